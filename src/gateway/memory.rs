//! Implementações em memória dos gateways.
//!
//! [`InMemoryOrderRepository`] guarda os pedidos num `HashMap` protegido por
//! `RwLock` e registra o histórico de status de cada pedido.
//! [`InMemoryBroker`] imita uma fila durável com ack manual: prefetch por
//! consumer, requeue, dead-letter e aviso de perda de conexão.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Notify, OwnedSemaphorePermit, RwLock, Semaphore, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{ConsumeGateway, Delivery, DeliveryStream, EventPublisher, OrderRepository};
use crate::error::{BrokerError, StoreError};
use crate::order::{Order, OrderStatus, StatusChangeEvent};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct StoredOrder {
    order: Order,
    history: Vec<OrderStatus>,
}

/// Thread-safe order store backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct InMemoryOrderRepository {
    orders: RwLock<HashMap<String, StoredOrder>>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every status the order has been stored with, oldest first.
    pub async fn status_history(&self, order_id: &str) -> Option<Vec<OrderStatus>> {
        let orders = self.orders.read().await;
        orders.get(order_id).map(|stored| stored.history.clone())
    }

    pub async fn count_by_status(&self) -> HashMap<OrderStatus, usize> {
        let orders = self.orders.read().await;
        let mut counts = HashMap::new();
        for stored in orders.values() {
            *counts.entry(stored.order.status).or_insert(0) += 1;
        }
        counts
    }

    pub async fn len(&self) -> usize {
        self.orders.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn create(&self, order: &Order) -> Result<(), StoreError> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.order_id) {
            return Err(StoreError::Duplicate(order.order_id.clone()));
        }
        orders.insert(
            order.order_id.clone(),
            StoredOrder {
                order: order.clone(),
                history: vec![order.status],
            },
        );
        Ok(())
    }

    async fn update_status(&self, order_id: &str, status: OrderStatus) -> Result<(), StoreError> {
        let mut orders = self.orders.write().await;
        let stored = orders
            .get_mut(order_id)
            .ok_or_else(|| StoreError::NotFound(order_id.to_string()))?;
        stored.order.status = status;
        stored.order.updated_at = Utc::now();
        stored.history.push(status);
        Ok(())
    }

    async fn find_by_order_id(&self, order_id: &str) -> Result<Order, StoreError> {
        let orders = self.orders.read().await;
        orders
            .get(order_id)
            .map(|stored| stored.order.clone())
            .ok_or_else(|| StoreError::NotFound(order_id.to_string()))
    }

    async fn compare_and_set_status(
        &self,
        order_id: &str,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<Order, StoreError> {
        let mut orders = self.orders.write().await;
        let stored = orders
            .get_mut(order_id)
            .ok_or_else(|| StoreError::NotFound(order_id.to_string()))?;
        if stored.order.status != expected {
            return Err(StoreError::Conflict {
                order_id: order_id.to_string(),
                expected,
                actual: stored.order.status,
            });
        }
        stored.order.status = next;
        stored.order.updated_at = Utc::now();
        stored.history.push(next);
        Ok(stored.order.clone())
    }
}

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    delivery_count: u32,
}

/// Counters exposed by [`InMemoryBroker::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub ready: usize,
    /// Requeued with a delay that has not elapsed yet.
    pub delayed: usize,
    pub unacked: usize,
    pub max_unacked: usize,
}

#[derive(Debug)]
struct BrokerState {
    ready: Mutex<VecDeque<Message>>,
    dead_letters: Mutex<Vec<Message>>,
    notify: Notify,
    // Some(reason) once the connection has been lost.
    connection: watch::Sender<Option<String>>,
    closed: AtomicBool,
    failing_publishes: AtomicU32,
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    unacked: AtomicUsize,
    max_unacked: AtomicUsize,
    delayed: AtomicUsize,
}

impl BrokerState {
    fn lost_reason(&self) -> Option<String> {
        self.connection.borrow().clone()
    }

    fn enqueue(&self, body: Vec<u8>) {
        lock(&self.ready).push_back(Message {
            body,
            delivery_count: 0,
        });
        self.published.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn pop_ready(&self) -> Option<Message> {
        let mut message = lock(&self.ready).pop_front()?;
        message.delivery_count += 1;
        self.delivered.fetch_add(1, Ordering::SeqCst);
        let unacked = self.unacked.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_unacked.fetch_max(unacked, Ordering::SeqCst);
        Some(message)
    }

    fn requeue(&self, message: Message, front: bool) {
        self.unacked.fetch_sub(1, Ordering::SeqCst);
        {
            let mut ready = lock(&self.ready);
            if front {
                ready.push_front(message);
            } else {
                ready.push_back(message);
            }
        }
        self.notify.notify_waiters();
    }

    // Settles the delivery now and puts the message back at the tail later.
    fn defer(self: &Arc<Self>, message: Message, delay: Duration) {
        self.unacked.fetch_sub(1, Ordering::SeqCst);
        self.delayed.fetch_add(1, Ordering::SeqCst);
        let state = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            state.delayed.fetch_sub(1, Ordering::SeqCst);
            lock(&state.ready).push_back(message);
            state.notify.notify_waiters();
        });
    }
}

/// In-process broker with a single durable queue.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (connection, _) = watch::channel(None);
        Self {
            state: Arc::new(BrokerState {
                ready: Mutex::new(VecDeque::new()),
                dead_letters: Mutex::new(Vec::new()),
                notify: Notify::new(),
                connection,
                closed: AtomicBool::new(false),
                failing_publishes: AtomicU32::new(0),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                acked: AtomicU64::new(0),
                requeued: AtomicU64::new(0),
                dead_lettered: AtomicU64::new(0),
                unacked: AtomicUsize::new(0),
                max_unacked: AtomicUsize::new(0),
                delayed: AtomicUsize::new(0),
            }),
        }
    }

    /// Enqueues a raw body, bypassing event serialisation.
    pub fn publish_raw(&self, body: impl Into<Vec<u8>>) {
        self.state.enqueue(body.into());
    }

    /// Makes the next `count` publishes fail with a transport error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Ends every delivery stream once the queue is drained of waiters.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    /// Simulates an unexpected connection drop.
    pub fn sever_connection(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(%reason, "conexão do broker em memória encerrada");
        self.state.connection.send_replace(Some(reason));
        self.state.notify.notify_waiters();
    }

    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        lock(&self.state.dead_letters)
            .iter()
            .map(|message| message.body.clone())
            .collect()
    }

    pub fn stats(&self) -> BrokerStats {
        let state = &self.state;
        BrokerStats {
            published: state.published.load(Ordering::SeqCst),
            delivered: state.delivered.load(Ordering::SeqCst),
            acked: state.acked.load(Ordering::SeqCst),
            requeued: state.requeued.load(Ordering::SeqCst),
            dead_lettered: state.dead_lettered.load(Ordering::SeqCst),
            ready: lock(&state.ready).len(),
            delayed: state.delayed.load(Ordering::SeqCst),
            unacked: state.unacked.load(Ordering::SeqCst),
            max_unacked: state.max_unacked.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl EventPublisher for InMemoryBroker {
    async fn publish(&self, event: &StatusChangeEvent, deadline: Instant) -> Result<(), BrokerError> {
        if Instant::now() >= deadline {
            return Err(BrokerError::DeadlineExceeded);
        }
        if let Some(reason) = self.state.lost_reason() {
            return Err(BrokerError::ConnectionClosed(reason));
        }
        let failing = self
            .state
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(BrokerError::Transport("falha de publicação simulada".into()));
        }

        let body = event.to_json()?;
        self.state.enqueue(body);
        debug!(order_id = %event.order_id, status = %event.status, "mensagem publicada");
        Ok(())
    }
}

#[async_trait]
impl ConsumeGateway for InMemoryBroker {
    async fn consume(&self, prefetch: usize) -> Result<Arc<dyn DeliveryStream>, BrokerError> {
        if let Some(reason) = self.state.lost_reason() {
            return Err(BrokerError::ConnectionClosed(reason));
        }
        Ok(Arc::new(MemoryStream {
            state: Arc::clone(&self.state),
            permits: Arc::new(Semaphore::new(prefetch)),
        }))
    }
}

struct MemoryStream {
    state: Arc<BrokerState>,
    // One permit per unsettled delivery.
    permits: Arc<Semaphore>,
}

#[async_trait]
impl DeliveryStream for MemoryStream {
    async fn next_delivery(&self) -> Option<Box<dyn Delivery>> {
        let permit = Arc::clone(&self.permits).acquire_owned().await.ok()?;
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.lost_reason().is_some() {
                return None;
            }
            if let Some(message) = self.state.pop_ready() {
                let delivery: Box<dyn Delivery> = Box::new(MemoryDelivery {
                    state: Arc::clone(&self.state),
                    message: Some(message),
                    _permit: permit,
                });
                return Some(delivery);
            }
            if self.state.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    async fn closed(&self) -> String {
        let mut rx = self.state.connection.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        match reason {
            Some(reason) => reason,
            None => std::future::pending().await,
        }
    }
}

struct MemoryDelivery {
    state: Arc<BrokerState>,
    message: Option<Message>,
    _permit: OwnedSemaphorePermit,
}

impl MemoryDelivery {
    fn take(&mut self) -> Result<Message, BrokerError> {
        let message = self
            .message
            .take()
            .ok_or_else(|| BrokerError::Transport("entrega já confirmada".into()))?;
        if let Some(reason) = self.state.lost_reason() {
            // A dead channel cannot settle; the broker requeues on its own.
            self.state.requeue(message, true);
            return Err(BrokerError::ConnectionClosed(reason));
        }
        Ok(message)
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        self.message.as_ref().map(|m| m.body.as_slice()).unwrap_or_default()
    }

    fn delivery_count(&self) -> u32 {
        self.message.as_ref().map(|m| m.delivery_count).unwrap_or_default()
    }

    async fn ack(mut self: Box<Self>) -> Result<(), BrokerError> {
        self.take()?;
        self.state.unacked.fetch_sub(1, Ordering::SeqCst);
        self.state.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(mut self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        let message = self.take()?;
        if requeue {
            self.state.requeued.fetch_add(1, Ordering::SeqCst);
            self.state.requeue(message, false);
        } else {
            self.state.unacked.fetch_sub(1, Ordering::SeqCst);
            self.state.dead_lettered.fetch_add(1, Ordering::SeqCst);
            lock(&self.state.dead_letters).push(message);
        }
        Ok(())
    }

    async fn requeue_after(mut self: Box<Self>, delay: Duration) -> Result<(), BrokerError> {
        let message = self.take()?;
        self.state.requeued.fetch_add(1, Ordering::SeqCst);
        self.state.defer(message, delay);
        Ok(())
    }
}

impl Drop for MemoryDelivery {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            self.state.requeue(message, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn repository_create_and_find() {
        let repo = InMemoryOrderRepository::new();
        let order = Order::new("widget".into(), 3);
        repo.create(&order).await.unwrap();

        let found = repo.find_by_order_id(&order.order_id).await.unwrap();
        assert_eq!(found, order);
        assert!(matches!(
            repo.create(&order).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn repository_missing_order() {
        let repo = InMemoryOrderRepository::new();
        assert!(matches!(
            repo.find_by_order_id("nope").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            repo.update_status("nope", OrderStatus::Processado).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn compare_and_set_checks_expected_status() {
        let repo = InMemoryOrderRepository::new();
        let order = Order::new("widget".into(), 1);
        repo.create(&order).await.unwrap();

        let updated = repo
            .compare_and_set_status(&order.order_id, OrderStatus::Criado, OrderStatus::Processando)
            .await
            .unwrap();
        assert_eq!(updated.status, OrderStatus::Processando);
        assert!(updated.updated_at >= order.updated_at);

        let conflict = repo
            .compare_and_set_status(&order.order_id, OrderStatus::Criado, OrderStatus::Processando)
            .await;
        assert!(matches!(
            conflict,
            Err(StoreError::Conflict { actual: OrderStatus::Processando, .. })
        ));
        assert_eq!(
            repo.status_history(&order.order_id).await.unwrap(),
            vec![OrderStatus::Criado, OrderStatus::Processando]
        );
    }

    #[tokio::test]
    async fn update_status_is_unconditional() {
        let repo = InMemoryOrderRepository::new();
        let order = Order::new("widget".into(), 1);
        repo.create(&order).await.unwrap();
        repo.update_status(&order.order_id, OrderStatus::Processado).await.unwrap();
        repo.update_status(&order.order_id, OrderStatus::Processado).await.unwrap();

        let counts = repo.count_by_status().await;
        assert_eq!(counts.get(&OrderStatus::Processado), Some(&1));
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn publish_then_consume_and_ack() {
        let broker = InMemoryBroker::new();
        broker
            .publish(&StatusChangeEvent::processing("o-1"), far_deadline())
            .await
            .unwrap();

        let stream = broker.consume(1).await.unwrap();
        let delivery = stream.next_delivery().await.unwrap();
        assert_eq!(delivery.delivery_count(), 1);
        let event = StatusChangeEvent::from_json(delivery.payload()).unwrap();
        assert_eq!(event.order_id, "o-1");
        delivery.ack().await.unwrap();

        let stats = broker.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.unacked, 0);
        assert_eq!(stats.ready, 0);
    }

    #[tokio::test]
    async fn requeued_message_is_redelivered_with_higher_count() {
        let broker = InMemoryBroker::new();
        broker.publish_raw(b"{}".to_vec());
        let stream = broker.consume(1).await.unwrap();

        let first = stream.next_delivery().await.unwrap();
        first.reject(true).await.unwrap();
        let second = stream.next_delivery().await.unwrap();
        assert_eq!(second.delivery_count(), 2);
        second.reject(false).await.unwrap();

        let stats = broker.stats();
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(broker.dead_letters(), vec![b"{}".to_vec()]);
    }

    #[tokio::test]
    async fn prefetch_bounds_unsettled_deliveries() {
        let broker = InMemoryBroker::new();
        for _ in 0..3 {
            broker.publish_raw(b"x".to_vec());
        }
        let stream = broker.consume(2).await.unwrap();
        let a = stream.next_delivery().await.unwrap();
        let _b = stream.next_delivery().await.unwrap();

        let third = tokio::time::timeout(Duration::from_millis(50), stream.next_delivery()).await;
        assert!(third.is_err(), "third delivery must wait for a free slot");

        a.ack().await.unwrap();
        let c = tokio::time::timeout(Duration::from_millis(500), stream.next_delivery())
            .await
            .unwrap();
        assert!(c.is_some());
        assert_eq!(broker.stats().max_unacked, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_requeue_frees_the_slot_until_due() {
        let broker = InMemoryBroker::new();
        broker.publish_raw(b"lento".to_vec());
        broker.publish_raw(b"rapido".to_vec());
        let stream = broker.consume(1).await.unwrap();

        let first = stream.next_delivery().await.unwrap();
        first.requeue_after(Duration::from_secs(2)).await.unwrap();
        let stats = broker.stats();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.unacked, 0);
        assert_eq!(stats.requeued, 1);

        let next = stream.next_delivery().await.unwrap();
        assert_eq!(next.payload(), b"rapido");
        next.ack().await.unwrap();

        let early = tokio::time::timeout(Duration::from_secs(1), stream.next_delivery()).await;
        assert!(early.is_err(), "delayed message must not be delivered early");

        let again = stream.next_delivery().await.unwrap();
        assert_eq!(again.payload(), b"lento");
        assert_eq!(again.delivery_count(), 2);
        assert_eq!(broker.stats().delayed, 0);
    }

    #[tokio::test]
    async fn dropped_delivery_stays_redeliverable() {
        let broker = InMemoryBroker::new();
        broker.publish_raw(b"x".to_vec());
        let stream = broker.consume(1).await.unwrap();
        drop(stream.next_delivery().await.unwrap());

        let again = stream.next_delivery().await.unwrap();
        assert_eq!(again.delivery_count(), 2);
        assert_eq!(broker.stats().unacked, 1);
    }

    #[tokio::test]
    async fn close_ends_the_stream() {
        let broker = InMemoryBroker::new();
        let stream = broker.consume(1).await.unwrap();
        broker.close();
        assert!(stream.next_delivery().await.is_none());
    }

    #[tokio::test]
    async fn severed_connection_is_reported() {
        let broker = InMemoryBroker::new();
        broker.publish_raw(b"x".to_vec());
        let stream = broker.consume(1).await.unwrap();
        let delivery = stream.next_delivery().await.unwrap();

        broker.sever_connection("heartbeat timeout");
        assert_eq!(stream.closed().await, "heartbeat timeout");
        assert!(matches!(
            delivery.ack().await,
            Err(BrokerError::ConnectionClosed(_))
        ));
        assert_eq!(broker.stats().ready, 1);
        assert!(matches!(
            broker
                .publish(&StatusChangeEvent::processing("o-2"), far_deadline())
                .await,
            Err(BrokerError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn publish_failures_can_be_injected() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(1);
        let event = StatusChangeEvent::processing("o-1");
        assert!(matches!(
            broker.publish(&event, far_deadline()).await,
            Err(BrokerError::Transport(_))
        ));
        broker.publish(&event, far_deadline()).await.unwrap();
        assert_eq!(broker.stats().published, 1);
    }

    #[tokio::test]
    async fn expired_deadline_is_not_published() {
        let broker = InMemoryBroker::new();
        let result = broker
            .publish(&StatusChangeEvent::processing("o-1"), Instant::now())
            .await;
        assert!(matches!(result, Err(BrokerError::DeadlineExceeded)));
        assert_eq!(broker.stats().published, 0);
    }
}
