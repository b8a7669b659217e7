//! Gateways externos usados pelo núcleo: repositório de status e broker.
//!
//! O núcleo só conhece estes traits. As implementações em memória de
//! [`memory`] cobrem a demo e os testes.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{BrokerError, StoreError};
use crate::order::{Order, OrderStatus, StatusChangeEvent};

pub use memory::{BrokerStats, InMemoryBroker, InMemoryOrderRepository};

/// Persistence capability for orders. Implementations must be safe for
/// concurrent use by many workers.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn create(&self, order: &Order) -> Result<(), StoreError>;

    /// Unconditionally sets the status and refreshes `updated_at`.
    async fn update_status(&self, order_id: &str, status: OrderStatus) -> Result<(), StoreError>;

    async fn find_by_order_id(&self, order_id: &str) -> Result<Order, StoreError>;

    /// Sets `next` only if the stored status is still `expected`.
    ///
    /// Fails with [`StoreError::Conflict`] carrying the actual status otherwise.
    async fn compare_and_set_status(
        &self,
        order_id: &str,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<Order, StoreError>;
}

/// Durable publication of status-change events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &StatusChangeEvent, deadline: Instant) -> Result<(), BrokerError>;
}

/// Registers a manual-ack consumer.
#[async_trait]
pub trait ConsumeGateway: Send + Sync {
    /// Opens a delivery stream holding at most `prefetch` unsettled deliveries.
    async fn consume(&self, prefetch: usize) -> Result<std::sync::Arc<dyn DeliveryStream>, BrokerError>;
}

/// A delivery stream shared by every worker of a consumer.
#[async_trait]
pub trait DeliveryStream: Send + Sync {
    /// Waits for the next delivery. `None` once the stream is closed.
    ///
    /// Must be cancel-safe: dropping the future loses no message.
    async fn next_delivery(&self) -> Option<Box<dyn Delivery>>;

    /// Resolves with the reason once the connection closes unexpectedly.
    async fn closed(&self) -> String;
}

/// One in-flight message. `ack` and `reject` consume the handle, so a
/// delivery is settled at most once; dropping it unsettled leaves the
/// message redeliverable.
#[async_trait]
pub trait Delivery: Send {
    fn payload(&self) -> &[u8];

    /// How many times the broker has delivered this message, starting at 1.
    fn delivery_count(&self) -> u32;

    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// `requeue = false` routes the message to the dead-letter path.
    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;

    /// Settles now, freeing the prefetch slot, and makes the message
    /// deliverable again once `delay` has passed.
    async fn requeue_after(self: Box<Self>, delay: Duration) -> Result<(), BrokerError>;
}

/// Runs a store call under a deadline, mapping expiry to [`StoreError::Timeout`].
pub async fn with_store_deadline<T, F>(timeout: Duration, call: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}
