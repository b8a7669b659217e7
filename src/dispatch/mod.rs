//! Pool de despacho do lado produtor.
//!
//! Desacopla a criação do pedido da latência e das falhas do broker: os jobs
//! entram numa fila limitada e um número fixo de workers os publica. Com a
//! fila cheia o envio passa a bloquear em vez de descartar; nenhum evento de
//! status é perdido, quem chama apenas espera mais.

mod job;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::error::{BrokerError, DispatchError};
use crate::gateway::EventPublisher;
use crate::order::{Order, StatusChangeEvent};

pub use job::{DispatchJob, PublishReceipt};

/// Sizing and deadlines of the dispatch pool.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Lifetime of a job; the publish is abandoned once it elapses.
    pub job_timeout: Duration,
    /// Bound on a single publish call, within the job's lifetime.
    pub publish_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 100,
            job_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(5),
        }
    }
}

/// Publish outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub published: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    failed: AtomicU64,
}

type JobQueue = Arc<Mutex<mpsc::Receiver<DispatchJob>>>;

pub struct DispatchPool {
    sender: RwLock<Option<mpsc::Sender<DispatchJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    config: DispatchConfig,
    span: Span,
}

impl DispatchPool {
    /// Spawns the workers. Must be called from within a Tokio runtime.
    pub fn new(publisher: Arc<dyn EventPublisher>, config: DispatchConfig) -> Self {
        Self::with_span(publisher, config, info_span!("dispatch"))
    }

    /// Like [`new`](Self::new), with every log line of the pool recorded
    /// under `span`.
    pub fn with_span(publisher: Arc<dyn EventPublisher>, config: DispatchConfig, span: Span) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let queue: JobQueue = Arc::new(Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let workers = (0..config.workers.max(1))
            .map(|id| {
                let worker = Worker {
                    id,
                    queue: Arc::clone(&queue),
                    publisher: Arc::clone(&publisher),
                    counters: Arc::clone(&counters),
                    publish_timeout: config.publish_timeout,
                };
                tokio::spawn(worker.run().instrument(span.clone()))
            })
            .collect();

        Self {
            sender: RwLock::new(Some(tx)),
            workers: Mutex::new(workers),
            counters,
            config,
            span,
        }
    }

    /// Queues a job without waiting for it to be published.
    ///
    /// Tries a non-blocking enqueue first; with the queue full it logs a
    /// warning and waits for room. Fails only once the pool is shut down.
    pub async fn submit(&self, job: DispatchJob) -> Result<(), DispatchError> {
        let sender = self.sender.read().await.clone().ok_or(DispatchError::Closed)?;
        let capacity = self.config.queue_capacity;

        async move {
            let order_id = job.event.order_id.clone();
            match sender.try_send(job) {
                Ok(()) => {
                    debug!(%order_id, "job enfileirado");
                    Ok(())
                }
                Err(TrySendError::Full(job)) => {
                    warn!(%order_id, capacity, "fila de jobs cheia, job pode ser processado com atraso");
                    sender.send(job).await.map_err(|_| DispatchError::Closed)
                }
                Err(TrySendError::Closed(_)) => Err(DispatchError::Closed),
            }
        }
        .instrument(self.span.clone())
        .await
    }

    /// Like [`submit`](Self::submit), returning a receipt that resolves with
    /// the publish outcome.
    pub async fn submit_tracked(&self, job: DispatchJob) -> Result<PublishReceipt, DispatchError> {
        let (job, receipt) = job.tracked();
        self.submit(job).await?;
        Ok(receipt)
    }

    /// Queues the "move to PROCESSANDO" event of a freshly created order.
    pub async fn submit_order_created(&self, order: &Order) -> Result<(), DispatchError> {
        let event = StatusChangeEvent::processing(order.order_id.clone());
        self.submit(DispatchJob::new(event, self.config.job_timeout)).await
    }

    /// Closes the queue and waits for the workers to publish what is left.
    ///
    /// Later calls to `submit` and `shutdown` fail with [`DispatchError::Closed`].
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        let sender = self.sender.write().await.take().ok_or(DispatchError::Closed)?;
        let pending = sender.max_capacity() - sender.capacity();
        drop(sender);

        let workers = std::mem::take(&mut *self.workers.lock().await);
        async move {
            info!(pending, workers = workers.len(), "encerrando workers do despacho");
            for handle in workers {
                if let Err(err) = handle.await {
                    error!(error = %err, "worker de despacho terminou com falha");
                }
            }
            info!("todos os workers de despacho foram encerrados");
        }
        .instrument(self.span.clone())
        .await;
        Ok(())
    }

    /// Jobs currently waiting in the queue.
    pub async fn queued(&self) -> usize {
        match self.sender.read().await.as_ref() {
            Some(sender) => sender.max_capacity() - sender.capacity(),
            None => 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.queue_capacity.max(1)
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            published: self.counters.published.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }
}

struct Worker {
    id: usize,
    queue: JobQueue,
    publisher: Arc<dyn EventPublisher>,
    counters: Arc<Counters>,
    publish_timeout: Duration,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "worker iniciado");
        loop {
            let next = self.queue.lock().await.recv().await;
            let Some(job) = next else { break };
            self.publish(job).await;
        }
        debug!(worker = self.id, "worker finalizado");
    }

    async fn publish(&self, job: DispatchJob) {
        let expired = job.is_expired();
        let DispatchJob {
            event,
            deadline,
            receipt,
        } = job;

        let outcome = if expired {
            Err(BrokerError::DeadlineExceeded)
        } else {
            let deadline = deadline.min(Instant::now() + self.publish_timeout);
            tokio::time::timeout_at(deadline, self.publisher.publish(&event, deadline))
                .await
                .unwrap_or(Err(BrokerError::DeadlineExceeded))
        };

        match &outcome {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::SeqCst);
                info!(worker = self.id, order_id = %event.order_id, "mensagem publicada com sucesso");
            }
            Err(err) => {
                // No retry here; the job is dropped.
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                error!(worker = self.id, order_id = %event.order_id, error = %err, "erro ao publicar mensagem");
            }
        }

        if let Some(receipt) = receipt {
            let _ = receipt.send(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryBroker;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    /// Records every published event after an optional delay.
    #[derive(Default)]
    struct RecordingPublisher {
        delay: Duration,
        events: StdMutex<Vec<StatusChangeEvent>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, event: &StatusChangeEvent, _deadline: Instant) -> Result<(), BrokerError> {
            tokio::time::sleep(self.delay).await;
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    /// Blocks every publish until released.
    #[derive(Default)]
    struct GatedPublisher {
        gate: Notify,
        started: Notify,
    }

    #[async_trait]
    impl EventPublisher for GatedPublisher {
        async fn publish(&self, _event: &StatusChangeEvent, _deadline: Instant) -> Result<(), BrokerError> {
            self.started.notify_one();
            self.gate.notified().await;
            Ok(())
        }
    }

    struct StuckPublisher;

    #[async_trait]
    impl EventPublisher for StuckPublisher {
        async fn publish(&self, _event: &StatusChangeEvent, _deadline: Instant) -> Result<(), BrokerError> {
            std::future::pending().await
        }
    }

    fn job(id: &str) -> DispatchJob {
        DispatchJob::new(StatusChangeEvent::processing(id), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn never_drops_jobs_beyond_capacity() {
        let publisher = Arc::new(RecordingPublisher {
            delay: Duration::from_millis(5),
            ..Default::default()
        });
        let pool = DispatchPool::new(
            publisher.clone(),
            DispatchConfig {
                workers: 2,
                queue_capacity: 3,
                ..Default::default()
            },
        );

        for i in 0..25 {
            pool.submit(job(&format!("o-{i}"))).await.unwrap();
        }
        pool.shutdown().await.unwrap();

        let events = publisher.events.lock().unwrap();
        assert_eq!(events.len(), 25);
        assert_eq!(pool.stats(), DispatchStats { published: 25, failed: 0 });
    }

    #[tokio::test]
    async fn full_queue_blocks_instead_of_dropping() {
        let publisher = Arc::new(GatedPublisher::default());
        let pool = Arc::new(DispatchPool::new(
            publisher.clone(),
            DispatchConfig {
                workers: 1,
                queue_capacity: 1,
                ..Default::default()
            },
        ));

        // First job is held by the only worker, second fills the queue.
        pool.submit(job("o-1")).await.unwrap();
        publisher.started.notified().await;
        pool.submit(job("o-2")).await.unwrap();
        assert_eq!(pool.queued().await, 1);

        let blocked = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.submit(job("o-3")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "submit must wait for room in the queue");

        publisher.gate.notify_one();
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // Release the remaining publishes so shutdown can drain.
        for _ in 0..2 {
            publisher.started.notified().await;
            publisher.gate.notify_one();
        }
        pool.shutdown().await.unwrap();
        assert_eq!(pool.stats().published, 3);
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_rejected() {
        let pool = DispatchPool::new(Arc::new(InMemoryBroker::new()), DispatchConfig::default());
        pool.shutdown().await.unwrap();

        assert_eq!(pool.submit(job("late")).await, Err(DispatchError::Closed));
        assert_eq!(pool.shutdown().await, Err(DispatchError::Closed));
        assert_eq!(pool.queued().await, 0);
    }

    #[tokio::test]
    async fn shutdown_drains_queued_jobs() {
        let broker = Arc::new(InMemoryBroker::new());
        let pool = DispatchPool::new(
            broker.clone(),
            DispatchConfig {
                workers: 1,
                queue_capacity: 10,
                ..Default::default()
            },
        );
        for i in 0..10 {
            pool.submit(job(&format!("o-{i}"))).await.unwrap();
        }
        pool.shutdown().await.unwrap();
        assert_eq!(broker.stats().published, 10);
    }

    #[tokio::test]
    async fn expired_job_is_abandoned() {
        let publisher = Arc::new(RecordingPublisher::default());
        let pool = DispatchPool::new(publisher.clone(), DispatchConfig::default());

        let expired = DispatchJob::with_deadline(StatusChangeEvent::processing("o-1"), Instant::now());
        let receipt = pool.submit_tracked(expired).await.unwrap();
        assert!(matches!(receipt.outcome().await, Err(BrokerError::DeadlineExceeded)));

        pool.shutdown().await.unwrap();
        assert!(publisher.events.lock().unwrap().is_empty());
        assert_eq!(pool.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_publish_is_bounded_by_job_deadline() {
        let pool = DispatchPool::new(
            Arc::new(StuckPublisher),
            DispatchConfig {
                workers: 1,
                job_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        );
        let receipt = pool
            .submit_tracked(DispatchJob::new(
                StatusChangeEvent::processing("o-1"),
                Duration::from_millis(200),
            ))
            .await
            .unwrap();

        assert!(matches!(receipt.outcome().await, Err(BrokerError::DeadlineExceeded)));
        pool.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_publish_is_bounded_by_publish_timeout() {
        let pool = DispatchPool::new(
            Arc::new(StuckPublisher),
            DispatchConfig {
                workers: 1,
                publish_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        );
        let started = Instant::now();
        let receipt = pool.submit_tracked(job("o-1")).await.unwrap();

        assert!(matches!(receipt.outcome().await, Err(BrokerError::DeadlineExceeded)));
        assert!(started.elapsed() < Duration::from_secs(30));
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn publish_failure_is_not_retried() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.fail_next_publishes(1);
        let pool = DispatchPool::new(broker.clone(), DispatchConfig::default());

        let failed = pool.submit_tracked(job("o-1")).await.unwrap();
        assert!(matches!(failed.outcome().await, Err(BrokerError::Transport(_))));
        let ok = pool.submit_tracked(job("o-2")).await.unwrap();
        ok.outcome().await.unwrap();

        pool.shutdown().await.unwrap();
        assert_eq!(broker.stats().published, 1);
        assert_eq!(pool.stats(), DispatchStats { published: 1, failed: 1 });
    }

    #[tokio::test]
    async fn order_created_becomes_processando_event() {
        let publisher = Arc::new(RecordingPublisher::default());
        let pool = DispatchPool::new(publisher.clone(), DispatchConfig::default());
        let order = Order::new("widget".into(), 3);

        pool.submit_order_created(&order).await.unwrap();
        pool.shutdown().await.unwrap();

        let events = publisher.events.lock().unwrap();
        assert_eq!(events.as_slice(), &[StatusChangeEvent::processing(order.order_id.clone())]);
    }
}
