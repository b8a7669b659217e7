//! Pool de consumo do lado worker.
//!
//! Registra um consumer com ack manual e prefetch limitado, distribui as
//! entregas entre um número fixo de workers e decide, para cada entrega, entre
//! `ack`, `reject` com reenfileiramento ou dead-letter:
//!
//! | resultado                      | ação                              |
//! |--------------------------------|-----------------------------------|
//! | sucesso                        | ack                               |
//! | payload inválido               | reject sem requeue (dead-letter)  |
//! | falha permanente               | reject sem requeue (dead-letter)  |
//! | falha transitória com retry    | requeue com atraso (backoff)      |
//! | falha transitória sem retry    | reject sem requeue (dead-letter)  |
//!
//! O orçamento de retry conta apenas falhas do handler, por pedido, num
//! [`RetryLedger`]. Requeues por shutdown ou por perda de conexão não contam.

mod retry;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::error::{ConsumerError, FailureKind, TransitionError};
use crate::gateway::{ConsumeGateway, Delivery, DeliveryStream};
use crate::order::{StatusChangeEvent, TransitionReport};
use crate::shutdown::{Shutdown, ShutdownListener};

pub use retry::{RetryConfig, RetryDecision, RetryLedger};

/// Business logic run for every decoded delivery.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// `shutdown` fires when the pool is stopping; long waits should observe it.
    async fn handle(
        &self,
        event: &StatusChangeEvent,
        shutdown: &ShutdownListener,
    ) -> Result<TransitionReport, TransitionError>;
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub workers: usize,
    /// Maximum unsettled deliveries held by the consumer at once.
    pub prefetch: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            prefetch: 1,
        }
    }
}

/// Settlement counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub malformed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    acked: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    malformed: AtomicU64,
}

pub struct ConsumptionPool {
    gateway: Arc<dyn ConsumeGateway>,
    handler: Arc<dyn DeliveryHandler>,
    config: ConsumerConfig,
    retry: RetryConfig,
    ledger: Arc<RetryLedger>,
    counters: Arc<Counters>,
    span: Span,
}

impl ConsumptionPool {
    pub fn new(
        gateway: Arc<dyn ConsumeGateway>,
        handler: Arc<dyn DeliveryHandler>,
        config: ConsumerConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            gateway,
            handler,
            config,
            retry,
            ledger: Arc::new(RetryLedger::new()),
            counters: Arc::new(Counters::default()),
            span: info_span!("consumer"),
        }
    }

    /// Records every log line of the pool under `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Shares a failure ledger with other pools, so a pool rebuilt after a
    /// lost connection keeps the retry counts of its predecessor.
    pub fn with_retry_ledger(mut self, ledger: Arc<RetryLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            acked: self.counters.acked.load(Ordering::SeqCst),
            requeued: self.counters.requeued.load(Ordering::SeqCst),
            dead_lettered: self.counters.dead_lettered.load(Ordering::SeqCst),
            malformed: self.counters.malformed.load(Ordering::SeqCst),
        }
    }

    /// Consumes until `shutdown` fires, the stream ends, or the connection
    /// is lost. Always waits for every worker to settle its current delivery
    /// before returning.
    ///
    /// Returns [`ConsumerError::ConnectionLost`] when the broker connection
    /// closes unexpectedly; the caller decides whether to restart.
    pub async fn run(&self, shutdown: ShutdownListener) -> Result<(), ConsumerError> {
        self.supervise(shutdown).instrument(self.span.clone()).await
    }

    async fn supervise(&self, shutdown: ShutdownListener) -> Result<(), ConsumerError> {
        let prefetch = self.config.prefetch.max(1);
        let stream = self
            .gateway
            .consume(prefetch)
            .await
            .map_err(ConsumerError::Subscribe)?;

        let workers = self.config.workers.max(1);
        info!(workers, prefetch, "consumer registrado, aguardando mensagens");

        let stop = Shutdown::new();
        let mut set = JoinSet::new();
        for id in 0..workers {
            let worker = Worker {
                id,
                stream: Arc::clone(&stream),
                handler: Arc::clone(&self.handler),
                retry: self.retry.clone(),
                ledger: Arc::clone(&self.ledger),
                counters: Arc::clone(&self.counters),
            };
            set.spawn(worker.run(stop.listener()).instrument(Span::current()));
        }

        let outcome = tokio::select! {
            biased;
            _ = shutdown.wait() => {
                info!("sinal de shutdown recebido, encerrando workers");
                Ok(())
            }
            reason = stream.closed() => {
                error!(%reason, "conexão com o broker perdida");
                Err(ConsumerError::ConnectionLost(reason))
            }
            _ = join_all(&mut set) => {
                info!("stream de entregas encerrado");
                Ok(())
            }
        };

        stop.trigger();
        join_all(&mut set).await;
        info!("todos os workers de consumo foram encerrados");
        outcome
    }
}

async fn join_all(set: &mut JoinSet<()>) {
    while let Some(joined) = set.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "worker de consumo terminou com falha");
        }
    }
}

struct Worker {
    id: usize,
    stream: Arc<dyn DeliveryStream>,
    handler: Arc<dyn DeliveryHandler>,
    retry: RetryConfig,
    ledger: Arc<RetryLedger>,
    counters: Arc<Counters>,
}

impl Worker {
    async fn run(self, stop: ShutdownListener) {
        debug!(worker = self.id, "worker iniciado");
        loop {
            let delivery = tokio::select! {
                biased;
                _ = stop.wait() => break,
                next = self.stream.next_delivery() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            self.settle(delivery, &stop).await;
        }
        debug!(worker = self.id, "worker finalizado");
    }

    async fn settle(&self, delivery: Box<dyn Delivery>, stop: &ShutdownListener) {
        let worker = self.id;
        let delivery_count = delivery.delivery_count();

        let event = match StatusChangeEvent::from_json(delivery.payload()) {
            Ok(event) => event,
            Err(err) => {
                warn!(worker, error = %err, "mensagem inválida, enviando para dead-letter");
                self.counters.malformed.fetch_add(1, Ordering::SeqCst);
                self.dead_letter(delivery, None).await;
                return;
            }
        };
        let order_id = event.order_id.as_str();
        debug!(worker, order_id, status = %event.status, delivery_count, "mensagem recebida");

        let err = match self.handler.handle(&event, stop).await {
            Ok(report) => {
                info!(
                    worker,
                    order_id,
                    found = %report.found,
                    noop = report.was_noop(),
                    duration_ms = report.duration_ms,
                    "pedido processado com sucesso"
                );
                match delivery.ack().await {
                    Ok(()) => {
                        self.ledger.clear(order_id);
                        self.counters.acked.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(err) => error!(worker, order_id, error = %err, "erro ao confirmar mensagem"),
                }
                return;
            }
            Err(err) => err,
        };

        if err.kind() == FailureKind::Permanent {
            error!(worker, order_id, error = %err, kind = %err.kind(), "falha permanente, enviando para dead-letter");
            self.dead_letter(delivery, Some(order_id)).await;
            return;
        }

        if stop.is_shutdown() {
            warn!(worker, order_id, error = %err, "processamento interrompido, mensagem devolvida à fila");
            self.requeue(delivery, order_id).await;
            return;
        }

        let failures = self.ledger.record_failure(order_id);
        match self.retry.decide(failures) {
            RetryDecision::Requeue { attempt, delay } => {
                warn!(
                    worker,
                    order_id,
                    error = %err,
                    attempt,
                    max_retries = self.retry.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "falha transitória, mensagem será reenfileirada"
                );
                match delivery.requeue_after(delay).await {
                    Ok(()) => {
                        self.counters.requeued.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(err) => error!(worker, order_id, error = %err, "erro ao reenfileirar mensagem"),
                }
            }
            RetryDecision::DeadLetter => {
                error!(
                    worker,
                    order_id,
                    error = %err,
                    failures,
                    delivery_count,
                    "tentativas esgotadas, enviando para dead-letter"
                );
                self.dead_letter(delivery, Some(order_id)).await;
            }
        }
    }

    async fn requeue(&self, delivery: Box<dyn Delivery>, order_id: &str) {
        match delivery.reject(true).await {
            Ok(()) => {
                self.counters.requeued.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => error!(worker = self.id, order_id, error = %err, "erro ao reenfileirar mensagem"),
        }
    }

    async fn dead_letter(&self, delivery: Box<dyn Delivery>, order_id: Option<&str>) {
        match delivery.reject(false).await {
            Ok(()) => {
                if let Some(order_id) = order_id {
                    self.ledger.clear(order_id);
                }
                self.counters.dead_lettered.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => error!(worker = self.id, order_id, error = %err, "erro ao rejeitar mensagem"),
        }
    }
}
