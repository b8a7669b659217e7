use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::model::{OrderStatus, StatusChangeEvent};
use crate::consumer::DeliveryHandler;
use crate::error::{StoreError, TransitionError};
use crate::gateway::{OrderRepository, with_store_deadline};
use crate::shutdown::ShutdownListener;

/// Settings for [`OrderTransition`].
#[derive(Debug, Clone)]
pub struct TransitionConfig {
    /// Simulated processing time between PROCESSANDO and PROCESSADO.
    pub processing_delay: Duration,
    /// Deadline applied to every store call.
    pub store_timeout: Duration,
    /// Abort the processing delay when the pool is shutting down.
    pub interruptible: bool,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            processing_delay: Duration::from_secs(2),
            store_timeout: Duration::from_secs(5),
            interruptible: true,
        }
    }
}

/// What a single run of the transition did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionReport {
    pub order_id: String,
    /// Status read from the store when the run started.
    pub found: OrderStatus,
    /// Statuses written by this run, in order.
    pub written: Vec<OrderStatus>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl TransitionReport {
    /// True when the order was already PROCESSADO (a duplicate delivery).
    pub fn was_noop(&self) -> bool {
        self.written.is_empty()
    }
}

/// Drives one order from whatever status it is in up to PROCESSADO.
///
/// Every write is a compare-and-set against the status the run expects, so a
/// redelivered event resumes where the previous attempt stopped:
///
/// - CRIADO: set PROCESSANDO, then continue.
/// - PROCESSANDO: simulated processing, then set PROCESSADO.
/// - PROCESSADO: terminal, nothing to do.
///
/// If a write finds the order already further ahead the run continues from
/// the status found. Nothing is rolled back on failure.
pub struct OrderTransition {
    repo: Arc<dyn OrderRepository>,
    config: TransitionConfig,
}

impl OrderTransition {
    pub fn new(repo: Arc<dyn OrderRepository>, config: TransitionConfig) -> Self {
        Self { repo, config }
    }

    pub async fn run(
        &self,
        order_id: &str,
        shutdown: &ShutdownListener,
    ) -> Result<TransitionReport, TransitionError> {
        let started_at = Utc::now();
        let order = with_store_deadline(self.config.store_timeout, self.repo.find_by_order_id(order_id))
            .await
            .map_err(|err| match err {
                StoreError::NotFound(id) => TransitionError::OrderNotFound(id),
                source => TransitionError::Store {
                    step: "buscar pedido",
                    source,
                },
            })?;
        debug!(
            order_id,
            product = %order.product,
            quantity = order.quantity,
            status = %order.status,
            "pedido encontrado"
        );

        let found = order.status;
        let mut status = found;
        let mut written = Vec::new();

        while let Some(next) = status.next() {
            if next == OrderStatus::Processado {
                self.simulate_processing(order_id, shutdown).await?;
            }
            status = match self.advance(order_id, status, next).await? {
                Advance::Written => {
                    info!(order_id, status = %next, "status atualizado");
                    written.push(next);
                    next
                }
                Advance::AlreadyAt(actual) => {
                    warn!(order_id, expected = %status, %actual, "pedido já avançou, continuando do status atual");
                    actual
                }
            };
        }

        Ok(TransitionReport {
            order_id: order_id.to_string(),
            found,
            written,
            started_at,
            duration_ms: (Utc::now() - started_at).num_milliseconds(),
        })
    }

    async fn advance(
        &self,
        order_id: &str,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<Advance, TransitionError> {
        let step = match next {
            OrderStatus::Processado => "atualizar status para PROCESSADO",
            _ => "atualizar status para PROCESSANDO",
        };
        let result = with_store_deadline(
            self.config.store_timeout,
            self.repo.compare_and_set_status(order_id, expected, next),
        )
        .await;
        match result {
            Ok(_) => Ok(Advance::Written),
            Err(StoreError::Conflict { actual, .. }) if actual > expected => Ok(Advance::AlreadyAt(actual)),
            Err(source) => Err(TransitionError::Store { step, source }),
        }
    }

    async fn simulate_processing(
        &self,
        order_id: &str,
        shutdown: &ShutdownListener,
    ) -> Result<(), TransitionError> {
        debug!(order_id, delay_ms = self.config.processing_delay.as_millis() as u64, "processando pedido");
        if !self.config.interruptible {
            tokio::time::sleep(self.config.processing_delay).await;
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(self.config.processing_delay) => Ok(()),
            _ = shutdown.wait() => Err(TransitionError::Interrupted(order_id.to_string())),
        }
    }
}

enum Advance {
    Written,
    AlreadyAt(OrderStatus),
}

#[async_trait]
impl DeliveryHandler for OrderTransition {
    async fn handle(
        &self,
        event: &StatusChangeEvent,
        shutdown: &ShutdownListener,
    ) -> Result<TransitionReport, TransitionError> {
        self.run(&event.order_id, shutdown).await
    }
}
