//! Demonstração do pipeline completo com gateways em memória.
//!
//! Liga repositório, broker, pool de despacho, pool de consumo e serviço,
//! cria os pedidos e acompanha até todos chegarem a PROCESSADO, até o prazo
//! expirar ou até o shutdown. O encerramento segue a ordem: esvazia o
//! despacho, cancela o consumo e aguarda os workers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::consumer::ConsumptionPool;
use crate::dispatch::DispatchPool;
use crate::gateway::{InMemoryBroker, InMemoryOrderRepository};
use crate::order::{CreateOrderRequest, OrderStatus, OrderTransition};
use crate::service::OrderService;
use crate::shutdown::Shutdown;
use crate::telemetry;
use crate::ui::{DemoProgress, DemoSummary};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub orders: usize,
    pub product: String,
    pub quantity: u32,
    /// Gives up waiting for PROCESSADO after this long.
    pub deadline: Duration,
    pub show_progress: bool,
}

impl DemoOptions {
    /// Enough time for `orders` to go through the consumer at its
    /// configured parallelism, plus a margin.
    pub fn deadline_for(config: &PipelineConfig, orders: usize) -> Duration {
        let parallel = config.consumer.workers.min(config.consumer.prefetch).max(1);
        let rounds = orders.div_ceil(parallel) as u32;
        Duration::from_millis(config.consumer.processing_delay_ms) * rounds + Duration::from_secs(10)
    }
}

pub async fn run(config: &PipelineConfig, options: &DemoOptions, shutdown: &Shutdown) -> Result<DemoSummary> {
    let started = Instant::now();
    let repo = Arc::new(InMemoryOrderRepository::new());
    let broker = Arc::new(InMemoryBroker::new());

    let dispatcher = Arc::new(DispatchPool::with_span(
        broker.clone(),
        config.dispatch_config(),
        telemetry::dispatch_span("demo"),
    ));
    let transition = Arc::new(OrderTransition::new(repo.clone(), config.transition_config()));
    let consumer = Arc::new(
        ConsumptionPool::new(broker.clone(), transition, config.consumer_config(), config.retry.clone())
            .with_span(telemetry::consumer_span("demo", config.consumer.prefetch)),
    );

    let consumer_scope = shutdown.child();
    let consuming = tokio::spawn({
        let consumer = Arc::clone(&consumer);
        let listener = consumer_scope.listener();
        async move { consumer.run(listener).await }
    });

    let service = OrderService::new(repo.clone(), Arc::clone(&dispatcher), config.store_timeout());
    let progress = options.show_progress.then(|| DemoProgress::start(options.orders));

    let mut created = 0;
    for _ in 0..options.orders {
        if shutdown.is_triggered() {
            break;
        }
        let response = service
            .create_order(CreateOrderRequest {
                product: options.product.clone(),
                quantity: options.quantity,
            })
            .await?;
        if let Some(progress) = &progress {
            progress.created(&response.order_id);
        }
        created += 1;
    }
    info!(created, "pedidos criados, aguardando processamento");

    let listener = shutdown.listener();
    let deadline = tokio::time::sleep(options.deadline);
    tokio::pin!(deadline);
    loop {
        let counts = repo.count_by_status().await;
        if let Some(progress) = &progress {
            progress.update(&counts);
        }
        if counts.get(&OrderStatus::Processado).copied().unwrap_or_default() >= created {
            break;
        }
        if consuming.is_finished() {
            warn!("consumer encerrou antes de processar todos os pedidos");
            break;
        }
        tokio::select! {
            _ = &mut deadline => {
                warn!(deadline_ms = options.deadline.as_millis() as u64, "prazo da demo expirado");
                break;
            }
            _ = listener.wait() => break,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
    if let Some(progress) = &progress {
        progress.finish();
    }

    if let Err(err) = dispatcher.shutdown().await {
        warn!(error = %err, "pool de despacho já encerrado");
    }
    consumer_scope.trigger();
    consuming
        .await
        .context("task do consumer terminou com falha")?
        .context("consumer encerrou com erro")?;

    Ok(DemoSummary {
        orders: created,
        counts: repo.count_by_status().await,
        dispatch: dispatcher.stats(),
        consumer: consumer.stats(),
        broker: broker.stats(),
        elapsed: started.elapsed(),
    })
}
