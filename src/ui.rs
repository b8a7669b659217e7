//! Interface de terminal da demo: barra de progresso e resumo colorido.
//!
//! Usa `indicatif` para acompanhar os pedidos até PROCESSADO e `console`
//! para estilizar o resumo final.

use std::collections::HashMap;
use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::consumer::ConsumerStats;
use crate::dispatch::DispatchStats;
use crate::gateway::BrokerStats;
use crate::order::OrderStatus;

/// Acompanha visualmente quantos pedidos já chegaram a PROCESSADO.
pub struct DemoProgress {
    pb: ProgressBar,
    yellow: Style,
}

impl DemoProgress {
    pub fn start(total: usize) -> Self {
        let pb = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        pb.set_style(style);
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            yellow: Style::new().yellow(),
        }
    }

    pub fn created(&self, order_id: &str) {
        self.pb.println(format!("  {} pedido {order_id} CRIADO", self.yellow.apply_to("+")));
    }

    /// Atualiza a barra a partir da contagem por status do repositório.
    pub fn update(&self, counts: &HashMap<OrderStatus, usize>) {
        let count = |status: OrderStatus| counts.get(&status).copied().unwrap_or_default();
        self.pb.set_position(count(OrderStatus::Processado) as u64);
        self.pb.set_message(format!(
            "CRIADO: {}  PROCESSANDO: {}",
            count(OrderStatus::Criado),
            count(OrderStatus::Processando)
        ));
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

/// Estado final de uma execução da demo.
#[derive(Debug, Clone)]
pub struct DemoSummary {
    pub orders: usize,
    pub counts: HashMap<OrderStatus, usize>,
    pub dispatch: DispatchStats,
    pub consumer: ConsumerStats,
    pub broker: BrokerStats,
    pub elapsed: Duration,
}

impl DemoSummary {
    pub fn processed(&self) -> usize {
        self.counts.get(&OrderStatus::Processado).copied().unwrap_or_default()
    }

    pub fn all_processed(&self) -> bool {
        self.processed() == self.orders
    }

    /// Linhas do resumo, sem cores.
    pub fn lines(&self) -> Vec<String> {
        let count = |status: OrderStatus| self.counts.get(&status).copied().unwrap_or_default();
        vec![
            format!(
                "pedidos: {} em {:.1}s",
                self.orders,
                self.elapsed.as_secs_f64()
            ),
            format!(
                "status: CRIADO={} PROCESSANDO={} PROCESSADO={}",
                count(OrderStatus::Criado),
                count(OrderStatus::Processando),
                count(OrderStatus::Processado)
            ),
            format!(
                "despacho: publicados={} falhas={}",
                self.dispatch.published, self.dispatch.failed
            ),
            format!(
                "consumo: ack={} requeue={} dead-letter={} inválidas={}",
                self.consumer.acked, self.consumer.requeued, self.consumer.dead_lettered, self.consumer.malformed
            ),
            format!(
                "broker: entregues={} pendentes={} max-unacked={}",
                self.broker.delivered, self.broker.ready, self.broker.max_unacked
            ),
        ]
    }

    pub fn print(&self) {
        let (mark, style) = if self.all_processed() {
            ("✓", Style::new().green().bold())
        } else {
            ("✗", Style::new().red().bold())
        };
        println!();
        println!(
            "{} {}",
            style.apply_to(mark),
            style.apply_to(format!("{}/{} pedidos PROCESSADO", self.processed(), self.orders))
        );
        for line in self.lines() {
            println!("  {line}");
        }
    }
}
