//! Inicialização de logs e spans padrão dos pools.
//!
//! Nenhum componente da biblioteca instala subscriber global; apenas o
//! binário chama [`init_logging`]. Os pools recebem o span pelo qual seus
//! logs são registrados.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    #[default]
    Pretty,
}

/// Installs the global subscriber. Later calls are no-ops.
///
/// `RUST_LOG` wins over `default_directive` when set.
pub fn init_logging(format: LogFormat, default_directive: &str) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().compact().with_writer(std::io::stderr))
                    .init();
            }
        }
    });
}

/// Default filter for the binary.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "pedidos=debug,info" } else { "warn" }
}

#[must_use]
pub fn dispatch_span(pool: &str) -> Span {
    tracing::info_span!("dispatch", pool = pool)
}

#[must_use]
pub fn consumer_span(pool: &str, prefetch: usize) -> Span {
    tracing::info_span!("consumer", pool = pool, prefetch = prefetch)
}
