mod cli;

use anyhow::{Result, bail};
use clap::Parser;
use tracing::warn;

use cli::{Cli, Command};
use pedidos::config::PipelineConfig;
use pedidos::demo::{self, DemoOptions};
use pedidos::shutdown::Shutdown;
use pedidos::telemetry::{self, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let format = if cli.json_logs { LogFormat::Json } else { LogFormat::Pretty };
    telemetry::init_logging(format, telemetry::default_directive(cli.verbose));

    let mut config = PipelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Config => {
            print!("{}", config.to_toml()?);
        }
        Command::Demo {
            orders,
            product,
            quantity,
            delay_ms,
        } => {
            if let Some(delay_ms) = delay_ms {
                config.consumer.processing_delay_ms = delay_ms;
            }

            let shutdown = Shutdown::new();
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Ctrl-C recebido, encerrando");
                        shutdown.trigger();
                    }
                }
            });

            let options = DemoOptions {
                orders,
                product,
                quantity,
                deadline: DemoOptions::deadline_for(&config, orders),
                show_progress: !cli.json_logs,
            };
            let summary = demo::run(&config, &options, &shutdown).await?;
            summary.print();

            if !summary.all_processed() && !shutdown.is_triggered() {
                bail!("nem todos os pedidos chegaram a PROCESSADO");
            }
        }
    }

    Ok(())
}
