//! Interface de linha de comando do `pedidos` baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (demo, config)
//! e flags globais (--config, --verbose, --json-logs).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Pipeline assíncrono de status de pedidos: CRIADO → PROCESSANDO → PROCESSADO.
#[derive(Debug, Parser)]
#[command(name = "pedidos", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Arquivo de configuração (padrão: pedidos.toml, se existir).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Emite logs em JSON, um objeto por linha.
    #[arg(long, global = true, default_value_t = false)]
    pub json_logs: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa o pipeline completo com gateways em memória.
    Demo {
        /// Quantidade de pedidos a criar.
        #[arg(long, default_value_t = 5)]
        orders: usize,

        /// Produto de cada pedido.
        #[arg(long, default_value = "widget")]
        product: String,

        /// Quantidade de itens de cada pedido.
        #[arg(long, default_value_t = 3)]
        quantity: u32,

        /// Sobrescreve o tempo de processamento simulado (ms).
        #[arg(long)]
        delay_ms: Option<u64>,
    },

    /// Mostra a configuração efetiva em TOML.
    Config,
}
