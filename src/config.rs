//! Configuração do pipeline carregada a partir de `pedidos.toml`.
//!
//! A struct [`PipelineConfig`] contém todos os parâmetros configuráveis,
//! agrupados nas seções `[dispatch]`, `[consumer]` e `[retry]`. Valores não
//! presentes no arquivo usam defaults sensíveis. Variáveis de ambiente têm
//! precedência sobre o arquivo.
//!
//! [`PipelineConfig::validate`] rejeita zero apenas nos tamanhos (workers,
//! fila, prefetch) e nos timeouts de job, publish e repositório. O atraso
//! de retry, `max_retries` e o atraso de processamento aceitam zero:
//! `base_delay_ms = 0` faz o requeue sem espera, `max_retries = 0` manda
//! toda falha transitória direto para dead-letter.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::consumer::{ConsumerConfig, RetryConfig};
use crate::dispatch::DispatchConfig;
use crate::order::TransitionConfig;

/// Arquivo lido quando nenhum caminho é informado.
pub const DEFAULT_CONFIG_FILE: &str = "pedidos.toml";

/// Configuração de nível superior carregada de `pedidos.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub dispatch: DispatchSettings,
    pub consumer: ConsumerSettings,
    pub retry: RetryConfig,
}

/// Seção `[dispatch]`: pool de publicação.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Número de workers publicando em paralelo.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacidade da fila de jobs.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Tempo de vida de cada job em milissegundos.
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,

    /// Limite de cada publicação em milissegundos.
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

/// Seção `[consumer]`: pool de consumo e transição.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Máximo de mensagens não confirmadas em posse do consumer.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,

    /// Tempo de processamento simulado em milissegundos.
    #[serde(default = "default_processing_delay_ms")]
    pub processing_delay_ms: u64,

    /// Limite de cada chamada ao repositório em milissegundos.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Interrompe o processamento simulado durante o shutdown.
    #[serde(default = "default_interruptible")]
    pub interruptible_processing: bool,
}

// Valor padrão para workers: 10.
fn default_workers() -> usize {
    10
}

// Valor padrão para a capacidade da fila: 100.
fn default_queue_capacity() -> usize {
    100
}

fn default_job_timeout_ms() -> u64 {
    30_000
}

fn default_publish_timeout_ms() -> u64 {
    5_000
}

// Um pedido por vez por consumer.
fn default_prefetch() -> usize {
    1
}

fn default_processing_delay_ms() -> u64 {
    2_000
}

fn default_store_timeout_ms() -> u64 {
    5_000
}

fn default_interruptible() -> bool {
    true
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            job_timeout_ms: default_job_timeout_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            prefetch: default_prefetch(),
            processing_delay_ms: default_processing_delay_ms(),
            store_timeout_ms: default_store_timeout_ms(),
            interruptible_processing: default_interruptible(),
        }
    }
}

impl PipelineConfig {
    /// Carrega a configuração de `path`, ou de `pedidos.toml` no diretório
    /// atual quando nenhum caminho é dado, aplica as variáveis de ambiente e
    /// valida o resultado.
    ///
    /// Um caminho explícito precisa existir; o arquivo padrão é opcional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?,
            None => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("falha ao ler configuração em {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("configuração inválida em {}", path.display()))
    }

    /// Aplica as variáveis de ambiente da implantação. Variáveis vazias são
    /// ignoradas; valores que não são números falham.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| -> Result<Option<u64>> {
            match lookup(name) {
                Some(value) if !value.trim().is_empty() => value
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .with_context(|| format!("variável {name} inválida: {value:?}")),
                _ => Ok(None),
            }
        };

        if let Some(workers) = read("WORKER_POOL_SIZE")? {
            self.consumer.workers = workers as usize;
        }
        if let Some(prefetch) = read("RABBITMQ_PREFETCH_COUNT")? {
            self.consumer.prefetch = prefetch as usize;
        }
        if let Some(delay) = read("WORKER_PROCESSING_DELAY_MS")? {
            self.consumer.processing_delay_ms = delay;
        }
        if let Some(workers) = read("DISPATCH_WORKERS")? {
            self.dispatch.workers = workers as usize;
        }
        if let Some(capacity) = read("DISPATCH_QUEUE_CAPACITY")? {
            self.dispatch.queue_capacity = capacity as usize;
        }
        if let Some(timeout) = read("RABBITMQ_PUBLISH_TIMEOUT_MS")? {
            self.dispatch.publish_timeout_ms = timeout;
        }
        if let Some(retries) = read("MAX_RETRIES")? {
            self.retry.max_retries = u32::try_from(retries).context("MAX_RETRIES fora do intervalo")?;
        }
        Ok(())
    }

    /// Rejects zero sizes and zero job, publish or store timeouts. The
    /// retry settings and the processing delay are not checked.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("dispatch.workers", self.dispatch.workers as u64),
            ("dispatch.queue_capacity", self.dispatch.queue_capacity as u64),
            ("dispatch.job_timeout_ms", self.dispatch.job_timeout_ms),
            ("dispatch.publish_timeout_ms", self.dispatch.publish_timeout_ms),
            ("consumer.workers", self.consumer.workers as u64),
            ("consumer.prefetch", self.consumer.prefetch as u64),
            ("consumer.store_timeout_ms", self.consumer.store_timeout_ms),
        ];
        for (field, value) in checks {
            if value == 0 {
                bail!("{field} deve ser maior que zero");
            }
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            workers: self.dispatch.workers,
            queue_capacity: self.dispatch.queue_capacity,
            job_timeout: Duration::from_millis(self.dispatch.job_timeout_ms),
            publish_timeout: Duration::from_millis(self.dispatch.publish_timeout_ms),
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            workers: self.consumer.workers,
            prefetch: self.consumer.prefetch,
        }
    }

    pub fn transition_config(&self) -> TransitionConfig {
        TransitionConfig {
            processing_delay: Duration::from_millis(self.consumer.processing_delay_ms),
            store_timeout: self.store_timeout(),
            interruptible: self.consumer.interruptible_processing,
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer.store_timeout_ms)
    }
}
