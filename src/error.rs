//! Tipos de erro do pipeline de pedidos.
//!
//! Cada fronteira tem seu próprio enum derivado com `thiserror`. Os erros que
//! chegam ao pool de consumo sabem dizer se são [`FailureKind::Transient`]
//! (vale a pena reenfileirar) ou [`FailureKind::Permanent`] (reenfileirar
//! nunca vai resolver).

use thiserror::Error;

use crate::order::OrderStatus;

/// Classifies a failure for the ack/reject decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeouts, unavailable store or broker, interrupted processing.
    Transient,
    /// The message can never succeed (missing order, malformed payload).
    Permanent,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "Transient"),
            FailureKind::Permanent => write!(f, "Permanent"),
        }
    }
}

/// Erros do gateway de persistência.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("pedido não encontrado: {0}")]
    NotFound(String),

    #[error("pedido já existe: {0}")]
    Duplicate(String),

    #[error("pedido {order_id} está em {actual}, esperado {expected}")]
    Conflict {
        order_id: String,
        expected: OrderStatus,
        actual: OrderStatus,
    },

    #[error("operação no repositório excedeu {0:?}")]
    Timeout(std::time::Duration),

    #[error("repositório indisponível: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StoreError::NotFound(_) | StoreError::Duplicate(_) => FailureKind::Permanent,
            _ => FailureKind::Transient,
        }
    }
}

/// Erros dos gateways de publicação e consumo do broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("erro ao serializar mensagem: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("prazo de publicação expirado")]
    DeadlineExceeded,

    #[error("erro de transporte: {0}")]
    Transport(String),

    #[error("conexão com o broker fechada: {0}")]
    ConnectionClosed(String),
}

/// Falha ao transicionar um pedido.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("pedido não encontrado: {0}")]
    OrderNotFound(String),

    #[error("erro ao {step}: {source}")]
    Store {
        step: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("processamento do pedido {0} interrompido por shutdown")]
    Interrupted(String),
}

impl TransitionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransitionError::OrderNotFound(_) => FailureKind::Permanent,
            TransitionError::Store { source, .. } => source.kind(),
            TransitionError::Interrupted(_) => FailureKind::Transient,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("pool de despacho encerrado")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("falha ao registrar consumer: {0}")]
    Subscribe(#[source] BrokerError),

    #[error("conexão com o broker perdida: {0}")]
    ConnectionLost(String),
}

/// Erros visíveis a quem cria pedidos.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("erro ao salvar o pedido: {0}")]
    Persist(#[source] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn not_found_is_permanent() {
        let err = TransitionError::OrderNotFound("abc".into());
        assert_eq!(err.kind(), FailureKind::Permanent);
    }

    #[test]
    fn store_failures_inherit_kind() {
        let timeout = TransitionError::Store {
            step: "atualizar status para PROCESSANDO",
            source: StoreError::Timeout(Duration::from_secs(5)),
        };
        assert_eq!(timeout.kind(), FailureKind::Transient);

        let missing = TransitionError::Store {
            step: "atualizar status para PROCESSADO",
            source: StoreError::NotFound("abc".into()),
        };
        assert_eq!(missing.kind(), FailureKind::Permanent);
    }

    #[test]
    fn interrupted_is_transient() {
        assert_eq!(
            TransitionError::Interrupted("abc".into()).kind(),
            FailureKind::Transient
        );
    }

    #[test]
    fn conflict_display() {
        let err = StoreError::Conflict {
            order_id: "o-1".into(),
            expected: OrderStatus::Criado,
            actual: OrderStatus::Processado,
        };
        assert_eq!(err.to_string(), "pedido o-1 está em PROCESSADO, esperado CRIADO");
    }

    #[test]
    fn failure_kind_display() {
        assert_eq!(FailureKind::Transient.to_string(), "Transient");
        assert_eq!(FailureKind::Permanent.to_string(), "Permanent");
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TransitionError>();
        assert_send_sync::<BrokerError>();
        assert_send_sync::<ConsumerError>();
    }
}
