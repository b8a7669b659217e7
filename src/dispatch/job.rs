use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::BrokerError;
use crate::order::StatusChangeEvent;

/// A status-change event waiting to be published, with the instant after
/// which the publish is abandoned.
#[derive(Debug)]
pub struct DispatchJob {
    pub event: StatusChangeEvent,
    pub deadline: Instant,
    pub(super) receipt: Option<oneshot::Sender<Result<(), BrokerError>>>,
}

impl DispatchJob {
    pub fn new(event: StatusChangeEvent, timeout: Duration) -> Self {
        Self::with_deadline(event, Instant::now() + timeout)
    }

    pub fn with_deadline(event: StatusChangeEvent, deadline: Instant) -> Self {
        Self {
            event,
            deadline,
            receipt: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub(super) fn tracked(mut self) -> (Self, PublishReceipt) {
        let (tx, rx) = oneshot::channel();
        self.receipt = Some(tx);
        (self, PublishReceipt { rx })
    }
}

/// Resolves with the outcome of a job submitted through
/// [`DispatchPool::submit_tracked`](super::DispatchPool::submit_tracked).
#[derive(Debug)]
pub struct PublishReceipt {
    rx: oneshot::Receiver<Result<(), BrokerError>>,
}

impl PublishReceipt {
    pub async fn outcome(self) -> Result<(), BrokerError> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(BrokerError::Transport("job descartado sem resultado".into())))
    }
}
