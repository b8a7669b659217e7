//! Hierarchical cancellation scope.
//!
//! A [`Shutdown`] is triggered once and observed through any number of
//! [`ShutdownListener`]s. [`Shutdown::child`] derives a scope that fires
//! when its parent fires or when it is triggered on its own, which is how
//! process shutdown flows into each worker pool.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fires the scope. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }

    /// A scope that is triggered together with `self`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn child(&self) -> Shutdown {
        let child = Shutdown::new();
        if self.is_triggered() {
            child.trigger();
            return child;
        }
        let parent = self.listener();
        let own = child.listener();
        let forward = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                fired = parent.wait_or_orphan() => {
                    if fired {
                        forward.trigger();
                    }
                }
                // Triggered on its own; nothing left to forward.
                _ = own.wait() => {}
            }
        });
        child
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Observes a [`Shutdown`] scope.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the scope is triggered. Never resolves if every
    /// [`Shutdown`] handle was dropped without triggering.
    pub async fn wait(&self) {
        if !self.wait_or_orphan().await {
            std::future::pending::<()>().await;
        }
    }

    // true when triggered, false when the scope can no longer be triggered
    async fn wait_or_orphan(&self) -> bool {
        let mut rx = self.rx.clone();
        rx.wait_for(|triggered| *triggered).await.is_ok()
    }
}
