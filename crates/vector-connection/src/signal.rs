//! Level-triggered, awaitable flags.
//!
//! A [`Signal`] is either set or clear. Waiters block until it is set and
//! return immediately if it already is. Built on [`tokio::sync::watch`] so it
//! can be set from one thread and awaited from tasks on another runtime.

use tokio::sync::watch;

/// A settable flag that tasks can wait on.
#[derive(Debug)]
pub struct Signal {
    tx: watch::Sender<bool>,
}

impl Signal {
    pub fn new(initially_set: bool) -> Self {
        let (tx, _) = watch::channel(initially_set);
        Self { tx }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the flag is set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|set| *set).await;
    }

    /// A detached handle for collaborators that want to observe the flag.
    pub fn listener(&self) -> SignalListener {
        SignalListener {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read-only view of a [`Signal`].
#[derive(Debug, Clone)]
pub struct SignalListener {
    rx: watch::Receiver<bool>,
}

impl SignalListener {
    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the flag is set.
    ///
    /// Returns `false` if the owning [`Signal`] was dropped before it was set.
    pub async fn wait(&mut self) -> bool {
        self.rx.wait_for(|set| *set).await.is_ok()
    }
}
