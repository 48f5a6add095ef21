//! Connectivity signal.
//!
//! Connectivity is a single value with change notification, so it is carried
//! on a `watch` channel: late subscribers see the current state immediately.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Whether the remote backend is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Online,
    Offline,
}

/// Publishes connectivity transitions to the sync coordinator and anyone else
/// who subscribes. Cloning shares the same signal.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<Connectivity>>,
}

impl NetworkMonitor {
    /// Creates a monitor starting in `initial`.
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Sets the current connectivity. Subscribers are only woken on change.
    pub fn set(&self, connectivity: Connectivity) {
        let previous = self.tx.send_replace(connectivity);
        if previous != connectivity {
            info!("Connectivity changed: {:?} -> {:?}", previous, connectivity);
        }
    }

    pub fn set_online(&self) {
        self.set(Connectivity::Online);
    }

    pub fn set_offline(&self) {
        self.set(Connectivity::Offline);
    }

    /// The current connectivity.
    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current() == Connectivity::Online
    }

    /// A receiver that observes every subsequent change.
    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }

    /// Runs `callback` on every connectivity change until the monitor is dropped.
    pub fn on_status_change<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(Connectivity) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let current = *rx.borrow_and_update();
                callback(current);
            }
        })
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(Connectivity::Online)
    }
}

/// Resolves once `rx` reports [`Connectivity::Offline`].
/// Never resolves if the sender is gone.
pub(crate) async fn wait_offline(rx: &mut watch::Receiver<Connectivity>) {
    loop {
        if *rx.borrow_and_update() == Connectivity::Offline {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
