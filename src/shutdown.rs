//! Shutdown signalling shared by the control loop and the parameter controller.

use log::info;
use tokio::sync::watch;

/// Sending half, owned by whoever reacts to Ctrl+C (or by tests).
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

/// Cheap-to-clone receiving half.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

impl ShutdownHandle {
    pub fn request(&self) {
        if !*self.tx.borrow() {
            info!("Shutdown requested");
        }
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal { rx: self.tx.subscribe() }
    }
}

impl ShutdownSignal {
    /// A signal that never fires, for one-shot runs.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested. Pends forever if the handle is
    /// dropped without requesting it.
    pub async fn requested(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_requested_resolves_after_request() {
        let (handle, mut signal) = channel();
        assert!(!signal.is_requested());

        let waiter = tokio::spawn(async move {
            signal.requested().await;
        });
        handle.request();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_handle_is_not_a_shutdown() {
        let (handle, mut signal) = channel();
        drop(handle);
        let outcome = tokio::time::timeout(Duration::from_millis(50), signal.requested()).await;
        assert!(outcome.is_err());
        assert!(!signal.is_requested());
    }
}
