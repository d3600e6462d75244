// ABOUTME: Cooperative shutdown signal shared by every pipeline task
// ABOUTME: Checked at transaction boundaries and at the reader's wait point

use tokio::sync::watch;

/// Sending half. Dropping it does not count as a shutdown request.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

/// Receiving half, cheap to clone into each stage.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested; never resolves otherwise.
    pub async fn requested(&mut self) {
        let sender_gone = self.rx.wait_for(|requested| *requested).await.is_err();
        if sender_gone {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_observes_shutdown() {
        let (handle, mut signal) = channel();
        assert!(!signal.is_requested());

        let other = handle.signal();
        handle.shutdown();
        assert!(signal.is_requested());
        assert!(other.is_requested());

        tokio::time::timeout(Duration::from_secs(1), signal.requested())
            .await
            .expect("shutdown should resolve");
    }

    #[tokio::test]
    async fn test_dropped_handle_is_not_a_shutdown() {
        let (handle, mut signal) = channel();
        drop(handle);
        assert!(!signal.is_requested());
        let waited = tokio::time::timeout(Duration::from_millis(50), signal.requested()).await;
        assert!(waited.is_err());
    }
}
