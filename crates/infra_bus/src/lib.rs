use anyhow::{anyhow, Result};
use tokio::sync::mpsc;

/// Ordered event channel with a single consumer (the dispatcher loop).
///
/// Clones share one queue, so events published through one handle arrive in publish order.
#[derive(Debug)]
pub struct EventBus<T: Send + 'static> {
    tx: mpsc::Sender<T>,
}

impl<T: Send + 'static> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> EventBus<T> {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(16));
        (Self { tx }, rx)
    }

    /// Waits for queue space.
    pub async fn publish(&self, event: T) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| anyhow!("bus publish failed: dispatcher gone"))
    }

    pub fn try_publish(&self, event: T) -> Result<()> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(anyhow!("bus publish failed: full")),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(anyhow!("bus publish failed: dispatcher gone"))
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}
