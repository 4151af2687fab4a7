//! Broadcast subscriptions that end when their owner closes

use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A receiver on one of a tunnel's (or a node's) broadcast channels.
///
/// Items published before the owner closed are still delivered; after
/// that [`recv`](Self::recv) yields `None`.
pub struct Subscription<T> {
    rx: broadcast::Receiver<T>,
    closed: CancellationToken,
}

impl<T: Clone> Subscription<T> {
    pub(crate) fn new(rx: broadcast::Receiver<T>, closed: CancellationToken) -> Self {
        Self { rx, closed }
    }

    /// Wait for the next item, or `None` once the owner has closed
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            tokio::select! {
                biased;
                item = self.rx.recv() => match item {
                    Ok(item) => return Some(item),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Subscriber lagged, {} items dropped", skipped);
                    }
                    Err(RecvError::Closed) => return None,
                },
                _ = self.closed.cancelled() => {
                    return match self.rx.try_recv() {
                        Ok(item) => Some(item),
                        Err(TryRecvError::Lagged(_)) => self.rx.try_recv().ok(),
                        Err(_) => None,
                    };
                }
            }
        }
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    /// Whether the owner has closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drains_before_close() {
        let (tx, rx) = broadcast::channel(8);
        let token = CancellationToken::new();
        let mut sub = Subscription::new(rx, token.clone());

        tx.send(1u32).unwrap();
        tx.send(2u32).unwrap();
        token.cancel();

        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, Some(2));
        assert_eq!(sub.recv().await, None);
        assert!(sub.is_closed());
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let (_tx, rx) = broadcast::channel::<u32>(8);
        let mut sub = Subscription::new(rx, CancellationToken::new());

        assert_eq!(sub.recv_timeout(Duration::from_millis(20)).await, None);
    }
}
