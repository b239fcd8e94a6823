//! Transport seam for the commit subscription.

use async_trait::async_trait;

use crate::types::Seq;

/// Subscription failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The relay dropped us for falling behind.
    #[error("consumer too slow")]
    ConsumerTooSlow,
    /// The relay closed the connection.
    #[error("connection closed")]
    Closed,
    /// Any other transport failure.
    #[error("transport i/o: {0}")]
    Io(String),
}

/// One open subscription.
#[async_trait]
pub trait FrameStream: Send {
    /// Next raw frame; `None` when the stream ended cleanly.
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, TransportError>>;
}

/// Opens subscriptions to the commit log.
#[async_trait]
pub trait CommitSource: Send + Sync {
    /// Subscribes after `cursor`, or from the live head when `None`.
    async fn connect(&self, cursor: Option<Seq>) -> Result<Box<dyn FrameStream>, TransportError>;
}
