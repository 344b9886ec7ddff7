#[cfg(any(test, feature = "test-support"))]
mod memory;
mod storage;

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueError;

#[cfg(any(test, feature = "test-support"))]
pub use memory::MemoryQueue;
pub use storage::{StorageAccount, StorageQueueClient};

/// A message leased from a queue. It stays invisible to other consumers until
/// the visibility timeout lapses or it is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: String,
    pub pop_receipt: String,
    pub dequeue_count: u32,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn ensure_queue(&self, queue: &str) -> Result<(), QueueError>;

    async fn send(&self, queue: &str, body: &[u8]) -> Result<(), QueueError>;

    async fn receive(
        &self,
        queue: &str,
        max_messages: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    async fn delete(&self, queue: &str, message: &ReceivedMessage) -> Result<(), QueueError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageEncoding {
    /// Base64 of the raw bytes, what serverless queue bindings produce and expect.
    Base64,
    /// Body stored verbatim; it must be valid UTF-8.
    Text,
}

impl FromStr for MessageEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "base64" => Ok(Self::Base64),
            "text" | "none" => Ok(Self::Text),
            other => Err(format!("unknown message encoding `{other}`, expected base64 or text")),
        }
    }
}
