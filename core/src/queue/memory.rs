use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use super::{QueueClient, ReceivedMessage};
use crate::error::QueueError;

#[derive(Debug)]
struct Stored {
    id: String,
    pop_receipt: String,
    dequeue_count: u32,
    visible_at: Instant,
    body: Vec<u8>,
}

/// In-process queue with lease semantics close to the storage service.
///
/// Sending to an unknown queue creates it.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    queues: Arc<Mutex<HashMap<String, VecDeque<Stored>>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bodies currently held by `queue`, leased or not, oldest first.
    pub fn bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .get(queue)
            .map(|q| q.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self, queue: &str) -> usize {
        self.lock().get(queue).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Stored>>> {
        // A poisoned map is still structurally sound; keep serving it.
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn ensure_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.lock().entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn send(&self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
        self.lock().entry(queue.to_string()).or_default().push_back(Stored {
            id: Uuid::new_v4().to_string(),
            pop_receipt: String::new(),
            dequeue_count: 0,
            visible_at: Instant::now(),
            body: body.to_vec(),
        });
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: u32,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let now = Instant::now();
        let mut queues = self.lock();
        let Some(messages) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let leased = messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .take(max_messages as usize)
            .map(|m| {
                m.dequeue_count += 1;
                m.pop_receipt = Uuid::new_v4().to_string();
                m.visible_at = now + visibility_timeout;
                ReceivedMessage {
                    id: m.id.clone(),
                    pop_receipt: m.pop_receipt.clone(),
                    dequeue_count: m.dequeue_count,
                    body: m.body.clone(),
                }
            })
            .collect();
        Ok(leased)
    }

    async fn delete(&self, queue: &str, message: &ReceivedMessage) -> Result<(), QueueError> {
        let mut queues = self.lock();
        let messages = queues.get_mut(queue).ok_or_else(|| QueueError::Api {
            status: 404,
            message: format!("queue `{queue}` does not exist"),
        })?;
        let position = messages
            .iter()
            .position(|m| m.id == message.id && m.pop_receipt == message.pop_receipt)
            .ok_or_else(|| QueueError::Api {
                status: 404,
                message: format!("message `{}` not found or lease expired", message.id),
            })?;
        messages.remove(position);
        Ok(())
    }
}
