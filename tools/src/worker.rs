use std::sync::Arc;
use std::time::Duration;

use skyqueue_core::config::{QueueNames, WorkerSettings};
use skyqueue_core::queue::{QueueClient, ReceivedMessage};
use skyqueue_core::QueueError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::handler::{handle, WeatherSource};

const BATCH_SIZE: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Answered { correlation_id: String },
    /// Left on the queue; it becomes visible again after the lease expires.
    Malformed,
    /// Moved to the poison queue after too many attempts.
    Poisoned,
}

/// Consumes tool requests from the input queue and answers on the output queue.
pub struct Worker {
    queue: Arc<dyn QueueClient>,
    weather: Arc<dyn WeatherSource>,
    queues: QueueNames,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        weather: Arc<dyn WeatherSource>,
        queues: QueueNames,
        settings: WorkerSettings,
    ) -> Self {
        Self { queue, weather, queues, settings }
    }

    pub async fn prepare(&self) -> Result<(), QueueError> {
        for name in [&self.queues.input, &self.queues.output, &self.queues.poison()] {
            self.queue.ensure_queue(name).await?;
        }
        Ok(())
    }

    // Transport errors are logged and retried on the idle back-off schedule.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut idle = self.settings.base_idle_poll;
        info!(queue = %self.queues.input, "worker listening");

        loop {
            let handled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.poll_once() => result,
            };

            let delay = match handled {
                Ok(outcomes) if !outcomes.is_empty() => {
                    idle = self.settings.base_idle_poll;
                    continue;
                }
                Ok(_) => idle,
                Err(e) => {
                    error!(queue = %self.queues.input, error = %e, "queue poll failed");
                    idle
                }
            };
            idle = next_idle(idle, self.settings.max_idle_poll);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(queue = %self.queues.input, "worker stopped");
    }

    pub async fn poll_once(&self) -> Result<Vec<Outcome>, QueueError> {
        let batch = self
            .queue
            .receive(&self.queues.input, BATCH_SIZE, self.settings.visibility_timeout)
            .await?;

        let mut outcomes = Vec::with_capacity(batch.len());
        for message in batch {
            match self.process(&message).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    // Lease expiry makes the message visible again.
                    warn!(message_id = %message.id, error = %e, "could not finish message");
                }
            }
        }
        Ok(outcomes)
    }

    async fn process(&self, message: &ReceivedMessage) -> Result<Outcome, QueueError> {
        if message.dequeue_count > self.settings.max_dequeue_count {
            let poison = self.queues.poison();
            self.queue.send(&poison, &message.body).await?;
            self.queue.delete(&self.queues.input, message).await?;
            warn!(
                message_id = %message.id,
                dequeue_count = message.dequeue_count,
                queue = %poison,
                "moved message to poison queue"
            );
            return Ok(Outcome::Poisoned);
        }

        let response = match handle(&message.body, self.weather.as_ref()) {
            Ok(response) => response,
            Err(e) => {
                error!(message_id = %message.id, error = %e, "rejected tool request");
                return Ok(Outcome::Malformed);
            }
        };

        let body = serde_json::to_vec(&response)
            .map_err(|e| QueueError::Decode(format!("cannot encode tool response: {e}")))?;
        self.queue.send(&self.queues.output, &body).await?;
        self.queue.delete(&self.queues.input, message).await?;

        info!(
            correlation_id = %response.correlation_id,
            queue = %self.queues.output,
            value = %response.value,
            "sent tool response"
        );
        Ok(Outcome::Answered { correlation_id: response.correlation_id })
    }
}

fn next_idle(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}
