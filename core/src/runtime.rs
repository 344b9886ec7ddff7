use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agents::{AgentService, Role, Run, RunStatus, ThreadMessage};
use crate::config::PollPolicy;
use crate::error::{AgentServiceError, TurnError};
use crate::session::{Session, SessionFactory};

// Upper bound on the remote cancel sent for an abandoned run.
const ABANDON_TIMEOUT: Duration = Duration::from_secs(5);

/// Drives a single run on a session's thread to a terminal state.
#[derive(Debug, Clone, Copy)]
pub struct Runtime {
    poll: PollPolicy,
}

impl Runtime {
    pub fn new(poll: PollPolicy) -> Self {
        Self { poll }
    }

    /// Appends `prompt`, starts one run and waits for it, then returns the
    /// latest assistant text on the thread. Every remote call races `cancel`
    /// and the turn deadline.
    pub async fn run_turn(
        &self,
        session: &Session,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, TurnError> {
        let service = session.service();
        let thread_id = session.thread_id();
        let budget = TurnBudget::start(cancel, self.poll.deadline);

        // 1. Post the prompt
        let message_id = budget.call(service.create_message(thread_id, prompt), None).await?;
        info!(%thread_id, %message_id, "created message");

        // 2. Start exactly one run
        let run = budget.call(service.create_run(thread_id, session.agent_id()), None).await?;
        info!(%thread_id, run_id = %run.id, status = %run.status, "started run");

        // 3. Wait for a terminal status, cancelling the run remotely if we give up
        let run_id = run.id.clone();
        let run = match self.await_terminal(&budget, service, thread_id, run).await {
            Ok(run) => run,
            Err(e) => {
                if matches!(e, TurnError::Cancelled { .. } | TurnError::DeadlineExceeded { .. }) {
                    abandon(service, thread_id, &run_id).await;
                }
                return Err(e);
            }
        };
        match run.status {
            RunStatus::Completed => info!(run_id = %run.id, "run finished with status: completed"),
            RunStatus::Failed => {
                let last_error = run.last_error.as_ref().map(ToString::to_string).unwrap_or_default();
                error!(run_id = %run.id, %last_error, "run failed");
            }
            other => warn!(run_id = %run.id, status = %other, "run finished without completing"),
        }

        // 4. Extract
        let messages = budget.call(service.list_messages(thread_id), Some(&run.id)).await?;
        debug!(%thread_id, count = messages.len(), "listed messages");

        let text = extract_assistant_text(&messages).ok_or_else(|| {
            TurnError::NoAssistantResponse { thread_id: thread_id.to_string() }
        })?;
        info!(%thread_id, chars = text.len(), "extracted assistant response");
        Ok(text.to_string())
    }

    async fn await_terminal(
        &self,
        budget: &TurnBudget<'_>,
        service: &dyn AgentService,
        thread_id: &str,
        mut run: Run,
    ) -> Result<Run, TurnError> {
        while run.status.is_active() {
            budget.pause(self.poll.interval, &run.id).await?;

            let previous = run.status;
            run = budget.call(service.get_run(thread_id, &run.id), Some(&run.id)).await?;
            if run.status != previous {
                debug!(run_id = %run.id, from = %previous, to = %run.status, "run status changed");
            }
        }
        Ok(run)
    }
}

struct TurnBudget<'a> {
    cancel: &'a CancellationToken,
    started: Instant,
    deadline: Instant,
}

impl<'a> TurnBudget<'a> {
    fn start(cancel: &'a CancellationToken, limit: Duration) -> Self {
        let started = Instant::now();
        Self { cancel, started, deadline: started + limit }
    }

    async fn interrupted(&self, run_id: Option<&str>) -> TurnError {
        let run_id = run_id.map(str::to_string);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => TurnError::Cancelled { run_id },
            _ = sleep_until(self.deadline) => TurnError::DeadlineExceeded {
                run_id,
                waited: self.started.elapsed(),
            },
        }
    }

    async fn call<T, F>(&self, call: F, run_id: Option<&str>) -> Result<T, TurnError>
    where
        F: Future<Output = Result<T, AgentServiceError>>,
    {
        tokio::select! {
            biased;
            e = self.interrupted(run_id) => Err(e),
            result = call => result.map_err(TurnError::RunTransport),
        }
    }

    async fn pause(&self, interval: Duration, run_id: &str) -> Result<(), TurnError> {
        tokio::select! {
            biased;
            e = self.interrupted(Some(run_id)) => Err(e),
            _ = sleep(interval) => Ok(()),
        }
    }
}

async fn abandon(service: &dyn AgentService, thread_id: &str, run_id: &str) {
    match timeout(ABANDON_TIMEOUT, service.cancel_run(thread_id, run_id)).await {
        Ok(Ok(run)) => info!(%run_id, status = %run.status, "requested run cancellation"),
        Ok(Err(e)) => warn!(%run_id, error = %e, "could not cancel abandoned run"),
        Err(_) => warn!(%run_id, "cancel request for abandoned run timed out"),
    }
}

/// Text of the newest assistant message's last content block.
///
/// `messages` must be most-recent-first.
pub fn extract_assistant_text(messages: &[ThreadMessage]) -> Option<&str> {
    messages
        .iter()
        .find(|m| m.role == Role::Assistant)?
        .content
        .last()?
        .text()
}

/// A complete request: open a session, run one turn, always close the session.
pub struct Conversation {
    factory: Arc<SessionFactory>,
    runtime: Runtime,
}

impl Conversation {
    pub fn new(factory: Arc<SessionFactory>, runtime: Runtime) -> Self {
        Self { factory, runtime }
    }

    pub fn factory(&self) -> &Arc<SessionFactory> {
        &self.factory
    }

    pub async fn ask(&self, prompt: &str, cancel: &CancellationToken) -> Result<String, TurnError> {
        let session = self.factory.create_session().await?;
        let outcome = self.runtime.run_turn(&session, prompt, cancel).await;
        session.close().await;
        outcome
    }
}
