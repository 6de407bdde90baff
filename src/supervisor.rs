//! Group membership loop.
//!
//! ```text
//! Idle -> Joining -> Consuming -> (error) Backoff -> Joining -> ... -> Draining -> Stopped
//! ```
//!
//! Broker errors never reach the caller: every failed join or session is followed
//! by a [BackoffPolicy] delay and another join, without limit. The only way out is
//! the cancellation token, which is honoured within one backoff interval and
//! releases the group session before [Supervisor::run] returns.
use std::sync::Arc;

use tokio::{sync::watch, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Span};

use crate::{backoff::BackoffPolicy, group::ConsumerGroup, ingester::Ingester};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Joining,
    Consuming,
    Backoff,
    Draining,
    Stopped,
}

pub struct Supervisor<G> {
    group: G,
    topics: Vec<String>,
    ingester: Arc<Ingester>,
    backoff: BackoffPolicy,
    state: watch::Sender<SupervisorState>,
    span: Span,
}

impl<G: ConsumerGroup> Supervisor<G> {
    pub fn new(
        group: G,
        topics: Vec<String>,
        ingester: Arc<Ingester>,
        backoff: BackoffPolicy,
        span: Span,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Supervisor {
            group,
            topics,
            ingester,
            backoff,
            state,
            span,
        }
    }

    /// Observes state transitions; the last value is always `Stopped` once `run` returned.
    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(parent: &self.span, topics = ?self.topics, "supervisor started");
        let mut attempt: u32 = 0;

        while !cancel.is_cancelled() {
            self.transition(SupervisorState::Joining);
            let session = match self.group.join(&self.topics).await {
                Ok(()) => {
                    self.transition(SupervisorState::Consuming);
                    self.group
                        .consume(self.ingester.clone(), cancel.clone())
                        .await
                }
                Err(e) => Err(e),
            };

            match session {
                Ok(()) => {
                    attempt = 0;
                    debug!(parent: &self.span, "group session ended");
                }
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    error!(
                        parent: &self.span,
                        error = %e,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "consumer group error"
                    );
                    self.transition(SupervisorState::Backoff);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        self.transition(SupervisorState::Draining);
        self.group.close().await;
        self.transition(SupervisorState::Stopped);
        info!(parent: &self.span, "supervisor stopped");
    }

    fn transition(&self, next: SupervisorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(parent: &self.span, from = ?previous, to = ?next, "state change");
        }
    }
}
