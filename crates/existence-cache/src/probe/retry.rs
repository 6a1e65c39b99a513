use std::error::Error;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ProbeClient, ProbeError, Verdict};
use crate::config::RetryConfig;

/// The final result of a probe, including all of its retries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The origin answered unambiguously.
    ///
    /// This is the only outcome that is written to the cache.
    Definitive(bool),
    /// A transport failure, or the origin never answered definitively within the configured
    /// number of attempts.
    Failed,
    /// Every waiter lost interest before the probe finished.
    Cancelled,
}

impl ProbeOutcome {
    /// The answer handed to waiters. Everything but a definitive "found" means `false`.
    pub fn exists(self) -> bool {
        matches!(self, Self::Definitive(true))
    }

    pub fn is_cacheable(self) -> bool {
        matches!(self, Self::Definitive(_))
    }

    pub fn as_tag(self) -> &'static str {
        match self {
            Self::Definitive(true) => "found",
            Self::Definitive(false) => "notfound",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// The states a probe moves through.
///
/// ```text
/// Probing ──> Done(Definitive | Failed | Cancelled)
///    ^  │
///    │  v
///  Retrying ──> Done(Failed | Cancelled)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeState {
    /// About to ask the origin, `attempt` counts from 1.
    Probing { attempt: usize },
    /// Attempt number `attempt` was indeterminate, waiting for the backoff to pass.
    Retrying { attempt: usize },
    Done(ProbeOutcome),
}

impl ProbeState {
    pub fn initial() -> Self {
        Self::Probing { attempt: 1 }
    }
}

/// Drives one probe from its first attempt to a [`ProbeOutcome`].
///
/// The cancellation token is checked before every attempt and raced against both the probe
/// itself and the backoff delay, so a cancelled probe stops right away.
pub struct RetryController<'a, C: ?Sized> {
    client: &'a C,
    identifier: &'a str,
    config: &'a RetryConfig,
    cancel: &'a CancellationToken,
}

impl<'a, C: ProbeClient + ?Sized> RetryController<'a, C> {
    pub fn new(
        client: &'a C,
        identifier: &'a str,
        config: &'a RetryConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            client,
            identifier,
            config,
            cancel,
        }
    }

    /// Runs the state machine until it reaches a terminal state.
    pub async fn run(&self) -> ProbeOutcome {
        let mut state = ProbeState::initial();
        loop {
            state = match state {
                ProbeState::Done(outcome) => return outcome,
                state => self.step(state).await,
            };
        }
    }

    /// Performs a single transition.
    pub async fn step(&self, state: ProbeState) -> ProbeState {
        match state {
            ProbeState::Probing { attempt } => self.probe(attempt).await,
            ProbeState::Retrying { attempt } => self.backoff(attempt).await,
            done @ ProbeState::Done(_) => done,
        }
    }

    async fn probe(&self, attempt: usize) -> ProbeState {
        if self.cancel.is_cancelled() {
            return ProbeState::Done(ProbeOutcome::Cancelled);
        }

        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return ProbeState::Done(ProbeOutcome::Cancelled),
            result = self.client.probe(self.identifier, self.cancel) => result,
        };

        let verdict = Verdict::classify(&result);
        let status = match &result {
            Ok(status) => status.as_str(),
            Err(ProbeError::Timeout) => "timeout",
            Err(ProbeError::Transport(_)) => "transport",
        };
        metric!(counter("probe.status") += 1, "status" => status);
        metric!(timer("probe.duration") = start.elapsed(), "verdict" => verdict.as_tag());

        match verdict {
            Verdict::Found => ProbeState::Done(ProbeOutcome::Definitive(true)),
            Verdict::NotFound => ProbeState::Done(ProbeOutcome::Definitive(false)),
            Verdict::Indeterminate => {
                tracing::debug!(
                    identifier = self.identifier,
                    attempt,
                    result = ?result,
                    "Indeterminate probe result"
                );
                ProbeState::Retrying { attempt }
            }
            Verdict::Failed => {
                if let Err(error) = &result {
                    tracing::debug!(
                        error = error as &dyn Error,
                        identifier = self.identifier,
                        "Probe failed"
                    );
                }
                ProbeState::Done(ProbeOutcome::Failed)
            }
        }
    }

    async fn backoff(&self, attempt: usize) -> ProbeState {
        if self
            .config
            .max_attempts
            .is_some_and(|max_attempts| attempt >= max_attempts.get())
        {
            tracing::warn!(
                identifier = self.identifier,
                attempts = attempt,
                "Giving up on indeterminate probe results"
            );
            return ProbeState::Done(ProbeOutcome::Failed);
        }

        metric!(counter("probe.retry") += 1);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => ProbeState::Done(ProbeOutcome::Cancelled),
            _ = tokio::time::sleep(self.config.backoff) => ProbeState::Probing { attempt: attempt + 1 },
        }
    }
}
