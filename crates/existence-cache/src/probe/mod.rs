//! Asking the origin whether a resource exists.
//!
//! A [`ProbeClient`] performs exactly one check and reports the raw status code. Turning raw
//! results into cacheable answers, and retrying the ones that are not, is the job of the
//! [`RetryController`].

use std::error::Error;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod http;
mod retry;

pub use self::http::HttpProbeClient;
pub(crate) use self::http::ensure_trailing_slash;
pub use self::retry::{ProbeOutcome, ProbeState, RetryController};

/// An error that prevented a probe from getting any status code at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// The origin did not answer in time.
    ///
    /// This is the only error that is retried, as the origin may just be busy.
    #[error("probe timed out")]
    Timeout,
    /// The probe could not be sent or its response could not be read, like connection loss,
    /// DNS resolution, or a malformed response.
    ///
    /// The attached string contains the innermost error message.
    #[error("probe failed: {0}")]
    Transport(String),
}

impl ProbeError {
    /// Whether it is worth asking the origin again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    fn transport_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        Self::Transport(error_string)
    }
}

impl From<reqwest::Error> for ProbeError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else {
            Self::transport_error(&error)
        }
    }
}

/// Performs a single existence check against the origin.
#[async_trait]
pub trait ProbeClient: Send + Sync + 'static {
    /// Asks the origin about `identifier` and returns the status code it answered with.
    ///
    /// `cancel` fires when nobody is interested in the answer anymore. Implementations may use
    /// it to abort early, the caller stops polling the probe in that case anyway.
    async fn probe(
        &self,
        identifier: &str,
        cancel: &CancellationToken,
    ) -> Result<StatusCode, ProbeError>;
}

/// How a single probe result is treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Any `2xx` status other than `202 Accepted`.
    Found,
    /// `404 Not Found`.
    NotFound,
    /// Worth asking again later: `202 Accepted` (the origin is still looking the resource up),
    /// any other unexpected status, or a timeout.
    Indeterminate,
    /// A transport error that will most likely not go away by retrying.
    Failed,
}

impl Verdict {
    pub fn classify(result: &Result<StatusCode, ProbeError>) -> Self {
        match result {
            Ok(StatusCode::NOT_FOUND) => Self::NotFound,
            Ok(StatusCode::ACCEPTED) => Self::Indeterminate,
            Ok(status) if status.is_success() => Self::Found,
            Ok(_) => Self::Indeterminate,
            Err(error) if error.is_retriable() => Self::Indeterminate,
            Err(_) => Self::Failed,
        }
    }

    pub fn as_tag(self) -> &'static str {
        match self {
            Self::Found => "found",
            Self::NotFound => "notfound",
            Self::Indeterminate => "indeterminate",
            Self::Failed => "failed",
        }
    }
}
