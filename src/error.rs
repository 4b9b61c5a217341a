//! Error taxonomy for calls against the billing API.

use thiserror::Error;

/// Failure of a single billing API call.
///
/// Cloneable so one failed in-flight request can be handed to every caller
/// that attached to it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  /// Connection, timeout or body-read failure.
  #[error("transport error: {message}")]
  Transport { message: String },
  /// The server answered 5xx.
  #[error("server error {status}: {body}")]
  Server { status: u16, body: String },
  /// The server answered 4xx. Never retried.
  #[error("request rejected {status}: {body}")]
  Client { status: u16, body: String },
  /// The response body did not have the expected shape.
  #[error("failed to decode response: {message}")]
  Decode { message: String },
}

impl FetchError {
  /// Build the error matching a non-success HTTP status.
  pub fn from_status(status: u16, body: &[u8]) -> Self {
    let body = String::from_utf8_lossy(body).trim().to_string();
    let body = if body.is_empty() {
      "<empty>".to_string()
    } else {
      body
    };
    if status >= 500 {
      FetchError::Server { status, body }
    } else {
      FetchError::Client { status, body }
    }
  }

  /// Transport failures and 5xx responses are worth another attempt.
  pub fn is_retryable(&self) -> bool {
    matches!(self, FetchError::Transport { .. } | FetchError::Server { .. })
  }
}

/// Rejected local edit of the pending set. Nothing was applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PendingEditError {
  #[error("site name is empty")]
  EmptySite,
  #[error("{0} is already pending")]
  DuplicateSite(String),
  #[error("no pending site at position {index} (list has {len})")]
  IndexOutOfRange { index: usize, len: usize },
  #[error("there are no pending sites to check out")]
  NothingPending,
}

impl From<reqwest::Error> for FetchError {
  fn from(e: reqwest::Error) -> Self {
    FetchError::Transport {
      message: e.to_string(),
    }
  }
}

impl From<serde_json::Error> for FetchError {
  fn from(e: serde_json::Error) -> Self {
    FetchError::Decode {
      message: e.to_string(),
    }
  }
}
