//! Fixed-backoff retry for billing API calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::FetchError;

/// Retry settings for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Additional attempts after the first one
  pub retries: u32,
  /// Wait between attempts
  pub backoff: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      retries: 2,
      backoff: Duration::from_secs(1),
    }
  }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent.
pub async fn with_retry<T, F, Fut>(what: &str, policy: RetryPolicy, op: F) -> Result<T, FetchError>
where
  F: Fn() -> Fut,
  Fut: Future<Output = Result<T, FetchError>>,
{
  let mut attempt = 0;
  loop {
    match op().await {
      Ok(value) => return Ok(value),
      Err(e) if e.is_retryable() && attempt < policy.retries => {
        attempt += 1;
        warn!(
          "{} failed ({}), retry {}/{} in {:?}",
          what, e, attempt, policy.retries, policy.backoff
        );
        tokio::time::sleep(policy.backoff).await;
      }
      Err(e) => return Err(e),
    }
  }
}
