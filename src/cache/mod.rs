//! Request caching for billing API reads.
//!
//! This module provides an API-agnostic caching mechanism that:
//! - Memoizes responses per canonical request key for a short TTL
//! - Collapses concurrent identical requests into one network call
//! - Retries transport failures and 5xx responses with a fixed backoff
//! - Supports substring and full invalidation after mutations

mod layer;
mod retry;
mod traits;

pub use layer::CacheLayer;
pub use retry::{with_retry, RetryPolicy};
pub use traits::{CacheResult, QueryKey};
