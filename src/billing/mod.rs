pub mod api_types;
pub mod cache;
pub mod cached_client;
pub mod client;
pub mod types;

#[cfg(test)]
pub mod fake;

pub use cached_client::CachedBillingClient;
pub use client::{BillingApi, HttpBillingClient};
