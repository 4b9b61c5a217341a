//! Billing client that routes every read through the request cache.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::cache::{with_retry, CacheLayer, CacheResult, RetryPolicy};
use crate::error::FetchError;

use super::api_types::{decode, ApiBillingPage, ApiLicensePage, ApiPendingEcho};
use super::cache::{BillingQueryKey, ListQuery, BILLING_PREFIX, LICENSES_PREFIX};
use super::client::BillingApi;
use super::types::{BillingSnapshot, CheckoutSession, LicenseSnapshot, PendingSiteEntry};

/// Billing client with transparent caching and request deduplication.
///
/// This wraps a [`BillingApi`] and assembles paginated reads into full
/// snapshots. Successful pending-site writes invalidate cached billing pages.
#[derive(Clone)]
pub struct CachedBillingClient {
  inner: Arc<dyn BillingApi>,
  cache: CacheLayer<Value>,
  page_size: u32,
  retry: RetryPolicy,
}

impl CachedBillingClient {
  pub fn new(
    inner: Arc<dyn BillingApi>,
    cache: CacheLayer<Value>,
    page_size: u32,
    retry: RetryPolicy,
  ) -> Self {
    Self {
      inner,
      cache,
      page_size: page_size.max(1),
      retry,
    }
  }

  /// Fetch every page of the billing snapshot.
  pub async fn billing_snapshot(
    &self,
    email: &str,
    use_cache: bool,
  ) -> Result<BillingSnapshot, FetchError> {
    let base = ListQuery::new(email, self.page_size);
    let mut snapshot = BillingSnapshot::default();
    let mut offset = 0u32;

    loop {
      let query = base.at_offset(offset);
      let key = BillingQueryKey::Billing(query.clone());
      let inner = Arc::clone(&self.inner);

      let result = self
        .cache
        .request(
          &key,
          move || {
            let inner = Arc::clone(&inner);
            let query = query.clone();
            async move { inner.fetch_billing(&query).await }
          },
          use_cache,
          self.retry.retries,
        )
        .await?;

      log_page("billing", offset, &result);
      let page: ApiBillingPage = decode(result.data)?;
      let (count, has_more, total) = (page.subscriptions.len(), page.has_more, page.total);
      snapshot.absorb(page);

      // Check if we've fetched all subscriptions
      match next_offset(offset, self.page_size, count, has_more, total) {
        Some(next) => offset = next,
        None => break,
      }
    }

    debug!(
      "billing snapshot: {} subscriptions, {} pending",
      snapshot.subscriptions.len(),
      snapshot.pending_sites.len()
    );
    Ok(snapshot)
  }

  /// Fetch every page of the license snapshot.
  pub async fn license_snapshot(
    &self,
    email: &str,
    use_cache: bool,
  ) -> Result<LicenseSnapshot, FetchError> {
    let base = ListQuery::new(email, self.page_size);
    let mut snapshot = LicenseSnapshot::default();
    let mut offset = 0u32;

    loop {
      let query = base.at_offset(offset);
      let key = BillingQueryKey::Licenses(query.clone());
      let inner = Arc::clone(&self.inner);

      let result = self
        .cache
        .request(
          &key,
          move || {
            let inner = Arc::clone(&inner);
            let query = query.clone();
            async move { inner.fetch_licenses(&query).await }
          },
          use_cache,
          self.retry.retries,
        )
        .await?;

      log_page("license", offset, &result);
      let page: ApiLicensePage = decode(result.data)?;
      let (count, has_more, total) = (page.licenses.len(), page.has_more, page.total);
      snapshot.absorb(page);

      match next_offset(offset, self.page_size, count, has_more, total) {
        Some(next) => offset = next,
        None => break,
      }
    }

    Ok(snapshot)
  }

  /// Add pending sites (retried, invalidates billing pages).
  pub async fn add_pending_sites(
    &self,
    email: &str,
    sites: &[PendingSiteEntry],
  ) -> Result<ApiPendingEcho, FetchError> {
    let echo = with_retry("add pending sites", self.retry, || {
      self.inner.add_pending_sites(email, sites)
    })
    .await?;
    self.cache.invalidate(BILLING_PREFIX);
    Ok(echo)
  }

  /// Replace the pending set (retried, invalidates billing pages).
  pub async fn replace_pending_sites(
    &self,
    email: &str,
    sites: &[PendingSiteEntry],
  ) -> Result<ApiPendingEcho, FetchError> {
    let echo = with_retry("replace pending sites", self.retry, || {
      self.inner.replace_pending_sites(email, sites)
    })
    .await?;
    self.cache.invalidate(BILLING_PREFIX);
    Ok(echo)
  }

  /// Remove one pending site (retried, invalidates billing pages).
  pub async fn remove_pending_site(
    &self,
    email: &str,
    site: &str,
  ) -> Result<ApiPendingEcho, FetchError> {
    let echo = with_retry("remove pending site", self.retry, || {
      self.inner.remove_pending_site(email, site)
    })
    .await?;
    self.cache.invalidate(BILLING_PREFIX);
    Ok(echo)
  }

  /// Create a checkout session (not retried: a duplicate would open two sessions).
  pub async fn create_checkout(
    &self,
    email: &str,
    sites: &[PendingSiteEntry],
  ) -> Result<CheckoutSession, FetchError> {
    self.inner.create_checkout(email, sites).await
  }

  /// Drop cached billing and license pages.
  pub fn invalidate_snapshots(&self) {
    self.cache.invalidate(BILLING_PREFIX);
    self.cache.invalidate(LICENSES_PREFIX);
  }

  /// Drop every cached page.
  pub fn invalidate_all(&self) {
    self.cache.invalidate_all();
  }
}

/// Offset of the next page, or `None` once the listing is exhausted.
///
/// `hasMore` alone is not trusted: paging also stops once the offset reaches
/// the reported total or would overflow.
fn next_offset(offset: u32, page_size: u32, count: usize, has_more: bool, total: u64) -> Option<u32> {
  if !has_more || count == 0 {
    return None;
  }
  let next = offset.checked_add(page_size)?;
  (u64::from(next) < total).then_some(next)
}

fn log_page(kind: &str, offset: u32, result: &CacheResult<Value>) {
  match result.cached_at {
    Some(at) => debug!(
      "{} page at offset {}: {:?}, stored {}",
      kind,
      offset,
      result.source,
      at.to_rfc3339()
    ),
    None => debug!("{} page at offset {}: {:?}", kind, offset, result.source),
  }
}
