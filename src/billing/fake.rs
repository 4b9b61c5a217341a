//! Scripted in-memory billing API for tests.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::api_types::{ApiPendingEcho, ApiPendingEchoSite};
use super::cache::ListQuery;
use super::client::BillingApi;
use super::types::{CheckoutSession, PendingSiteEntry};
use crate::error::FetchError;

#[derive(Default)]
struct FakeState {
  subscriptions: Map<String, Value>,
  licenses: Vec<Value>,
  pending: Vec<PendingSiteEntry>,
  billing_failures: VecDeque<FetchError>,
  write_failure: Option<FetchError>,
  checkout_failure: Option<FetchError>,
  writes: Vec<String>,
  delay: Duration,
  write_delay: Duration,
  endless_pages: bool,
}

#[derive(Default)]
pub struct FakeApi {
  state: Mutex<FakeState>,
  billing_calls: AtomicU32,
  license_calls: AtomicU32,
}

impl FakeApi {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_subscription(self, id: &str, body: Value) -> Self {
    self.add_subscription(id, body);
    self
  }

  pub fn add_subscription(&self, id: &str, body: Value) {
    self.state.lock().unwrap().subscriptions.insert(id.to_string(), body);
  }

  pub fn with_license(self, body: Value) -> Self {
    self.state.lock().unwrap().licenses.push(body);
    self
  }

  pub fn set_pending(&self, sites: &[&str]) {
    self.state.lock().unwrap().pending = sites
      .iter()
      .map(|s| PendingSiteEntry::new(*s, Default::default()))
      .collect();
  }

  pub fn pending_sites(&self) -> Vec<String> {
    let state = self.state.lock().unwrap();
    state.pending.iter().map(|e| e.site.clone()).collect()
  }

  pub fn fail_billing(&self, error: FetchError, times: usize) {
    let mut state = self.state.lock().unwrap();
    for _ in 0..times {
      state.billing_failures.push_back(error.clone());
    }
  }

  pub fn fail_writes(&self, error: Option<FetchError>) {
    self.state.lock().unwrap().write_failure = error;
  }

  pub fn fail_checkout(&self, error: FetchError) {
    self.state.lock().unwrap().checkout_failure = Some(error);
  }

  pub fn set_delay(&self, delay: Duration) {
    self.state.lock().unwrap().delay = delay;
  }

  /// Hold every pending-site write for `delay` before applying it.
  pub fn set_write_delay(&self, delay: Duration) {
    self.state.lock().unwrap().write_delay = delay;
  }

  /// Report `hasMore: true` on every page, as a misbehaving backend would.
  pub fn set_endless_pages(&self, endless: bool) {
    self.state.lock().unwrap().endless_pages = endless;
  }

  pub fn billing_calls(&self) -> u32 {
    self.billing_calls.load(Ordering::SeqCst)
  }

  pub fn license_calls(&self) -> u32 {
    self.license_calls.load(Ordering::SeqCst)
  }

  pub fn writes(&self) -> Vec<String> {
    self.state.lock().unwrap().writes.clone()
  }

  fn delay(&self) -> Duration {
    self.state.lock().unwrap().delay
  }

  fn write_delay(&self) -> Duration {
    self.state.lock().unwrap().write_delay
  }

  fn echo(state: &FakeState) -> ApiPendingEcho {
    ApiPendingEcho {
      sites: state
        .pending
        .iter()
        .map(|e| ApiPendingEchoSite {
          site: e.site.clone(),
          subscription_id: None,
        })
        .collect(),
    }
  }

  async fn write(
    &self,
    op: String,
    apply: impl FnOnce(&mut FakeState),
  ) -> Result<ApiPendingEcho, FetchError> {
    tokio::time::sleep(self.write_delay()).await;
    let mut state = self.state.lock().unwrap();
    if let Some(e) = state.write_failure.clone() {
      return Err(e);
    }
    state.writes.push(op);
    apply(&mut state);
    Ok(Self::echo(&state))
  }
}

fn page<T: Clone>(items: &[T], query: &ListQuery) -> (Vec<T>, bool) {
  let start = (query.offset as usize).min(items.len());
  let end = (start + query.limit as usize).min(items.len());
  (items[start..end].to_vec(), end < items.len())
}

#[async_trait]
impl BillingApi for FakeApi {
  async fn fetch_billing(&self, query: &ListQuery) -> Result<Value, FetchError> {
    self.billing_calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(self.delay()).await;

    let mut state = self.state.lock().unwrap();
    if let Some(e) = state.billing_failures.pop_front() {
      return Err(e);
    }
    let all: Vec<(String, Value)> = state
      .subscriptions
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect();
    let (subs, has_more) = page(&all, query);
    let has_more = has_more || state.endless_pages;
    let subscriptions: Map<String, Value> = subs.into_iter().collect();
    Ok(json!({
      "subscriptions": subscriptions,
      "pendingSites": state.pending,
      "total": all.len(),
      "hasMore": has_more,
    }))
  }

  async fn fetch_licenses(&self, query: &ListQuery) -> Result<Value, FetchError> {
    self.license_calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(self.delay()).await;

    let state = self.state.lock().unwrap();
    let (licenses, has_more) = page(&state.licenses, query);
    let has_more = has_more || state.endless_pages;
    Ok(json!({
      "licenses": licenses,
      "total": state.licenses.len(),
      "hasMore": has_more,
    }))
  }

  async fn add_pending_sites(
    &self,
    _email: &str,
    sites: &[PendingSiteEntry],
  ) -> Result<ApiPendingEcho, FetchError> {
    let names: Vec<&str> = sites.iter().map(|s| s.site.as_str()).collect();
    self.write(format!("add {}", names.join(",")), |state| {
      for site in sites {
        if !state.pending.iter().any(|p| p.same_site(&site.site)) {
          state.pending.push(site.clone());
        }
      }
    })
    .await
  }

  async fn replace_pending_sites(
    &self,
    _email: &str,
    sites: &[PendingSiteEntry],
  ) -> Result<ApiPendingEcho, FetchError> {
    let names: Vec<&str> = sites.iter().map(|s| s.site.as_str()).collect();
    self.write(format!("replace {}", names.join(",")), |state| {
      state.pending = sites.to_vec();
    })
    .await
  }

  async fn remove_pending_site(
    &self,
    _email: &str,
    site: &str,
  ) -> Result<ApiPendingEcho, FetchError> {
    self.write(format!("remove {}", site), |state| {
      state.pending.retain(|p| !p.same_site(site));
    })
    .await
  }

  async fn create_checkout(
    &self,
    _email: &str,
    sites: &[PendingSiteEntry],
  ) -> Result<CheckoutSession, FetchError> {
    let mut state = self.state.lock().unwrap();
    if let Some(e) = state.checkout_failure.clone() {
      return Err(e);
    }
    state.writes.push(format!("checkout {}", sites.len()));
    Ok(CheckoutSession {
      url: "https://pay.example.com/cs_test_1".to_string(),
      session_id: Some("cs_test_1".to_string()),
    })
  }
}
