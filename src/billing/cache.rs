//! Request keys for billing API reads.

use crate::cache::QueryKey;

/// Key prefix shared by every billing snapshot request
pub const BILLING_PREFIX: &str = "billing?";
/// Key prefix shared by every license snapshot request
pub const LICENSES_PREFIX: &str = "licenses?";

/// Filter and pagination parameters accepted by the read endpoints.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListQuery {
  pub email: String,
  pub type_filter: Option<String>,
  pub status: Option<String>,
  pub limit: u32,
  pub offset: u32,
}

impl ListQuery {
  pub fn new(email: &str, limit: u32) -> Self {
    Self {
      email: email.to_string(),
      limit,
      ..Self::default()
    }
  }

  /// Same filters, shifted to the given offset.
  pub fn at_offset(&self, offset: u32) -> Self {
    Self {
      offset,
      ..self.clone()
    }
  }

  /// Parameters as sent on the wire, sorted by name and normalized.
  pub fn params(&self) -> Vec<(&'static str, String)> {
    let mut params = vec![
      ("email", normalize(&self.email)),
      ("limit", self.limit.to_string()),
      ("offset", self.offset.to_string()),
    ];
    if let Some(status) = self.status.as_deref().map(normalize).filter(|s| !s.is_empty()) {
      params.push(("status", status));
    }
    if let Some(t) = self.type_filter.as_deref().map(normalize).filter(|s| !s.is_empty()) {
      params.push(("type", t));
    }
    params
  }
}

/// Read requests issued against the billing API.
#[derive(Clone, Debug)]
pub enum BillingQueryKey {
  /// One page of the billing snapshot
  Billing(ListQuery),
  /// One page of the license snapshot
  Licenses(ListQuery),
}

impl BillingQueryKey {
  fn parts(&self) -> (&'static str, &ListQuery) {
    match self {
      Self::Billing(q) => (BILLING_PREFIX, q),
      Self::Licenses(q) => (LICENSES_PREFIX, q),
    }
  }
}

impl QueryKey for BillingQueryKey {
  fn cache_key(&self) -> String {
    let (prefix, query) = self.parts();
    let params: Vec<String> = query
      .params()
      .into_iter()
      .map(|(k, v)| format!("{}={}", k, v))
      .collect();
    format!("{}{}", prefix, params.join("&"))
  }

  fn description(&self) -> String {
    let (_, q) = self.parts();
    let what = match self {
      Self::Billing(_) => "billing",
      Self::Licenses(_) => "licenses",
    };
    format!("{} for {} (offset {})", what, q.email, q.offset)
  }
}

/// Normalize a parameter value for consistent keys.
/// Trims whitespace and lowercases for case-insensitive matching.
fn normalize(value: &str) -> String {
  value.trim().to_lowercase()
}
