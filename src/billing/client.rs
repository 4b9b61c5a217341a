use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::billing::api_types::{
  decode, ApiPendingEcho, ApiPendingSitesRequest, ApiRemovePendingRequest,
};
use crate::billing::cache::ListQuery;
use crate::billing::types::{CheckoutSession, PendingSiteEntry};
use crate::config::Config;
use crate::error::FetchError;

/// Remote billing API consumed by the sync engine.
///
/// Reads return the raw response body so the cache can hand independent
/// copies to every reader; writes return decoded responses.
#[async_trait]
pub trait BillingApi: Send + Sync {
  /// One page of the billing snapshot
  async fn fetch_billing(&self, query: &ListQuery) -> Result<Value, FetchError>;

  /// One page of the license snapshot
  async fn fetch_licenses(&self, query: &ListQuery) -> Result<Value, FetchError>;

  /// Add a batch of pending sites
  async fn add_pending_sites(
    &self,
    email: &str,
    sites: &[PendingSiteEntry],
  ) -> Result<ApiPendingEcho, FetchError>;

  /// Replace the whole pending set
  async fn replace_pending_sites(
    &self,
    email: &str,
    sites: &[PendingSiteEntry],
  ) -> Result<ApiPendingEcho, FetchError>;

  /// Remove one pending site
  async fn remove_pending_site(&self, email: &str, site: &str)
    -> Result<ApiPendingEcho, FetchError>;

  /// Create a checkout session for the given sites
  async fn create_checkout(
    &self,
    email: &str,
    sites: &[PendingSiteEntry],
  ) -> Result<CheckoutSession, FetchError>;
}

/// HTTP implementation of [`BillingApi`]
#[derive(Clone)]
pub struct HttpBillingClient {
  base_url: Url,
  token: Option<String>,
  timeout: Duration,
  http: reqwest::Client,
}

impl HttpBillingClient {
  pub fn new(config: &Config) -> Result<Self> {
    let base_url = normalize_base_url(&config.api.url)?;

    let http = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      base_url,
      token: Config::get_api_token(),
      timeout: Duration::from_secs(config.api.timeout_secs),
      http,
    })
  }

  /// Absolute URL for an endpoint path relative to the API root.
  pub fn endpoint(&self, path: &str) -> Result<Url, FetchError> {
    self
      .base_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| FetchError::Transport {
        message: format!("invalid endpoint {}: {}", path, e),
      })
  }

  fn request(&self, method: Method, path: &str) -> Result<reqwest::RequestBuilder, FetchError> {
    let url = self.endpoint(path)?;
    let mut request = self.http.request(method, url).timeout(self.timeout);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    Ok(request)
  }

  async fn get_json(&self, path: &str, query: &ListQuery) -> Result<Value, FetchError> {
    let request = self.request(Method::GET, path)?.query(&query.params());
    read_json(request.send().await?).await
  }

  async fn send_json<B: Serialize + ?Sized>(
    &self,
    method: Method,
    path: &str,
    body: &B,
  ) -> Result<Value, FetchError> {
    let request = self.request(method, path)?.json(body);
    read_json(request.send().await?).await
  }
}

#[async_trait]
impl BillingApi for HttpBillingClient {
  async fn fetch_billing(&self, query: &ListQuery) -> Result<Value, FetchError> {
    self.get_json("billing", query).await
  }

  async fn fetch_licenses(&self, query: &ListQuery) -> Result<Value, FetchError> {
    self.get_json("licenses", query).await
  }

  async fn add_pending_sites(
    &self,
    email: &str,
    sites: &[PendingSiteEntry],
  ) -> Result<ApiPendingEcho, FetchError> {
    let body = ApiPendingSitesRequest { email, sites };
    let value = self.send_json(Method::POST, "pending-sites", &body).await?;
    Ok(decode(value)?)
  }

  async fn replace_pending_sites(
    &self,
    email: &str,
    sites: &[PendingSiteEntry],
  ) -> Result<ApiPendingEcho, FetchError> {
    let body = ApiPendingSitesRequest { email, sites };
    let value = self.send_json(Method::PUT, "pending-sites", &body).await?;
    Ok(decode(value)?)
  }

  async fn remove_pending_site(
    &self,
    email: &str,
    site: &str,
  ) -> Result<ApiPendingEcho, FetchError> {
    let body = ApiRemovePendingRequest { email, site };
    let value = self
      .send_json(Method::POST, "pending-sites/remove", &body)
      .await?;
    Ok(decode(value)?)
  }

  async fn create_checkout(
    &self,
    email: &str,
    sites: &[PendingSiteEntry],
  ) -> Result<CheckoutSession, FetchError> {
    let body = ApiPendingSitesRequest { email, sites };
    let value = self.send_json(Method::POST, "checkout", &body).await?;
    Ok(decode(value)?)
  }
}

fn normalize_base_url(raw: &str) -> Result<Url> {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    return Err(eyre!("api.url is empty"));
  }
  // Url::join replaces the last path segment unless the base ends with '/'
  let with_slash = format!("{}/", trimmed.trim_end_matches('/'));
  Url::parse(&with_slash).map_err(|e| eyre!("Invalid api.url {}: {}", trimmed, e))
}

async fn read_json(response: reqwest::Response) -> Result<Value, FetchError> {
  let status = response.status();
  let bytes = response.bytes().await?;

  if !status.is_success() {
    return Err(FetchError::from_status(status.as_u16(), &bytes));
  }
  if bytes.is_empty() {
    return Ok(Value::Object(Default::default()));
  }

  Ok(serde_json::from_slice(&bytes)?)
}
