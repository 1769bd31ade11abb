use crate::config::TransportConfig;
use crate::error::{Result, UpdateError};
use reqwest::blocking::{Client, Response};
use reqwest::header::USER_AGENT;
use reqwest::redirect::Policy;
use reqwest::Url;
use std::io::Read;
use std::time::Duration;

/// Raw outcome of a feed request. Non-2xx statuses are not errors at this
/// layer; the orchestrator decides what they mean.
#[derive(Debug, Clone)]
pub struct FeedResponse {
  pub status: u16,
  pub body: Vec<u8>,
}

impl FeedResponse {
  pub fn is_success(&self) -> bool {
    (200..=299).contains(&self.status)
  }
}

pub trait FeedTransport: Send + Sync {
  fn fetch(&self, url: &Url) -> Result<FeedResponse>;
}

pub struct HttpFeedTransport {
  client: Client,
  max_bytes: usize,
}

impl HttpFeedTransport {
  pub fn new(cfg: &TransportConfig) -> Result<Self> {
    let client = build_client(cfg)?;
    Ok(Self {
      client,
      max_bytes: cfg.max_feed_bytes,
    })
  }
}

pub(crate) fn build_client(cfg: &TransportConfig) -> Result<Client> {
  if cfg.timeout_seconds == 0 {
    return Err(UpdateError::InvalidConfiguration(
      "timeout_seconds must be > 0".to_string(),
    ));
  }
  Client::builder()
    .timeout(Duration::from_secs(cfg.timeout_seconds))
    .redirect(Policy::none())
    .build()
    .map_err(|e| UpdateError::DependencyUnavailable(format!("build HTTP client: {e}")))
}

impl FeedTransport for HttpFeedTransport {
  fn fetch(&self, url: &Url) -> Result<FeedResponse> {
    let response = http_get(&self.client, url)?;
    let status = response.status().as_u16();
    let body = read_response_with_limit(response, self.max_bytes)?;
    tracing::debug!(url = %safe_url_label(url), status, bytes = body.len(), "feed response");
    Ok(FeedResponse { status, body })
  }
}

pub(crate) fn http_get(client: &Client, url: &Url) -> Result<Response> {
  if url.scheme() != "https" {
    return Err(UpdateError::InvalidUrl(format!(
      "{} must use HTTPS",
      safe_url_label(url)
    )));
  }
  client
    .get(url.clone())
    .header(
      USER_AGENT,
      format!("update-agent/{}", env!("CARGO_PKG_VERSION")),
    )
    .send()
    .map_err(map_reqwest_error)
}

pub(crate) fn map_reqwest_error(e: reqwest::Error) -> UpdateError {
  if e.is_timeout() {
    return UpdateError::Timeout;
  }
  if e.is_builder() {
    return UpdateError::InvalidUrl(e.to_string());
  }
  let text = format!("{e:#}");
  if text.contains("certificate") || text.contains("tls") || text.contains("TLS") {
    return UpdateError::Tls(text);
  }
  UpdateError::Transport(text)
}

pub(crate) fn read_response_with_limit(response: Response, max_bytes: usize) -> Result<Vec<u8>> {
  let mut out = Vec::new();
  let mut limited = response.take((max_bytes.saturating_add(1)) as u64);
  limited
    .read_to_end(&mut out)
    .map_err(|e| UpdateError::InvalidBody(format!("read response body: {e}")))?;

  if out.len() > max_bytes {
    return Err(UpdateError::InvalidBody(format!(
      "response exceeds max size {max_bytes} bytes"
    )));
  }

  Ok(out)
}

pub(crate) fn safe_url_label(url: &Url) -> String {
  let host = url.host_str().unwrap_or("<no-host>");
  let mut path = url.path().to_string();
  if path.is_empty() {
    path = "/".to_string();
  }
  format!("{host}{path}")
}
