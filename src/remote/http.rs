//! reqwest-backed transport for paginated JSON APIs.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, LINK};
use url::Url;

use crate::error::{ConfigurationError, FetchError};

use super::request::{parse_next_link, RawResponse, RemoteRequest};
use super::transport::{Credentials, Transport};

/// HTTP transport rooted at an API base URL.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpTransport {
  pub fn new(base_url: &str) -> Result<Self, ConfigurationError> {
    let base_url = Url::parse(base_url).map_err(|e| ConfigurationError::InvalidBaseUrl {
      url: base_url.to_string(),
      reason: e.to_string(),
    })?;
    if base_url.cannot_be_a_base() {
      return Err(ConfigurationError::InvalidBaseUrl {
        url: base_url.to_string(),
        reason: "url cannot be used as a base".to_string(),
      });
    }

    let client = reqwest::Client::builder()
      .user_agent(concat!("syncstore/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| ConfigurationError::InvalidBaseUrl {
        url: base_url.to_string(),
        reason: e.to_string(),
      })?;

    Ok(Self { client, base_url })
  }

  /// Absolute URL for a request, with its query applied.
  pub fn resolve(&self, request: &RemoteRequest) -> Result<Url, FetchError> {
    let mut url = self
      .base_url
      .join(&request.path)
      .map_err(|e| FetchError::Network(format!("invalid request path {}: {}", request.path, e)))?;

    if !request.query.is_empty() || request.per_page.is_some() {
      let mut pairs = url.query_pairs_mut();
      for (name, value) in &request.query {
        pairs.append_pair(name, value);
      }
      if let Some(per_page) = request.per_page {
        pairs.append_pair("per_page", &per_page.to_string());
      }
    }
    Ok(url)
  }

  /// Whether the bearer token may go to `url`: same scheme, host and port as
  /// the base URL.
  fn sends_credentials(&self, url: &Url) -> bool {
    url.origin() == self.base_url.origin()
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: &RemoteRequest, credentials: Option<&Credentials>) -> Result<RawResponse, FetchError> {
    let url = self.resolve(request)?;
    let same_origin = self.sends_credentials(&url);

    let mut builder = self.client.get(url.clone()).header(ACCEPT, "application/json");
    // Never leak the token to a continuation link on another origin.
    if let (Some(credentials), true) = (credentials, same_origin) {
      builder = builder.header(AUTHORIZATION, format!("Bearer {}", credentials.token));
    }

    tracing::debug!(%url, "sending request");
    let response = builder
      .send()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?;

    let status = response.status().as_u16();
    let next = response
      .headers()
      .get(LINK)
      .and_then(|v| v.to_str().ok())
      .and_then(parse_next_link);
    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?;

    Ok(RawResponse {
      status,
      body: body.to_vec(),
      next,
    })
  }
}

impl std::fmt::Debug for HttpTransport {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HttpTransport")
      .field("base_url", &self.base_url.as_str())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_resolve_relative_and_absolute_paths() {
    let transport = HttpTransport::new("https://school.example.com/api/v1/").unwrap();

    let url = transport
      .resolve(&RemoteRequest::get("courses").query("include[]", "term").per_page(50))
      .unwrap();
    assert_eq!(
      url.as_str(),
      "https://school.example.com/api/v1/courses?include%5B%5D=term&per_page=50"
    );

    let next = transport
      .resolve(&RemoteRequest::get("https://school.example.com/api/v1/courses?page=2"))
      .unwrap();
    assert_eq!(next.as_str(), "https://school.example.com/api/v1/courses?page=2");
  }

  #[test]
  fn test_credentials_stay_on_base_origin() {
    let transport = HttpTransport::new("https://school.example.com/api/v1/").unwrap();
    let origin = |url: &str| transport.sends_credentials(&Url::parse(url).unwrap());

    assert!(origin("https://school.example.com/api/v1/courses?page=2"));
    assert!(origin("https://school.example.com:443/other"));
    assert!(!origin("http://school.example.com/api/v1/courses?page=2"));
    assert!(!origin("https://school.example.com:8443/api/v1/courses"));
    assert!(!origin("https://cdn.example.com/api/v1/courses"));
  }

  #[test]
  fn test_rejects_invalid_base_url() {
    assert!(matches!(
      HttpTransport::new("not a url"),
      Err(ConfigurationError::InvalidBaseUrl { .. })
    ));
    assert!(matches!(
      HttpTransport::new("mailto:someone@example.com"),
      Err(ConfigurationError::InvalidBaseUrl { .. })
    ));
  }
}
