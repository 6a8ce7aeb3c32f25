//! Seams for the network stack and the credential source.

use async_trait::async_trait;

use crate::error::FetchError;

use super::request::{RawResponse, RemoteRequest};

/// Bearer credentials attached to outgoing requests.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
  pub token: String,
}

impl Credentials {
  pub fn bearer(token: impl Into<String>) -> Self {
    Self { token: token.into() }
  }
}

impl std::fmt::Debug for Credentials {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Credentials").field("token", &"<redacted>").finish()
  }
}

/// Executes one request. Only transport-level failures are errors; HTTP
/// status codes are returned in the response and mapped by the fetcher.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &RemoteRequest, credentials: Option<&Credentials>) -> Result<RawResponse, FetchError>;
}

/// Source of credentials, able to mint fresh ones after a 401.
#[async_trait]
pub trait SessionProvider: Send + Sync {
  async fn credentials(&self) -> Option<Credentials>;

  async fn refresh(&self) -> Result<Credentials, FetchError>;
}

/// Fixed credentials that cannot be refreshed.
#[derive(Debug, Clone, Default)]
pub struct StaticSession {
  credentials: Option<Credentials>,
}

impl StaticSession {
  pub fn new(credentials: Option<Credentials>) -> Self {
    Self { credentials }
  }

  pub fn anonymous() -> Self {
    Self { credentials: None }
  }
}

#[async_trait]
impl SessionProvider for StaticSession {
  async fn credentials(&self) -> Option<Credentials> {
    self.credentials.clone()
  }

  async fn refresh(&self) -> Result<Credentials, FetchError> {
    Err(FetchError::Unauthorized)
  }
}
