//! Request descriptors and raw responses exchanged with a transport.

use serde_json::Value;

use crate::error::{ConfigurationError, FetchError};

/// Description of a paginated GET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRequest {
  /// Path relative to the API base, or an absolute continuation URL
  pub path: String,
  pub query: Vec<(String, String)>,
  /// Key holding the record array when the body is an object
  pub envelope: Option<String>,
  pub per_page: Option<u32>,
}

impl RemoteRequest {
  pub fn get(path: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      query: Vec::new(),
      envelope: None,
      per_page: None,
    }
  }

  pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.query.push((name.into(), value.into()));
    self
  }

  pub fn envelope(mut self, key: impl Into<String>) -> Self {
    self.envelope = Some(key.into());
    self
  }

  pub fn per_page(mut self, per_page: u32) -> Self {
    self.per_page = Some(per_page);
    self
  }

  pub(crate) fn validate(&self) -> Result<(), ConfigurationError> {
    if self.path.trim().is_empty() {
      return Err(ConfigurationError::EmptyRequestPath);
    }
    if self.per_page == Some(0) {
      return Err(ConfigurationError::ZeroPageSize);
    }
    Ok(())
  }

  /// Follow-up request for a continuation link. The link already carries
  /// the query string, so only the decoding settings are kept.
  pub fn next_page(&self, next: impl Into<String>) -> Self {
    Self {
      path: next.into(),
      query: Vec::new(),
      envelope: self.envelope.clone(),
      per_page: None,
    }
  }

  /// Extract the record array from a response body.
  pub fn decode_records(&self, body: &[u8]) -> Result<Vec<Value>, FetchError> {
    let value: Value = serde_json::from_slice(body).map_err(|e| FetchError::Decoding(e.to_string()))?;
    match (value, &self.envelope) {
      (Value::Array(records), None) => Ok(records),
      (Value::Object(mut object), Some(key)) => match object.remove(key) {
        Some(Value::Array(records)) => Ok(records),
        Some(_) => Err(FetchError::Decoding(format!("`{}` is not an array", key))),
        None => Err(FetchError::Decoding(format!("missing `{}` in response", key))),
      },
      (_, None) => Err(FetchError::Decoding("expected a JSON array".to_string())),
      (_, Some(key)) => Err(FetchError::Decoding(format!(
        "expected an object with `{}`",
        key
      ))),
    }
  }
}

/// One HTTP exchange as seen by the fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
  pub status: u16,
  pub body: Vec<u8>,
  /// Continuation for the next page, if any
  pub next: Option<String>,
}

impl RawResponse {
  pub fn ok(body: impl Into<Vec<u8>>) -> Self {
    Self {
      status: 200,
      body: body.into(),
      next: None,
    }
  }

  pub fn with_next(mut self, next: impl Into<String>) -> Self {
    self.next = Some(next.into());
    self
  }

  pub fn status(status: u16) -> Self {
    Self {
      status,
      body: Vec::new(),
      next: None,
    }
  }
}

/// Pull the `rel="next"` target out of a `Link` header.
pub fn parse_next_link(header: &str) -> Option<String> {
  header.split(',').find_map(|part| {
    let mut segments = part.split(';');
    let target = segments.next()?.trim();
    let url = target.strip_prefix('<')?.strip_suffix('>')?;
    if url.is_empty() {
      return None;
    }
    let is_next = segments.any(|param| {
      let param = param.trim();
      param == "rel=\"next\"" || param == "rel=next"
    });
    is_next.then(|| url.to_string())
  })
}
