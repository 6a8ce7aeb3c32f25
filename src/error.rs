//! Error taxonomy shared by the fetcher, the persistence layer and stores.

use thiserror::Error;

/// A use case or engine was assembled with invalid settings.
///
/// Returned from builders only; a `Store` never enters a running state with a
/// malformed descriptor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
  #[error("cache key must not be empty")]
  EmptyCacheKey,
  #[error("request path must not be empty")]
  EmptyRequestPath,
  #[error("sort descriptor at position {0} has an empty key")]
  EmptySortKey(usize),
  #[error("page size must be greater than zero")]
  ZeroPageSize,
  #[error("page cap must be greater than zero")]
  ZeroPageCap,
  #[error("worker pool must allow at least one concurrent fetch")]
  ZeroConcurrency,
  #[error("a local-only use case needs a non-zero ttl")]
  ZeroTtlWithoutRequest,
  #[error("sync engine must be created inside a tokio runtime")]
  NoRuntime,
  #[error("invalid base url {url}: {reason}")]
  InvalidBaseUrl { url: String, reason: String },
}

/// Failure of a remote fetch. Recoverable; surfaced through `Store::error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  #[error("network error: {0}")]
  Network(String),
  #[error("unauthorized")]
  Unauthorized,
  #[error("server responded with status {0}")]
  ServerError(u16),
  #[error("failed to decode response: {0}")]
  Decoding(String),
}

/// Failure of a single transactional write. Earlier commits stay intact.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
  #[error("storage backend error: {0}")]
  Backend(String),
  #[error("failed to encode document: {0}")]
  Encoding(String),
  #[error("failed to open cache at {path}: {reason}")]
  Open { path: String, reason: String },
}

impl From<rusqlite::Error> for PersistenceError {
  fn from(e: rusqlite::Error) -> Self {
    PersistenceError::Backend(e.to_string())
  }
}

/// Records that were dropped from an otherwise committed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialDecodeWarning {
  pub skipped: Vec<SkippedRecord>,
}

impl PartialDecodeWarning {
  pub fn is_empty(&self) -> bool {
    self.skipped.is_empty()
  }
}

/// A record left out of a commit, with the position it had in its page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
  pub position: usize,
  pub reason: String,
}

/// Error held in a store's `error` state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
  #[error(transparent)]
  Fetch(#[from] FetchError),
  #[error(transparent)]
  Persistence(#[from] PersistenceError),
}
