//! Declarative fetch-and-cache descriptors.
//!
//! A use case names a cache key, the remote request that fills it, the local
//! scope that reads it back and the policy used to write responses. It is
//! immutable once built and has no side effects until a store runs it.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::cache::{Entity, LocalPersistence, MergePolicy, Scope, WriteBatch, WriteOutcome};
use crate::error::{ConfigurationError, PersistenceError};
use crate::remote::RemoteRequest;

/// Cached data younger than this is served without a request.
pub const DEFAULT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// How fetched records land in persistence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WritePolicy {
  pub merge: MergePolicy,
  /// Delete rows in scope that a complete response no longer contains
  pub prune_scope: bool,
  /// Ignore the response and delete every row in scope once it succeeds
  pub delete_scope: bool,
}

impl WritePolicy {
  /// Field-level upsert; nothing is deleted.
  pub const fn merge() -> Self {
    Self {
      merge: MergePolicy::Merge,
      prune_scope: false,
      delete_scope: false,
    }
  }

  /// Each record replaces the stored row; nothing is deleted.
  pub const fn replace() -> Self {
    Self {
      merge: MergePolicy::Replace,
      prune_scope: false,
      delete_scope: false,
    }
  }

  /// Field-level upsert, and the response is the whole collection.
  pub const fn collection() -> Self {
    Self {
      merge: MergePolicy::Merge,
      prune_scope: true,
      delete_scope: false,
    }
  }

  /// The request is a deletion: on success every row in scope goes. Without a
  /// request, a refresh deletes the scope locally.
  pub const fn delete() -> Self {
    Self {
      merge: MergePolicy::Merge,
      prune_scope: false,
      delete_scope: true,
    }
  }
}

/// Fetch-and-cache descriptor for one entity type.
pub trait UseCase: Send + Sync + 'static {
  type Entity: Entity;

  /// Identity of the cached result; stores sharing a key share requests.
  fn cache_key(&self) -> &str;

  /// Local predicate and sort order.
  fn scope(&self) -> &Scope;

  fn ttl(&self) -> Duration {
    DEFAULT_TTL
  }

  fn write_policy(&self) -> WritePolicy {
    WritePolicy::default()
  }

  /// The request that fills the cache, or None for a local-only use case.
  fn make_request(&self) -> Option<RemoteRequest>;

  /// Whether a refresh follows every continuation. When false only the first
  /// page is fetched and the rest is loaded with `Store::get_next_page`.
  fn load_all_pages(&self) -> bool {
    true
  }

  /// Adjust a raw record before it is written.
  fn prepare(&self, record: Value) -> Value {
    record
  }

  /// Write a page of fetched records using `batch` as the template.
  fn write(
    &self,
    records: Vec<Value>,
    batch: WriteBatch,
    into: &dyn LocalPersistence,
  ) -> Result<WriteOutcome, PersistenceError> {
    let records = records.into_iter().map(|r| self.prepare(r)).collect();
    into.write(WriteBatch { records, ..batch })
  }
}

/// Stable cache key for a parameterized query.
///
/// Parameters are trimmed so cosmetic whitespace does not split the cache.
pub fn derive_cache_key(kind: &str, params: &[&str]) -> String {
  let input = params
    .iter()
    .map(|p| p.trim())
    .collect::<Vec<_>>()
    .join("\u{1f}");

  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(kind.as_bytes());
  hasher.update([0u8]);
  hasher.update(input.as_bytes());
  format!("{}:{}", kind, hex::encode(hasher.finalize()))
}

type PrepareFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// A use case assembled by `UseCaseBuilder`.
pub struct CollectionUseCase<E> {
  cache_key: String,
  scope: Scope,
  ttl: Duration,
  policy: WritePolicy,
  request: Option<RemoteRequest>,
  load_all_pages: bool,
  prepare: Option<PrepareFn>,
  _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> UseCase for CollectionUseCase<E> {
  type Entity = E;

  fn cache_key(&self) -> &str {
    &self.cache_key
  }

  fn scope(&self) -> &Scope {
    &self.scope
  }

  fn ttl(&self) -> Duration {
    self.ttl
  }

  fn write_policy(&self) -> WritePolicy {
    self.policy
  }

  fn make_request(&self) -> Option<RemoteRequest> {
    self.request.clone()
  }

  fn load_all_pages(&self) -> bool {
    self.load_all_pages
  }

  fn prepare(&self, record: Value) -> Value {
    match &self.prepare {
      Some(prepare) => prepare(record),
      None => record,
    }
  }
}

impl<E> Clone for CollectionUseCase<E> {
  fn clone(&self) -> Self {
    Self {
      cache_key: self.cache_key.clone(),
      scope: self.scope.clone(),
      ttl: self.ttl,
      policy: self.policy,
      request: self.request.clone(),
      load_all_pages: self.load_all_pages,
      prepare: self.prepare.clone(),
      _entity: PhantomData,
    }
  }
}

impl<E> fmt::Debug for CollectionUseCase<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CollectionUseCase")
      .field("cache_key", &self.cache_key)
      .field("scope", &self.scope)
      .field("ttl", &self.ttl)
      .field("policy", &self.policy)
      .field("request", &self.request)
      .field("load_all_pages", &self.load_all_pages)
      .finish_non_exhaustive()
  }
}

/// Builder that validates a use case before anything runs it.
pub struct UseCaseBuilder<E> {
  cache_key: String,
  scope: Scope,
  ttl: Duration,
  policy: WritePolicy,
  request: Option<RemoteRequest>,
  load_all_pages: bool,
  prepare: Option<PrepareFn>,
  _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> UseCaseBuilder<E> {
  pub fn new(cache_key: impl Into<String>) -> Self {
    Self {
      cache_key: cache_key.into(),
      scope: Scope::default(),
      ttl: DEFAULT_TTL,
      policy: WritePolicy::default(),
      request: None,
      load_all_pages: true,
      prepare: None,
      _entity: PhantomData,
    }
  }

  pub fn request(mut self, request: RemoteRequest) -> Self {
    self.request = Some(request);
    self
  }

  /// Fetch only the first page on refresh; see `UseCase::load_all_pages`.
  pub fn first_page_only(mut self) -> Self {
    self.load_all_pages = false;
    self
  }

  pub fn scope(mut self, scope: Scope) -> Self {
    self.scope = scope;
    self
  }

  pub fn ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn write_policy(mut self, policy: WritePolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn prepare<F>(mut self, prepare: F) -> Self
  where
    F: Fn(Value) -> Value + Send + Sync + 'static,
  {
    self.prepare = Some(Arc::new(prepare));
    self
  }

  /// Stamp `field = value` onto every fetched record, e.g. the owning course.
  pub fn with_field(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    let field = field.into();
    let value = value.into();
    self.prepare(move |mut record| {
      if let Value::Object(map) = &mut record {
        map.insert(field.clone(), value.clone());
      }
      record
    })
  }

  pub fn build(self) -> Result<CollectionUseCase<E>, ConfigurationError> {
    if self.cache_key.trim().is_empty() {
      return Err(ConfigurationError::EmptyCacheKey);
    }
    if let Some(position) = self.scope.order.iter().position(|d| d.key.trim().is_empty()) {
      return Err(ConfigurationError::EmptySortKey(position));
    }
    match &self.request {
      Some(request) => request.validate()?,
      None if self.ttl.is_zero() => return Err(ConfigurationError::ZeroTtlWithoutRequest),
      None => {}
    }

    Ok(CollectionUseCase {
      cache_key: self.cache_key,
      scope: self.scope,
      ttl: self.ttl,
      policy: self.policy,
      request: self.request,
      load_all_pages: self.load_all_pages,
      prepare: self.prepare,
      _entity: PhantomData,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SortDescriptor;
  use serde::{Deserialize, Serialize};
  use serde_json::json;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Course {
    id: String,
    name: String,
  }

  impl Entity for Course {
    fn id(&self) -> String {
      self.id.clone()
    }

    fn entity_type() -> &'static str {
      "course"
    }
  }

  #[test]
  fn test_build_rejects_empty_cache_key() {
    let result = UseCaseBuilder::<Course>::new("  ").build();
    assert!(matches!(result, Err(ConfigurationError::EmptyCacheKey)));
  }

  #[test]
  fn test_build_rejects_empty_sort_key() {
    let scope = Scope::all("name").with_order(vec![SortDescriptor::ascending("name"), SortDescriptor::ascending("")]);
    let result = UseCaseBuilder::<Course>::new("courses").scope(scope).build();
    assert!(matches!(result, Err(ConfigurationError::EmptySortKey(1))));
  }

  #[test]
  fn test_build_rejects_bad_request() {
    let result = UseCaseBuilder::<Course>::new("courses")
      .request(RemoteRequest::get(""))
      .build();
    assert!(matches!(result, Err(ConfigurationError::EmptyRequestPath)));
  }

  #[test]
  fn test_local_use_case_needs_ttl() {
    let result = UseCaseBuilder::<Course>::new("courses")
      .ttl(Duration::ZERO)
      .build();
    assert!(matches!(result, Err(ConfigurationError::ZeroTtlWithoutRequest)));
  }

  #[test]
  fn test_defaults() {
    let use_case = UseCaseBuilder::<Course>::new("courses").build().unwrap();
    assert_eq!(use_case.ttl(), DEFAULT_TTL);
    assert_eq!(use_case.write_policy(), WritePolicy::merge());
    assert!(use_case.make_request().is_none());
    assert!(use_case.load_all_pages());
  }

  #[test]
  fn test_first_page_only() {
    let use_case = UseCaseBuilder::<Course>::new("courses")
      .request(RemoteRequest::get("/courses"))
      .first_page_only()
      .build()
      .unwrap();
    assert!(!use_case.load_all_pages());
  }

  #[test]
  fn test_with_field_stamps_records() {
    let use_case = UseCaseBuilder::<Course>::new("courses")
      .with_field("course_id", 7)
      .build()
      .unwrap();
    assert_eq!(
      use_case.prepare(json!({"id": "1"})),
      json!({"id": "1", "course_id": 7})
    );
  }

  #[test]
  fn test_derived_keys_are_stable() {
    let a = derive_cache_key("assignments", &["course_1", " due_at "]);
    let b = derive_cache_key("assignments", &["course_1", "due_at"]);
    let c = derive_cache_key("assignments", &["course_2", "due_at"]);
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert!(a.starts_with("assignments:"));
  }
}
