//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

/// Field every stored document is keyed by.
pub const ID_FIELD: &str = "id";

/// Trait for entities that can be cached.
///
/// Entities are persisted as JSON documents. The serialized form must carry
/// the stable identifier under the `id` field, as a string or a number.
pub trait Entity: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Stable identifier, unique per entity type.
  fn id(&self) -> String;

  /// Entity type name for storage organization (e.g., "course", "assignment")
  fn entity_type() -> &'static str;
}

/// How an incoming record combines with the row already stored under its id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergePolicy {
  /// Incoming fields overwrite, fields absent from the record are kept.
  #[default]
  Merge,
  /// The incoming record becomes the whole row.
  Replace,
}

/// Per cache key bookkeeping written in the same transaction as the rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStamp {
  pub cache_key: String,
  /// When the last successful refresh committed
  pub refreshed_at: DateTime<Utc>,
}

impl CacheStamp {
  pub fn new(cache_key: impl Into<String>) -> Self {
    Self {
      cache_key: cache_key.into(),
      refreshed_at: Utc::now(),
    }
  }

  /// Whether the stamp is older than `ttl`.
  pub fn is_expired(&self, ttl: std::time::Duration) -> bool {
    match chrono::Duration::from_std(ttl) {
      Ok(ttl) => Utc::now() - self.refreshed_at >= ttl,
      Err(_) => false,
    }
  }
}

/// Extract the stable id of a raw document.
pub fn document_id(doc: &Value) -> Option<String> {
  match doc.get(ID_FIELD)? {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Combine an incoming record with the stored row.
pub fn merge_document(existing: Option<&Value>, incoming: Map<String, Value>, policy: MergePolicy) -> Value {
  match (existing, policy) {
    (Some(Value::Object(current)), MergePolicy::Merge) => {
      let mut merged = current.clone();
      for (field, value) in incoming {
        merged.insert(field, value);
      }
      Value::Object(merged)
    }
    _ => Value::Object(incoming),
  }
}

/// Check that a merged document still decodes as `E`.
pub fn validate_as<E: Entity>(doc: &Value) -> Result<(), String> {
  E::deserialize(doc).map(|_| ()).map_err(|e| e.to_string())
}
