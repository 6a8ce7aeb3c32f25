//! The persistence contract and the write planning shared by every backend.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::error::{PartialDecodeWarning, PersistenceError, SkippedRecord};
use crate::observer::{ObserverRegistry, Subscription};

use super::scope::{Predicate, SortDescriptor};
use super::traits::{document_id, merge_document, CacheStamp, MergePolicy};

/// Validates a merged document before it is committed.
pub type Validator = fn(&Value) -> Result<(), String>;

/// Evaluated on the write lane immediately before a batch is applied.
pub type Precondition = Arc<dyn Fn() -> bool + Send + Sync>;

/// Callback fired after a matching commit.
pub type ChangeCallback = Arc<dyn Fn(&ChangeSet) + Send + Sync>;

/// Which fetch produced a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOrigin {
  pub cache_key: String,
  pub generation: u64,
  /// Set on the write that completes the fetch
  pub final_page: bool,
}

/// Rows in `predicate` that are not in `keep` are deleted by the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Prune {
  pub predicate: Predicate,
  pub keep: HashSet<String>,
}

/// One atomic write.
#[derive(Clone)]
pub struct WriteBatch {
  pub entity_type: String,
  pub records: Vec<Value>,
  pub merge: MergePolicy,
  pub prune: Option<Prune>,
  pub stamp: Option<CacheStamp>,
  pub validate: Option<Validator>,
  pub precondition: Option<Precondition>,
  pub origin: Option<WriteOrigin>,
}

impl WriteBatch {
  pub fn new(entity_type: impl Into<String>, records: Vec<Value>) -> Self {
    Self {
      entity_type: entity_type.into(),
      records,
      merge: MergePolicy::Merge,
      prune: None,
      stamp: None,
      validate: None,
      precondition: None,
      origin: None,
    }
  }

  pub fn with_merge(mut self, merge: MergePolicy) -> Self {
    self.merge = merge;
    self
  }

  pub fn with_prune(mut self, prune: Prune) -> Self {
    self.prune = Some(prune);
    self
  }

  pub fn with_stamp(mut self, stamp: CacheStamp) -> Self {
    self.stamp = Some(stamp);
    self
  }

  pub fn with_validator(mut self, validate: Validator) -> Self {
    self.validate = Some(validate);
    self
  }

  pub fn with_precondition(mut self, precondition: Precondition) -> Self {
    self.precondition = Some(precondition);
    self
  }

  pub fn with_origin(mut self, origin: WriteOrigin) -> Self {
    self.origin = Some(origin);
    self
  }
}

impl std::fmt::Debug for WriteBatch {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WriteBatch")
      .field("entity_type", &self.entity_type)
      .field("records", &self.records.len())
      .field("merge", &self.merge)
      .field("prune", &self.prune.is_some())
      .field("stamp", &self.stamp)
      .field("origin", &self.origin)
      .finish_non_exhaustive()
  }
}

/// What a committed batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
  pub written: usize,
  pub deleted: usize,
  pub warning: PartialDecodeWarning,
}

/// Result of a write attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
  Committed(CommitSummary),
  /// The precondition failed; nothing was written and no one was notified.
  Rejected,
}

/// Rows touched by one commit, published to observers after it lands.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
  pub entity_type: String,
  /// Prior versions of updated and deleted rows
  pub before: Vec<Value>,
  /// Rows as committed
  pub after: Vec<Value>,
  pub origin: Option<WriteOrigin>,
}

/// Selects the commits an observer cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct ObserveFilter {
  pub entity_type: String,
  pub predicate: Predicate,
  /// Commits originating from this cache key always match, even if empty
  pub cache_key: Option<String>,
}

impl ObserveFilter {
  pub fn accepts(&self, change: &ChangeSet) -> bool {
    if change.entity_type != self.entity_type {
      return false;
    }
    let from_key = match (&self.cache_key, &change.origin) {
      (Some(key), Some(origin)) => *key == origin.cache_key,
      _ => false,
    };
    from_key
      || change
        .before
        .iter()
        .chain(change.after.iter())
        .any(|doc| self.predicate.matches(doc))
  }
}

/// Transactional, queryable document storage.
///
/// Writes are serialized on one write lane and observers run on that lane
/// right after the commit, so a query issued from an observer sees exactly the
/// committed state. Reads never observe a partially applied batch.
pub trait LocalPersistence: Send + Sync {
  /// Matching documents of `entity_type`, ordered by `order` then id.
  fn query(
    &self,
    entity_type: &str,
    predicate: &Predicate,
    order: &[SortDescriptor],
  ) -> Result<Vec<Value>, PersistenceError>;

  /// Apply a batch atomically.
  fn write(&self, batch: WriteBatch) -> Result<WriteOutcome, PersistenceError>;

  /// Call `callback` after each commit accepted by `filter`.
  fn observe(&self, filter: ObserveFilter, callback: ChangeCallback) -> Subscription;

  /// TTL bookkeeping for a cache key.
  fn cache_stamp(&self, cache_key: &str) -> Result<Option<CacheStamp>, PersistenceError>;

  /// Remove every row and stamp.
  fn clear(&self) -> Result<(), PersistenceError>;
}

/// Register a filtered observer on a backend's change registry.
pub(crate) fn register_observer(
  observers: &ObserverRegistry<ChangeSet>,
  filter: ObserveFilter,
  callback: ChangeCallback,
) -> Subscription {
  observers.register(move |change| {
    if filter.accepts(change) {
      callback(change);
    }
  })
}

/// Row-level effect of a batch, computed before anything is applied.
pub(crate) struct Plan {
  pub upserts: Vec<(String, Value)>,
  pub deletes: Vec<String>,
  pub before: Vec<Value>,
  pub warning: PartialDecodeWarning,
}

impl Plan {
  pub fn into_change(self, batch: &WriteBatch) -> (ChangeSet, CommitSummary) {
    let summary = CommitSummary {
      written: self.upserts.len(),
      deleted: self.deletes.len(),
      warning: self.warning,
    };
    let change = ChangeSet {
      entity_type: batch.entity_type.clone(),
      before: self.before,
      after: self.upserts.into_iter().map(|(_, doc)| doc).collect(),
      origin: batch.origin.clone(),
    };
    (change, summary)
  }
}

/// Resolve merges, validation and pruning for a batch.
///
/// `lookup` reads the committed row for an id; `scan` returns the committed
/// rows matching a predicate. Both must read inside the write transaction.
pub(crate) fn plan_batch<L, S>(batch: &WriteBatch, mut lookup: L, scan: S) -> Result<Plan, PersistenceError>
where
  L: FnMut(&str) -> Result<Option<Value>, PersistenceError>,
  S: FnOnce(&Predicate) -> Result<Vec<Value>, PersistenceError>,
{
  let mut staged: HashMap<String, usize> = HashMap::new();
  let mut upserts: Vec<(String, Value)> = Vec::new();
  let mut before = Vec::new();
  let mut warning = PartialDecodeWarning::default();

  for (position, record) in batch.records.iter().enumerate() {
    let skip = |reason: String, warning: &mut PartialDecodeWarning| {
      tracing::warn!(
        entity_type = %batch.entity_type,
        position,
        %reason,
        "skipping malformed record"
      );
      warning.skipped.push(SkippedRecord { position, reason });
    };

    let Value::Object(fields) = record else {
      skip("record is not an object".to_string(), &mut warning);
      continue;
    };
    let Some(id) = document_id(record) else {
      skip("record has no id".to_string(), &mut warning);
      continue;
    };

    let staged_at = staged.get(&id).copied();
    let existing = match staged_at {
      Some(index) => Some(upserts[index].1.clone()),
      None => lookup(&id)?,
    };
    let merged = merge_document(existing.as_ref(), fields.clone(), batch.merge);

    if let Some(validate) = batch.validate {
      if let Err(reason) = validate(&merged) {
        skip(reason, &mut warning);
        continue;
      }
    }

    match staged_at {
      Some(index) => upserts[index].1 = merged,
      None => {
        if let Some(previous) = existing {
          before.push(previous);
        }
        staged.insert(id.clone(), upserts.len());
        upserts.push((id, merged));
      }
    }
  }

  let mut deletes = Vec::new();
  if let Some(prune) = &batch.prune {
    for doc in scan(&prune.predicate)? {
      let Some(id) = document_id(&doc) else {
        continue;
      };
      if !prune.keep.contains(&id) && !staged.contains_key(&id) {
        deletes.push(id);
        before.push(doc);
      }
    }
  }

  Ok(Plan {
    upserts,
    deletes,
    before,
    warning,
  })
}
