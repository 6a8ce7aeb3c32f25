//! In-memory persistence backend.
//!
//! Commits build a new table set and swap it in, so readers holding the old
//! `Arc` keep a consistent pre-commit view.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::Value;

use crate::error::PersistenceError;
use crate::observer::{ObserverRegistry, Subscription};

use super::scope::{select, Predicate, SortDescriptor};
use super::storage::{
  plan_batch, register_observer, ChangeCallback, ChangeSet, LocalPersistence, ObserveFilter, WriteBatch,
  WriteOutcome,
};
use super::traits::CacheStamp;

#[derive(Debug, Clone, Default)]
struct Tables {
  rows: HashMap<String, HashMap<String, Value>>,
  stamps: HashMap<String, CacheStamp>,
}

/// Process-local storage, isolated per instance.
pub struct MemoryStorage {
  write_lane: Mutex<()>,
  tables: RwLock<Arc<Tables>>,
  observers: ObserverRegistry<ChangeSet>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self {
      write_lane: Mutex::new(()),
      tables: RwLock::new(Arc::new(Tables::default())),
      observers: ObserverRegistry::new(),
    }
  }

  fn current(&self) -> Arc<Tables> {
    Arc::clone(&self.tables.read().unwrap_or_else(PoisonError::into_inner))
  }

  fn install(&self, tables: Tables) {
    *self.tables.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(tables);
  }

  /// Number of stored rows of `entity_type`.
  pub fn len(&self, entity_type: &str) -> usize {
    self.current().rows.get(entity_type).map_or(0, HashMap::len)
  }
}

impl Default for MemoryStorage {
  fn default() -> Self {
    Self::new()
  }
}

impl LocalPersistence for MemoryStorage {
  fn query(
    &self,
    entity_type: &str,
    predicate: &Predicate,
    order: &[SortDescriptor],
  ) -> Result<Vec<Value>, PersistenceError> {
    let tables = self.current();
    let rows = match tables.rows.get(entity_type) {
      Some(rows) => rows.values().cloned().collect::<Vec<_>>(),
      None => Vec::new(),
    };
    Ok(select(rows, predicate, order))
  }

  fn write(&self, batch: WriteBatch) -> Result<WriteOutcome, PersistenceError> {
    let _lane = self.write_lane.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(precondition) = &batch.precondition {
      if !precondition() {
        return Ok(WriteOutcome::Rejected);
      }
    }

    let current = self.current();
    let empty = HashMap::new();
    let existing = current.rows.get(&batch.entity_type).unwrap_or(&empty);
    let plan = plan_batch(
      &batch,
      |id| Ok(existing.get(id).cloned()),
      |predicate| Ok(existing.values().filter(|d| predicate.matches(d)).cloned().collect()),
    )?;

    let mut next = (*current).clone();
    let table = next.rows.entry(batch.entity_type.clone()).or_default();
    for (id, doc) in &plan.upserts {
      table.insert(id.clone(), doc.clone());
    }
    for id in &plan.deletes {
      table.remove(id);
    }
    if let Some(stamp) = &batch.stamp {
      next.stamps.insert(stamp.cache_key.clone(), stamp.clone());
    }
    self.install(next);

    let (change, summary) = plan.into_change(&batch);
    tracing::debug!(
      entity_type = %batch.entity_type,
      written = summary.written,
      deleted = summary.deleted,
      "committed batch"
    );
    self.observers.notify(&change);
    Ok(WriteOutcome::Committed(summary))
  }

  fn observe(&self, filter: ObserveFilter, callback: ChangeCallback) -> Subscription {
    register_observer(&self.observers, filter, callback)
  }

  fn cache_stamp(&self, cache_key: &str) -> Result<Option<CacheStamp>, PersistenceError> {
    Ok(self.current().stamps.get(cache_key).cloned())
  }

  fn clear(&self) -> Result<(), PersistenceError> {
    let _lane = self.write_lane.lock().unwrap_or_else(PoisonError::into_inner);
    let cleared = self.current();
    self.install(Tables::default());

    for (entity_type, rows) in &cleared.rows {
      if rows.is_empty() {
        continue;
      }
      tracing::debug!(entity_type = %entity_type, deleted = rows.len(), "cleared rows");
      self.observers.notify(&ChangeSet {
        entity_type: entity_type.clone(),
        before: rows.values().cloned().collect(),
        after: Vec::new(),
        origin: None,
      });
    }
    Ok(())
  }
}
