//! SQLite persistence backend.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;

use crate::error::PersistenceError;
use crate::observer::{ObserverRegistry, Subscription};

use super::scope::{select, Predicate, SortDescriptor};
use super::storage::{
  plan_batch, register_observer, ChangeCallback, ChangeSet, LocalPersistence, ObserveFilter, WriteBatch,
  WriteOutcome,
};
use super::traits::CacheStamp;

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Generic entity cache (stores serialized JSON)
CREATE TABLE IF NOT EXISTS entity_cache (
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (entity_type, entity_key)
);

-- Refresh bookkeeping per cache key
CREATE TABLE IF NOT EXISTS cache_stamps (
    cache_key TEXT PRIMARY KEY,
    refreshed_at TEXT NOT NULL
);
"#;

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  write_lane: Mutex<()>,
  observers: ObserverRegistry<ChangeSet>,
}

impl SqliteStorage {
  /// Open the cache at the default location.
  pub fn open_default() -> Result<Self, PersistenceError> {
    let path = Self::default_path()?;
    Self::open(&path)
  }

  /// Open or create the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self, PersistenceError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| PersistenceError::Open {
        path: parent.display().to_string(),
        reason: e.to_string(),
      })?;
    }

    let conn = Connection::open(path).map_err(|e| PersistenceError::Open {
      path: path.display().to_string(),
      reason: e.to_string(),
    })?;
    Self::with_connection(conn)
  }

  /// A private database that disappears with the value.
  pub fn in_memory() -> Result<Self, PersistenceError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self, PersistenceError> {
    conn.execute_batch(CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
      write_lane: Mutex::new(()),
      observers: ObserverRegistry::new(),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf, PersistenceError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| PersistenceError::Open {
        path: "<data dir>".to_string(),
        reason: "could not determine data directory".to_string(),
      })?;

    Ok(data_dir.join("syncstore").join("cache.db"))
  }

  fn conn(&self) -> MutexGuard<'_, Connection> {
    self.conn.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

fn decode_rows(entity_type: &str, rows: Vec<Vec<u8>>) -> Vec<Value> {
  rows
    .into_iter()
    .filter_map(|data| match serde_json::from_slice(&data) {
      Ok(doc) => Some(doc),
      Err(e) => {
        tracing::warn!(entity_type, error = %e, "dropping undecodable cache row");
        None
      }
    })
    .collect()
}

fn load_all(conn: &Connection, entity_type: &str) -> Result<Vec<Value>, PersistenceError> {
  let mut stmt = conn.prepare("SELECT data FROM entity_cache WHERE entity_type = ?")?;
  let rows = stmt
    .query_map(params![entity_type], |row| row.get::<_, Vec<u8>>(0))?
    .collect::<Result<Vec<_>, _>>()?;
  Ok(decode_rows(entity_type, rows))
}

fn load_one(tx: &Transaction<'_>, entity_type: &str, id: &str) -> Result<Option<Value>, PersistenceError> {
  let data: Option<Vec<u8>> = tx
    .query_row(
      "SELECT data FROM entity_cache WHERE entity_type = ? AND entity_key = ?",
      params![entity_type, id],
      |row| row.get(0),
    )
    .optional()?;
  Ok(data.and_then(|d| decode_rows(entity_type, vec![d]).pop()))
}

impl LocalPersistence for SqliteStorage {
  fn query(
    &self,
    entity_type: &str,
    predicate: &Predicate,
    order: &[SortDescriptor],
  ) -> Result<Vec<Value>, PersistenceError> {
    let rows = load_all(&self.conn(), entity_type)?;
    Ok(select(rows, predicate, order))
  }

  fn write(&self, batch: WriteBatch) -> Result<WriteOutcome, PersistenceError> {
    let _lane = self.write_lane.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(precondition) = &batch.precondition {
      if !precondition() {
        return Ok(WriteOutcome::Rejected);
      }
    }

    let entity_type = batch.entity_type.as_str();
    let plan = {
      let mut conn = self.conn();
      let tx = conn.transaction()?;

      let plan = plan_batch(
        &batch,
        |id| load_one(&tx, entity_type, id),
        |predicate| {
          let rows = load_all(&tx, entity_type)?;
          Ok(rows.into_iter().filter(|d| predicate.matches(d)).collect())
        },
      )?;

      for (id, doc) in &plan.upserts {
        let data = serde_json::to_vec(doc).map_err(|e| PersistenceError::Encoding(e.to_string()))?;
        tx.execute(
          "INSERT INTO entity_cache (entity_type, entity_key, data, cached_at)
           VALUES (?, ?, ?, datetime('now'))
           ON CONFLICT (entity_type, entity_key)
           DO UPDATE SET data = excluded.data, cached_at = excluded.cached_at",
          params![entity_type, id, data],
        )?;
      }

      for id in &plan.deletes {
        tx.execute(
          "DELETE FROM entity_cache WHERE entity_type = ? AND entity_key = ?",
          params![entity_type, id],
        )?;
      }

      if let Some(stamp) = &batch.stamp {
        tx.execute(
          "INSERT OR REPLACE INTO cache_stamps (cache_key, refreshed_at) VALUES (?, ?)",
          params![stamp.cache_key, stamp.refreshed_at.to_rfc3339()],
        )?;
      }

      tx.commit()?;
      plan
    };

    let (change, summary) = plan.into_change(&batch);
    tracing::debug!(
      entity_type,
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
    let conn = self.conn();
    let refreshed_at: Option<String> = conn
      .query_row(
        "SELECT refreshed_at FROM cache_stamps WHERE cache_key = ?",
        params![cache_key],
        |row| row.get(0),
      )
      .optional()?;

    match refreshed_at {
      Some(refreshed_at) => Ok(Some(CacheStamp {
        cache_key: cache_key.to_string(),
        refreshed_at: parse_datetime(&refreshed_at)?,
      })),
      None => Ok(None),
    }
  }

  fn clear(&self) -> Result<(), PersistenceError> {
    let _lane = self.write_lane.lock().unwrap_or_else(PoisonError::into_inner);
    let cleared = {
      let mut conn = self.conn();
      let tx = conn.transaction()?;
      let mut raw: BTreeMap<String, Vec<Vec<u8>>> = BTreeMap::new();
      {
        let mut stmt = tx.prepare("SELECT entity_type, data FROM entity_cache")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?;
        for row in rows {
          let (entity_type, data) = row?;
          raw.entry(entity_type).or_default().push(data);
        }
      }
      tx.execute_batch("DELETE FROM entity_cache; DELETE FROM cache_stamps;")?;
      tx.commit()?;
      raw
    };

    for (entity_type, rows) in cleared {
      let before = decode_rows(&entity_type, rows);
      tracing::debug!(entity_type = %entity_type, deleted = before.len(), "cleared rows");
      self.observers.notify(&ChangeSet {
        entity_type,
        before,
        after: Vec::new(),
        origin: None,
      });
    }
    Ok(())
  }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, PersistenceError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| PersistenceError::Backend(format!("failed to parse datetime '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::Prune;
  use serde_json::json;

  #[test]
  fn test_rows_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage
        .write(
          WriteBatch::new("course", vec![json!({"id": "1", "name": "Bio"})])
            .with_stamp(CacheStamp::new("courses")),
        )
        .unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    let rows = storage.query("course", &Predicate::All, &[]).unwrap();
    assert_eq!(rows, vec![json!({"id": "1", "name": "Bio"})]);

    let stamp = storage.cache_stamp("courses").unwrap().unwrap();
    assert!(!stamp.is_expired(std::time::Duration::from_secs(60)));
  }

  #[test]
  fn test_merge_and_prune_in_one_transaction() {
    let storage = SqliteStorage::in_memory().unwrap();
    storage
      .write(WriteBatch::new(
        "course",
        vec![
          json!({"id": "1", "name": "A", "term": "fall"}),
          json!({"id": "2", "name": "B"}),
        ],
      ))
      .unwrap();

    let outcome = storage
      .write(
        WriteBatch::new("course", vec![json!({"id": "1", "name": "A2"})]).with_prune(Prune {
          predicate: Predicate::All,
          keep: Default::default(),
        }),
      )
      .unwrap();

    match outcome {
      WriteOutcome::Committed(summary) => {
        assert_eq!(summary.written, 1);
        assert_eq!(summary.deleted, 1);
      }
      WriteOutcome::Rejected => panic!("unexpected rejection"),
    }
    let rows = storage.query("course", &Predicate::All, &[]).unwrap();
    assert_eq!(rows, vec![json!({"id": "1", "name": "A2", "term": "fall"})]);
  }

  #[test]
  fn test_clear_wipes_rows_and_stamps() {
    let storage = SqliteStorage::in_memory().unwrap();
    storage
      .write(WriteBatch::new("course", vec![json!({"id": "1"})]).with_stamp(CacheStamp::new("courses")))
      .unwrap();
    let notified = std::sync::Arc::new(Mutex::new(Vec::new()));
    let sink = std::sync::Arc::clone(&notified);
    let _sub = storage.observe(
      ObserveFilter {
        entity_type: "course".into(),
        predicate: Predicate::All,
        cache_key: None,
      },
      std::sync::Arc::new(move |change: &ChangeSet| sink.lock().unwrap().push(change.before.clone())),
    );
    storage.clear().unwrap();

    assert_eq!(*notified.lock().unwrap(), vec![vec![json!({"id": "1"})]]);
    assert!(storage.query("course", &Predicate::All, &[]).unwrap().is_empty());
    assert!(storage.cache_stamp("courses").unwrap().is_none());
  }
}
