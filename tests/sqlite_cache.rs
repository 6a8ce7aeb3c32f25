mod common;

use std::sync::Arc;

use common::*;
use syncstore::{SqliteStorage, StoreState, SyncEngine};

#[tokio::test]
async fn test_synced_rows_survive_reopen() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("cache.db");

  {
    let transport = ScriptedTransport::new();
    transport.push(Ok(courses(&[(1, "Biology"), (2, "Algebra")])));
    let engine = engine(Arc::new(SqliteStorage::open(&path).unwrap()), transport);

    let store = engine.store(course_list());
    store.refresh(false);
    store.wait_idle().await;
    assert_eq!(store.state(), StoreState::Data);
  }

  let engine = SyncEngine::local(Arc::new(SqliteStorage::open(&path).unwrap())).unwrap();
  let store = engine.store(course_list());
  assert_eq!(store.state(), StoreState::Idle);
  assert_eq!(names(&store.snapshot()), vec!["Algebra", "Biology"]);

  store.refresh(false);
  assert_eq!(store.state(), StoreState::Data);
}

#[tokio::test]
async fn test_cache_stamp_survives_reopen() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("cache.db");

  {
    let transport = ScriptedTransport::new();
    transport.push(Ok(courses(&[(1, "Biology")])));
    let engine = engine(Arc::new(SqliteStorage::open(&path).unwrap()), transport);
    let store = engine.store(course_list());
    store.refresh(false);
    store.wait_idle().await;
  }

  let transport = ScriptedTransport::new();
  let engine = engine(Arc::new(SqliteStorage::open(&path).unwrap()), transport.clone());
  let store = engine.store(course_list());
  store.refresh(false);
  store.wait_idle().await;

  assert_eq!(transport.calls(), 0);
  assert_eq!(store.state(), StoreState::Data);
}

#[tokio::test]
async fn test_sqlite_prunes_missing_rows() {
  let dir = tempfile::tempdir().unwrap();
  let transport = ScriptedTransport::new();
  transport.push(Ok(courses(&[(1, "Biology"), (2, "Algebra")])));
  transport.push(Ok(courses(&[(2, "Algebra")])));
  let engine = engine(
    Arc::new(SqliteStorage::open(&dir.path().join("cache.db")).unwrap()),
    transport,
  );

  let store = engine.store(course_list());
  store.refresh(false);
  store.wait_idle().await;
  store.refresh(true);
  store.wait_idle().await;

  assert_eq!(names(&store.snapshot()), vec!["Algebra"]);
}
