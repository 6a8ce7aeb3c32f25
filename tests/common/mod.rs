#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Notify;

use syncstore::cache::{
  ChangeCallback, ObserveFilter, Precondition, Predicate, SortDescriptor, WriteBatch, WriteOutcome,
};
use syncstore::observer::Subscription;
use syncstore::remote::{RawResponse, Transport};
use syncstore::{
  CollectionUseCase, Credentials, Entity, FetchError, FetcherConfig, LocalPersistence, MemoryStorage,
  PersistenceError, RemoteFetcher, RemoteRequest, Scope, SessionProvider, StaticSession, Store, StoreUpdate,
  SyncEngine, UseCase, UseCaseBuilder, WritePolicy,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
  pub id: u64,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub points: Option<u32>,
}

impl Entity for Course {
  fn id(&self) -> String {
    self.id.to_string()
  }

  fn entity_type() -> &'static str {
    "course"
  }
}

struct Step {
  response: Result<RawResponse, FetchError>,
  gate: Option<Arc<Notify>>,
}

/// Transport replaying canned responses in call order. A gated response is
/// held until its `Notify` fires.
#[derive(Default)]
pub struct ScriptedTransport {
  steps: Mutex<VecDeque<Step>>,
  calls: AtomicUsize,
}

impl ScriptedTransport {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn push(&self, response: Result<RawResponse, FetchError>) {
    self.steps.lock().unwrap().push_back(Step { response, gate: None });
  }

  /// Queue a response released by the returned handle.
  pub fn push_gated(&self, response: Result<RawResponse, FetchError>) -> Arc<Notify> {
    let gate = Arc::new(Notify::new());
    self.steps.lock().unwrap().push_back(Step {
      response,
      gate: Some(Arc::clone(&gate)),
    });
    gate
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Transport for ScriptedTransport {
  async fn send(&self, _request: &RemoteRequest, _credentials: Option<&Credentials>) -> Result<RawResponse, FetchError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let step = self.steps.lock().unwrap().pop_front();
    let Some(step) = step else {
      return Err(FetchError::Network("script exhausted".into()));
    };
    if let Some(gate) = step.gate {
      gate.notified().await;
    }
    step.response
  }
}

/// Memory storage that reports every write attempt, including rejected ones.
#[derive(Default)]
pub struct CountingStorage {
  inner: MemoryStorage,
  pub rejected: AtomicUsize,
  pub written: Notify,
}

impl LocalPersistence for CountingStorage {
  fn query(&self, entity_type: &str, predicate: &Predicate, order: &[SortDescriptor]) -> Result<Vec<Value>, PersistenceError> {
    self.inner.query(entity_type, predicate, order)
  }

  fn write(&self, batch: WriteBatch) -> Result<WriteOutcome, PersistenceError> {
    let outcome = self.inner.write(batch);
    if let Ok(WriteOutcome::Rejected) = outcome {
      self.rejected.fetch_add(1, Ordering::SeqCst);
    }
    self.written.notify_one();
    outcome
  }

  fn observe(&self, filter: ObserveFilter, callback: ChangeCallback) -> Subscription {
    self.inner.observe(filter, callback)
  }

  fn cache_stamp(&self, cache_key: &str) -> Result<Option<syncstore::cache::CacheStamp>, PersistenceError> {
    self.inner.cache_stamp(cache_key)
  }

  fn clear(&self) -> Result<(), PersistenceError> {
    self.inner.clear()
  }
}

type Hook = Box<dyn FnOnce() + Send>;

/// Memory storage that runs a one-shot hook inside the next write whose
/// precondition passes, before the rows are committed.
#[derive(Default)]
pub struct HookedStorage {
  inner: MemoryStorage,
  hook: Mutex<Option<Hook>>,
}

impl HookedStorage {
  pub fn arm(&self, hook: impl FnOnce() + Send + 'static) {
    *self.hook.lock().unwrap() = Some(Box::new(hook));
  }
}

impl LocalPersistence for HookedStorage {
  fn query(&self, entity_type: &str, predicate: &Predicate, order: &[SortDescriptor]) -> Result<Vec<Value>, PersistenceError> {
    self.inner.query(entity_type, predicate, order)
  }

  fn write(&self, mut batch: WriteBatch) -> Result<WriteOutcome, PersistenceError> {
    let hook = self.hook.lock().unwrap().take();
    if let (Some(hook), Some(original)) = (hook, batch.precondition.clone()) {
      let hook = Mutex::new(Some(hook));
      let wrapped: Precondition = Arc::new(move || {
        let current = original();
        if current {
          if let Some(hook) = hook.lock().unwrap().take() {
            hook();
          }
        }
        current
      });
      batch.precondition = Some(wrapped);
    }
    self.inner.write(batch)
  }

  fn observe(&self, filter: ObserveFilter, callback: ChangeCallback) -> Subscription {
    self.inner.observe(filter, callback)
  }

  fn cache_stamp(&self, cache_key: &str) -> Result<Option<syncstore::cache::CacheStamp>, PersistenceError> {
    self.inner.cache_stamp(cache_key)
  }

  fn clear(&self) -> Result<(), PersistenceError> {
    self.inner.clear()
  }
}

/// Session whose refresh always succeeds, counting how often it is asked.
#[derive(Default)]
pub struct CountingSession {
  pub refreshes: AtomicUsize,
}

#[async_trait]
impl SessionProvider for CountingSession {
  async fn credentials(&self) -> Option<Credentials> {
    Some(Credentials::bearer("expired"))
  }

  async fn refresh(&self) -> Result<Credentials, FetchError> {
    self.refreshes.fetch_add(1, Ordering::SeqCst);
    Ok(Credentials::bearer("renewed"))
  }
}

pub fn body(records: Value) -> RawResponse {
  RawResponse::ok(serde_json::to_vec(&records).unwrap())
}

pub fn courses(pairs: &[(u64, &str)]) -> RawResponse {
  let records: Vec<Value> = pairs.iter().map(|(id, name)| json!({"id": id, "name": name})).collect();
  body(Value::Array(records))
}

pub fn engine(storage: Arc<dyn LocalPersistence>, transport: Arc<ScriptedTransport>) -> SyncEngine {
  engine_with(storage, transport, FetcherConfig::default())
}

pub fn engine_with(storage: Arc<dyn LocalPersistence>, transport: Arc<ScriptedTransport>, config: FetcherConfig) -> SyncEngine {
  let fetcher = RemoteFetcher::new(transport, Arc::new(StaticSession::anonymous()), config).unwrap();
  SyncEngine::new(storage, fetcher).unwrap()
}

pub fn engine_with_session(
  storage: Arc<dyn LocalPersistence>,
  transport: Arc<ScriptedTransport>,
  session: Arc<dyn SessionProvider>,
) -> SyncEngine {
  let fetcher = RemoteFetcher::new(transport, session, FetcherConfig::default()).unwrap();
  SyncEngine::new(storage, fetcher).unwrap()
}

pub fn course_list() -> CollectionUseCase<Course> {
  UseCaseBuilder::<Course>::new("courses")
    .request(RemoteRequest::get("/courses"))
    .scope(Scope::all("name"))
    .write_policy(WritePolicy::collection())
    .build()
    .unwrap()
}

pub fn course_list_with_ttl(ttl: Duration) -> CollectionUseCase<Course> {
  UseCaseBuilder::<Course>::new("courses")
    .request(RemoteRequest::get("/courses"))
    .scope(Scope::all("name"))
    .write_policy(WritePolicy::collection())
    .ttl(ttl)
    .build()
    .unwrap()
}

pub type Updates<E> = Arc<Mutex<Vec<StoreUpdate<E>>>>;

/// Subscribe a recorder that keeps every update it receives.
pub fn record<U: UseCase>(store: &Store<U>) -> (Updates<U::Entity>, Subscription) {
  let updates: Updates<U::Entity> = Arc::new(Mutex::new(Vec::new()));
  let sink = Arc::clone(&updates);
  let subscription = store.subscribe(move |update: &StoreUpdate<U::Entity>| sink.lock().unwrap().push(update.clone()));
  (updates, subscription)
}

pub fn names(snapshot: &[Course]) -> Vec<String> {
  snapshot.iter().map(|c| c.name.clone()).collect()
}
