//! Reactive stores over the local cache.
//!
//! A `Store` shows the rows its use case selects from `LocalPersistence` and
//! moves through `Idle -> Pending -> {Data, Empty, Error}` as refreshes run.
//! Network responses never reach a store directly: they are written to
//! persistence, and the commit notification is what updates every store
//! watching the affected rows.
//!
//! Request bookkeeping lives on the `SyncEngine`, per cache key, so stores
//! sharing a key share one in-flight request and one generation counter.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::cache::{
  document_id, validate_as, CacheStamp, ChangeSet, Entity, LocalPersistence, ObserveFilter, Precondition, Prune,
  WriteBatch, WriteOrigin, WriteOutcome,
};
use crate::diff::{diff, diff_sections, group_sections, CollectionUpdate, Section, SectionUpdate};
use crate::error::{ConfigurationError, PartialDecodeWarning, PersistenceError, SyncError};
use crate::observer::{DeliveryLane, ObserverRegistry, Subscription};
use crate::remote::{RemoteFetcher, RemoteRequest};
use crate::use_case::UseCase;

/// Lifecycle of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreState {
  /// Showing cached rows; no refresh has settled yet
  Idle,
  /// A request for the cache key is in flight
  Pending,
  /// The last refresh settled with rows
  Data,
  /// The last refresh settled with no rows
  Empty,
  /// The last refresh failed; the snapshot is what was shown before
  Error(SyncError),
}

impl StoreState {
  pub fn is_pending(&self) -> bool {
    matches!(self, StoreState::Pending)
  }

  pub fn error(&self) -> Option<&SyncError> {
    match self {
      StoreState::Error(e) => Some(e),
      _ => None,
    }
  }

  fn settled(count: usize) -> Self {
    if count == 0 {
      StoreState::Empty
    } else {
      StoreState::Data
    }
  }
}

/// One emission to store subscribers.
#[derive(Debug, Clone)]
pub struct StoreUpdate<E> {
  pub state: StoreState,
  pub snapshot: Arc<[E]>,
  /// Edits from the previous emission's snapshot to this one
  pub changes: Vec<CollectionUpdate>,
  /// Sectioned form of `changes`, for scopes with a section key
  pub section_changes: Vec<SectionUpdate>,
  pub revision: u64,
}

/// Per cache key callbacks from the engine to its stores.
trait KeyListener: Send + Sync {
  fn on_pending(&self);
  /// The key's request finished; stores still pending settle from the cache
  fn on_settled(&self);
  fn on_failed(&self, error: &SyncError);
  fn on_warning(&self, warning: &PartialDecodeWarning);
}

struct KeyState {
  generation: u64,
  /// Generation of the request currently in flight
  in_flight: Option<u64>,
  pending: watch::Sender<bool>,
  listeners: Vec<Weak<dyn KeyListener>>,
  /// Continuation the last completed fetch left unfollowed
  next_page: Option<RemoteRequest>,
}

impl KeyState {
  fn new() -> Self {
    let (pending, _) = watch::channel(false);
    Self {
      generation: 0,
      in_flight: None,
      pending,
      listeners: Vec::new(),
      next_page: None,
    }
  }

  fn live_listeners(&mut self) -> Vec<Arc<dyn KeyListener>> {
    self.listeners.retain(|l| l.strong_count() > 0);
    self.listeners.iter().filter_map(Weak::upgrade).collect()
  }

  /// Whether the entry still has a store watching it or a request running.
  fn in_use(&mut self) -> bool {
    self.listeners.retain(|l| l.strong_count() > 0);
    !self.listeners.is_empty() || self.in_flight.is_some()
  }
}

enum Begin {
  Coalesced,
  Fresh,
  Started(u64),
}

/// What a fetch task is loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
  /// A refresh of the whole result; may prune and stamps the cache key
  Refresh,
  /// A continuation appended to the current result
  NextPage,
}

struct EngineInner {
  persistence: Arc<dyn LocalPersistence>,
  fetcher: Option<RemoteFetcher>,
  lane: DeliveryLane,
  runtime: Handle,
  keys: Mutex<HashMap<String, KeyState>>,
  /// Engine-wide so a generation is never reused after a key is evicted
  generations: AtomicU64,
  offline: AtomicBool,
}

impl EngineInner {
  fn keys(&self) -> MutexGuard<'_, HashMap<String, KeyState>> {
    self.keys.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn attach(&self, key: &str, listener: Arc<dyn KeyListener>) {
    let mut keys = self.keys();
    keys.retain(|k, state| k == key || state.in_use());
    let state = keys.entry(key.to_string()).or_insert_with(KeyState::new);
    state.listeners.push(Arc::downgrade(&listener));
    if state.in_flight.is_some() {
      listener.on_pending();
    }
  }

  fn is_current(&self, key: &str, generation: u64) -> bool {
    self
      .keys()
      .get(key)
      .map_or(false, |state| state.generation == generation)
  }

  fn begin(&self, key: &str, force: bool, fresh: bool) -> Begin {
    let mut keys = self.keys();
    let state = keys.entry(key.to_string()).or_insert_with(KeyState::new);

    if state.in_flight.is_some() && !force {
      return Begin::Coalesced;
    }
    if fresh && !force {
      return Begin::Fresh;
    }
    Begin::Started(self.start(state))
  }

  /// Start a fetch for the key's stored continuation, unless a request is
  /// already in flight or there is nothing left to load.
  fn begin_next(&self, key: &str) -> Option<(u64, RemoteRequest)> {
    let mut keys = self.keys();
    let state = keys.get_mut(key)?;
    if state.in_flight.is_some() {
      return None;
    }
    let request = state.next_page.clone()?;
    Some((self.start(state), request))
  }

  fn start(&self, state: &mut KeyState) -> u64 {
    state.generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
    state.in_flight = Some(state.generation);
    state.pending.send_replace(true);
    // Listeners run under the key lock so a late pending can never land
    // after the commit that settles this generation.
    for listener in state.live_listeners() {
      listener.on_pending();
    }
    state.generation
  }

  fn set_next_page(&self, key: &str, generation: u64, next: Option<RemoteRequest>) {
    if let Some(state) = self.keys().get_mut(key) {
      if state.generation == generation {
        state.next_page = next;
      }
    }
  }

  fn has_next_page(&self, key: &str) -> bool {
    self.keys().get(key).map_or(false, |state| state.next_page.is_some())
  }

  fn finish(&self, key: &str, generation: u64) {
    let mut keys = self.keys();
    let Some(state) = keys.get_mut(key) else {
      return;
    };
    if state.in_flight != Some(generation) {
      return;
    }
    state.in_flight = None;
    state.pending.send_replace(false);
    for listener in state.live_listeners() {
      listener.on_settled();
    }
    if !state.in_use() {
      keys.remove(key);
    }
  }

  fn fail(&self, key: &str, generation: u64, error: SyncError) {
    let mut keys = self.keys();
    let Some(state) = keys.get_mut(key) else {
      return;
    };
    if state.generation != generation {
      tracing::debug!(cache_key = key, generation, "ignoring failure of superseded request");
      return;
    }
    for listener in state.live_listeners() {
      listener.on_failed(&error);
    }
    state.in_flight = None;
    state.pending.send_replace(false);
    if !state.in_use() {
      keys.remove(key);
    }
  }

  fn warn(&self, key: &str, warning: &PartialDecodeWarning) {
    let mut keys = self.keys();
    if let Some(state) = keys.get_mut(key) {
      for listener in state.live_listeners() {
        listener.on_warning(warning);
      }
    }
  }

  fn pending_receiver(&self, key: &str) -> watch::Receiver<bool> {
    let mut keys = self.keys();
    keys
      .entry(key.to_string())
      .or_insert_with(KeyState::new)
      .pending
      .subscribe()
  }

  fn offline(&self) -> bool {
    self.offline.load(Ordering::Relaxed)
  }
}

/// Shared context for stores: persistence, the fetcher, the delivery lane and
/// per cache key request state.
#[derive(Clone)]
pub struct SyncEngine {
  inner: Arc<EngineInner>,
}

impl SyncEngine {
  /// Engine that refreshes through `fetcher`. Must be created inside a tokio
  /// runtime; fetches and deliveries are spawned on it.
  pub fn new(persistence: Arc<dyn LocalPersistence>, fetcher: RemoteFetcher) -> Result<Self, ConfigurationError> {
    Self::build(persistence, Some(fetcher))
  }

  /// Engine without network access. Every refresh serves the cache.
  pub fn local(persistence: Arc<dyn LocalPersistence>) -> Result<Self, ConfigurationError> {
    Self::build(persistence, None)
  }

  fn build(persistence: Arc<dyn LocalPersistence>, fetcher: Option<RemoteFetcher>) -> Result<Self, ConfigurationError> {
    let runtime = Handle::try_current().map_err(|_| ConfigurationError::NoRuntime)?;
    let lane = DeliveryLane::spawn(&runtime);
    Ok(Self {
      inner: Arc::new(EngineInner {
        persistence,
        fetcher,
        lane,
        runtime,
        keys: Mutex::new(HashMap::new()),
        generations: AtomicU64::new(0),
        offline: AtomicBool::new(false),
      }),
    })
  }

  pub fn persistence(&self) -> &Arc<dyn LocalPersistence> {
    &self.inner.persistence
  }

  /// While offline, refreshes serve the cache without touching the network.
  pub fn set_offline(&self, offline: bool) {
    tracing::info!(offline, "offline mode changed");
    self.inner.offline.store(offline, Ordering::Relaxed);
  }

  pub fn is_offline(&self) -> bool {
    self.inner.offline()
  }

  /// Create a store for `use_case`, seeded from the cache.
  pub fn store<U: UseCase>(&self, use_case: U) -> Store<U> {
    let engine = Arc::clone(&self.inner);
    let use_case = Arc::new(use_case);

    let core = Arc::new_cyclic(|weak: &Weak<StoreCore<U>>| {
      let filter = ObserveFilter {
        entity_type: U::Entity::entity_type().to_string(),
        predicate: use_case.scope().predicate.clone(),
        cache_key: Some(use_case.cache_key().to_string()),
      };
      let on_commit = weak.clone();
      // Observe before the first read so no commit falls in between.
      let commits = engine.persistence.observe(
        filter,
        Arc::new(move |change: &ChangeSet| {
          if let Some(core) = on_commit.upgrade() {
            core.on_commit(change);
          }
        }),
      );

      let (state, snapshot) = match load_snapshot(engine.persistence.as_ref(), use_case.as_ref()) {
        Ok(rows) => (StoreState::Idle, rows),
        Err(e) => (StoreState::Error(e.into()), Vec::new()),
      };

      StoreCore {
        use_case: Arc::clone(&use_case),
        engine: Arc::clone(&engine),
        inner: Mutex::new(StoreInner {
          state,
          snapshot: snapshot.into(),
          revision: 0,
          warning: None,
        }),
        observers: ObserverRegistry::new(),
        _commits: commits,
      }
    });

    // Commits landing before the cycle closed could not reach the core.
    core.reload();
    let listener: Arc<dyn KeyListener> = core.clone();
    self.inner.attach(core.use_case.cache_key(), listener);

    Store { core }
  }

  /// Create a store, subscribe `on_change` and start a non-forced refresh.
  pub fn subscribe<U, F>(&self, use_case: U, on_change: F) -> (Store<U>, Subscription)
  where
    U: UseCase,
    F: Fn(&StoreUpdate<U::Entity>) + Send + Sync + 'static,
  {
    let store = self.store(use_case);
    let subscription = store.subscribe(on_change);
    store.refresh(false);
    (store, subscription)
  }

  /// Resolve once every update queued so far has been delivered.
  pub async fn flush(&self) {
    self.inner.lane.flush().await;
  }
}

impl std::fmt::Debug for SyncEngine {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SyncEngine")
      .field("fetcher", &self.inner.fetcher)
      .field("offline", &self.inner.offline())
      .finish_non_exhaustive()
  }
}

struct StoreInner<E> {
  state: StoreState,
  snapshot: Arc<[E]>,
  revision: u64,
  warning: Option<PartialDecodeWarning>,
}

struct StoreCore<U: UseCase> {
  use_case: Arc<U>,
  engine: Arc<EngineInner>,
  inner: Mutex<StoreInner<U::Entity>>,
  observers: ObserverRegistry<StoreUpdate<U::Entity>>,
  _commits: Subscription,
}

impl<U: UseCase> StoreCore<U> {
  fn inner(&self) -> MutexGuard<'_, StoreInner<U::Entity>> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Apply a transition and queue it for subscribers. Must be called with the
  /// state lock held so the queue order matches the mutation order.
  fn publish(&self, inner: &mut StoreInner<U::Entity>, state: StoreState, snapshot: Option<Arc<[U::Entity]>>) {
    let changes = match &snapshot {
      Some(next) => diff(&inner.snapshot, next),
      None => Vec::new(),
    };
    if state == inner.state && changes.is_empty() {
      return;
    }

    let section_changes = match (&self.use_case.scope().section_key, &snapshot) {
      (Some(key), Some(next)) if !changes.is_empty() => {
        diff_sections(&group_sections(&inner.snapshot, key), &group_sections(next, key))
      }
      _ => Vec::new(),
    };

    inner.revision += 1;
    inner.state = state;
    if let Some(next) = snapshot {
      inner.snapshot = next;
    }

    let update = StoreUpdate {
      state: inner.state.clone(),
      snapshot: Arc::clone(&inner.snapshot),
      changes,
      section_changes,
      revision: inner.revision,
    };
    let observers = self.observers.clone();
    let revision = inner.revision;
    self
      .engine
      .lane
      .enqueue(move || observers.notify_revision(revision, &update));
  }

  fn on_commit(&self, change: &ChangeSet) {
    let key = self.use_case.cache_key();
    // Held until the transition is published so a refresh cannot supersede
    // this write in between.
    let keys = self.engine.keys();
    let settles = change.origin.as_ref().map_or(false, |origin| {
      origin.cache_key == key
        && origin.final_page
        && keys.get(key).map_or(false, |state| state.generation == origin.generation)
    });

    let mut inner = self.inner();
    match load_snapshot(self.engine.persistence.as_ref(), self.use_case.as_ref()) {
      Ok(rows) => {
        let state = match &inner.state {
          _ if settles => StoreState::settled(rows.len()),
          StoreState::Data | StoreState::Empty => StoreState::settled(rows.len()),
          other => other.clone(),
        };
        self.publish(&mut inner, state, Some(rows.into()));
      }
      Err(e) => {
        tracing::warn!(cache_key = key, error = %e, "failed to reload snapshot");
        self.publish(&mut inner, StoreState::Error(e.into()), None);
      }
    }
  }

  /// Re-read the snapshot, keeping the current state.
  fn reload(&self) {
    let mut inner = self.inner();
    if let Ok(rows) = load_snapshot(self.engine.persistence.as_ref(), self.use_case.as_ref()) {
      let state = inner.state.clone();
      self.publish(&mut inner, state, Some(rows.into()));
    }
  }

  /// Delete every row in scope without a request.
  fn delete_scope(&self) {
    let batch = WriteBatch::new(U::Entity::entity_type(), Vec::new()).with_prune(Prune {
      predicate: self.use_case.scope().predicate.clone(),
      keep: HashSet::new(),
    });
    if let Err(e) = self.engine.persistence.write(batch) {
      tracing::warn!(cache_key = self.use_case.cache_key(), error = %e, "failed to delete scope");
      let mut inner = self.inner();
      self.publish(&mut inner, StoreState::Error(e.into()), None);
    }
  }

  /// Settle from the cache without a request.
  fn settle_from_cache(&self) {
    let mut inner = self.inner();
    match load_snapshot(self.engine.persistence.as_ref(), self.use_case.as_ref()) {
      Ok(rows) => {
        let state = StoreState::settled(rows.len());
        self.publish(&mut inner, state, Some(rows.into()));
      }
      Err(e) => self.publish(&mut inner, StoreState::Error(e.into()), None),
    }
  }

  fn is_fresh(&self) -> bool {
    let key = self.use_case.cache_key();
    match self.engine.persistence.cache_stamp(key) {
      Ok(Some(stamp)) => !stamp.is_expired(self.use_case.ttl()),
      Ok(None) => false,
      Err(e) => {
        tracing::warn!(cache_key = key, error = %e, "failed to read cache stamp");
        false
      }
    }
  }
}

impl<U: UseCase> KeyListener for StoreCore<U> {
  fn on_pending(&self) {
    let mut inner = self.inner();
    self.publish(&mut inner, StoreState::Pending, None);
  }

  fn on_settled(&self) {
    if self.inner().state.is_pending() {
      self.settle_from_cache();
    }
  }

  fn on_failed(&self, error: &SyncError) {
    let mut inner = self.inner();
    self.publish(&mut inner, StoreState::Error(error.clone()), None);
  }

  fn on_warning(&self, warning: &PartialDecodeWarning) {
    self.inner().warning = Some(warning.clone());
  }
}

/// Reactive view over the rows selected by a use case.
///
/// Cloning yields another handle to the same store. The store is torn down
/// when the last handle is dropped; an in-flight request still completes and
/// lands in the cache.
pub struct Store<U: UseCase> {
  core: Arc<StoreCore<U>>,
}

impl<U: UseCase> Clone for Store<U> {
  fn clone(&self) -> Self {
    Self {
      core: Arc::clone(&self.core),
    }
  }
}

impl<U: UseCase> Store<U> {
  /// Register `on_change`. It receives the current snapshot synchronously,
  /// then every later transition in order, on the delivery lane.
  pub fn subscribe<F>(&self, on_change: F) -> Subscription
  where
    F: Fn(&StoreUpdate<U::Entity>) + Send + Sync + 'static,
  {
    let (subscription, primer, current) = {
      let inner = self.core.inner();
      let (subscription, primer) = self.core.observers.register_deferred(on_change, inner.revision);
      let current = StoreUpdate {
        state: inner.state.clone(),
        snapshot: Arc::clone(&inner.snapshot),
        changes: Vec::new(),
        section_changes: Vec::new(),
        revision: inner.revision,
      };
      (subscription, primer, current)
    };
    primer.deliver(&current);
    subscription
  }

  /// Start a refresh and return immediately.
  ///
  /// Without `force`, joins a request already in flight for the cache key,
  /// or settles from the cache when it is younger than the use case's TTL.
  /// With `force`, supersedes any in-flight request; its response is dropped.
  pub fn refresh(&self, force: bool) {
    let core = &self.core;
    let key = core.use_case.cache_key();

    let (fetcher, request) = match (&core.engine.fetcher, core.use_case.make_request()) {
      (Some(fetcher), Some(request)) if !core.engine.offline() => (fetcher.clone(), request),
      (_, None) if core.use_case.write_policy().delete_scope => {
        tracing::debug!(cache_key = key, "deleting scope locally");
        core.delete_scope();
        core.settle_from_cache();
        return;
      }
      _ => {
        tracing::debug!(cache_key = key, "serving refresh from cache");
        core.settle_from_cache();
        return;
      }
    };

    // A failed store retries even if an earlier success is still fresh.
    let failed = core.inner().state.error().is_some();
    let fresh = !force && !failed && core.is_fresh();
    match core.engine.begin(key, force, fresh) {
      Begin::Coalesced => {
        tracing::debug!(cache_key = key, "refresh joined in-flight request");
      }
      Begin::Fresh => {
        tracing::debug!(cache_key = key, "cache is fresh, skipping request");
        core.settle_from_cache();
      }
      Begin::Started(generation) => {
        tracing::debug!(cache_key = key, generation, force, "starting request");
        core.engine.runtime.spawn(run_fetch(
          Arc::clone(&core.engine),
          fetcher,
          Arc::clone(&core.use_case),
          request,
          generation,
          FetchMode::Refresh,
        ));
      }
    }
  }

  /// Whether the last fetch for the cache key stopped before the final page.
  pub fn has_next_page(&self) -> bool {
    self.core.engine.has_next_page(self.core.use_case.cache_key())
  }

  /// Load the next page after the current result. Returns false without
  /// doing anything when there is no next page, a request is already in
  /// flight for the key, or the engine cannot reach the network.
  ///
  /// The page is written like a refresh, under a new generation, so a forced
  /// refresh still supersedes it.
  pub fn get_next_page(&self) -> bool {
    let core = &self.core;
    let key = core.use_case.cache_key();
    let Some(fetcher) = core.engine.fetcher.clone() else {
      return false;
    };
    if core.engine.offline() {
      return false;
    }
    let Some((generation, request)) = core.engine.begin_next(key) else {
      tracing::debug!(cache_key = key, "no next page to load");
      return false;
    };

    tracing::debug!(cache_key = key, generation, path = %request.path, "loading next page");
    core.engine.runtime.spawn(run_fetch(
      Arc::clone(&core.engine),
      fetcher,
      Arc::clone(&core.use_case),
      request,
      generation,
      FetchMode::NextPage,
    ));
    true
  }

  /// Resolve once no request is in flight for the cache key and every update
  /// queued so far has been delivered.
  pub async fn wait_idle(&self) {
    let mut pending = self.core.engine.pending_receiver(self.core.use_case.cache_key());
    let _ = pending.wait_for(|in_flight| !*in_flight).await;
    self.core.engine.lane.flush().await;
  }

  pub fn use_case(&self) -> &U {
    &self.core.use_case
  }

  pub fn count(&self) -> usize {
    self.core.inner().snapshot.len()
  }

  pub fn is_empty(&self) -> bool {
    self.count() == 0
  }

  pub fn first(&self) -> Option<U::Entity> {
    self.core.inner().snapshot.first().cloned()
  }

  pub fn get(&self, index: usize) -> Option<U::Entity> {
    self.core.inner().snapshot.get(index).cloned()
  }

  pub fn snapshot(&self) -> Arc<[U::Entity]> {
    Arc::clone(&self.core.inner().snapshot)
  }

  /// Current snapshot grouped by the scope's section key, if it has one.
  pub fn sections(&self) -> Option<Vec<Section<U::Entity>>> {
    let key = self.core.use_case.scope().section_key.as_ref()?;
    Some(group_sections(&self.snapshot(), key))
  }

  pub fn state(&self) -> StoreState {
    self.core.inner().state.clone()
  }

  pub fn error(&self) -> Option<SyncError> {
    self.core.inner().state.error().cloned()
  }

  pub fn is_pending(&self) -> bool {
    self.core.inner().state.is_pending()
  }

  pub fn revision(&self) -> u64 {
    self.core.inner().revision
  }

  /// Records skipped from the most recent write for this cache key.
  pub fn warning(&self) -> Option<PartialDecodeWarning> {
    self.core.inner().warning.clone()
  }
}

impl<U: UseCase> std::fmt::Debug for Store<U> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let inner = self.core.inner();
    f.debug_struct("Store")
      .field("cache_key", &self.core.use_case.cache_key())
      .field("state", &inner.state)
      .field("count", &inner.snapshot.len())
      .field("revision", &inner.revision)
      .finish()
  }
}

fn load_snapshot<U: UseCase>(persistence: &dyn LocalPersistence, use_case: &U) -> Result<Vec<U::Entity>, PersistenceError> {
  let scope = use_case.scope();
  let docs = persistence.query(U::Entity::entity_type(), &scope.predicate, &scope.order)?;
  let mut rows = Vec::with_capacity(docs.len());
  for doc in docs {
    match serde_json::from_value::<U::Entity>(doc) {
      Ok(row) => rows.push(row),
      Err(e) => tracing::warn!(
        cache_key = use_case.cache_key(),
        error = %e,
        "cached row no longer decodes, leaving it out"
      ),
    }
  }
  Ok(rows)
}

/// Fetch the pages for one generation and write them through the use case.
async fn run_fetch<U: UseCase>(
  engine: Arc<EngineInner>,
  fetcher: RemoteFetcher,
  use_case: Arc<U>,
  request: RemoteRequest,
  generation: u64,
  mode: FetchMode,
) {
  let key = use_case.cache_key().to_string();
  let policy = use_case.write_policy();
  let predicate = use_case.scope().predicate.clone();
  let limit = (!use_case.load_all_pages()).then_some(1);

  let precondition: Precondition = {
    let engine = Arc::clone(&engine);
    let key = key.clone();
    Arc::new(move || engine.is_current(&key, generation))
  };

  let mut seen: HashSet<String> = HashSet::new();
  let mut superseded = false;
  let mut write_error: Option<PersistenceError> = None;

  let result = fetcher
    .fetch_pages(&request, limit, |page| {
      seen.extend(page.records.iter().filter_map(document_id));

      let mut batch = WriteBatch::new(U::Entity::entity_type(), Vec::new())
        .with_merge(policy.merge)
        .with_validator(validate_as::<U::Entity>)
        .with_precondition(Arc::clone(&precondition))
        .with_origin(WriteOrigin {
          cache_key: key.clone(),
          generation,
          final_page: page.is_last,
        });
      if page.is_last {
        engine.set_next_page(&key, generation, page.next.as_ref().map(|next| request.next_page(next.clone())));
        if mode == FetchMode::Refresh {
          batch = batch.with_stamp(CacheStamp::new(key.clone()));
        }
        if policy.delete_scope {
          batch = batch.with_prune(Prune {
            predicate: predicate.clone(),
            keep: HashSet::new(),
          });
        } else if policy.prune_scope && mode == FetchMode::Refresh && !page.truncated {
          batch = batch.with_prune(Prune {
            predicate: predicate.clone(),
            keep: seen.clone(),
          });
        }
      }

      let records = if policy.delete_scope { Vec::new() } else { page.records };
      match use_case.write(records, batch, engine.persistence.as_ref()) {
        Ok(WriteOutcome::Committed(summary)) => {
          if !summary.warning.is_empty() {
            tracing::warn!(
              cache_key = %key,
              skipped = summary.warning.skipped.len(),
              "committed page with skipped records"
            );
            engine.warn(&key, &summary.warning);
          }
          ControlFlow::Continue(())
        }
        Ok(WriteOutcome::Rejected) => {
          superseded = true;
          ControlFlow::Break(())
        }
        Err(e) => {
          write_error = Some(e);
          ControlFlow::Break(())
        }
      }
    })
    .await;

  match (result, write_error) {
    (_, Some(e)) => {
      tracing::warn!(cache_key = %key, error = %e, "failed to write response");
      engine.fail(&key, generation, e.into());
    }
    (Err(e), None) => {
      tracing::warn!(cache_key = %key, error = %e, "fetch failed");
      engine.fail(&key, generation, e.into());
    }
    (Ok(summary), None) => {
      if superseded {
        tracing::debug!(cache_key = %key, generation, "response superseded, discarded");
      } else {
        tracing::info!(
          cache_key = %key,
          ?mode,
          pages = summary.pages,
          records = summary.records,
          truncated = summary.truncated,
          more = summary.next.is_some(),
          "sync complete"
        );
      }
      engine.finish(&key, generation);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryStorage, Scope};
  use crate::use_case::UseCaseBuilder;
  use serde::{Deserialize, Serialize};
  use serde_json::json;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Note {
    id: String,
    title: String,
  }

  impl Entity for Note {
    fn id(&self) -> String {
      self.id.clone()
    }

    fn entity_type() -> &'static str {
      "note"
    }
  }

  fn seed(storage: &MemoryStorage, ids: &[&str]) {
    let records = ids.iter().map(|id| json!({"id": id, "title": id})).collect();
    storage.write(WriteBatch::new("note", records)).unwrap();
  }

  #[tokio::test]
  async fn test_store_seeds_from_cache() {
    let storage = Arc::new(MemoryStorage::new());
    seed(&storage, &["b", "a"]);
    let engine = SyncEngine::local(storage).unwrap();

    let store = engine.store(
      UseCaseBuilder::<Note>::new("notes")
        .scope(Scope::all("title"))
        .build()
        .unwrap(),
    );

    assert_eq!(store.state(), StoreState::Idle);
    assert_eq!(store.count(), 2);
    assert_eq!(store.first().unwrap().id, "a");
  }

  #[tokio::test]
  async fn test_local_refresh_settles_and_tracks_writes() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = SyncEngine::local(storage.clone()).unwrap();
    let store = engine.store(UseCaseBuilder::<Note>::new("notes").build().unwrap());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = store.subscribe(move |update: &StoreUpdate<Note>| {
      sink.lock().unwrap().push((update.state.clone(), update.snapshot.len()));
    });

    store.refresh(false);
    seed(&storage, &["x"]);
    engine.flush().await;

    assert_eq!(
      *seen.lock().unwrap(),
      vec![
        (StoreState::Idle, 0),
        (StoreState::Empty, 0),
        (StoreState::Data, 1),
      ]
    );
  }

  #[tokio::test]
  async fn test_dropped_subscription_stops_delivery() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = SyncEngine::local(storage.clone()).unwrap();
    let store = engine.store(UseCaseBuilder::<Note>::new("notes").build().unwrap());

    let seen = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&seen);
    let subscription = store.subscribe(move |_: &StoreUpdate<Note>| *sink.lock().unwrap() += 1);
    subscription.unsubscribe();

    seed(&storage, &["x"]);
    engine.flush().await;

    assert_eq!(*seen.lock().unwrap(), 1);
    assert_eq!(store.count(), 1);
  }

  #[test]
  fn test_engine_needs_runtime() {
    let result = SyncEngine::local(Arc::new(MemoryStorage::new()));
    assert!(matches!(result, Err(ConfigurationError::NoRuntime)));
  }

  #[tokio::test]
  async fn test_sections_follow_scope_section_key() {
    let storage = Arc::new(MemoryStorage::new());
    let records = vec![
      json!({"id": "1", "title": "draft"}),
      json!({"id": "2", "title": "final"}),
      json!({"id": "3", "title": "draft"}),
    ];
    storage.write(WriteBatch::new("note", records)).unwrap();
    let engine = SyncEngine::local(storage).unwrap();

    let flat = engine.store(UseCaseBuilder::<Note>::new("flat").build().unwrap());
    assert!(flat.sections().is_none());

    let grouped = engine.store(
      UseCaseBuilder::<Note>::new("grouped")
        .scope(Scope::all("id").sectioned_by("title"))
        .build()
        .unwrap(),
    );
    let sections = grouped.sections().unwrap();
    let keys: Vec<&str> = sections.iter().map(|s| s.key.as_str()).collect();
    assert_eq!(keys, vec!["draft", "final"]);
    assert_eq!(sections[0].items.len(), 2);
  }

  #[tokio::test]
  async fn test_revision_counts_transitions() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = SyncEngine::local(storage.clone()).unwrap();
    let store = engine.store(UseCaseBuilder::<Note>::new("notes").build().unwrap());
    assert_eq!(store.revision(), 0);

    store.refresh(false);
    assert_eq!(store.revision(), 1);

    // Same state and rows: nothing to publish.
    store.refresh(false);
    assert_eq!(store.revision(), 1);

    seed(&storage, &["x"]);
    assert_eq!(store.revision(), 2);
    assert_eq!(store.state(), StoreState::Data);
  }

  #[tokio::test]
  async fn test_idle_keys_are_evicted() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = SyncEngine::local(storage).unwrap();

    let first = engine.store(UseCaseBuilder::<Note>::new("first").build().unwrap());
    let _second = engine.store(UseCaseBuilder::<Note>::new("second").build().unwrap());
    assert_eq!(engine.inner.keys().len(), 2);

    drop(first);
    let _third = engine.store(UseCaseBuilder::<Note>::new("third").build().unwrap());
    let keys = engine.inner.keys();
    assert!(!keys.contains_key("first"));
    assert!(keys.contains_key("second"));
    assert!(keys.contains_key("third"));
  }
}
