//! Subscriber bookkeeping and ordered delivery.
//!
//! `ObserverRegistry<T>` is an arena of live callbacks. Registering returns a
//! `Subscription` handle that removes the callback when dropped, so observer
//! lifetimes follow the scope that owns the handle.
//!
//! `DeliveryLane` is the single cooperative context every store pushes its
//! updates through. Jobs run one at a time in enqueue order on one tokio task.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::runtime::Handle;
use tokio::sync::mpsc;

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

struct Delivery<T> {
  /// Highest revision handed to this callback
  last_revision: u64,
  /// The initial value has been delivered
  primed: bool,
  /// Revisions that arrived before the initial value
  deferred: Vec<T>,
}

struct Entry<T> {
  callback: Callback<T>,
  /// Locked for the whole duration of a delivery so deliveries to one
  /// observer never overlap.
  delivery: Mutex<Delivery<T>>,
}

impl<T> Entry<T> {
  fn delivery(&self) -> MutexGuard<'_, Delivery<T>> {
    self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

struct RegistryInner<T> {
  next_id: AtomicU64,
  entries: Mutex<BTreeMap<u64, Arc<Entry<T>>>>,
}

impl<T> RegistryInner<T> {
  fn entries(&self) -> MutexGuard<'_, BTreeMap<u64, Arc<Entry<T>>>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

trait Detach: Send + Sync {
  fn detach(&self, id: u64);
}

impl<T: Send + Sync> Detach for RegistryInner<T> {
  fn detach(&self, id: u64) {
    self.entries().remove(&id);
  }
}

/// Arena of live subscriber callbacks.
pub struct ObserverRegistry<T> {
  inner: Arc<RegistryInner<T>>,
}

impl<T: Send + Sync + 'static> ObserverRegistry<T> {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(RegistryInner {
        next_id: AtomicU64::new(1),
        entries: Mutex::new(BTreeMap::new()),
      }),
    }
  }

  /// Register a callback with no initial delivery.
  pub fn register<F>(&self, callback: F) -> Subscription
  where
    F: Fn(&T) + Send + Sync + 'static,
  {
    let (subscription, _entry) = self.insert(Box::new(callback), 0, true);
    subscription
  }

  /// Register a callback whose initial value is delivered later through the
  /// returned `Primer`. Later calls to `notify_revision` with a revision at or
  /// below `revision` are skipped for this callback.
  ///
  /// Newer revisions published in between are held back and replayed right
  /// after the initial value. This lets a caller register while holding its
  /// own state lock and deliver once the lock is released.
  pub fn register_deferred<F>(&self, callback: F, revision: u64) -> (Subscription, Primer<T>)
  where
    F: Fn(&T) + Send + Sync + 'static,
  {
    let (subscription, entry) = self.insert(Box::new(callback), revision, false);
    (subscription, Primer { entry: Some(entry) })
  }

  fn insert(&self, callback: Callback<T>, revision: u64, primed: bool) -> (Subscription, Arc<Entry<T>>) {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    let entry = Arc::new(Entry {
      callback,
      delivery: Mutex::new(Delivery {
        last_revision: revision,
        primed,
        deferred: Vec::new(),
      }),
    });
    self.inner.entries().insert(id, Arc::clone(&entry));
    let registry: Arc<dyn Detach> = self.inner.clone();
    let subscription = Subscription {
      registry: Arc::downgrade(&registry),
      id,
    };
    (subscription, entry)
  }

  /// Deliver to every live callback, in registration order.
  pub fn notify(&self, value: &T) {
    for entry in self.snapshot() {
      let _delivering = entry.delivery();
      (entry.callback)(value);
    }
  }

  /// Deliver a revisioned value, skipping callbacks that already saw it.
  pub fn notify_revision(&self, revision: u64, value: &T)
  where
    T: Clone,
  {
    for entry in self.snapshot() {
      let mut delivery = entry.delivery();
      if revision <= delivery.last_revision {
        continue;
      }
      delivery.last_revision = revision;
      if !delivery.primed {
        delivery.deferred.push(value.clone());
        continue;
      }
      (entry.callback)(value);
    }
  }

  pub fn len(&self) -> usize {
    self.inner.entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  // Callbacks run outside the arena lock so they may subscribe or unsubscribe.
  fn snapshot(&self) -> Vec<Arc<Entry<T>>> {
    self.inner.entries().values().cloned().collect()
  }
}

impl<T: Send + Sync + 'static> Default for ObserverRegistry<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Clone for ObserverRegistry<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

/// Pending initial delivery for a callback from `register_deferred`.
///
/// Dropping it without delivering releases any held-back revisions.
pub struct Primer<T> {
  entry: Option<Arc<Entry<T>>>,
}

impl<T> Primer<T> {
  /// Deliver `initial`, then every revision held back since registration.
  pub fn deliver(mut self, initial: &T) {
    if let Some(entry) = self.entry.take() {
      prime(&entry, Some(initial));
    }
  }
}

impl<T> Drop for Primer<T> {
  fn drop(&mut self) {
    if let Some(entry) = self.entry.take() {
      prime(&entry, None);
    }
  }
}

fn prime<T>(entry: &Entry<T>, initial: Option<&T>) {
  let mut delivery = entry.delivery();
  if let Some(initial) = initial {
    (entry.callback)(initial);
  }
  delivery.primed = true;
  for value in std::mem::take(&mut delivery.deferred) {
    (entry.callback)(&value);
  }
}

/// Handle to a registered callback. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
  registry: Weak<dyn Detach>,
  id: u64,
}

impl Subscription {
  /// Unsubscribe now. Equivalent to dropping the handle.
  pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(registry) = self.registry.upgrade() {
      registry.detach(self.id);
    }
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription").field("id", &self.id).finish()
  }
}

type Job = Box<dyn FnOnce() + Send>;

/// Single-consumer queue that runs delivery jobs in FIFO order.
#[derive(Clone)]
pub struct DeliveryLane {
  tx: mpsc::UnboundedSender<Job>,
}

impl DeliveryLane {
  /// Spawn the lane's task on `runtime`.
  pub fn spawn(runtime: &Handle) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    runtime.spawn(async move {
      while let Some(job) = rx.recv().await {
        job();
      }
      tracing::debug!("delivery lane closed");
    });
    Self { tx }
  }

  /// Queue a job behind everything already enqueued.
  pub fn enqueue<F>(&self, job: F)
  where
    F: FnOnce() + Send + 'static,
  {
    if self.tx.send(Box::new(job)).is_err() {
      tracing::warn!("delivery lane is gone, dropping update");
    }
  }

  /// Resolve once every job enqueued before this call has run.
  pub async fn flush(&self) {
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    self.enqueue(move || {
      let _ = done_tx.send(());
    });
    let _ = done_rx.await;
  }
}

impl std::fmt::Debug for DeliveryLane {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DeliveryLane").finish_non_exhaustive()
  }
}
