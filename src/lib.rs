//! Offline-first sync for paginated REST collections.
//!
//! Use cases describe what to fetch and how to read it back, `RemoteFetcher`
//! pulls every page, `LocalPersistence` stores the rows, and `Store`s watch
//! the cache and emit ordered snapshots with edit scripts.

pub mod cache;
pub mod diff;
pub mod error;
pub mod observer;
pub mod remote;
pub mod store;
pub mod use_case;

pub use cache::{Entity, LocalPersistence, MemoryStorage, Predicate, Scope, SortDescriptor, SqliteStorage};
pub use diff::{apply, diff, diff_sections, CollectionUpdate, Section, SectionUpdate};
pub use error::{ConfigurationError, FetchError, PartialDecodeWarning, PersistenceError, SyncError};
pub use observer::Subscription;
pub use remote::{Credentials, FetcherConfig, HttpTransport, RemoteFetcher, RemoteRequest, SessionProvider, StaticSession};
pub use store::{Store, StoreState, StoreUpdate, SyncEngine};
pub use use_case::{derive_cache_key, CollectionUseCase, UseCase, UseCaseBuilder, WritePolicy};
