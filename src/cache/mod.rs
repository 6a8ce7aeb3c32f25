//! Local persistence for synced entities.
//!
//! This module provides the storage side of the engine:
//! - Entities are stored as JSON documents keyed by (entity type, id)
//! - Writes upsert by id, merging fields unless a full replace is requested
//! - Queries filter by predicate and order by sort descriptors, ties by id
//! - Observers are called after each commit that touches rows they watch
//! - Each cache key carries a refresh stamp used for TTL checks

mod memory;
mod scope;
mod sqlite;
mod storage;
mod traits;

pub use memory::MemoryStorage;
pub use scope::{compare_documents, compare_values, select, Predicate, Scope, SortDescriptor};
pub use sqlite::SqliteStorage;
pub use storage::{
  ChangeCallback, ChangeSet, CommitSummary, LocalPersistence, ObserveFilter, Precondition, Prune, Validator,
  WriteBatch, WriteOrigin, WriteOutcome,
};
pub use traits::{document_id, merge_document, validate_as, CacheStamp, Entity, MergePolicy, ID_FIELD};
