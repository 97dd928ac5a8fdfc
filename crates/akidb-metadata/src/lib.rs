//! Persistent metadata for the AkiDB data coordinator.
//!
//! Collections, partitions, segments and allocator counters live in an
//! ordered key-value store. [`SqliteKvBackend`] is the durable backend;
//! [`MemoryKvBackend`] serves tests and throwaway deployments.

mod id_allocator;
mod kv;
mod meta_store;
mod sqlite_kv;
mod util;

pub use id_allocator::KvIdAllocator;
pub use kv::{KvBackend, MemoryKvBackend};
pub use meta_store::KvMetadataStore;
pub use sqlite_kv::SqliteKvBackend;
pub use util::{create_sqlite_pool, run_migrations};

/// Embedded SQL migrations for the metadata database.
pub const MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
