//! Advanced memory store.
//!
//! An in-process record store with secondary indexes and structured queries.
//! It exports to and imports from JSON, CSV, XML and YAML, with optional gzip
//! and passphrase encryption, runs retention cleanup passes, and reports
//! statistics. Entries can be mirrored to a SQLite snapshot.
//!
//! - **Repository**: sharded entry map plus index, per-entry locking
//! - **Query engine**: index narrowing, predicate re-check, sort, page, aggregate
//! - **Codecs**: one [`codec::EntryCodec`] per format, plus the byte envelope
//! - **Transfer**: export and import under a conflict strategy
//! - **Cleanup**: ordered retention rules, dry-run capable
//! - **Stats**: overview, distribution, performance, health, optimization
//!
//! Hosts construct a [`MemoryStore`], share it as `Arc<MemoryStore>`, and may
//! start a [`MemoryService`] for periodic cleanup and flushing.

pub mod cleanup;
pub mod codec;
pub mod config;
pub mod index;
pub mod migration;
pub mod persistence;
pub mod query;
pub mod record;
pub mod repository;
pub mod service;
pub mod stats;
pub mod transfer;

mod store;
pub use service::MemoryService;
pub use store::MemoryStore;
