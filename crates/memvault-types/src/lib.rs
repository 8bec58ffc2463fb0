//! Core types for the Memvault advanced memory store.
//!
//! This crate defines the shared data structures exchanged with the store:
//! entries, option and result structs, statistics, configuration, and the
//! error type. It contains no business logic.

pub mod cleanup;
pub mod config;
pub mod entry;
pub mod error;
pub mod query;
pub mod serde_compat;
pub mod stats;
pub mod transfer;
