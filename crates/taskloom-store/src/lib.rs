//! Persistence for taskloom: task records and graphs keyed by id, with an
//! append-only execution log per task kept apart from the mutable record.
//!
//! # Main types
//!
//! - [`TaskStore`]: Async storage trait the engine writes through.
//! - [`InMemoryTaskStore`]: Default in-process backend.
//! - [`FileTaskStore`]: JSON files on disk, JSON-lines logs.

/// File-backed store.
pub mod file;
/// Store trait and in-memory backend.
pub mod store;

pub use file::FileTaskStore;
pub use store::{InMemoryTaskStore, TaskStore};
