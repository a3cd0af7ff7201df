//! File-backed storage for the map layer: instance saves, player and group
//! binds, instance script data, respawn times and scheduled resets.
//!
//! # Invariants
//! - The journal is append-only; a segment is never rewritten.
//! - Every snapshot and journal segment is listed in a sha256 hash chain and
//!   any mismatch fails the open.
//! - Reopening a store replays the latest snapshot plus every journal
//!   segment written after it, reproducing the state exactly.

pub mod file;
pub mod journal;
pub mod store;

pub use file::FilePersistence;
pub use journal::Mutation;
pub use store::{IntegrityManifest, ManifestEntry, StateStore, StoreError, StoreMeta};
