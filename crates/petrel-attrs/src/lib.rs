//! Attribute storage: per-server notification attributes attached to the
//! object / instance / resource / resource-instance hierarchy.
//!
//! The tree mirrors the data model lazily (entries appear on first write and
//! vanish when their last attribute record does), reconciles itself against
//! data-model change notifications, snapshots itself for transaction
//! rollback, and persists to a versioned big-endian stream.

pub mod persistence;
pub mod reconcile;
pub mod storage;

pub use storage::AttrStorage;
