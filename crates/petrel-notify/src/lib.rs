//! Per-transaction queue of data-model change events.
//!
//! Mutations mark what happened ("instance created", "resource changed", ...)
//! and the queue folds the marks into one ordered entry per object. Flushing
//! happens after the enclosing transaction commits; the drained entries drive
//! attribute-storage reconciliation and observe triggers.

pub mod queue;

pub use queue::{InstanceSetChanges, NotifyQueue, ObjectChanges};
