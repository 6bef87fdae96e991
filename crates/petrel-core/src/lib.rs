//! The client-facing core: owns the registry, the notification queue and
//! the built-in modules, runs the transaction protocol around every
//! mutation, and flushes change notifications into attribute-storage
//! reconciliation and observe triggers.

pub mod client;

pub use client::{Client, NotificationSink};
