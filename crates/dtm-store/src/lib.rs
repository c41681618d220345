//! DT-Messaging persistence layer
//!
//! SQLite-backed message log and friends directory behind an async facade:
//! mutations run on a bounded writer pool, reads feed live query views that
//! re-emit after every committed write. Schema evolution uses explicit
//! versioned migrations tracked in SQLite's `user_version` pragma.

pub mod migrations;
pub mod models;
pub mod store;

pub use models::{FriendRecord, MessageCounts, MessageRecord};
pub use store::{MessageStore, StoreError};
