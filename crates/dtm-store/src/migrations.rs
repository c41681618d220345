//! Schema migrations
//!
//! Versioning rides on SQLite's `user_version` pragma via
//! `rusqlite_migration`; the version increases monotonically and each step is
//! an explicit SQL batch. The messages table came first, the friends
//! directory was added in version 2.

use rusqlite_migration::{Migrations, M};

/// All schema migrations, oldest first.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "-- Migration 1: message log

CREATE TABLE messages (
    message_id TEXT PRIMARY KEY NOT NULL,
    content TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    recipient_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    status INTEGER NOT NULL DEFAULT 0,
    hop_count INTEGER NOT NULL DEFAULT 0,
    ttl INTEGER NOT NULL,
    hash TEXT NOT NULL,
    is_outgoing INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX idx_messages_timestamp ON messages(timestamp);
CREATE INDEX idx_messages_status ON messages(status);
CREATE INDEX idx_messages_ttl ON messages(ttl);
CREATE INDEX idx_messages_conversation ON messages(sender_id, recipient_id);
",
        ),
        M::up(
            "-- Migration 2: friends directory

CREATE TABLE friends (
    user_id TEXT PRIMARY KEY NOT NULL,
    nickname TEXT,
    endpoint_id TEXT,
    last_seen INTEGER NOT NULL,
    added_date INTEGER NOT NULL,
    is_online INTEGER NOT NULL DEFAULT 0,
    total_messages INTEGER NOT NULL DEFAULT 0,
    is_favorite INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX idx_friends_endpoint ON friends(endpoint_id);
",
        ),
    ])
}
