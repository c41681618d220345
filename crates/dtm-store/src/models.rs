//! Persistent row types
//!
//! [`MessageRecord`] is the stored form of a message (always plaintext; wire
//! encryption is applied at egress) and [`FriendRecord`] one entry of the
//! friends directory. Row mapping lives here so the store module stays all
//! queries.

use dtm_core::{EndpointId, MessageId, MessageStatus, Timestamp, UserId};
use rusqlite::Row;

// ----------------------------------------------------------------------------
// Message Record
// ----------------------------------------------------------------------------

/// A message as persisted in the `messages` table.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    /// Unique message ID; re-insert with the same ID replaces the row.
    pub message_id: MessageId,
    /// Plaintext body.
    pub content: String,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    /// Origin creation time (ms since epoch).
    pub timestamp: u64,
    pub status: MessageStatus,
    /// Hops traversed so far; 0 at origin.
    pub hop_count: u32,
    /// Absolute expiry time (ms since epoch).
    pub ttl: u64,
    /// Hex SHA-256 over `content || sender || recipient || timestamp`.
    pub integrity_hash: String,
    /// Whether this device authored the message.
    pub is_outgoing: bool,
}

impl MessageRecord {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now.as_millis() > self.ttl
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status_raw: i64 = row.get("status")?;
        Ok(Self {
            message_id: MessageId::new(row.get::<_, String>("message_id")?),
            content: row.get("content")?,
            sender_id: UserId::new(row.get::<_, String>("sender_id")?),
            recipient_id: UserId::new(row.get::<_, String>("recipient_id")?),
            timestamp: row.get::<_, i64>("timestamp")? as u64,
            status: MessageStatus::from_i64(status_raw).unwrap_or(MessageStatus::Failed),
            hop_count: row.get::<_, i64>("hop_count")? as u32,
            ttl: row.get::<_, i64>("ttl")? as u64,
            integrity_hash: row.get("hash")?,
            is_outgoing: row.get("is_outgoing")?,
        })
    }
}

// ----------------------------------------------------------------------------
// Friend Record
// ----------------------------------------------------------------------------

/// One entry of the friends directory.
#[derive(Debug, Clone, PartialEq)]
pub struct FriendRecord {
    pub user_id: UserId,
    pub nickname: String,
    /// Endpoint the friend was last observed behind, if any.
    pub endpoint_id: Option<EndpointId>,
    pub last_seen_ms: u64,
    pub added_ms: u64,
    /// Transient; reset to false on every engine start.
    pub is_online: bool,
    pub total_messages: u64,
    pub is_favorite: bool,
}

impl FriendRecord {
    pub fn new(user_id: UserId, nickname: impl Into<String>, now: Timestamp) -> Self {
        Self {
            user_id,
            nickname: nickname.into(),
            endpoint_id: None,
            last_seen_ms: now.as_millis(),
            added_ms: now.as_millis(),
            is_online: false,
            total_messages: 0,
            is_favorite: false,
        }
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: UserId::new(row.get::<_, String>("user_id")?),
            nickname: row.get::<_, Option<String>>("nickname")?.unwrap_or_default(),
            endpoint_id: row
                .get::<_, Option<String>>("endpoint_id")?
                .map(EndpointId::new),
            last_seen_ms: row.get::<_, i64>("last_seen")? as u64,
            added_ms: row.get::<_, i64>("added_date")? as u64,
            is_online: row.get("is_online")?,
            total_messages: row.get::<_, i64>("total_messages")? as u64,
            is_favorite: row.get("is_favorite")?,
        })
    }
}

// ----------------------------------------------------------------------------
// Counts
// ----------------------------------------------------------------------------

/// Message counters for the UI's status line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageCounts {
    pub total: u64,
    pub pending: u64,
}
