//! SQLite-backed message log and friends directory
//!
//! A single connection guarded by a mutex, driven through
//! `tokio::task::spawn_blocking`; write concurrency is bounded by a
//! semaphore so a burst of status updates cannot starve the runtime's
//! blocking pool. Every committed write bumps a revision counter that the
//! live query views watch, re-running their query on each change.
//!
//! Opening the store performs the start-of-life maintenance: expired
//! messages are swept and every friend's online flag is reset, since
//! presence is transient state.

use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use dtm_core::{
    EndpointId, EngineError, MessageId, MessageStatus, StoreConfig, Timestamp, UserId,
};

use crate::migrations;
use crate::models::{FriendRecord, MessageCounts, MessageRecord};

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),
    #[error("store task failed: {0}")]
    Join(String),
    #[error("store is closed")]
    Closed,
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        EngineError::persistence(err.to_string())
    }
}

// ----------------------------------------------------------------------------
// Message Store
// ----------------------------------------------------------------------------

/// Persistent log of messages and friends with live query views.
#[derive(Clone)]
pub struct MessageStore {
    conn: Arc<Mutex<Connection>>,
    writers: Arc<Semaphore>,
    revision: Arc<watch::Sender<u64>>,
}

impl MessageStore {
    /// Open (or create) the store described by `config` and run pending
    /// migrations, the expiry sweep, and the online-flag reset.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut conn = match &config.path {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir).ok();
                }
                let conn = Connection::open(path)?;
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn
            }
            None => Connection::open_in_memory()?,
        };
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::migrations().to_latest(&mut conn)?;

        let now = Timestamp::now().as_millis() as i64;
        let swept = conn.execute("DELETE FROM messages WHERE ttl < ?1", params![now])?;
        if swept > 0 {
            info!(swept, "removed expired messages on open");
        }
        // Presence is transient; nobody is online until the transport says so.
        conn.execute("UPDATE friends SET is_online = 0", [])?;

        let (revision, _) = watch::channel(0u64);
        info!(
            path = ?config.path,
            "message store opened"
        );
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            writers: Arc::new(Semaphore::new(config.effective_writer_permits())),
            revision: Arc::new(revision),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(&StoreConfig::in_memory())
    }

    fn bump(&self) {
        self.revision.send_modify(|v| *v += 1);
    }

    /// Run a mutation on the writer pool; bumps the revision on success.
    async fn write<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .writers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Closed)?;
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap();
            let out = op(&guard);
            drop(permit);
            out
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))??;
        self.bump();
        Ok(result)
    }

    /// Run a read-only query off the async executor.
    async fn read<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap();
            op(&guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
        .map_err(StoreError::from)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Insert a message, replacing any existing row with the same ID.
    pub async fn insert_message(&self, record: MessageRecord) -> Result<(), StoreError> {
        self.write(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO messages \
                 (message_id, content, sender_id, recipient_id, timestamp, status, \
                  hop_count, ttl, hash, is_outgoing) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.message_id.as_str(),
                    record.content,
                    record.sender_id.as_str(),
                    record.recipient_id.as_str(),
                    record.timestamp as i64,
                    record.status.as_i64(),
                    record.hop_count as i64,
                    record.ttl as i64,
                    record.integrity_hash,
                    record.is_outgoing,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Update a message's status, enforcing the monotone transition rule:
    /// `PENDING -> SENT -> DELIVERED`, `FAILED` reachable from any
    /// non-terminal state, nothing leaves `DELIVERED` or `FAILED`.
    ///
    /// Returns whether a row actually changed.
    pub async fn update_status(
        &self,
        id: &MessageId,
        status: MessageStatus,
    ) -> Result<bool, StoreError> {
        let id = id.clone();
        let changed = self
            .write(move |conn| {
                conn.execute(
                    "UPDATE messages SET status = ?1 \
                     WHERE message_id = ?2 AND status < 2 AND status < ?1",
                    params![status.as_i64(), id.as_str()],
                )
            })
            .await?;
        if changed == 0 {
            debug!(%status, "status update was a no-op");
        }
        Ok(changed > 0)
    }

    pub async fn message(&self, id: &MessageId) -> Result<Option<MessageRecord>, StoreError> {
        let id = id.clone();
        self.read(move |conn| {
            conn.query_row(
                "SELECT * FROM messages WHERE message_id = ?1",
                params![id.as_str()],
                |row| MessageRecord::from_row(row),
            )
            .optional()
        })
        .await
    }

    pub async fn message_exists(&self, id: &MessageId) -> Result<bool, StoreError> {
        Ok(self.message(id).await?.is_some())
    }

    /// Every stored message, oldest first.
    pub async fn all_messages(&self) -> Result<Vec<MessageRecord>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM messages ORDER BY timestamp ASC")?;
            let rows = stmt.query_map([], |row| MessageRecord::from_row(row))?;
            rows.collect()
        })
        .await
    }

    /// Messages exchanged between two users, in either direction, oldest
    /// first.
    pub async fn conversation(
        &self,
        user_a: &UserId,
        user_b: &UserId,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let (a, b) = (user_a.clone(), user_b.clone());
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM messages WHERE \
                 (sender_id = ?1 AND recipient_id = ?2) OR \
                 (sender_id = ?2 AND recipient_id = ?1) \
                 ORDER BY timestamp ASC",
            )?;
            let rows = stmt.query_map(params![a.as_str(), b.as_str()], |row| {
                MessageRecord::from_row(row)
            })?;
            rows.collect()
        })
        .await
    }

    /// Outgoing messages still awaiting a first successful send.
    pub async fn pending_outgoing(&self) -> Result<Vec<MessageRecord>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM messages WHERE is_outgoing = 1 AND status = 0 \
                 ORDER BY timestamp ASC",
            )?;
            let rows = stmt.query_map([], |row| MessageRecord::from_row(row))?;
            rows.collect()
        })
        .await
    }

    /// Stored incoming messages still worth relaying: not yet delivered and
    /// not expired.
    pub async fn forwardable(&self, now: Timestamp) -> Result<Vec<MessageRecord>, StoreError> {
        let now = now.as_millis() as i64;
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM messages WHERE is_outgoing = 0 AND status != 2 \
                 AND ttl > ?1 ORDER BY timestamp ASC",
            )?;
            let rows = stmt.query_map(params![now], |row| MessageRecord::from_row(row))?;
            rows.collect()
        })
        .await
    }

    /// Undelivered messages addressed to a specific recipient.
    pub async fn undelivered_for(
        &self,
        recipient: &UserId,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let recipient = recipient.clone();
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM messages WHERE recipient_id = ?1 AND status != 2 \
                 ORDER BY timestamp ASC",
            )?;
            let rows = stmt.query_map(params![recipient.as_str()], |row| {
                MessageRecord::from_row(row)
            })?;
            rows.collect()
        })
        .await
    }

    /// Remove every message whose TTL has elapsed. Idempotent.
    pub async fn delete_expired(&self, now: Timestamp) -> Result<usize, StoreError> {
        let now = now.as_millis() as i64;
        let deleted = self
            .write(move |conn| conn.execute("DELETE FROM messages WHERE ttl < ?1", params![now]))
            .await?;
        if deleted > 0 {
            info!(deleted, "swept expired messages");
        }
        Ok(deleted)
    }

    pub async fn delete_message(&self, id: &MessageId) -> Result<bool, StoreError> {
        let id = id.clone();
        let deleted = self
            .write(move |conn| {
                conn.execute(
                    "DELETE FROM messages WHERE message_id = ?1",
                    params![id.as_str()],
                )
            })
            .await?;
        Ok(deleted > 0)
    }

    /// Total and pending message counts.
    pub async fn counts(&self) -> Result<MessageCounts, StoreError> {
        self.read(|conn| {
            conn.query_row(
                "SELECT COUNT(*), \
                 COALESCE(SUM(CASE WHEN status = 0 THEN 1 ELSE 0 END), 0) \
                 FROM messages",
                [],
                |row| {
                    Ok(MessageCounts {
                        total: row.get::<_, i64>(0)? as u64,
                        pending: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
        })
        .await
    }

    // ------------------------------------------------------------------
    // Friends
    // ------------------------------------------------------------------

    /// Insert or replace a friend entry.
    pub async fn upsert_friend(&self, record: FriendRecord) -> Result<(), StoreError> {
        self.write(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO friends \
                 (user_id, nickname, endpoint_id, last_seen, added_date, \
                  is_online, total_messages, is_favorite) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.user_id.as_str(),
                    record.nickname,
                    record.endpoint_id.as_ref().map(|e| e.as_str().to_string()),
                    record.last_seen_ms as i64,
                    record.added_ms as i64,
                    record.is_online,
                    record.total_messages as i64,
                    record.is_favorite,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn remove_friend(&self, user_id: &UserId) -> Result<bool, StoreError> {
        let user_id = user_id.clone();
        let deleted = self
            .write(move |conn| {
                conn.execute(
                    "DELETE FROM friends WHERE user_id = ?1",
                    params![user_id.as_str()],
                )
            })
            .await?;
        Ok(deleted > 0)
    }

    pub async fn rename_friend(
        &self,
        user_id: &UserId,
        nickname: &str,
    ) -> Result<bool, StoreError> {
        let user_id = user_id.clone();
        let nickname = nickname.to_string();
        let changed = self
            .write(move |conn| {
                conn.execute(
                    "UPDATE friends SET nickname = ?1 WHERE user_id = ?2",
                    params![nickname, user_id.as_str()],
                )
            })
            .await?;
        Ok(changed > 0)
    }

    pub async fn set_favorite(
        &self,
        user_id: &UserId,
        favorite: bool,
    ) -> Result<bool, StoreError> {
        let user_id = user_id.clone();
        let changed = self
            .write(move |conn| {
                conn.execute(
                    "UPDATE friends SET is_favorite = ?1 WHERE user_id = ?2",
                    params![favorite, user_id.as_str()],
                )
            })
            .await?;
        Ok(changed > 0)
    }

    /// Bump a friend's exchanged-message counter.
    pub async fn increment_friend_messages(&self, user_id: &UserId) -> Result<bool, StoreError> {
        let user_id = user_id.clone();
        let changed = self
            .write(move |conn| {
                conn.execute(
                    "UPDATE friends SET total_messages = total_messages + 1 \
                     WHERE user_id = ?1",
                    params![user_id.as_str()],
                )
            })
            .await?;
        Ok(changed > 0)
    }

    /// Record that a known user was observed behind an endpoint.
    pub async fn note_friend_endpoint(
        &self,
        user_id: &UserId,
        endpoint: &EndpointId,
        now: Timestamp,
    ) -> Result<bool, StoreError> {
        let user_id = user_id.clone();
        let endpoint = endpoint.as_str().to_string();
        let now = now.as_millis() as i64;
        let changed = self
            .write(move |conn| {
                conn.execute(
                    "UPDATE friends SET endpoint_id = ?1, is_online = 1, last_seen = ?2 \
                     WHERE user_id = ?3",
                    params![endpoint, now, user_id.as_str()],
                )
            })
            .await?;
        Ok(changed > 0)
    }

    /// Flip the online flag for whichever friend sits behind an endpoint.
    pub async fn set_online_by_endpoint(
        &self,
        endpoint: &EndpointId,
        online: bool,
        now: Timestamp,
    ) -> Result<bool, StoreError> {
        let endpoint = endpoint.as_str().to_string();
        let now = now.as_millis() as i64;
        let changed = self
            .write(move |conn| {
                conn.execute(
                    "UPDATE friends SET is_online = ?1, last_seen = ?2 \
                     WHERE endpoint_id = ?3",
                    params![online, now, endpoint],
                )
            })
            .await?;
        Ok(changed > 0)
    }

    pub async fn set_all_offline(&self) -> Result<usize, StoreError> {
        self.write(|conn| conn.execute("UPDATE friends SET is_online = 0", []))
            .await
    }

    /// Every friend, favorites first, most recently seen first within each
    /// group.
    pub async fn friends(&self) -> Result<Vec<FriendRecord>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM friends ORDER BY is_favorite DESC, last_seen DESC",
            )?;
            let rows = stmt.query_map([], |row| FriendRecord::from_row(row))?;
            rows.collect()
        })
        .await
    }

    pub async fn friend(&self, user_id: &UserId) -> Result<Option<FriendRecord>, StoreError> {
        let user_id = user_id.clone();
        self.read(move |conn| {
            conn.query_row(
                "SELECT * FROM friends WHERE user_id = ?1",
                params![user_id.as_str()],
                |row| FriendRecord::from_row(row),
            )
            .optional()
        })
        .await
    }

    // ------------------------------------------------------------------
    // Live Views
    // ------------------------------------------------------------------

    /// Subscribe to the store's revision counter; bumped on every committed
    /// write.
    pub fn revision(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Live view of all messages ordered by timestamp: emits the current
    /// snapshot immediately, then re-emits after each committed write.
    pub fn observe_messages(&self) -> mpsc::Receiver<Vec<MessageRecord>> {
        let store = self.clone();
        self.spawn_view(move || {
            let store = store.clone();
            async move { store.all_messages().await }
        })
    }

    /// Live view of one conversation.
    pub fn observe_conversation(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> mpsc::Receiver<Vec<MessageRecord>> {
        let store = self.clone();
        self.spawn_view(move || {
            let store = store.clone();
            let (a, b) = (user_a.clone(), user_b.clone());
            async move { store.conversation(&a, &b).await }
        })
    }

    /// Live view of message counters.
    pub fn observe_counts(&self) -> mpsc::Receiver<MessageCounts> {
        let store = self.clone();
        self.spawn_view(move || {
            let store = store.clone();
            async move { store.counts().await }
        })
    }

    /// Live view of the friends directory.
    pub fn observe_friends(&self) -> mpsc::Receiver<Vec<FriendRecord>> {
        let store = self.clone();
        self.spawn_view(move || {
            let store = store.clone();
            async move { store.friends().await }
        })
    }

    fn spawn_view<T, F, Fut>(&self, query: F) -> mpsc::Receiver<T>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, StoreError>> + Send,
    {
        let (tx, rx) = mpsc::channel(16);
        let mut revision = self.revision.subscribe();
        tokio::spawn(async move {
            loop {
                match query().await {
                    Ok(snapshot) => {
                        if tx.send(snapshot).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "live view query failed"),
                }
                if revision.changed().await.is_err() {
                    break;
                }
            }
        });
        rx
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, sender: &str, recipient: &str, ts: u64) -> MessageRecord {
        MessageRecord {
            message_id: MessageId::from(id),
            content: format!("body of {id}"),
            sender_id: UserId::from(sender),
            recipient_id: UserId::from(recipient),
            timestamp: ts,
            status: MessageStatus::Pending,
            hop_count: 0,
            ttl: ts + 86_400_000,
            integrity_hash: "ab".repeat(32),
            is_outgoing: sender == "me",
        }
    }

    #[tokio::test]
    async fn test_insert_and_fetch() {
        let store = MessageStore::open_in_memory().unwrap();
        let rec = record("m1", "me", "them", 1000);
        store.insert_message(rec.clone()).await.unwrap();

        let fetched = store.message(&MessageId::from("m1")).await.unwrap().unwrap();
        assert_eq!(fetched, rec);
        assert!(store.message_exists(&MessageId::from("m1")).await.unwrap());
        assert!(!store.message_exists(&MessageId::from("m2")).await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_same_id_replaces() {
        let store = MessageStore::open_in_memory().unwrap();
        store.insert_message(record("m1", "me", "them", 1000)).await.unwrap();

        let mut updated = record("m1", "me", "them", 1000);
        updated.content = "edited".into();
        store.insert_message(updated).await.unwrap();

        let all = store.all_messages().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content, "edited");
    }

    #[tokio::test]
    async fn test_status_transitions_are_monotone() {
        let store = MessageStore::open_in_memory().unwrap();
        let id = MessageId::from("m1");
        store.insert_message(record("m1", "me", "them", 1000)).await.unwrap();

        assert!(store.update_status(&id, MessageStatus::Sent).await.unwrap());
        assert!(store.update_status(&id, MessageStatus::Delivered).await.unwrap());

        // Delivered is terminal.
        assert!(!store.update_status(&id, MessageStatus::Sent).await.unwrap());
        assert!(!store.update_status(&id, MessageStatus::Failed).await.unwrap());
        assert_eq!(
            store.message(&id).await.unwrap().unwrap().status,
            MessageStatus::Delivered
        );
    }

    #[tokio::test]
    async fn test_failed_is_terminal() {
        let store = MessageStore::open_in_memory().unwrap();
        let id = MessageId::from("m1");
        store.insert_message(record("m1", "me", "them", 1000)).await.unwrap();

        assert!(store.update_status(&id, MessageStatus::Failed).await.unwrap());
        assert!(!store.update_status(&id, MessageStatus::Sent).await.unwrap());
        assert!(!store.update_status(&id, MessageStatus::Delivered).await.unwrap());
        assert_eq!(
            store.message(&id).await.unwrap().unwrap().status,
            MessageStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_status_never_regresses() {
        let store = MessageStore::open_in_memory().unwrap();
        let id = MessageId::from("m1");
        store.insert_message(record("m1", "me", "them", 1000)).await.unwrap();

        assert!(store.update_status(&id, MessageStatus::Sent).await.unwrap());
        assert!(!store.update_status(&id, MessageStatus::Pending).await.unwrap());
        assert_eq!(
            store.message(&id).await.unwrap().unwrap().status,
            MessageStatus::Sent
        );
    }

    #[tokio::test]
    async fn test_conversation_is_bidirectional() {
        let store = MessageStore::open_in_memory().unwrap();
        store.insert_message(record("m1", "a", "b", 1000)).await.unwrap();
        store.insert_message(record("m2", "b", "a", 2000)).await.unwrap();
        store.insert_message(record("m3", "a", "c", 3000)).await.unwrap();

        let convo = store
            .conversation(&UserId::from("a"), &UserId::from("b"))
            .await
            .unwrap();
        assert_eq!(convo.len(), 2);
        assert_eq!(convo[0].message_id, MessageId::from("m1"));
        assert_eq!(convo[1].message_id, MessageId::from("m2"));
    }

    #[tokio::test]
    async fn test_pending_outgoing_filter() {
        let store = MessageStore::open_in_memory().unwrap();
        store.insert_message(record("out-pending", "me", "b", 1000)).await.unwrap();
        store.insert_message(record("in-pending", "b", "me", 2000)).await.unwrap();

        let mut sent = record("out-sent", "me", "b", 3000);
        sent.status = MessageStatus::Sent;
        store.insert_message(sent).await.unwrap();

        let pending = store.pending_outgoing().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_id, MessageId::from("out-pending"));
    }

    #[tokio::test]
    async fn test_forwardable_filter() {
        let store = MessageStore::open_in_memory().unwrap();
        let now = Timestamp::now();
        let base = now.as_millis();

        // Incoming, undelivered, alive: forwardable.
        store.insert_message(record("keep", "a", "c", base)).await.unwrap();
        // Outgoing: not forwardable.
        store.insert_message(record("mine", "me", "c", base)).await.unwrap();
        // Delivered: not forwardable.
        let mut delivered = record("done", "a", "c", base);
        delivered.status = MessageStatus::Delivered;
        store.insert_message(delivered).await.unwrap();
        // Expired: not forwardable.
        let mut expired = record("old", "a", "c", base);
        expired.ttl = base.saturating_sub(1);
        store.insert_message(expired).await.unwrap();

        let forwardable = store.forwardable(now).await.unwrap();
        assert_eq!(forwardable.len(), 1);
        assert_eq!(forwardable[0].message_id, MessageId::from("keep"));
    }

    #[tokio::test]
    async fn test_delete_expired_is_idempotent() {
        let store = MessageStore::open_in_memory().unwrap();
        let now = Timestamp::now();
        let base = now.as_millis();

        let mut stale = record("stale", "a", "b", base);
        stale.ttl = base - 1;
        store.insert_message(stale).await.unwrap();
        store.insert_message(record("fresh", "a", "b", base)).await.unwrap();

        assert_eq!(store.delete_expired(now).await.unwrap(), 1);
        assert_eq!(store.delete_expired(now).await.unwrap(), 0);
        assert_eq!(store.all_messages().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_counts() {
        let store = MessageStore::open_in_memory().unwrap();
        store.insert_message(record("m1", "me", "b", 1000)).await.unwrap();
        let mut sent = record("m2", "me", "b", 2000);
        sent.status = MessageStatus::Sent;
        store.insert_message(sent).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts, MessageCounts { total: 2, pending: 1 });
    }

    #[tokio::test]
    async fn test_friend_crud() {
        let store = MessageStore::open_in_memory().unwrap();
        let alice = UserId::from("alice");
        let now = Timestamp::new(5000);

        store
            .upsert_friend(FriendRecord::new(alice.clone(), "Alice", now))
            .await
            .unwrap();
        assert!(store.rename_friend(&alice, "Alyce").await.unwrap());
        assert!(store.set_favorite(&alice, true).await.unwrap());
        assert!(store.increment_friend_messages(&alice).await.unwrap());

        let fetched = store.friend(&alice).await.unwrap().unwrap();
        assert_eq!(fetched.nickname, "Alyce");
        assert!(fetched.is_favorite);
        assert_eq!(fetched.total_messages, 1);

        assert!(store.remove_friend(&alice).await.unwrap());
        assert!(store.friend(&alice).await.unwrap().is_none());
        assert!(!store.remove_friend(&alice).await.unwrap());
    }

    #[tokio::test]
    async fn test_online_flags_by_endpoint() {
        let store = MessageStore::open_in_memory().unwrap();
        let bob = UserId::from("bob");
        let ep = EndpointId::from("ep-7");
        let now = Timestamp::new(9000);

        store
            .upsert_friend(FriendRecord::new(bob.clone(), "Bob", now))
            .await
            .unwrap();
        assert!(store.note_friend_endpoint(&bob, &ep, now).await.unwrap());
        assert!(store.friend(&bob).await.unwrap().unwrap().is_online);

        assert!(store
            .set_online_by_endpoint(&ep, false, now)
            .await
            .unwrap());
        assert!(!store.friend(&bob).await.unwrap().unwrap().is_online);

        store.note_friend_endpoint(&bob, &ep, now).await.unwrap();
        assert_eq!(store.set_all_offline().await.unwrap(), 1);
        assert!(!store.friend(&bob).await.unwrap().unwrap().is_online);
    }

    #[tokio::test]
    async fn test_reopen_resets_presence_and_sweeps() {
        let path = std::env::temp_dir().join(format!(
            "dtm-store-test-{}-{}.db",
            std::process::id(),
            Timestamp::now().as_millis()
        ));
        let config = StoreConfig::at_path(&path);

        {
            let store = MessageStore::open(&config).unwrap();
            let now = Timestamp::now();
            let mut stale = record("stale", "a", "b", now.as_millis());
            stale.ttl = now.as_millis() - 1;
            store.insert_message(stale).await.unwrap();

            let carol = UserId::from("carol");
            store
                .upsert_friend(FriendRecord::new(carol.clone(), "Carol", now))
                .await
                .unwrap();
            store
                .note_friend_endpoint(&carol, &EndpointId::from("ep-1"), now)
                .await
                .unwrap();
            assert!(store.friend(&carol).await.unwrap().unwrap().is_online);
        }

        let store = MessageStore::open(&config).unwrap();
        assert!(store.all_messages().await.unwrap().is_empty());
        let carol = store.friend(&UserId::from("carol")).await.unwrap().unwrap();
        assert!(!carol.is_online);

        drop(store);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_observe_messages_emits_on_write() {
        let store = MessageStore::open_in_memory().unwrap();
        let mut view = store.observe_messages();

        // Initial snapshot.
        let snapshot = view.recv().await.unwrap();
        assert!(snapshot.is_empty());

        store.insert_message(record("m1", "a", "b", 1000)).await.unwrap();
        let snapshot = view.recv().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].message_id, MessageId::from("m1"));
    }

    #[tokio::test]
    async fn test_revision_bumps_on_writes_only() {
        let store = MessageStore::open_in_memory().unwrap();
        let revision = store.revision();
        let before = *revision.borrow();

        store.all_messages().await.unwrap();
        assert_eq!(*revision.borrow(), before);

        store.insert_message(record("m1", "a", "b", 1000)).await.unwrap();
        assert!(*revision.borrow() > before);
    }
}
