//! Exponential-backoff retry scheduling
//!
//! Tracks one entry per undelivered outgoing message: the attempt counter,
//! the expected fire time, a cancellation flag, and the timer task handle.
//! Timers fire into the forwarder's job queue so the actual resend runs on
//! the single forwarder worker; the scheduler only manages state and time.
//!
//! Cancellation is race-safe: a timer that is already firing observes its
//! flag and becomes a no-op, and an entry is only removed by the timer that
//! owns it, so a reschedule racing a late fire never loses its fresh entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dtm_core::{
    EngineEvent, EngineEventSender, MessageId, MessageStatus, RetryConfig, SharedTimeSource,
    Timestamp,
};
use dtm_store::MessageStore;

use crate::forwarder::{ForwarderJob, ForwarderJobSender};

// ----------------------------------------------------------------------------
// Retry Entry
// ----------------------------------------------------------------------------

struct RetryEntry {
    /// Attempt number that will execute when the timer fires (1-based after
    /// the first schedule).
    attempt: u32,
    /// Expected fire time, used by the stale sweep.
    next_time: Timestamp,
    cancelled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Snapshot of scheduler state for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub pending: usize,
    pub oldest_next_time: Option<Timestamp>,
}

// ----------------------------------------------------------------------------
// Retry Scheduler
// ----------------------------------------------------------------------------

/// Schedules and cancels retry timers for undelivered outgoing messages.
pub struct RetryScheduler {
    config: RetryConfig,
    store: MessageStore,
    jobs: ForwarderJobSender,
    events: EngineEventSender,
    entries: Mutex<HashMap<MessageId, RetryEntry>>,
    time: SharedTimeSource,
}

impl RetryScheduler {
    pub fn new(
        config: RetryConfig,
        store: MessageStore,
        jobs: ForwarderJobSender,
        events: EngineEventSender,
        time: SharedTimeSource,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            jobs,
            events,
            entries: Mutex::new(HashMap::new()),
            time,
        })
    }

    /// Schedule the next retry for a message. `attempt` is the number of
    /// attempts already made; once it reaches the budget the message is
    /// failed instead.
    pub async fn schedule(self: &Arc<Self>, message_id: MessageId, attempt: u32) {
        if attempt >= self.config.max_attempts {
            debug!(id = %message_id, attempt, "retry budget exhausted");
            self.cancel(&message_id);
            if let Err(error) = self
                .store
                .update_status(&message_id, MessageStatus::Failed)
                .await
            {
                warn!(id = %message_id, %error, "failed to mark message failed");
            }
            let _ = self
                .events
                .send(EngineEvent::MaxRetriesExceeded { message_id });
            return;
        }

        let delay = self.config.delay(attempt);
        self.arm(message_id.clone(), delay, attempt + 1);
        debug!(
            id = %message_id,
            attempt = attempt + 1,
            max = self.config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );
        let _ = self.events.send(EngineEvent::RetryScheduled {
            message_id,
            attempt: attempt + 1,
            delay,
        });
    }

    /// Near-immediate retry after a peer connects; the short delay lets the
    /// connection stabilize. Resumes the attempt counter at zero.
    pub fn schedule_immediate(self: &Arc<Self>, message_id: MessageId) {
        debug!(id = %message_id, "immediate retry scheduled");
        self.arm(message_id, self.config.reconnect_delay, 0);
    }

    /// Install a timer entry, replacing any existing one for the message.
    fn arm(self: &Arc<Self>, message_id: MessageId, delay: Duration, fire_attempt: u32) {
        self.cancel(&message_id);

        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = {
            let scheduler = Arc::clone(self);
            let flag = Arc::clone(&cancelled);
            let id = message_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if flag.load(Ordering::SeqCst) {
                    return;
                }
                scheduler.remove_own_entry(&id, &flag);
                let _ = scheduler.jobs.send(ForwarderJob::Resend {
                    message_id: id,
                    attempt: fire_attempt,
                });
            })
        };

        let entry = RetryEntry {
            attempt: fire_attempt,
            next_time: self.time.now().saturating_add(delay.as_millis() as u64),
            cancelled,
            handle,
        };
        self.entries.lock().unwrap().insert(message_id, entry);
    }

    /// Remove the entry belonging to a firing timer, leaving any newer
    /// entry for the same message untouched.
    fn remove_own_entry(&self, message_id: &MessageId, flag: &Arc<AtomicBool>) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(message_id) {
            if Arc::ptr_eq(&entry.cancelled, flag) {
                entries.remove(message_id);
            }
        }
    }

    /// Cancel any pending retry for a message. Cancelling an absent or
    /// already-firing entry is a no-op. Returns whether an entry existed.
    pub fn cancel(&self, message_id: &MessageId) -> bool {
        if let Some(entry) = self.entries.lock().unwrap().remove(message_id) {
            entry.cancelled.store(true, Ordering::SeqCst);
            entry.handle.abort();
            debug!(id = %message_id, "retry cancelled");
            true
        } else {
            false
        }
    }

    /// Delivery confirmation: cancel the retry and record the terminal
    /// status. Idempotent.
    pub async fn mark_delivered(&self, message_id: &MessageId) {
        self.cancel(message_id);
        if let Err(error) = self
            .store
            .update_status(message_id, MessageStatus::Delivered)
            .await
        {
            warn!(id = %message_id, %error, "failed to mark message delivered");
        }
    }

    /// Schedule an immediate retry for every pending outgoing message.
    /// Called when connectivity returns.
    pub async fn retry_pending_on_connection_restored(self: &Arc<Self>) {
        let pending = match self.store.pending_outgoing().await {
            Ok(pending) => pending,
            Err(error) => {
                warn!(%error, "failed to load pending messages");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "connection restored, retrying pending messages");
        for record in pending {
            self.schedule_immediate(record.message_id);
        }
    }

    /// Force-fail entries whose fire time is long past; a timer that old has
    /// been lost to a dead runtime or clock jump.
    pub async fn cleanup(&self) {
        let now = self.time.now();
        let stale_ms = self.config.stale_after().as_millis() as u64;
        let stale: Vec<(MessageId, u32)> = {
            let entries = self.entries.lock().unwrap();
            entries
                .iter()
                .filter(|(_, entry)| now.millis_since(entry.next_time) > stale_ms)
                .map(|(id, entry)| (id.clone(), entry.attempt))
                .collect()
        };
        for (message_id, attempt) in stale {
            warn!(id = %message_id, attempt, "dropping stale retry");
            self.cancel(&message_id);
            if let Err(error) = self
                .store
                .update_status(&message_id, MessageStatus::Failed)
                .await
            {
                warn!(id = %message_id, %error, "failed to fail stale message");
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn stats(&self) -> RetryStats {
        let entries = self.entries.lock().unwrap();
        RetryStats {
            pending: entries.len(),
            oldest_next_time: entries.values().map(|e| e.next_time).min(),
        }
    }

    /// Cancel everything; called on engine shutdown.
    pub fn shutdown(&self) {
        let mut entries = self.entries.lock().unwrap();
        for (_, entry) in entries.drain() {
            entry.cancelled.store(true, Ordering::SeqCst);
            entry.handle.abort();
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
