//! Engine events surfaced to the embedding application
//!
//! Network-layer outcomes never reach the UI as errors; they arrive as
//! values on this stream alongside message status transitions in the store's
//! live views.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::types::{EndpointId, MessageId, UserId};

// ----------------------------------------------------------------------------
// Engine Events
// ----------------------------------------------------------------------------

/// Events emitted by the engine toward the embedding application.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A peer endpoint connected.
    PeerConnected { endpoint: EndpointId, name: String },
    /// A peer endpoint disconnected.
    PeerDisconnected { endpoint: EndpointId },
    /// An inbound message addressed to this device was stored.
    MessageReceived {
        message_id: MessageId,
        sender: UserId,
    },
    /// A message reached its recipient (locally, or confirmed by ACK).
    Delivered { message_id: MessageId },
    /// A message was rebroadcast toward other peers.
    Forwarded {
        message_id: MessageId,
        peer_count: usize,
    },
    /// An already-processed message was dropped.
    DuplicateFiltered { message_id: MessageId },
    /// A message permanently failed.
    Failed {
        message_id: MessageId,
        reason: String,
    },
    /// A retry was queued for an undelivered outgoing message.
    RetryScheduled {
        message_id: MessageId,
        attempt: u32,
        delay: Duration,
    },
    /// A retry attempt reached connected peers.
    RetrySucceeded { message_id: MessageId, attempt: u32 },
    /// A retry attempt found no path; another retry may follow.
    RetryFailed { message_id: MessageId, attempt: u32 },
    /// The retry budget was exhausted; the message is failed.
    MaxRetriesExceeded { message_id: MessageId },
    /// Periodic statistics snapshot.
    StatsReport(EngineStats),
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub connected_peers: usize,
    pub seen_messages: usize,
    pub pending_retries: usize,
    pub stored_messages: u64,
    pub pending_messages: u64,
}

/// Sender half of the engine event stream.
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

/// Receiver half of the engine event stream.
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Create the engine event channel.
pub fn engine_event_channel() -> (EngineEventSender, EngineEventReceiver) {
    mpsc::unbounded_channel()
}
