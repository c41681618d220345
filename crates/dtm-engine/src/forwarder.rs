//! Store-and-forward pipeline
//!
//! The forwarder is a single worker task that serializes all ingress and
//! egress work, so the seen set and per-message bookkeeping need no
//! fine-grained locking. Transport callbacks, the retry scheduler, and the
//! coordinator all feed it through one job queue.
//!
//! Ingress order matters: TTL and duplicate checks run before the expensive
//! integrity verification, but the message ID only enters the seen set
//! *after* verification passes, so a tampered replay cannot block a later
//! legitimate copy of the same message.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use dtm_core::{
    crypto::EncryptedPayload,
    wire::{self, MessageType},
    CryptoBox, CryptoError, EndpointId, EngineError, EngineEvent, EngineEventSender, EngineStats,
    ForwardingConfig, MessageId, MessageStatus, NetworkMessage, PeerTransport, Result, SeenSet,
    SharedTimeSource, UserId, WireCodec,
};
use dtm_store::{MessageRecord, MessageStore};

use crate::retry::RetryScheduler;

// ----------------------------------------------------------------------------
// Forwarder Jobs
// ----------------------------------------------------------------------------

/// Work items serialized through the forwarder task.
#[derive(Debug)]
pub enum ForwarderJob {
    /// Raw bytes arrived from a peer endpoint.
    Ingest { from: EndpointId, bytes: Vec<u8> },
    /// A freshly authored message awaits its first send.
    SendNew { record: MessageRecord },
    /// A retry timer fired for an undelivered outgoing message.
    Resend { message_id: MessageId, attempt: u32 },
    /// A peer connected; flush pending and forwardable messages.
    PeerConnected { endpoint: EndpointId },
    /// Periodic maintenance sweep.
    Cleanup,
    /// Periodic statistics snapshot.
    EmitStats,
    /// Drain and stop.
    Shutdown,
}

pub type ForwarderJobSender = mpsc::UnboundedSender<ForwarderJob>;
pub type ForwarderJobReceiver = mpsc::UnboundedReceiver<ForwarderJob>;

// ----------------------------------------------------------------------------
// Forwarder
// ----------------------------------------------------------------------------

/// Single-worker ingress/egress pipeline owning the seen set.
pub struct Forwarder {
    self_id: UserId,
    config: ForwardingConfig,
    store: MessageStore,
    crypto: Arc<CryptoBox>,
    transport: Arc<dyn PeerTransport>,
    retries: Arc<RetryScheduler>,
    seen: SeenSet,
    events: EngineEventSender,
    jobs: ForwarderJobReceiver,
    time: SharedTimeSource,
}

impl Forwarder {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        self_id: UserId,
        config: ForwardingConfig,
        store: MessageStore,
        crypto: Arc<CryptoBox>,
        transport: Arc<dyn PeerTransport>,
        retries: Arc<RetryScheduler>,
        events: EngineEventSender,
        jobs: ForwarderJobReceiver,
        time: SharedTimeSource,
    ) -> Self {
        let seen = SeenSet::new(config.seen_set_limit);
        Self {
            self_id,
            config,
            store,
            crypto,
            transport,
            retries,
            seen,
            events,
            jobs,
            time,
        }
    }

    /// Process jobs until the queue closes or a shutdown job arrives.
    pub async fn run(mut self) {
        info!(user = %self.self_id, "forwarder started");
        while let Some(job) = self.jobs.recv().await {
            match job {
                ForwarderJob::Ingest { from, bytes } => self.handle_ingest(from, bytes).await,
                ForwarderJob::SendNew { record } => self.handle_send_new(record).await,
                ForwarderJob::Resend { message_id, attempt } => {
                    self.handle_resend(message_id, attempt).await
                }
                ForwarderJob::PeerConnected { endpoint } => {
                    self.handle_peer_connected(endpoint).await
                }
                ForwarderJob::Cleanup => self.handle_cleanup().await,
                ForwarderJob::EmitStats => self.emit_stats().await,
                ForwarderJob::Shutdown => break,
            }
        }
        info!("forwarder stopped");
    }

    // ------------------------------------------------------------------
    // Ingress
    // ------------------------------------------------------------------

    async fn handle_ingest(&mut self, from: EndpointId, bytes: Vec<u8>) {
        let message = match WireCodec::decode(&bytes) {
            Ok(message) => message,
            Err(error) => {
                debug!(%from, %error, "dropping undecodable payload");
                return;
            }
        };

        if message.is_expired(self.time.now()) {
            debug!(id = %message.message_id, "dropping expired message");
            return;
        }

        if self.seen.contains(&message.message_id) {
            debug!(id = %message.message_id, "duplicate message filtered");
            self.emit(EngineEvent::DuplicateFiltered {
                message_id: message.message_id.clone(),
            });
            return;
        }

        let plaintext = match self.verify_and_recover(&message) {
            Ok(plaintext) => plaintext,
            Err(error) => {
                warn!(id = %message.message_id, %error, "dropping unverifiable message");
                return;
            }
        };

        self.seen.insert(message.message_id.clone());

        match message.message_type {
            MessageType::Text => self.handle_text(from, message, plaintext).await,
            MessageType::Ack => self.handle_ack(message).await,
        }
    }

    /// Verify signature format and content hash, recovering the plaintext
    /// body (decrypting if needed).
    fn verify_and_recover(&self, message: &NetworkMessage) -> Result<String> {
        if !CryptoBox::verify_signature(&message.signature) {
            return Err(CryptoError::Tampered.into());
        }

        let plaintext = if message.encrypted {
            let payload = EncryptedPayload::from_json(&message.content)?;
            self.crypto.decrypt(&payload)?
        } else {
            message.content.clone()
        };

        let expected = CryptoBox::content_hash(
            &plaintext,
            &message.sender_id,
            &message.recipient_id,
            message.timestamp,
        );
        if expected != message.hash {
            return Err(CryptoError::Tampered.into());
        }

        Ok(plaintext)
    }

    async fn handle_text(&mut self, from: EndpointId, message: NetworkMessage, plaintext: String) {
        let for_us =
            message.recipient_id == self.self_id || message.recipient_id.is_broadcast();

        let record = MessageRecord {
            message_id: message.message_id.clone(),
            content: plaintext,
            sender_id: message.sender_id.clone(),
            recipient_id: message.recipient_id.clone(),
            timestamp: message.timestamp,
            status: MessageStatus::Pending,
            hop_count: message.hop_count,
            ttl: message.ttl,
            integrity_hash: message.hash.clone(),
            is_outgoing: false,
        };
        if let Err(error) = self.store.insert_message(record).await {
            warn!(id = %message.message_id, %error, "failed to persist inbound message");
            return;
        }

        if for_us {
            debug!(id = %message.message_id, sender = %message.sender_id, "message delivered locally");
            self.retries.mark_delivered(&message.message_id).await;
            let now = self.time.now();
            let _ = self
                .store
                .note_friend_endpoint(&message.sender_id, &from, now)
                .await;
            let _ = self
                .store
                .increment_friend_messages(&message.sender_id)
                .await;
            self.emit(EngineEvent::MessageReceived {
                message_id: message.message_id.clone(),
                sender: message.sender_id.clone(),
            });
            self.emit(EngineEvent::Delivered {
                message_id: message.message_id.clone(),
            });
            if !message.recipient_id.is_broadcast() {
                self.send_ack(&message).await;
            }
        } else {
            debug!(id = %message.message_id, "message stored for relay");
        }

        // Relay whether or not it was for us; broadcast messages fan out
        // through every node that still has hop budget.
        self.forward(&message).await;
    }

    async fn handle_ack(&mut self, message: NetworkMessage) {
        let Some(original) = message.ack_target() else {
            debug!(id = %message.message_id, "dropping malformed ack");
            return;
        };
        debug!(%original, "ack received");
        self.retries.mark_delivered(&original).await;
        self.emit(EngineEvent::Delivered {
            message_id: original,
        });
        // ACKs are single-hop: only TEXT messages reach the forward step.
    }

    // ------------------------------------------------------------------
    // Forwarding
    // ------------------------------------------------------------------

    async fn forward(&mut self, message: &NetworkMessage) {
        if !message.should_forward(self.time.now(), self.config.max_hops) {
            debug!(
                id = %message.message_id,
                hops = message.hop_count,
                "not forwarding (hop limit or expired)"
            );
            return;
        }
        if !self.transport.is_connected() {
            debug!(id = %message.message_id, "no connected peers to forward to");
            return;
        }

        let relayed = message.forwarded_by(&self.self_id);
        let bytes = match WireCodec::encode(&relayed) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(id = %message.message_id, %error, "failed to encode for forwarding");
                return;
            }
        };

        match self.transport.broadcast(bytes).await {
            Ok(0) => {}
            Ok(peer_count) => {
                debug!(id = %message.message_id, peer_count, hops = relayed.hop_count, "forwarded");
                self.emit(EngineEvent::Forwarded {
                    message_id: message.message_id.clone(),
                    peer_count,
                });
            }
            Err(error) => warn!(id = %message.message_id, %error, "forward broadcast failed"),
        }
    }

    async fn send_ack(&mut self, original: &NetworkMessage) {
        let now = self.time.now();
        let content = wire::ack_content(&original.message_id);
        let ack_id = MessageId::new(CryptoBox::random_id());
        let ack = NetworkMessage {
            message_type: MessageType::Ack,
            message_id: ack_id.clone(),
            sender_id: self.self_id.clone(),
            recipient_id: original.sender_id.clone(),
            content: content.clone(),
            timestamp: now.as_millis(),
            hop_count: 0,
            ttl: now.as_millis() + self.config.ack_ttl.as_millis() as u64,
            hash: CryptoBox::content_hash(
                &content,
                &self.self_id,
                &original.sender_id,
                now.as_millis(),
            ),
            encrypted: false,
            signature: self.crypto.sign(&content, &self.self_id, now.as_millis()),
            forwarder_path: self.self_id.to_string(),
        };

        // Keep our own ack out of the ingress path if it echoes back.
        self.seen.insert(ack_id);

        match WireCodec::encode(&ack) {
            Ok(bytes) => match self.transport.broadcast(bytes).await {
                Ok(_) => debug!(original = %original.message_id, "ack sent"),
                Err(error) => warn!(original = %original.message_id, %error, "ack broadcast failed"),
            },
            Err(error) => warn!(original = %original.message_id, %error, "ack encode failed"),
        }
    }

    // ------------------------------------------------------------------
    // Egress
    // ------------------------------------------------------------------

    async fn handle_send_new(&mut self, record: MessageRecord) {
        let message_id = record.message_id.clone();
        let bytes = match self.build_wire(&record).and_then(|m| {
            WireCodec::encode(&m).map_err(EngineError::from)
        }) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(id = %message_id, %error, "egress encode failed");
                self.fail_message(&message_id, &format!("encode failed: {error}"))
                    .await;
                return;
            }
        };

        // Prevents treating our own message as new if a peer echoes it back.
        self.seen.insert(message_id.clone());

        if self.transport.is_connected() {
            match self.transport.broadcast(bytes).await {
                Ok(peer_count) if peer_count > 0 => {
                    let _ = self
                        .store
                        .update_status(&message_id, MessageStatus::Sent)
                        .await;
                    debug!(id = %message_id, peer_count, "message broadcast");
                }
                Ok(_) | Err(_) => {
                    debug!(id = %message_id, "broadcast reached nobody, scheduling retry");
                    self.retries.schedule(message_id, 0).await;
                }
            }
        } else {
            debug!(id = %message_id, "no connected peers, scheduling retry");
            self.retries.schedule(message_id, 0).await;
        }
    }

    async fn handle_resend(&mut self, message_id: MessageId, attempt: u32) {
        debug!(id = %message_id, attempt, "executing retry");

        if !self.transport.is_connected() {
            debug!(id = %message_id, "no peers available for retry, rescheduling");
            self.retries.schedule(message_id, attempt).await;
            return;
        }

        let record = match self.store.message(&message_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(id = %message_id, "message not found for retry");
                return;
            }
            Err(error) => {
                warn!(id = %message_id, %error, "failed to load message for retry");
                return;
            }
        };

        // Delivery may have raced the timer; both terminal states stop here.
        if record.status.is_terminal() {
            debug!(id = %message_id, status = %record.status, "retry obsolete");
            return;
        }

        if record.is_expired(self.time.now()) {
            debug!(id = %message_id, "message expired before delivery");
            self.fail_message(&message_id, "expired before delivery").await;
            return;
        }

        if self.try_broadcast_record(&record).await {
            let _ = self
                .store
                .update_status(&message_id, MessageStatus::Sent)
                .await;
            self.emit(EngineEvent::RetrySucceeded {
                message_id,
                attempt,
            });
        } else {
            self.emit(EngineEvent::RetryFailed {
                message_id: message_id.clone(),
                attempt,
            });
            self.retries.schedule(message_id, attempt).await;
        }
    }

    async fn try_broadcast_record(&mut self, record: &MessageRecord) -> bool {
        let bytes = match self
            .build_wire(record)
            .and_then(|m| WireCodec::encode(&m).map_err(EngineError::from))
        {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(id = %record.message_id, %error, "resend encode failed");
                return false;
            }
        };
        self.seen.insert(record.message_id.clone());
        matches!(self.transport.broadcast(bytes).await, Ok(n) if n > 0)
    }

    /// Build the wire form of a stored record: encrypt when the crypto box
    /// is ready, fall back to plaintext otherwise. The integrity hash is
    /// always the stored plaintext hash.
    fn build_wire(&self, record: &MessageRecord) -> Result<NetworkMessage> {
        let (content, encrypted) = if self.crypto.is_ready() {
            (self.crypto.encrypt(&record.content)?.to_json(), true)
        } else {
            (record.content.clone(), false)
        };

        Ok(NetworkMessage {
            message_type: MessageType::Text,
            message_id: record.message_id.clone(),
            sender_id: record.sender_id.clone(),
            recipient_id: record.recipient_id.clone(),
            content,
            timestamp: record.timestamp,
            hop_count: record.hop_count,
            ttl: record.ttl,
            hash: record.integrity_hash.clone(),
            encrypted,
            signature: self
                .crypto
                .sign(&record.content, &record.sender_id, record.timestamp),
            forwarder_path: record.sender_id.to_string(),
        })
    }

    async fn fail_message(&mut self, message_id: &MessageId, reason: &str) {
        let _ = self
            .store
            .update_status(message_id, MessageStatus::Failed)
            .await;
        self.retries.cancel(message_id);
        self.emit(EngineEvent::Failed {
            message_id: message_id.clone(),
            reason: reason.to_string(),
        });
    }

    // ------------------------------------------------------------------
    // Connectivity and Maintenance
    // ------------------------------------------------------------------

    async fn handle_peer_connected(&mut self, endpoint: EndpointId) {
        debug!(%endpoint, "peer connected, flushing pending work");

        // Outgoing messages waiting for a path get an immediate retry.
        self.retries.retry_pending_on_connection_restored().await;

        // Stored messages from others that still have budget are relayed
        // toward the new neighborhood.
        match self.store.forwardable(self.time.now()).await {
            Ok(records) => {
                for record in records {
                    match self.build_wire(&record) {
                        Ok(message) => self.forward(&message).await,
                        Err(error) => {
                            warn!(id = %record.message_id, %error, "could not rebuild stored message")
                        }
                    }
                }
            }
            Err(error) => warn!(%error, "failed to load forwardable messages"),
        }
    }

    async fn handle_cleanup(&mut self) {
        if let Err(error) = self.store.delete_expired(self.time.now()).await {
            warn!(%error, "expired-message sweep failed");
        }
        self.seen.maintain();
        self.retries.cleanup().await;
        debug!("cleanup pass completed");
    }

    async fn emit_stats(&mut self) {
        let counts = self.store.counts().await.unwrap_or_default();
        let stats = EngineStats {
            connected_peers: self.transport.connected_endpoints().len(),
            seen_messages: self.seen.len(),
            pending_retries: self.retries.pending_count(),
            stored_messages: counts.total,
            pending_messages: counts.pending,
        };
        info!(
            peers = stats.connected_peers,
            seen = stats.seen_messages,
            retries = stats.pending_retries,
            stored = stats.stored_messages,
            "engine statistics"
        );
        self.emit(EngineEvent::StatsReport(stats));
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use dtm_core::transport::memory::MemoryHub;
    use dtm_core::{engine_event_channel, EngineConfig, SystemTimeSource, Timestamp};

    struct Fixture {
        forwarder: Forwarder,
        _jobs: ForwarderJobSender,
    }

    fn fixture(self_id: &str) -> Fixture {
        let config = EngineConfig::testing();
        let store = MessageStore::open_in_memory().unwrap();
        let crypto = Arc::new(CryptoBox::with_demo_key());
        let hub = MemoryHub::new();
        let (transport, _events) = hub.register(EndpointId::from("ep-test"), "test");
        let transport: Arc<dyn PeerTransport> = Arc::new(transport);
        let (events_tx, _events_rx) = engine_event_channel();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let time: SharedTimeSource = Arc::new(SystemTimeSource);
        let retries = RetryScheduler::new(
            config.retry.clone(),
            store.clone(),
            jobs_tx.clone(),
            events_tx.clone(),
            Arc::clone(&time),
        );
        let forwarder = Forwarder::new(
            UserId::from(self_id),
            config.forwarding.clone(),
            store,
            crypto,
            transport,
            retries,
            events_tx,
            jobs_rx,
            time,
        );
        Fixture {
            forwarder,
            _jobs: jobs_tx,
        }
    }

    fn outgoing_record(id: &str, sender: &str, recipient: &str) -> MessageRecord {
        let now = Timestamp::now().as_millis();
        let content = format!("body of {id}");
        MessageRecord {
            message_id: MessageId::from(id),
            integrity_hash: CryptoBox::content_hash(
                &content,
                &UserId::from(sender),
                &UserId::from(recipient),
                now,
            ),
            content,
            sender_id: UserId::from(sender),
            recipient_id: UserId::from(recipient),
            timestamp: now,
            status: MessageStatus::Pending,
            hop_count: 0,
            ttl: now + 60_000,
            is_outgoing: true,
        }
    }

    #[tokio::test]
    async fn test_build_wire_encrypts_and_verifies() {
        let fx = fixture("user-a");
        let record = outgoing_record("m1", "user-a", "user-b");

        let message = fx.forwarder.build_wire(&record).unwrap();
        assert!(message.encrypted);
        assert_ne!(message.content, record.content);
        assert_eq!(message.hash, record.integrity_hash);

        // The ingress side recovers the original plaintext.
        let plaintext = fx.forwarder.verify_and_recover(&message).unwrap();
        assert_eq!(plaintext, record.content);
    }

    #[tokio::test]
    async fn test_verify_rejects_wrong_hash() {
        let fx = fixture("user-a");
        let record = outgoing_record("m1", "user-a", "user-b");
        let mut message = fx.forwarder.build_wire(&record).unwrap();
        message.hash = "00".repeat(32);

        assert!(fx.forwarder.verify_and_recover(&message).is_err());
    }

    #[tokio::test]
    async fn test_verify_rejects_bad_signature() {
        let fx = fixture("user-a");
        let record = outgoing_record("m1", "user-a", "user-b");
        let mut message = fx.forwarder.build_wire(&record).unwrap();
        message.signature = "short".to_string();

        assert!(fx.forwarder.verify_and_recover(&message).is_err());
    }

    #[tokio::test]
    async fn test_verify_accepts_plaintext_frames() {
        let fx = fixture("user-a");
        let record = outgoing_record("m1", "user-a", "user-b");
        let mut message = fx.forwarder.build_wire(&record).unwrap();

        // Downgrade to a plaintext frame, as sent by a keyless node.
        message.encrypted = false;
        message.content = record.content.clone();
        let plaintext = fx.forwarder.verify_and_recover(&message).unwrap();
        assert_eq!(plaintext, record.content);
    }
}
