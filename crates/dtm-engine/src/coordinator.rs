//! Engine coordinator
//!
//! Owns every component and wires them together: the transport event pump,
//! the forwarder worker, the retry scheduler, and the periodic maintenance
//! timers. The embedding application talks to the engine exclusively through
//! this type — commands in via methods, outcomes out via the event stream
//! and the store's live views.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use smallvec::SmallVec;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dtm_core::{
    CryptoBox, EndpointId, EngineConfig, EngineError, EngineEvent, EngineEventReceiver,
    EngineEventSender, MessageId, MessageStatus, PeerTransport, Result, SharedTimeSource,
    TransportEvent, TransportEventReceiver, UserId, ValidationError,
};
use dtm_store::{FriendRecord, MessageCounts, MessageRecord, MessageStore};
use tokio::sync::mpsc;

use crate::forwarder::{Forwarder, ForwarderJob, ForwarderJobSender};
use crate::retry::{RetryScheduler, RetryStats};

// ----------------------------------------------------------------------------
// Engine Coordinator
// ----------------------------------------------------------------------------

/// Top-level owner of the messaging engine. Construct with
/// [`crate::builder::EngineBuilder`], then call [`EngineCoordinator::start`].
pub struct EngineCoordinator {
    self_id: UserId,
    config: EngineConfig,
    store: MessageStore,
    transport: Arc<dyn PeerTransport>,
    jobs: ForwarderJobSender,
    retries: Arc<RetryScheduler>,
    events_tx: EngineEventSender,
    time: SharedTimeSource,
    // Taken at start()/take_events(); behind mutexes so the coordinator
    // itself can be shared in an Arc.
    events_rx: Mutex<Option<EngineEventReceiver>>,
    transport_events: Mutex<Option<TransportEventReceiver>>,
    forwarder: Mutex<Option<Forwarder>>,
    forwarder_handle: Mutex<Option<JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl EngineCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        self_id: UserId,
        config: EngineConfig,
        store: MessageStore,
        transport: Arc<dyn PeerTransport>,
        jobs: ForwarderJobSender,
        retries: Arc<RetryScheduler>,
        events_tx: EngineEventSender,
        events_rx: EngineEventReceiver,
        transport_events: TransportEventReceiver,
        forwarder: Forwarder,
        time: SharedTimeSource,
    ) -> Self {
        Self {
            self_id,
            config,
            store,
            transport,
            jobs,
            retries,
            events_tx,
            time,
            events_rx: Mutex::new(Some(events_rx)),
            transport_events: Mutex::new(Some(transport_events)),
            forwarder: Mutex::new(Some(forwarder)),
            forwarder_handle: Mutex::new(None),
            background: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// This device's stable user ID.
    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    /// Direct access to the persistence layer (queries and live views).
    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Take the engine event stream. Yields `None` after a second call.
    pub fn take_events(&self) -> Option<EngineEventReceiver> {
        self.events_rx.lock().unwrap().take()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start networking, the forwarder worker, and periodic maintenance.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(user = %self.self_id, "engine starting");

        self.transport.start_advertising().await?;
        self.transport.start_discovery().await?;

        if let Some(forwarder) = self.forwarder.lock().unwrap().take() {
            *self.forwarder_handle.lock().unwrap() = Some(tokio::spawn(forwarder.run()));
        }

        if let Some(transport_events) = self.transport_events.lock().unwrap().take() {
            let pump = self.spawn_event_pump(transport_events);
            self.background.lock().unwrap().push(pump);
        }

        let timers = self.spawn_maintenance();
        self.background.lock().unwrap().extend(timers);

        Ok(())
    }

    /// Stop timers, drain the forwarder within the configured budget, and
    /// tear the transport down.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("engine shutting down");

        for handle in self.background.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.retries.shutdown();

        let _ = self.jobs.send(ForwarderJob::Shutdown);
        let handle = self.forwarder_handle.lock().unwrap().take();
        if let Some(mut handle) = handle {
            let drain = self.config.maintenance.shutdown_drain;
            if tokio::time::timeout(drain, &mut handle).await.is_err() {
                warn!("forwarder did not drain in time, aborting");
                handle.abort();
            }
        }

        self.transport.stop_all().await?;
        Ok(())
    }

    fn spawn_event_pump(&self, mut events: TransportEventReceiver) -> JoinHandle<()> {
        let store = self.store.clone();
        let jobs = self.jobs.clone();
        let upstream = self.events_tx.clone();
        let time = Arc::clone(&self.time);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::EndpointDiscovered { endpoint, name } => {
                        debug!(%endpoint, %name, "endpoint discovered");
                    }
                    TransportEvent::EndpointConnected { endpoint, name } => {
                        info!(%endpoint, %name, "peer connected");
                        let _ = store
                            .set_online_by_endpoint(&endpoint, true, time.now())
                            .await;
                        let _ = upstream.send(EngineEvent::PeerConnected {
                            endpoint: endpoint.clone(),
                            name,
                        });
                        let _ = jobs.send(ForwarderJob::PeerConnected { endpoint });
                    }
                    TransportEvent::EndpointDisconnected { endpoint } => {
                        info!(%endpoint, "peer disconnected");
                        let _ = store
                            .set_online_by_endpoint(&endpoint, false, time.now())
                            .await;
                        let _ = upstream.send(EngineEvent::PeerDisconnected { endpoint });
                    }
                    TransportEvent::BytesReceived { from, bytes } => {
                        let _ = jobs.send(ForwarderJob::Ingest { from, bytes });
                    }
                }
            }
            debug!("transport event stream ended");
        })
    }

    fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Cleanup sweep: expired rows, seen set, stale retries.
        let jobs = self.jobs.clone();
        let period = self.config.maintenance.cleanup_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                if jobs.send(ForwarderJob::Cleanup).is_err() {
                    break;
                }
            }
        }));

        // Statistics report.
        let jobs = self.jobs.clone();
        let period = self.config.maintenance.stats_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if jobs.send(ForwarderJob::EmitStats).is_err() {
                    break;
                }
            }
        }));

        // Rediscovery while peerless.
        let transport = Arc::clone(&self.transport);
        let period = self.config.maintenance.rediscovery_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !transport.is_connected() {
                    debug!("no peers connected, reissuing discovery");
                    if let Err(error) = transport.start_discovery().await {
                        warn!(%error, "rediscovery failed");
                    }
                }
            }
        }));

        handles
    }

    // ------------------------------------------------------------------
    // Messaging API
    // ------------------------------------------------------------------

    /// Author and send a text message. Returns its ID; delivery progress
    /// arrives via the event stream and the store's live views.
    pub async fn send_text(&self, recipient: &UserId, body: &str) -> Result<MessageId> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }
        let len = body.chars().count();
        let max = self.config.forwarding.max_message_length;
        if len > max {
            return Err(ValidationError::ContentTooLong { len, max }.into());
        }

        let now = self.time.now();
        let message_id = MessageId::new(CryptoBox::random_id());
        let record = MessageRecord {
            message_id: message_id.clone(),
            content: body.to_string(),
            sender_id: self.self_id.clone(),
            recipient_id: recipient.clone(),
            timestamp: now.as_millis(),
            status: MessageStatus::Pending,
            hop_count: 0,
            ttl: now.as_millis() + self.config.forwarding.default_ttl.as_millis() as u64,
            integrity_hash: CryptoBox::content_hash(body, &self.self_id, recipient, now.as_millis()),
            is_outgoing: true,
        };

        self.store.insert_message(record.clone()).await?;
        let _ = self.store.increment_friend_messages(recipient).await;

        self.jobs
            .send(ForwarderJob::SendNew { record })
            .map_err(|_| EngineError::channel("forwarder is not running"))?;

        debug!(id = %message_id, recipient = %recipient, "message queued");
        Ok(message_id)
    }

    /// Remove every expired message from the store.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        Ok(self.store.delete_expired(self.time.now()).await?)
    }

    // ------------------------------------------------------------------
    // Query Views
    // ------------------------------------------------------------------

    /// Live view of all messages, oldest first.
    pub fn observe_messages(&self) -> mpsc::Receiver<Vec<MessageRecord>> {
        self.store.observe_messages()
    }

    /// Live view of the conversation between two users.
    pub fn observe_conversation(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> mpsc::Receiver<Vec<MessageRecord>> {
        self.store.observe_conversation(user_a, user_b)
    }

    /// Live view of total/pending message counts.
    pub fn observe_counts(&self) -> mpsc::Receiver<MessageCounts> {
        self.store.observe_counts()
    }

    /// Live view of the friends directory.
    pub fn observe_friends(&self) -> mpsc::Receiver<Vec<FriendRecord>> {
        self.store.observe_friends()
    }

    // ------------------------------------------------------------------
    // Friends API
    // ------------------------------------------------------------------

    pub async fn add_friend(&self, user_id: UserId, nickname: &str) -> Result<()> {
        let record = FriendRecord::new(user_id, nickname, self.time.now());
        Ok(self.store.upsert_friend(record).await?)
    }

    pub async fn remove_friend(&self, user_id: &UserId) -> Result<bool> {
        Ok(self.store.remove_friend(user_id).await?)
    }

    pub async fn rename_friend(&self, user_id: &UserId, nickname: &str) -> Result<bool> {
        Ok(self.store.rename_friend(user_id, nickname).await?)
    }

    pub async fn set_favorite(&self, user_id: &UserId, favorite: bool) -> Result<bool> {
        Ok(self.store.set_favorite(user_id, favorite).await?)
    }

    pub async fn increment_friend_messages(&self, user_id: &UserId) -> Result<bool> {
        Ok(self.store.increment_friend_messages(user_id).await?)
    }

    pub async fn friends(&self) -> Result<Vec<FriendRecord>> {
        Ok(self.store.friends().await?)
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Currently connected peer endpoints.
    pub fn connected_peers(&self) -> SmallVec<[EndpointId; 8]> {
        self.transport.connected_endpoints()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Scheduler diagnostics.
    pub fn retry_stats(&self) -> RetryStats {
        self.retries.stats()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
