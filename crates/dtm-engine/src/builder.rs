//! Engine assembly
//!
//! The builder is the one place the component graph is wired: store, crypto
//! box, retry scheduler, forwarder, and coordinator, all sharing the same
//! job queue and event stream. Nothing in the engine reaches for globals;
//! everything is owned and injected here.

use std::sync::Arc;

use tokio::sync::mpsc;

use dtm_core::{
    engine_event_channel, CryptoBox, EngineConfig, KeyProvider, PeerTransport, Result,
    SharedTimeSource, SystemTimeSource, TimeSource, TransportError, TransportEventReceiver,
    UserId,
};
use dtm_store::MessageStore;

use crate::coordinator::EngineCoordinator;
use crate::forwarder::Forwarder;
use crate::retry::RetryScheduler;

/// Builder for [`EngineCoordinator`].
pub struct EngineBuilder {
    self_id: UserId,
    config: EngineConfig,
    transport: Option<(Arc<dyn PeerTransport>, TransportEventReceiver)>,
    key_provider: Option<Box<dyn KeyProvider>>,
    time_source: Option<SharedTimeSource>,
}

impl EngineBuilder {
    /// Start building an engine for the given device-stable user ID.
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            config: EngineConfig::default(),
            transport: None,
            key_provider: None,
            time_source: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach the peer transport and the event stream it reports through.
    pub fn transport(
        mut self,
        transport: Arc<dyn PeerTransport>,
        events: TransportEventReceiver,
    ) -> Self {
        self.transport = Some((transport, events));
        self
    }

    /// Override the key provider. Defaults to the demo seed key.
    pub fn key_provider(mut self, provider: impl KeyProvider + 'static) -> Self {
        self.key_provider = Some(Box::new(provider));
        self
    }

    /// Override the clock every component reads. Defaults to the system
    /// clock; tests inject a virtual one.
    pub fn time_source(mut self, source: impl TimeSource + 'static) -> Self {
        self.time_source = Some(Arc::new(source));
        self
    }

    /// Open the store and wire all components together. The engine is inert
    /// until [`EngineCoordinator::start`] is called.
    pub fn build(self) -> Result<EngineCoordinator> {
        let (transport, transport_events) =
            self.transport.ok_or(TransportError::Unavailable {
                reason: "no transport configured".into(),
            })?;

        let crypto = Arc::new(match &self.key_provider {
            Some(provider) => CryptoBox::new(provider.as_ref()),
            None => CryptoBox::with_demo_key(),
        });

        let store = MessageStore::open(&self.config.store).map_err(dtm_core::EngineError::from)?;

        let time: SharedTimeSource = self
            .time_source
            .unwrap_or_else(|| Arc::new(SystemTimeSource));

        let (events_tx, events_rx) = engine_event_channel();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();

        let retries = RetryScheduler::new(
            self.config.retry.clone(),
            store.clone(),
            jobs_tx.clone(),
            events_tx.clone(),
            Arc::clone(&time),
        );

        let forwarder = Forwarder::new(
            self.self_id.clone(),
            self.config.forwarding.clone(),
            store.clone(),
            Arc::clone(&crypto),
            Arc::clone(&transport),
            Arc::clone(&retries),
            events_tx.clone(),
            jobs_rx,
            Arc::clone(&time),
        );

        Ok(EngineCoordinator::new(
            self.self_id,
            self.config,
            store,
            transport,
            jobs_tx,
            retries,
            events_tx,
            events_rx,
            transport_events,
            forwarder,
            time,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtm_core::transport::memory::MemoryHub;
    use dtm_core::{EndpointId, EngineError, NoKeyProvider};

    #[tokio::test]
    async fn test_build_requires_transport() {
        let result = EngineBuilder::new(UserId::from("user-a"))
            .config(EngineConfig::testing())
            .build();
        assert!(matches!(result, Err(EngineError::Transport(_))));
    }

    #[tokio::test]
    async fn test_build_with_custom_key_provider() {
        let hub = MemoryHub::new();
        let (transport, events) = hub.register(EndpointId::from("ep-a"), "a");
        let engine = EngineBuilder::new(UserId::from("user-a"))
            .config(EngineConfig::testing())
            .transport(Arc::new(transport), events)
            .key_provider(NoKeyProvider)
            .build()
            .unwrap();
        assert_eq!(engine.self_id(), &UserId::from("user-a"));
    }
}
