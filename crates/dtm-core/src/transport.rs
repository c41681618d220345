//! Peer transport abstraction
//!
//! The engine is transport-agnostic: anything that can discover neighbors
//! and move byte payloads between endpoints implements [`PeerTransport`] and
//! reports what happens through a [`TransportEvent`] stream. The engine
//! assumes broadcast is best-effort fan-out, that ordering between distinct
//! sends is not guaranteed, and that payloads arrive whole or not at all.
//!
//! The [`memory`] module provides an in-process hub transport used by the
//! integration tests to build multi-node topologies.

use async_trait::async_trait;
use smallvec::SmallVec;
use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::types::EndpointId;

// ----------------------------------------------------------------------------
// Transport Events
// ----------------------------------------------------------------------------

/// Events emitted by a transport toward the engine.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A nearby endpoint was discovered but is not yet connected.
    EndpointDiscovered { endpoint: EndpointId, name: String },
    /// A connection to an endpoint was established.
    EndpointConnected { endpoint: EndpointId, name: String },
    /// A connection was lost.
    EndpointDisconnected { endpoint: EndpointId },
    /// A payload arrived from a connected endpoint.
    BytesReceived { from: EndpointId, bytes: Vec<u8> },
}

/// Sender half of a transport's event stream.
///
/// Unbounded by design: transport callbacks must never block, so
/// backpressure is handled downstream by the forwarder.
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiver half of a transport's event stream.
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

// ----------------------------------------------------------------------------
// Peer Transport Trait
// ----------------------------------------------------------------------------

/// Abstract neighbor discovery plus byte delivery to peer endpoints.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Make this device discoverable by nearby peers.
    async fn start_advertising(&self) -> Result<(), TransportError>;

    /// Begin scanning for nearby peers. Safe to call repeatedly.
    async fn start_discovery(&self) -> Result<(), TransportError>;

    /// Send a payload to one connected endpoint.
    async fn send(&self, endpoint: &EndpointId, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Best-effort fan-out to every connected endpoint. Returns the number
    /// of endpoints the payload was handed to.
    async fn broadcast(&self, bytes: Vec<u8>) -> Result<usize, TransportError>;

    /// Tear down advertising, discovery, and all connections.
    async fn stop_all(&self) -> Result<(), TransportError>;

    /// Currently connected endpoints.
    fn connected_endpoints(&self) -> SmallVec<[EndpointId; 8]>;

    /// Whether at least one peer is connected.
    fn is_connected(&self) -> bool {
        !self.connected_endpoints().is_empty()
    }
}

// ----------------------------------------------------------------------------
// In-Memory Transport
// ----------------------------------------------------------------------------

pub mod memory {
    //! In-process transport for tests and simulations.
    //!
    //! A [`MemoryHub`] holds a set of registered endpoints and the pairwise
    //! links between them; tests wire arbitrary topologies with
    //! [`MemoryHub::connect`] and cut them with [`MemoryHub::disconnect`].

    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    struct HubNode {
        name: String,
        events: TransportEventSender,
        links: HashSet<EndpointId>,
    }

    /// Shared medium connecting [`MemoryTransport`] instances.
    #[derive(Default)]
    pub struct MemoryHub {
        nodes: Mutex<HashMap<EndpointId, HubNode>>,
    }

    impl MemoryHub {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Register an endpoint on the hub, returning its transport handle
        /// and the event stream the engine consumes.
        pub fn register(
            self: &Arc<Self>,
            endpoint: EndpointId,
            name: impl Into<String>,
        ) -> (MemoryTransport, TransportEventReceiver) {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            self.nodes.lock().unwrap().insert(
                endpoint.clone(),
                HubNode {
                    name: name.into(),
                    events: events_tx,
                    links: HashSet::new(),
                },
            );
            let transport = MemoryTransport {
                hub: Arc::clone(self),
                endpoint,
                active: AtomicBool::new(false),
            };
            (transport, events_rx)
        }

        /// Link two endpoints; both sides observe `EndpointConnected`.
        pub fn connect(&self, a: &EndpointId, b: &EndpointId) {
            let mut nodes = self.nodes.lock().unwrap();
            let a_name = nodes.get(a).map(|n| n.name.clone()).unwrap_or_default();
            let b_name = nodes.get(b).map(|n| n.name.clone()).unwrap_or_default();

            if let Some(node) = nodes.get_mut(a) {
                if node.links.insert(b.clone()) {
                    let _ = node.events.send(TransportEvent::EndpointConnected {
                        endpoint: b.clone(),
                        name: b_name,
                    });
                }
            }
            if let Some(node) = nodes.get_mut(b) {
                if node.links.insert(a.clone()) {
                    let _ = node.events.send(TransportEvent::EndpointConnected {
                        endpoint: a.clone(),
                        name: a_name,
                    });
                }
            }
        }

        /// Cut the link between two endpoints; both sides observe
        /// `EndpointDisconnected`.
        pub fn disconnect(&self, a: &EndpointId, b: &EndpointId) {
            let mut nodes = self.nodes.lock().unwrap();
            if let Some(node) = nodes.get_mut(a) {
                if node.links.remove(b) {
                    let _ = node
                        .events
                        .send(TransportEvent::EndpointDisconnected { endpoint: b.clone() });
                }
            }
            if let Some(node) = nodes.get_mut(b) {
                if node.links.remove(a) {
                    let _ = node
                        .events
                        .send(TransportEvent::EndpointDisconnected { endpoint: a.clone() });
                }
            }
        }

        /// Deliver raw bytes into an endpoint's event stream, bypassing the
        /// link check. Lets tests play a hostile or non-conforming peer.
        pub fn inject(&self, from: &EndpointId, to: &EndpointId, bytes: Vec<u8>) {
            let nodes = self.nodes.lock().unwrap();
            if let Some(node) = nodes.get(to) {
                let _ = node.events.send(TransportEvent::BytesReceived {
                    from: from.clone(),
                    bytes,
                });
            }
        }

        fn deliver(&self, from: &EndpointId, to: &EndpointId, bytes: Vec<u8>) -> bool {
            let nodes = self.nodes.lock().unwrap();
            let linked = nodes
                .get(from)
                .map(|n| n.links.contains(to))
                .unwrap_or(false);
            if !linked {
                return false;
            }
            if let Some(node) = nodes.get(to) {
                let _ = node.events.send(TransportEvent::BytesReceived {
                    from: from.clone(),
                    bytes,
                });
                true
            } else {
                false
            }
        }

        fn links_of(&self, endpoint: &EndpointId) -> SmallVec<[EndpointId; 8]> {
            let nodes = self.nodes.lock().unwrap();
            nodes
                .get(endpoint)
                .map(|n| n.links.iter().cloned().collect())
                .unwrap_or_default()
        }

        fn drop_links_of(&self, endpoint: &EndpointId) {
            let mut nodes = self.nodes.lock().unwrap();
            let links: Vec<EndpointId> = nodes
                .get_mut(endpoint)
                .map(|n| n.links.drain().collect())
                .unwrap_or_default();
            for other in links {
                if let Some(node) = nodes.get_mut(&other) {
                    if node.links.remove(endpoint) {
                        let _ = node.events.send(TransportEvent::EndpointDisconnected {
                            endpoint: endpoint.clone(),
                        });
                    }
                }
            }
        }
    }

    /// A single endpoint's view of the hub.
    pub struct MemoryTransport {
        hub: Arc<MemoryHub>,
        endpoint: EndpointId,
        active: AtomicBool,
    }

    impl MemoryTransport {
        pub fn endpoint(&self) -> &EndpointId {
            &self.endpoint
        }
    }

    #[async_trait]
    impl PeerTransport for MemoryTransport {
        async fn start_advertising(&self) -> Result<(), TransportError> {
            self.active.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn start_discovery(&self) -> Result<(), TransportError> {
            self.active.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, endpoint: &EndpointId, bytes: Vec<u8>) -> Result<(), TransportError> {
            if !self.active.load(Ordering::SeqCst) {
                return Err(TransportError::Shutdown);
            }
            if self.hub.deliver(&self.endpoint, endpoint, bytes) {
                Ok(())
            } else {
                Err(TransportError::SendFailed {
                    endpoint: endpoint.to_string(),
                    reason: "endpoint not connected".into(),
                })
            }
        }

        async fn broadcast(&self, bytes: Vec<u8>) -> Result<usize, TransportError> {
            if !self.active.load(Ordering::SeqCst) {
                return Err(TransportError::Shutdown);
            }
            let mut reached = 0;
            for peer in self.hub.links_of(&self.endpoint) {
                if self.hub.deliver(&self.endpoint, &peer, bytes.clone()) {
                    reached += 1;
                }
            }
            Ok(reached)
        }

        async fn stop_all(&self) -> Result<(), TransportError> {
            self.active.store(false, Ordering::SeqCst);
            self.hub.drop_links_of(&self.endpoint);
            Ok(())
        }

        fn connected_endpoints(&self) -> SmallVec<[EndpointId; 8]> {
            self.hub.links_of(&self.endpoint)
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
