//! DT-Messaging core protocol
//!
//! Protocol layer for a delay-tolerant peer-to-peer messaging engine:
//! devices opportunistically connect to nearby peers and relay user messages
//! via multi-hop store-and-forward until they reach their addressee or
//! expire.
//!
//! This crate is the headless protocol library with no knowledge of any
//! particular transport, store, or user interface:
//!
//! - [`wire`] — the JSON wire format and its codec
//! - [`crypto`] — AES-256-CBC payload encryption, content hashing, IDs
//! - [`seen`] — bounded duplicate suppression for forwarding loops
//! - [`transport`] — the [`PeerTransport`] seam plus an in-memory test hub
//! - [`events`] — the event stream surfaced to embedding applications
//! - [`config`] — protocol constants and tunables
//!
//! The forwarding pipeline, retry scheduler, and persistence live in the
//! `dtm-engine` and `dtm-store` crates, which build on these types.

pub mod config;
pub mod crypto;
pub mod errors;
pub mod events;
pub mod seen;
pub mod transport;
pub mod types;
pub mod wire;

pub use config::{EngineConfig, ForwardingConfig, MaintenanceConfig, RetryConfig, StoreConfig};
pub use crypto::{CryptoBox, EncryptedPayload, KeyProvider, NoKeyProvider, SeedKeyProvider};
pub use errors::{
    CodecError, CryptoError, EngineError, Result, TransportError, ValidationError,
};
pub use events::{
    engine_event_channel, EngineEvent, EngineEventReceiver, EngineEventSender, EngineStats,
};
pub use seen::SeenSet;
pub use transport::{
    PeerTransport, TransportEvent, TransportEventReceiver, TransportEventSender,
};
pub use types::{
    EndpointId, MessageId, MessageStatus, SharedTimeSource, SystemTimeSource, TimeSource,
    Timestamp, UserId,
};
pub use wire::{MessageType, NetworkMessage, WireCodec};
