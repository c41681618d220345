//! DT-Messaging engine runtime
//!
//! Ties the protocol layer (`dtm-core`) and the persistence layer
//! (`dtm-store`) into a running delay-tolerant messaging engine:
//!
//! - [`forwarder`] — the single-worker store-and-forward pipeline
//! - [`retry`] — exponential-backoff retries for undelivered messages
//! - [`coordinator`] — component ownership, maintenance timers, the API
//!   surface the embedding application calls
//! - [`builder`] — dependency wiring
//!
//! ```no_run
//! use std::sync::Arc;
//! use dtm_core::transport::memory::MemoryHub;
//! use dtm_core::{EndpointId, UserId};
//! use dtm_engine::EngineBuilder;
//!
//! # #[tokio::main]
//! # async fn main() -> dtm_core::Result<()> {
//! let hub = MemoryHub::new();
//! let (transport, transport_events) = hub.register(EndpointId::from("ep-1"), "this device");
//!
//! let engine = EngineBuilder::new(UserId::from("user-1"))
//!     .transport(Arc::new(transport), transport_events)
//!     .build()?;
//! engine.start().await?;
//!
//! let mut events = engine.take_events().expect("first take");
//! let message_id = engine.send_text(&UserId::from("user-2"), "hello out there").await?;
//! # let _ = (events.recv().await, message_id);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod coordinator;
pub mod forwarder;
pub mod retry;

pub use builder::EngineBuilder;
pub use coordinator::EngineCoordinator;
pub use forwarder::{Forwarder, ForwarderJob, ForwarderJobReceiver, ForwarderJobSender};
pub use retry::{RetryScheduler, RetryStats};
