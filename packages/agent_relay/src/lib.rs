//! # Agent Relay
//!
//! Streams incremental replies from conversational agents to every live
//! viewer of the same conversation. A central [`Broker`] gives producers
//! and consumers a shared broadcast domain; each consumer-side
//! [`Connection`] runs a background relay task that parses the frame
//! stream and routes reassembled envelopes into per-subscriber queues.
//!
//! The broker is protocol-blind: it forwards every frame it receives on
//! its ingress address to every consumer attached on its egress address.
//! All demultiplexing intelligence lives in the connection.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), agent_relay::RelayError> {
//! use std::time::Duration;
//!
//! use agent_relay::{Broker, RelayConfig, StartTag};
//!
//! let broker = Broker::new(RelayConfig::from_env()?);
//! broker.start().await?;
//!
//! let producer = broker.connect().await;
//! producer.start().await?;
//! let viewer = broker.connect().await;
//! viewer.start().await?;
//!
//! let sub = viewer.subscribe("thread-1", "viewer-1").await;
//!
//! producer.publish_start(&StartTag::new("thread-1")).await?;
//! producer.publish_content("hello").await?;
//! producer.publish_end().await?;
//!
//! if let Some(envelope) = sub.wait_for_message(Duration::from_secs(2)).await? {
//!     println!("{}", envelope.content.get_content().await);
//! }
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod connection;
pub mod error;

pub use broker::Broker;
pub use config::RelayConfig;
pub use connection::{Connection, Subscription};
pub use error::RelayError;

pub use agent_wire::{
    Clob, ClobReader, ContentKind, END_TAG, Envelope, EnvelopeSnapshot, Frame, Role, StartTag,
    WireError,
};
