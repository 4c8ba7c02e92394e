//! # Agent Wire
//!
//! Wire-level building blocks for streaming conversational agent replies:
//! the frame grammar spoken over the broadcast transport, the
//! length-prefixed codec that carries frames on a byte stream, and the
//! data model consumers reconstruct from the stream.
//!
//! A logical reply travels as three kinds of frames: an open tag carrying
//! the envelope attributes, zero or more bare content fragments, and a
//! close tag. The receiving side reassembles these into an [`Envelope`]
//! whose [`Clob`] content fills in as fragments arrive.
//!
//! ## Quick Start
//!
//! ```rust
//! use agent_wire::{Envelope, Frame, StartTag};
//!
//! # fn main() -> Result<(), agent_wire::WireError> {
//! let tag = StartTag::new("thread-1");
//! let frame = Frame::classify(&tag.encode())?;
//!
//! match frame {
//!     Frame::Start(tag) => {
//!         let envelope = Envelope::from_tag(tag);
//!         assert_eq!(envelope.thread_id, "thread-1");
//!     }
//!     _ => unreachable!(),
//! }
//! # Ok(())
//! # }
//! ```

pub mod clob;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod wire;

pub use clob::{Clob, ClobReader};
pub use envelope::{ContentKind, Envelope, EnvelopeSnapshot, Role};
pub use error::WireError;
pub use framing::{MAX_FRAME_SIZE, read_frame, write_frame};
pub use wire::{END_TAG, Frame, StartTag};
