//! Common types and plumbing shared by tether agents and controllers.
//!
//! This crate provides:
//! - Marker-based stream synchronization ([`marker`])
//! - Envelope encoding and parsing ([`envelope`])
//! - Session keys and AEAD frame sealing ([`cipher`])
//! - The inbound type gate ([`policy`])
//! - The object-level secure channel ([`channel`])
//! - Connection liveness checking ([`heartbeat`])
//! - Protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod cipher;
pub mod envelope;
pub mod error;
pub mod heartbeat;
pub mod marker;
pub mod policy;
pub mod types;

pub use channel::{ChannelReader, ChannelWriter, SecureConnection};
pub use cipher::{CipherSpec, Role, SessionKey};
pub use envelope::{Cause, Envelope, Outcome, TypeTag};
pub use error::{ChannelError, CloseReason};
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor, HeartbeatSettings};
pub use policy::SecurityPolicy;
pub use types::TaskId;
