//! Core type definitions and protocol constants for Tether.

use crate::cipher::{NONCE_LEN, TAG_LEN};
use crate::envelope::MAX_ENVELOPE_LEN;

/// Controller-assigned task identifier.
pub type TaskId = u64;

/// Protocol identifier printed in the agent banner.
/// Bump this on breaking wire-format changes.
pub const PROTOCOL_VERSION: &str = "tether.v1";

/// Mode bytes that open every frame body.
pub mod frame_mode {
    /// The body is a bare envelope.
    pub const PLAIN: u8 = 0x00;
    /// The body is `nonce ‖ ciphertext+tag` of an envelope.
    pub const SEALED: u8 = 0x01;
}

/// Largest frame body accepted on the wire: mode byte, nonce, tag and a
/// maximum-size envelope.
pub const MAX_FRAME_LEN: usize = 1 + NONCE_LEN + MAX_ENVELOPE_LEN + TAG_LEN;
