//! Tether wire envelopes.
//!
//! Each envelope is a type-length-value (TLV) binary unit carried inside one
//! channel frame. The first byte is the type tag; the remaining bytes are the
//! tag-specific body. The tag is readable without touching the body, which
//! lets the security policy rule on an envelope before it is decoded.

use std::fmt;
use thiserror::Error;

/// TEXT envelope: a UTF-8 string value.
pub const TYPE_TEXT: u8 = 0x01;
/// BYTES envelope: an opaque binary value.
pub const TYPE_BYTES: u8 = 0x02;
/// PING envelope: heartbeat probe carrying a sequence number.
pub const TYPE_PING: u8 = 0x10;
/// PONG envelope: heartbeat acknowledgment echoing the probe's sequence.
pub const TYPE_PONG: u8 = 0x11;
/// SETUP_PING envelope: asks the peer to start its own reciprocal heartbeat.
pub const TYPE_SETUP_PING: u8 = 0x12;
/// TASK envelope: controller → agent, a unit of work.
pub const TYPE_TASK: u8 = 0x20;
/// INTERRUPT envelope: controller → agent, interruption causes for a task.
pub const TYPE_INTERRUPT: u8 = 0x21;
/// OUTCOME envelope: agent → controller, terminal outcome of a task.
pub const TYPE_OUTCOME: u8 = 0x22;

const CAUSE_USER: u8 = 0x01;
const CAUSE_KILLED_HARD: u8 = 0x02;
const CAUSE_CHANNEL_CLOSED: u8 = 0x03;

const OUTCOME_SUCCESS: u8 = 0x00;
const OUTCOME_FAILURE: u8 = 0x01;
const OUTCOME_INTERRUPTED: u8 = 0x02;

/// Maximum encoded envelope size in bytes (1 MiB).
pub const MAX_ENVELOPE_LEN: usize = 1 << 20;

/// The closed set of envelope types this protocol recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeTag {
    /// [`TYPE_TEXT`]
    Text,
    /// [`TYPE_BYTES`]
    Bytes,
    /// [`TYPE_PING`]
    Ping,
    /// [`TYPE_PONG`]
    Pong,
    /// [`TYPE_SETUP_PING`]
    SetupPing,
    /// [`TYPE_TASK`]
    Task,
    /// [`TYPE_INTERRUPT`]
    Interrupt,
    /// [`TYPE_OUTCOME`]
    Outcome,
}

impl TypeTag {
    /// Every recognized tag, in wire-byte order.
    pub const ALL: [Self; 8] = [
        Self::Text,
        Self::Bytes,
        Self::Ping,
        Self::Pong,
        Self::SetupPing,
        Self::Task,
        Self::Interrupt,
        Self::Outcome,
    ];

    /// Maps a wire byte onto a recognized tag.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            TYPE_TEXT => Some(Self::Text),
            TYPE_BYTES => Some(Self::Bytes),
            TYPE_PING => Some(Self::Ping),
            TYPE_PONG => Some(Self::Pong),
            TYPE_SETUP_PING => Some(Self::SetupPing),
            TYPE_TASK => Some(Self::Task),
            TYPE_INTERRUPT => Some(Self::Interrupt),
            TYPE_OUTCOME => Some(Self::Outcome),
            _ => None,
        }
    }

    /// Returns the wire byte for this tag.
    #[must_use]
    pub const fn byte(self) -> u8 {
        match self {
            Self::Text => TYPE_TEXT,
            Self::Bytes => TYPE_BYTES,
            Self::Ping => TYPE_PING,
            Self::Pong => TYPE_PONG,
            Self::SetupPing => TYPE_SETUP_PING,
            Self::Task => TYPE_TASK,
            Self::Interrupt => TYPE_INTERRUPT,
            Self::Outcome => TYPE_OUTCOME,
        }
    }

    /// Stable human-readable name, used in logs and security errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Bytes => "bytes",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::SetupPing => "setup-ping",
            Self::Task => "task",
            Self::Interrupt => "interrupt",
            Self::Outcome => "outcome",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02x})", self.name(), self.byte())
    }
}

/// Why a task was interrupted.
///
/// Causes compare by value: interrupting a task twice with equal causes
/// records the cause once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Cause {
    /// An operator asked for the interruption.
    User {
        /// Name of the requesting user.
        name: String,
    },
    /// The execution slot running the task was killed hard.
    KilledHard {
        /// Diagnostic captured at the time of the kill.
        diagnostic: String,
    },
    /// The channel that delivered the task went away.
    ChannelClosed {
        /// Close reason as reported by the channel.
        detail: String,
    },
}

impl Cause {
    /// Shorthand for [`Cause::User`].
    #[must_use]
    pub fn user(name: impl Into<String>) -> Self {
        Self::User { name: name.into() }
    }

    /// Shorthand for [`Cause::KilledHard`].
    #[must_use]
    pub fn killed_hard(diagnostic: impl Into<String>) -> Self {
        Self::KilledHard {
            diagnostic: diagnostic.into(),
        }
    }

    const fn kind(&self) -> u8 {
        match self {
            Self::User { .. } => CAUSE_USER,
            Self::KilledHard { .. } => CAUSE_KILLED_HARD,
            Self::ChannelClosed { .. } => CAUSE_CHANNEL_CLOSED,
        }
    }

    fn text(&self) -> &str {
        match self {
            Self::User { name } => name,
            Self::KilledHard { diagnostic } => diagnostic,
            Self::ChannelClosed { detail } => detail,
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User { name } => write!(f, "aborted by {name}"),
            Self::KilledHard { diagnostic } => write!(f, "slot killed hard: {diagnostic}"),
            Self::ChannelClosed { detail } => write!(f, "channel closed: {detail}"),
        }
    }
}

/// Terminal outcome of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The task completed and produced a value.
    Success(Vec<u8>),
    /// The task failed with a message.
    Failure(String),
    /// The task was interrupted; carries the merged cause set.
    Interrupted(Vec<Cause>),
}

impl Outcome {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Failure(_) => "failure",
            Self::Interrupted(_) => "interrupted",
        }
    }
}

/// A decoded Tether envelope.
///
/// Variants map 1:1 to the `TYPE_*` constants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Text value.
    Text(String),
    /// Binary value.
    Bytes(Vec<u8>),
    /// Heartbeat probe.
    Ping {
        /// Probe sequence number.
        seq: u64,
    },
    /// Heartbeat acknowledgment.
    Pong {
        /// Sequence number of the acknowledged probe.
        seq: u64,
    },
    /// Asks the receiving peer to ping back with these settings.
    SetupPing {
        /// Acknowledgment deadline, in milliseconds.
        timeout_ms: u64,
        /// Probe interval, in milliseconds. Zero disables pinging.
        interval_ms: u64,
    },
    /// Unit of work for an agent.
    Task {
        /// Controller-assigned task id.
        id: u64,
        /// Name of the registered handler to run.
        name: String,
        /// Handler-specific input.
        payload: Vec<u8>,
    },
    /// Interruption request for a running task.
    Interrupt {
        /// Target task id.
        id: u64,
        /// Causes to merge into the task's record.
        causes: Vec<Cause>,
    },
    /// Terminal outcome report.
    Outcome {
        /// Task id the outcome belongs to.
        id: u64,
        /// The outcome itself.
        outcome: Outcome,
    },
}

/// Errors that can occur while encoding or parsing an envelope.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The input byte slice was empty.
    #[error("envelope is empty")]
    Empty,
    /// The envelope ended before a field was complete.
    #[error("envelope too short: expected {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected byte count.
        expected: usize,
        /// Actual byte count available.
        actual: usize,
    },
    /// The first byte does not match any known envelope type.
    #[error("unknown envelope type 0x{0:02x}")]
    UnknownType(u8),
    /// A text field was not valid UTF-8.
    #[error("invalid utf-8 in text field")]
    InvalidUtf8,
    /// Bytes were left over after the last field.
    #[error("{0} trailing bytes after envelope body")]
    TrailingBytes(usize),
    /// An interruption cause carried an unknown kind byte.
    #[error("unknown cause kind 0x{0:02x}")]
    UnknownCause(u8),
    /// An outcome carried an unknown kind byte.
    #[error("unknown outcome kind 0x{0:02x}")]
    UnknownOutcome(u8),
    /// A field or the whole envelope is larger than the format allows.
    #[error("field too large: max {max}, got {actual}")]
    TooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },
}

fn put_str16(out: &mut Vec<u8>, s: &str) -> Result<(), EnvelopeError> {
    let len = u16::try_from(s.len()).map_err(|_| EnvelopeError::TooLarge {
        max: usize::from(u16::MAX),
        actual: s.len(),
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_causes(out: &mut Vec<u8>, causes: &[Cause]) -> Result<(), EnvelopeError> {
    let count = u16::try_from(causes.len()).map_err(|_| EnvelopeError::TooLarge {
        max: usize::from(u16::MAX),
        actual: causes.len(),
    })?;
    out.extend_from_slice(&count.to_be_bytes());
    for cause in causes {
        out.push(cause.kind());
        put_str16(out, cause.text())?;
    }
    Ok(())
}

/// Bounds-checked reader over an envelope body.
struct Fields<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], EnvelopeError> {
        let end = self.pos.saturating_add(n);
        if end > self.data.len() {
            return Err(EnvelopeError::TooShort {
                expected: end,
                actual: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, EnvelopeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, EnvelopeError> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2)?);
        Ok(u16::from_be_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, EnvelopeError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    fn str16(&mut self) -> Result<String, EnvelopeError> {
        let len = usize::from(self.u16()?);
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| EnvelopeError::InvalidUtf8)
    }

    fn causes(&mut self) -> Result<Vec<Cause>, EnvelopeError> {
        let count = usize::from(self.u16()?);
        let mut causes = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let kind = self.u8()?;
            let text = self.str16()?;
            causes.push(match kind {
                CAUSE_USER => Cause::User { name: text },
                CAUSE_KILLED_HARD => Cause::KilledHard { diagnostic: text },
                CAUSE_CHANNEL_CLOSED => Cause::ChannelClosed { detail: text },
                other => return Err(EnvelopeError::UnknownCause(other)),
            });
        }
        Ok(causes)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    fn rest_utf8(&mut self) -> Result<String, EnvelopeError> {
        String::from_utf8(self.rest().to_vec()).map_err(|_| EnvelopeError::InvalidUtf8)
    }

    fn finish(&self) -> Result<(), EnvelopeError> {
        match self.data.len() - self.pos {
            0 => Ok(()),
            n => Err(EnvelopeError::TrailingBytes(n)),
        }
    }
}

impl Envelope {
    /// Creates a `Text` envelope.
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Creates a `Task` envelope.
    #[must_use]
    pub fn task(id: u64, name: impl Into<String>, payload: &[u8]) -> Self {
        Self::Task {
            id,
            name: name.into(),
            payload: payload.to_vec(),
        }
    }

    /// Returns the type tag of this envelope.
    #[must_use]
    pub const fn type_tag(&self) -> TypeTag {
        match self {
            Self::Text(_) => TypeTag::Text,
            Self::Bytes(_) => TypeTag::Bytes,
            Self::Ping { .. } => TypeTag::Ping,
            Self::Pong { .. } => TypeTag::Pong,
            Self::SetupPing { .. } => TypeTag::SetupPing,
            Self::Task { .. } => TypeTag::Task,
            Self::Interrupt { .. } => TypeTag::Interrupt,
            Self::Outcome { .. } => TypeTag::Outcome,
        }
    }

    /// Encodes this envelope into its wire form.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::TooLarge`] if a length-prefixed field or the
    /// whole envelope exceeds the format limits.
    ///
    /// # Examples
    ///
    /// ```
    /// use tether_common::envelope::{Envelope, TYPE_TEXT};
    /// let bytes = Envelope::text("hello").encode().unwrap();
    /// assert_eq!(bytes[0], TYPE_TEXT);
    /// assert_eq!(&bytes[1..], b"hello");
    /// ```
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut v = Vec::with_capacity(16);
        v.push(self.type_tag().byte());
        match self {
            Self::Text(text) => v.extend_from_slice(text.as_bytes()),
            Self::Bytes(bytes) => v.extend_from_slice(bytes),
            Self::Ping { seq } | Self::Pong { seq } => v.extend_from_slice(&seq.to_be_bytes()),
            Self::SetupPing {
                timeout_ms,
                interval_ms,
            } => {
                v.extend_from_slice(&timeout_ms.to_be_bytes());
                v.extend_from_slice(&interval_ms.to_be_bytes());
            }
            Self::Task { id, name, payload } => {
                v.extend_from_slice(&id.to_be_bytes());
                put_str16(&mut v, name)?;
                v.extend_from_slice(payload);
            }
            Self::Interrupt { id, causes } => {
                v.extend_from_slice(&id.to_be_bytes());
                put_causes(&mut v, causes)?;
            }
            Self::Outcome { id, outcome } => {
                v.extend_from_slice(&id.to_be_bytes());
                match outcome {
                    Outcome::Success(value) => {
                        v.push(OUTCOME_SUCCESS);
                        v.extend_from_slice(value);
                    }
                    Outcome::Failure(message) => {
                        v.push(OUTCOME_FAILURE);
                        v.extend_from_slice(message.as_bytes());
                    }
                    Outcome::Interrupted(causes) => {
                        v.push(OUTCOME_INTERRUPTED);
                        put_causes(&mut v, causes)?;
                    }
                }
            }
        }
        if v.len() > MAX_ENVELOPE_LEN {
            return Err(EnvelopeError::TooLarge {
                max: MAX_ENVELOPE_LEN,
                actual: v.len(),
            });
        }
        Ok(v)
    }

    /// Parses wire bytes into a typed `Envelope`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError`] if the data is empty, truncated, carries an
    /// unrecognized type byte, or has bytes left over after the body.
    ///
    /// # Examples
    ///
    /// ```
    /// use tether_common::envelope::Envelope;
    /// let envelope = Envelope::task(7, "echo", b"hi");
    /// let parsed = Envelope::parse(&envelope.encode().unwrap()).unwrap();
    /// assert_eq!(envelope, parsed);
    /// ```
    pub fn parse(data: &[u8]) -> Result<Self, EnvelopeError> {
        let Some((&tag, body)) = data.split_first() else {
            return Err(EnvelopeError::Empty);
        };
        if data.len() > MAX_ENVELOPE_LEN {
            return Err(EnvelopeError::TooLarge {
                max: MAX_ENVELOPE_LEN,
                actual: data.len(),
            });
        }
        let mut f = Fields::new(body);
        let envelope = match tag {
            TYPE_TEXT => Self::Text(f.rest_utf8()?),
            TYPE_BYTES => Self::Bytes(f.rest().to_vec()),
            TYPE_PING => Self::Ping { seq: f.u64()? },
            TYPE_PONG => Self::Pong { seq: f.u64()? },
            TYPE_SETUP_PING => Self::SetupPing {
                timeout_ms: f.u64()?,
                interval_ms: f.u64()?,
            },
            TYPE_TASK => Self::Task {
                id: f.u64()?,
                name: f.str16()?,
                payload: f.rest().to_vec(),
            },
            TYPE_INTERRUPT => Self::Interrupt {
                id: f.u64()?,
                causes: f.causes()?,
            },
            TYPE_OUTCOME => {
                let id = f.u64()?;
                let outcome = match f.u8()? {
                    OUTCOME_SUCCESS => Outcome::Success(f.rest().to_vec()),
                    OUTCOME_FAILURE => Outcome::Failure(f.rest_utf8()?),
                    OUTCOME_INTERRUPTED => Outcome::Interrupted(f.causes()?),
                    other => return Err(EnvelopeError::UnknownOutcome(other)),
                };
                Self::Outcome { id, outcome }
            }
            t => return Err(EnvelopeError::UnknownType(t)),
        };
        f.finish()?;
        Ok(envelope)
    }
}
