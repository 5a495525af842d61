//! Object-level duplex channel over a pair of raw byte streams.
//!
//! Frames are `u32` big-endian length, then a body that starts with a
//! [`frame_mode`] byte. A [`SecureConnection`] starts in plaintext and can be
//! upgraded once to AEAD sealing. Every inbound envelope's type byte passes
//! the [`SecurityPolicy`] before the body is decoded.
//!
//! Heartbeat envelopes (`Ping`, `Pong`, `SetupPing`) are consumed by the read
//! path and never returned to callers.
//!
//! # Example
//!
//! ```no_run
//! use tether_common::channel::SecureConnection;
//! use tether_common::policy::SecurityPolicy;
//!
//! # async fn demo() -> Result<(), tether_common::error::ChannelError> {
//! let (a, b) = tokio::io::duplex(4096);
//! let (a_rd, a_wr) = tokio::io::split(a);
//! let (b_rd, b_wr) = tokio::io::split(b);
//! let mut left = SecureConnection::open(a_rd, a_wr, SecurityPolicy::allow_all_known());
//! let mut right = SecureConnection::open(b_rd, b_wr, SecurityPolicy::allow_all_known());
//! left.write_value("hello").await?;
//! assert_eq!(right.read_value().await?, "hello");
//! # Ok(())
//! # }
//! ```

use crate::cipher::{FrameSealer, Role, SessionKey};
use crate::envelope::Envelope;
use crate::error::{ChannelError, CloseReason};
use crate::heartbeat::{HeartbeatConfig, HeartbeatMonitor};
use crate::policy::{Decision, SecurityPolicy, TypeIdentity};
use crate::types::{frame_mode, MAX_FRAME_LEN};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, trace, warn};

/// Boxed inbound byte stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed outbound byte stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Encryption state of one direction. Only ever moves to `Encrypted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionState {
    /// Frames carry bare envelopes.
    Plaintext,
    /// Frames carry sealed envelopes.
    Encrypted,
}

struct Outbound {
    sink: BoxedWriter,
    sealer: Option<FrameSealer>,
}

impl Outbound {
    async fn write_frame(&mut self, envelope: &[u8]) -> Result<(), ChannelError> {
        let body = match self.sealer.as_mut() {
            None => {
                let mut body = Vec::with_capacity(1 + envelope.len());
                body.push(frame_mode::PLAIN);
                body.extend_from_slice(envelope);
                body
            }
            Some(sealer) => {
                let sealed = sealer.seal(envelope)?;
                let mut body = Vec::with_capacity(1 + sealed.len());
                body.push(frame_mode::SEALED);
                body.extend_from_slice(&sealed);
                body
            }
        };
        let len = u32::try_from(body.len())
            .ok()
            .filter(|len| *len as usize <= MAX_FRAME_LEN)
            .ok_or_else(|| ChannelError::Framing(format!("frame of {} bytes too large", body.len())))?;
        self.sink.write_all(&len.to_be_bytes()).await?;
        self.sink.write_all(&body).await?;
        self.sink.flush().await?;
        Ok(())
    }
}

struct Shared {
    outbound: Mutex<Outbound>,
    sealed: AtomicBool,
    link: watch::Sender<Option<CloseReason>>,
    acks: watch::Sender<u64>,
    next_ping: AtomicU64,
}

impl Shared {
    /// Records the close reason. Returns `false` if already closed.
    fn mark_closed(&self, reason: CloseReason) -> bool {
        self.link.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason);
                true
            } else {
                false
            }
        })
    }

    async fn shutdown(&self, reason: CloseReason) {
        if !self.mark_closed(reason) {
            return;
        }
        // Writers blocked on the transport observe the close and release the lock.
        let mut out = self.outbound.lock().await;
        if let Ok(Err(err)) = tokio::time::timeout(SHUTDOWN_GRACE, out.sink.shutdown()).await {
            debug!(%err, "transport shutdown failed");
        }
    }
}

async fn wait_closed(link: &mut watch::Receiver<Option<CloseReason>>) -> CloseReason {
    loop {
        let current = link.borrow_and_update().clone();
        if let Some(reason) = current {
            return reason;
        }
        if link.changed().await.is_err() {
            return CloseReason::Local;
        }
    }
}

/// Cloneable outbound half. All clones share one write lock, so frames from
/// concurrent writers never interleave.
#[derive(Clone)]
pub struct ChannelWriter {
    shared: Arc<Shared>,
}

impl ChannelWriter {
    /// Sends an envelope.
    ///
    /// # Errors
    ///
    /// Fails if the envelope cannot be encoded, the transport fails, or the
    /// connection is or becomes closed while waiting.
    pub async fn write_object(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        let bytes = envelope.encode()?;
        let mut link = self.shared.link.subscribe();
        let current = link.borrow_and_update().clone();
        if let Some(reason) = current {
            return Err(reason.into());
        }
        let result = tokio::select! {
            biased;
            reason = wait_closed(&mut link) => return Err(reason.into()),
            result = async {
                let mut out = self.shared.outbound.lock().await;
                out.write_frame(&bytes).await
            } => result,
        };
        if let Err(ChannelError::Transport(err)) = &result {
            self.shared.mark_closed(CloseReason::Failed(err.to_string()));
        }
        result
    }

    /// Sends a text value.
    ///
    /// # Errors
    ///
    /// Same as [`write_object`](Self::write_object).
    pub async fn write_value(&self, value: &str) -> Result<(), ChannelError> {
        self.write_object(&Envelope::text(value)).await
    }

    /// Switches the outbound direction to frames sealed by `role`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AlreadyEncrypted`] on a second call.
    pub async fn upgrade(&self, key: &SessionKey, role: Role) -> Result<(), ChannelError> {
        let mut out = self.shared.outbound.lock().await;
        if out.sealer.is_some() {
            return Err(ChannelError::AlreadyEncrypted);
        }
        out.sealer = Some(FrameSealer::sending(key, role));
        self.shared.sealed.store(true, Ordering::Release);
        Ok(())
    }

    /// Encryption state of the outbound direction.
    #[must_use]
    pub fn encryption_state(&self) -> EncryptionState {
        if self.shared.sealed.load(Ordering::Acquire) {
            EncryptionState::Encrypted
        } else {
            EncryptionState::Plaintext
        }
    }

    /// Closes the connection. Pending and later operations on either half
    /// fail with [`ChannelError::Closed`].
    pub async fn close(&self) {
        self.shared.shutdown(CloseReason::Local).await;
    }

    /// Closes the connection with a specific reason.
    pub async fn force_close(&self, reason: CloseReason) {
        self.shared.shutdown(reason).await;
    }

    /// Whether the connection has been closed for any reason.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.link.borrow().is_some()
    }

    /// Why the connection closed, if it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.link.borrow().clone()
    }

    /// The error operations fail with once the connection is closed.
    #[must_use]
    pub fn close_error(&self) -> ChannelError {
        self.close_reason()
            .map_or(ChannelError::Closed(CloseReason::Local), ChannelError::from)
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) -> CloseReason {
        let mut link = self.shared.link.subscribe();
        wait_closed(&mut link).await
    }

    pub(crate) fn acks(&self) -> watch::Receiver<u64> {
        self.shared.acks.subscribe()
    }

    pub(crate) fn next_ping_seq(&self) -> u64 {
        self.shared.next_ping.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl std::fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("encryption", &self.encryption_state())
            .field("close_reason", &self.close_reason())
            .finish_non_exhaustive()
    }
}

/// Inbound half. Reads are sequential, so there is exactly one reader.
pub struct ChannelReader {
    source: BoxedReader,
    opener: Option<FrameSealer>,
    link: watch::Receiver<Option<CloseReason>>,
    writer: ChannelWriter,
    policy: SecurityPolicy,
    reciprocal: Option<HeartbeatMonitor>,
}

impl ChannelReader {
    /// Switches the inbound direction to frames sealed by `role`'s peer.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AlreadyEncrypted`] on a second call.
    pub fn upgrade(&mut self, key: &SessionKey, role: Role) -> Result<(), ChannelError> {
        if self.opener.is_some() {
            return Err(ChannelError::AlreadyEncrypted);
        }
        self.opener = Some(FrameSealer::receiving(key, role));
        Ok(())
    }

    /// Encryption state of the inbound direction.
    #[must_use]
    pub const fn encryption_state(&self) -> EncryptionState {
        if self.opener.is_some() {
            EncryptionState::Encrypted
        } else {
            EncryptionState::Plaintext
        }
    }

    /// Reads the next application envelope.
    ///
    /// Heartbeat traffic is answered or applied internally and skipped.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Security`] if the envelope's type is denied; the body
    /// is not decoded. Framing, transport and close errors otherwise.
    pub async fn read_object(&mut self) -> Result<Envelope, ChannelError> {
        loop {
            match self.next_envelope().await? {
                Envelope::Ping { seq } => {
                    trace!(seq, "answering ping");
                    self.writer.write_object(&Envelope::Pong { seq }).await?;
                }
                Envelope::Pong { seq } => {
                    trace!(seq, "pong received");
                    self.writer.shared.acks.send_if_modified(|acked| {
                        if seq > *acked {
                            *acked = seq;
                            true
                        } else {
                            false
                        }
                    });
                }
                Envelope::SetupPing {
                    timeout_ms,
                    interval_ms,
                } => {
                    let config = match HeartbeatConfig::from_setup_ping(interval_ms, timeout_ms) {
                        Ok(config) => config,
                        Err(err) => {
                            warn!(interval_ms, timeout_ms, %err, "refusing peer heartbeat");
                            self.writer.shared.mark_closed(CloseReason::Failed(err.to_string()));
                            return Err(err);
                        }
                    };
                    info!(
                        interval_ms,
                        timeout_ms, "peer requested reciprocal heartbeat"
                    );
                    self.reciprocal = Some(HeartbeatMonitor::start_local(self.writer.clone(), config));
                }
                other => return Ok(other),
            }
        }
    }

    /// Reads the next text value.
    ///
    /// # Errors
    ///
    /// Same as [`read_object`](Self::read_object), plus a framing error when
    /// the next envelope is not text.
    pub async fn read_value(&mut self) -> Result<String, ChannelError> {
        match self.read_object().await? {
            Envelope::Text(value) => Ok(value),
            other => Err(ChannelError::Framing(format!(
                "expected a text value, received {}",
                other.type_tag()
            ))),
        }
    }

    /// Heartbeat the peer asked this side to run, if any.
    #[must_use]
    pub fn remote_heartbeat(&self) -> Option<HeartbeatConfig> {
        self.reciprocal.as_ref().map(HeartbeatMonitor::config)
    }

    /// The policy gating this reader.
    #[must_use]
    pub const fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Writer sharing this reader's connection.
    #[must_use]
    pub const fn writer(&self) -> &ChannelWriter {
        &self.writer
    }

    async fn next_envelope(&mut self) -> Result<Envelope, ChannelError> {
        let current = self.link.borrow_and_update().clone();
        if let Some(reason) = current {
            return Err(reason.into());
        }
        let frame = tokio::select! {
            biased;
            reason = wait_closed(&mut self.link) => return Err(reason.into()),
            frame = read_frame(&mut self.source, self.opener.as_mut()) => frame,
        };
        let result = frame.and_then(|bytes| self.admit(&bytes));
        match &result {
            Err(ChannelError::Closed(reason)) => {
                self.writer.shared.mark_closed(reason.clone());
            }
            Err(err @ (ChannelError::Transport(_) | ChannelError::Framing(_))) => {
                debug!(%err, "inbound failure, closing connection");
                self.writer.shared.mark_closed(CloseReason::Failed(err.to_string()));
            }
            _ => {}
        }
        result
    }

    fn admit(&self, bytes: &[u8]) -> Result<Envelope, ChannelError> {
        let Some(&tag) = bytes.first() else {
            return Err(ChannelError::Framing("empty envelope".into()));
        };
        if self.policy.decide(tag) == Decision::Deny {
            let identity = TypeIdentity::from_byte(tag);
            warn!(%identity, len = bytes.len(), "security policy rejected inbound envelope");
            return Err(ChannelError::Security { identity });
        }
        Ok(Envelope::parse(bytes)?)
    }
}

async fn read_frame(
    source: &mut BoxedReader,
    opener: Option<&mut FrameSealer>,
) -> Result<Vec<u8>, ChannelError> {
    let mut header = [0u8; 4];
    match source.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ChannelError::Closed(CloseReason::PeerClosed));
        }
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(ChannelError::Framing(format!(
            "frame length {len} outside 1..={MAX_FRAME_LEN}"
        )));
    }
    let mut body = vec![0u8; len];
    source.read_exact(&mut body).await?;
    let rest = body.split_off(1);
    match (body[0], opener) {
        (frame_mode::PLAIN, None) => Ok(rest),
        (frame_mode::SEALED, Some(opener)) => Ok(opener.open(&rest)?),
        (frame_mode::PLAIN, Some(_)) => Err(ChannelError::Framing(
            "plaintext frame on an encrypted connection".into(),
        )),
        (frame_mode::SEALED, None) => Err(ChannelError::Framing(
            "sealed frame on a plaintext connection".into(),
        )),
        (other, _) => Err(ChannelError::Framing(format!(
            "unknown frame mode 0x{other:02x}"
        ))),
    }
}

/// Object-level duplex connection.
pub struct SecureConnection {
    reader: ChannelReader,
    writer: ChannelWriter,
}

impl SecureConnection {
    /// Wraps raw streams. Both directions start in plaintext.
    pub fn open<R, W>(raw_in: R, raw_out: W, policy: SecurityPolicy) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (link, link_rx) = watch::channel(None);
        let (acks, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            outbound: Mutex::new(Outbound {
                sink: Box::new(raw_out),
                sealer: None,
            }),
            sealed: AtomicBool::new(false),
            link,
            acks,
            next_ping: AtomicU64::new(0),
        });
        let writer = ChannelWriter { shared };
        let reader = ChannelReader {
            source: Box::new(raw_in),
            opener: None,
            link: link_rx,
            writer: writer.clone(),
            policy,
            reciprocal: None,
        };
        Self { reader, writer }
    }

    /// Upgrades both directions to sealed frames under `key`, acting as
    /// `role`.
    ///
    /// The peer must upgrade at the same point in the stream with the same
    /// key and the other role; otherwise the next frame fails with
    /// [`ChannelError::Framing`].
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AlreadyEncrypted`] if either direction is
    /// already encrypted; nothing is changed in that case.
    pub async fn upgrade(&mut self, key: &SessionKey, role: Role) -> Result<(), ChannelError> {
        if self.reader.encryption_state() == EncryptionState::Encrypted
            || self.writer.encryption_state() == EncryptionState::Encrypted
        {
            return Err(ChannelError::AlreadyEncrypted);
        }
        self.writer.upgrade(key, role).await?;
        self.reader.upgrade(key, role)?;
        debug!(cipher = %key.spec(), ?role, "connection upgraded");
        Ok(())
    }

    /// Encryption state of the connection.
    #[must_use]
    pub const fn encryption_state(&self) -> EncryptionState {
        self.reader.encryption_state()
    }

    /// See [`ChannelWriter::write_value`].
    ///
    /// # Errors
    ///
    /// Same as [`ChannelWriter::write_object`].
    pub async fn write_value(&self, value: &str) -> Result<(), ChannelError> {
        self.writer.write_value(value).await
    }

    /// See [`ChannelReader::read_value`].
    ///
    /// # Errors
    ///
    /// Same as [`ChannelReader::read_value`].
    pub async fn read_value(&mut self) -> Result<String, ChannelError> {
        self.reader.read_value().await
    }

    /// See [`ChannelWriter::write_object`].
    ///
    /// # Errors
    ///
    /// Same as [`ChannelWriter::write_object`].
    pub async fn write_object(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        self.writer.write_object(envelope).await
    }

    /// See [`ChannelReader::read_object`].
    ///
    /// # Errors
    ///
    /// Same as [`ChannelReader::read_object`].
    pub async fn read_object(&mut self) -> Result<Envelope, ChannelError> {
        self.reader.read_object().await
    }

    /// Closes the connection.
    pub async fn close(&self) {
        self.writer.close().await;
    }

    /// A handle to the outbound half.
    #[must_use]
    pub fn writer(&self) -> ChannelWriter {
        self.writer.clone()
    }

    /// Borrows the inbound half.
    #[must_use]
    pub const fn reader(&self) -> &ChannelReader {
        &self.reader
    }

    /// Why the connection closed, if it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.writer.close_reason()
    }

    /// Splits into the single reader and a cloneable writer.
    #[must_use]
    pub fn into_split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}
