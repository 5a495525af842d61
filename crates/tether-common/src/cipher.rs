//! Session keys and per-direction AEAD frame sealing.
//!
//! A sealed frame is `nonce(12) ‖ ciphertext+tag`. The associated data is a
//! direction label followed by the frame's sequence number in that direction,
//! so a reordered, replayed, dropped or reflected frame fails authentication
//! on the receiving side.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use zeroize::Zeroizing;

/// Nonce length shared by both supported AEADs.
pub const NONCE_LEN: usize = 12;
/// Authentication tag length shared by both supported AEADs.
pub const TAG_LEN: usize = 16;

const KEY_DERIVATION_LABEL: &[u8] = b"tether/session-key/v1";
const CONTROLLER_TO_AGENT: &[u8] = b"tether/controller->agent";
const AGENT_TO_CONTROLLER: &[u8] = b"tether/agent->controller";

/// Which end of a connection this side is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sends tasks.
    Controller,
    /// Runs tasks.
    Agent,
}

impl Role {
    /// The other end.
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::Controller => Self::Agent,
            Self::Agent => Self::Controller,
        }
    }

    const fn sending_label(self) -> &'static [u8] {
        match self {
            Self::Controller => CONTROLLER_TO_AGENT,
            Self::Agent => AGENT_TO_CONTROLLER,
        }
    }
}

/// Supported AEAD constructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CipherSpec {
    /// ChaCha20-Poly1305 (RFC 8439).
    #[default]
    ChaCha20Poly1305,
    /// AES-256 in Galois/Counter Mode.
    Aes256Gcm,
}

impl CipherSpec {
    /// Configuration name of this spec.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ChaCha20Poly1305 => "chacha20-poly1305",
            Self::Aes256Gcm => "aes-256-gcm",
        }
    }
}

impl fmt::Display for CipherSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CipherSpec {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chacha20-poly1305" | "chacha20poly1305" => Ok(Self::ChaCha20Poly1305),
            "aes-256-gcm" | "aes256gcm" => Ok(Self::Aes256Gcm),
            _ => Err(CipherError::UnknownSpec(s.to_string())),
        }
    }
}

/// Errors from key handling and frame sealing.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The cipher name is not one of the supported specs.
    #[error("unknown cipher spec '{0}' (expected chacha20-poly1305 or aes-256-gcm)")]
    UnknownSpec(String),
    /// The shared secret is empty.
    #[error("session secret is empty")]
    EmptySecret,
    /// The key file could not be read.
    #[error("cannot read key file {path}: {source}")]
    KeyFile {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The key file is readable by group or other.
    #[error("key file {path} has overly permissive permissions ({mode:o}), must be 0600")]
    KeyFilePermissions {
        /// Offending path.
        path: String,
        /// Permission bits found.
        mode: u32,
    },
    /// A sealed frame is shorter than nonce plus tag.
    #[error("sealed frame too short: {0} bytes")]
    Truncated(usize),
    /// Encryption failed.
    #[error("failed to seal frame")]
    Seal,
    /// Authentication failed: wrong key, tampering, or out-of-order frame.
    #[error("failed to open sealed frame {sequence}: authentication failed")]
    Open {
        /// Expected sequence number of the frame.
        sequence: u64,
    },
}

/// Symmetric session key plus the cipher it is used with.
///
/// Key material is zeroized on drop.
#[derive(Clone)]
pub struct SessionKey {
    key: Zeroizing<[u8; 32]>,
    spec: CipherSpec,
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl SessionKey {
    /// Derives a 32-byte AEAD key from a shared secret of any length.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::EmptySecret`] for an empty secret.
    ///
    /// # Examples
    ///
    /// ```
    /// use tether_common::cipher::{CipherSpec, SessionKey};
    /// let key = SessionKey::derive(&[7u8; 16], CipherSpec::Aes256Gcm).unwrap();
    /// assert_eq!(key.spec(), CipherSpec::Aes256Gcm);
    /// ```
    pub fn derive(secret: &[u8], spec: CipherSpec) -> Result<Self, CipherError> {
        if secret.is_empty() {
            return Err(CipherError::EmptySecret);
        }
        let mut hasher = Sha256::new();
        hasher.update(KEY_DERIVATION_LABEL);
        hasher.update(secret);
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&hasher.finalize());
        Ok(Self { key, spec })
    }

    /// Loads the shared secret from a file and derives the session key.
    ///
    /// On Unix the file must not be accessible by group or other.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable, too permissive, or empty.
    pub fn load(path: &Path, spec: CipherSpec) -> Result<Self, CipherError> {
        let display = path.display().to_string();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = std::fs::metadata(path).map_err(|source| CipherError::KeyFile {
                path: display.clone(),
                source,
            })?;
            let mode = metadata.permissions().mode();
            if mode & 0o077 != 0 {
                return Err(CipherError::KeyFilePermissions {
                    path: display,
                    mode: mode & 0o777,
                });
            }
        }
        let secret = Zeroizing::new(
            std::fs::read(path).map_err(|source| CipherError::KeyFile {
                path: display,
                source,
            })?,
        );
        Self::derive(&secret, spec)
    }

    /// Cipher this key is used with.
    #[must_use]
    pub const fn spec(&self) -> CipherSpec {
        self.spec
    }
}

enum AeadCipher {
    ChaCha(Box<ChaCha20Poly1305>),
    Aes(Box<Aes256Gcm>),
}

/// One direction of an encrypted connection.
///
/// Sequence numbers advance once per frame; the sealing and opening ends of
/// a direction stay in step as long as no frame is lost.
pub(crate) struct FrameSealer {
    cipher: AeadCipher,
    label: &'static [u8],
    sequence: u64,
}

impl FrameSealer {
    /// Seals frames `role` sends.
    pub(crate) fn sending(key: &SessionKey, role: Role) -> Self {
        Self::new(key, role.sending_label())
    }

    /// Opens frames `role` receives from its peer.
    pub(crate) fn receiving(key: &SessionKey, role: Role) -> Self {
        Self::new(key, role.peer().sending_label())
    }

    fn new(key: &SessionKey, label: &'static [u8]) -> Self {
        let cipher = match key.spec {
            CipherSpec::ChaCha20Poly1305 => AeadCipher::ChaCha(Box::new(ChaCha20Poly1305::new(
                chacha20poly1305::Key::from_slice(&key.key[..]),
            ))),
            CipherSpec::Aes256Gcm => AeadCipher::Aes(Box::new(Aes256Gcm::new(
                aes_gcm::Key::<Aes256Gcm>::from_slice(&key.key[..]),
            ))),
        };
        Self {
            cipher,
            label,
            sequence: 0,
        }
    }

    fn aad(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.label.len() + 8);
        aad.extend_from_slice(self.label);
        aad.extend_from_slice(&self.sequence.to_be_bytes());
        aad
    }

    pub(crate) fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill(&mut nonce);
        let aad = self.aad();
        let payload = Payload {
            msg: plaintext,
            aad: &aad,
        };
        let ciphertext = match &self.cipher {
            AeadCipher::ChaCha(c) => c.encrypt(chacha20poly1305::Nonce::from_slice(&nonce), payload),
            AeadCipher::Aes(c) => c.encrypt(aes_gcm::Nonce::from_slice(&nonce), payload),
        }
        .map_err(|_| CipherError::Seal)?;
        self.sequence += 1;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub(crate) fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::Truncated(sealed.len()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let aad = self.aad();
        let payload = Payload {
            msg: ciphertext,
            aad: &aad,
        };
        let plaintext = match &self.cipher {
            AeadCipher::ChaCha(c) => c.decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload),
            AeadCipher::Aes(c) => c.decrypt(aes_gcm::Nonce::from_slice(nonce), payload),
        }
        .map_err(|_| CipherError::Open {
            sequence: self.sequence,
        })?;
        self.sequence += 1;
        Ok(plaintext)
    }
}
