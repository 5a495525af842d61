//! Agent bootstrap: find the channel marker, set up the secure channel and
//! install the heartbeat.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::remote::RemoteAgent;
use tether_common::marker::skip_preamble;
use tether_common::{HeartbeatConfig, Role, SecureConnection, SecurityPolicy, SessionKey};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Bytes of pre-marker output kept as the agent banner.
const MAX_BANNER_LEN: usize = 4096;

/// How to set up a connection once the marker is found.
#[derive(Debug, Default)]
pub struct ConnectOptions {
    /// Upgrade the channel with this key. Plaintext when `None`.
    pub session_key: Option<SessionKey>,
    /// Heartbeat to install.
    pub heartbeat: HeartbeatConfig,
}

impl ConnectOptions {
    /// Options from loaded configuration, reading the session key file if
    /// one is configured.
    ///
    /// # Errors
    ///
    /// Fails on an unknown cipher or an unusable key file.
    pub fn from_config(config: &ControllerConfig) -> Result<Self, ControllerError> {
        let session_key = match &config.session.key_file {
            Some(path) => Some(SessionKey::load(path, config.cipher()?)?),
            None => None,
        };
        Ok(Self {
            session_key,
            heartbeat: config.heartbeat(),
        })
    }
}

/// Bootstraps over raw agent streams.
///
/// Everything the agent writes before the marker is treated as its banner.
/// Bytes following the marker stay buffered and become the start of the
/// channel.
///
/// # Errors
///
/// `Io` if the stream ends or overflows before the marker, `Channel` if the
/// upgrade or heartbeat install fails.
pub async fn establish<R, W>(
    raw_in: R,
    raw_out: W,
    options: &ConnectOptions,
) -> Result<RemoteAgent, ControllerError>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut buffered = BufReader::new(raw_in);
    let mut preamble = Vec::new();
    let skipped = skip_preamble(&mut buffered, |noise| {
        let room = MAX_BANNER_LEN.saturating_sub(preamble.len());
        preamble.extend_from_slice(&noise[..noise.len().min(room)]);
    })
    .await?;
    let banner = String::from_utf8_lossy(&preamble).trim().to_string();
    debug!(skipped, preamble = %banner, "channel marker found");

    let mut conn = SecureConnection::open(buffered, raw_out, SecurityPolicy::controller());
    if let Some(key) = &options.session_key {
        conn.upgrade(key, Role::Controller).await?;
    }
    info!(
        encrypted = options.session_key.is_some(),
        "agent channel established"
    );
    RemoteAgent::start(conn, options.heartbeat, banner).await
}

/// Connects to an agent over TCP and bootstraps the channel within
/// `config`'s connect timeout.
///
/// # Errors
///
/// `ConnectTimeout` if setup takes too long, otherwise as [`establish`].
pub async fn connect(config: &ControllerConfig, options: &ConnectOptions) -> Result<RemoteAgent, ControllerError> {
    let addr = config.agent.as_str();
    let setup = async {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (rd, wr) = stream.into_split();
        establish(rd, wr, options).await
    };
    tokio::time::timeout(config.connect_timeout(), setup)
        .await
        .map_err(|_| ControllerError::ConnectTimeout(addr.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_common::marker::MARK;
    use tether_common::{CipherSpec, Envelope, Outcome};
    use tokio::io::AsyncWriteExt;

    fn quiet() -> HeartbeatConfig {
        HeartbeatConfig::new(Duration::ZERO, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn skips_banner_and_runs_task() {
        let (controller_io, mut agent_io) = tokio::io::duplex(64 * 1024);
        agent_io.write_all(b"agent v1 starting\nloading...\n").await.unwrap();
        agent_io.write_all(MARK).await.unwrap();

        let (c_rd, c_wr) = tokio::io::split(controller_io);
        let options = ConnectOptions {
            session_key: None,
            heartbeat: quiet(),
        };
        let remote = establish(c_rd, c_wr, &options).await.unwrap();
        assert_eq!(remote.banner(), "agent v1 starting\nloading...");

        let (a_rd, a_wr) = tokio::io::split(agent_io);
        let mut agent = SecureConnection::open(a_rd, a_wr, SecurityPolicy::agent());
        let task = remote.dispatch("echo", b"hi").await.unwrap();
        let Envelope::Task { id, payload, .. } = agent.read_object().await.unwrap() else {
            panic!("expected task");
        };
        agent
            .write_object(&Envelope::Outcome {
                id,
                outcome: Outcome::Success(payload),
            })
            .await
            .unwrap();
        assert_eq!(task.outcome().await.unwrap(), Outcome::Success(b"hi".to_vec()));
    }

    #[tokio::test]
    async fn frames_right_after_marker_are_kept() {
        let (controller_io, agent_io) = tokio::io::duplex(64 * 1024);
        let (a_rd, mut a_wr) = tokio::io::split(agent_io);
        a_wr.write_all(b"noise").await.unwrap();
        a_wr.write_all(MARK).await.unwrap();
        let agent = SecureConnection::open(a_rd, a_wr, SecurityPolicy::agent());
        agent.write_value("ready").await.unwrap();

        let (c_rd, c_wr) = tokio::io::split(controller_io);
        let options = ConnectOptions {
            session_key: None,
            heartbeat: quiet(),
        };
        let remote = establish(c_rd, c_wr, &options).await.unwrap();
        assert_eq!(remote.banner(), "noise");
        assert!(remote.close_reason().is_none());
    }

    #[tokio::test]
    async fn stream_without_marker_fails() {
        let (controller_io, mut agent_io) = tokio::io::duplex(1024);
        agent_io.write_all(b"login: ").await.unwrap();
        drop(agent_io);

        let (c_rd, c_wr) = tokio::io::split(controller_io);
        let err = establish(c_rd, c_wr, &ConnectOptions::default()).await.unwrap_err();
        assert!(matches!(err, ControllerError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn encrypted_bootstrap() {
        let secret = b"correct horse battery staple";
        let (controller_io, mut agent_io) = tokio::io::duplex(64 * 1024);
        agent_io.write_all(MARK).await.unwrap();
        let (a_rd, a_wr) = tokio::io::split(agent_io);
        let mut agent = SecureConnection::open(a_rd, a_wr, SecurityPolicy::agent());
        agent
            .upgrade(&SessionKey::derive(secret, CipherSpec::Aes256Gcm).unwrap(), Role::Agent)
            .await
            .unwrap();

        let (c_rd, c_wr) = tokio::io::split(controller_io);
        let options = ConnectOptions {
            session_key: Some(SessionKey::derive(secret, CipherSpec::Aes256Gcm).unwrap()),
            heartbeat: quiet(),
        };
        let remote = establish(c_rd, c_wr, &options).await.unwrap();
        remote.say("sealed hello").await.unwrap();
        assert_eq!(agent.read_value().await.unwrap(), "sealed hello");
    }

    #[test]
    fn options_from_default_config_are_plaintext() {
        let options = ConnectOptions::from_config(&ControllerConfig::default()).unwrap();
        assert!(options.session_key.is_none());
        assert_eq!(options.heartbeat, HeartbeatConfig::default());
    }
}
