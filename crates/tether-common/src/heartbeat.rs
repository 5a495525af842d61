//! Connection liveness checking.
//!
//! The side that installs a [`HeartbeatMonitor`] sends one `SetupPing` so the
//! peer pings back, then pings on its own schedule. A ping that is not
//! acknowledged within the timeout force-closes the connection with
//! [`CloseReason::LivenessTimeout`]; every operation blocked on or later
//! issued against it fails with [`ChannelError::LivenessTimeout`].

use crate::channel::ChannelWriter;
use crate::envelope::Envelope;
use crate::error::{ChannelError, CloseReason};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default ping interval in seconds.
pub const DEFAULT_INTERVAL_SECS: u64 = 300;
/// Default acknowledgment timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 240;
/// Shortest ping interval a peer can ask this side to run.
pub const MIN_PEER_INTERVAL: Duration = Duration::from_secs(1);

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Raw heartbeat settings as read from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatSettings {
    /// Ping interval in seconds.
    pub interval_seconds: Option<u64>,
    /// Acknowledgment timeout in seconds.
    pub timeout_seconds: Option<u64>,
    /// Older interval setting, in minutes. Ignored when
    /// `interval_seconds` is set.
    pub legacy_interval_minutes: Option<u64>,
}

/// Resolved heartbeat schedule. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between pings. Zero disables pinging.
    pub interval: Duration,
    /// How long a ping may stay unacknowledged.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_INTERVAL_SECS),
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        )
    }
}

impl HeartbeatConfig {
    /// Builds a config from explicit durations.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Resolves settings: explicit seconds first, then the legacy minutes
    /// interval, then defaults. The timeout never comes from legacy settings.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use tether_common::heartbeat::{HeartbeatConfig, HeartbeatSettings};
    ///
    /// let config = HeartbeatConfig::resolve(&HeartbeatSettings {
    ///     legacy_interval_minutes: Some(7),
    ///     ..HeartbeatSettings::default()
    /// });
    /// assert_eq!(config.interval, Duration::from_secs(420));
    /// assert_eq!(config.timeout, Duration::from_secs(240));
    /// ```
    #[must_use]
    pub fn resolve(settings: &HeartbeatSettings) -> Self {
        let interval = settings
            .interval_seconds
            .or_else(|| settings.legacy_interval_minutes.map(|m| m.saturating_mul(60)))
            .unwrap_or(DEFAULT_INTERVAL_SECS);
        let timeout = settings.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS);
        Self::new(Duration::from_secs(interval), Duration::from_secs(timeout))
    }

    /// Whether pinging is switched off.
    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        self.interval.is_zero()
    }

    /// Schedule requested by a peer's `SetupPing`.
    ///
    /// An interval below [`MIN_PEER_INTERVAL`] is raised to it. A zero
    /// interval still disables the heartbeat.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Framing`] for a zero timeout on an enabled heartbeat.
    pub fn from_setup_ping(interval_ms: u64, timeout_ms: u64) -> Result<Self, ChannelError> {
        if interval_ms == 0 {
            return Ok(Self::new(Duration::ZERO, Duration::from_millis(timeout_ms)));
        }
        if timeout_ms == 0 {
            return Err(ChannelError::Framing(
                "setup ping with zero timeout".into(),
            ));
        }
        let interval = Duration::from_millis(interval_ms).max(MIN_PEER_INTERVAL);
        Ok(Self::new(interval, Duration::from_millis(timeout_ms)))
    }

    fn setup_envelope(&self) -> Envelope {
        Envelope::SetupPing {
            timeout_ms: millis(self.timeout),
            interval_ms: millis(self.interval),
        }
    }
}

/// A running heartbeat. Dropping it stops the pinging.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    /// Asks the peer to ping back, then starts pinging locally.
    ///
    /// The `SetupPing` is sent even when `config` is disabled, so the peer
    /// learns that it should not ping either.
    ///
    /// # Errors
    ///
    /// Fails if the `SetupPing` cannot be written.
    pub async fn install(writer: &ChannelWriter, config: HeartbeatConfig) -> Result<Self, ChannelError> {
        writer.write_object(&config.setup_envelope()).await?;
        Ok(Self::start_local(writer.clone(), config))
    }

    /// Starts pinging without notifying the peer.
    #[must_use]
    pub fn start_local(writer: ChannelWriter, config: HeartbeatConfig) -> Self {
        if config.is_disabled() {
            info!("heartbeat disabled (interval is zero)");
            return Self { config, task: None };
        }
        debug!(
            interval_ms = millis(config.interval),
            timeout_ms = millis(config.timeout),
            "heartbeat started"
        );
        let task = tokio::spawn(ping_loop(writer, config));
        Self {
            config,
            task: Some(task),
        }
    }

    /// The schedule this monitor runs.
    #[must_use]
    pub const fn config(&self) -> HeartbeatConfig {
        self.config
    }

    /// Whether the ping task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn acknowledged(acks: &mut watch::Receiver<u64>, seq: u64) -> bool {
    loop {
        let acked = *acks.borrow_and_update();
        if acked >= seq {
            return true;
        }
        if acks.changed().await.is_err() {
            return false;
        }
    }
}

async fn ping_loop(writer: ChannelWriter, config: HeartbeatConfig) {
    let mut acks = writer.acks();
    let mut ticker = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = writer.closed() => return,
            _ = ticker.tick() => {}
        }
        let seq = writer.next_ping_seq();
        let started = Instant::now();
        let round_trip = async {
            writer.write_object(&Envelope::Ping { seq }).await?;
            tokio::select! {
                reason = writer.closed() => Err(ChannelError::from(reason)),
                ok = acknowledged(&mut acks, seq) => {
                    if ok { Ok(()) } else { Err(writer.close_error()) }
                }
            }
        };
        match tokio::time::timeout(config.timeout, round_trip).await {
            Ok(Ok(())) => {
                debug!(seq, rtt_ms = millis(started.elapsed()), "heartbeat acknowledged");
            }
            Ok(Err(err)) => {
                debug!(seq, %err, "heartbeat stopped");
                return;
            }
            Err(_) => {
                warn!(
                    seq,
                    timeout_ms = millis(config.timeout),
                    "heartbeat not acknowledged, closing connection"
                );
                writer.force_close(CloseReason::LivenessTimeout).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SecureConnection;
    use crate::envelope::Envelope;
    use crate::policy::SecurityPolicy;
    use crate::types::frame_mode;
    use tokio::io::AsyncReadExt;

    fn secs(interval: u64, timeout: u64) -> HeartbeatConfig {
        HeartbeatConfig::new(Duration::from_secs(interval), Duration::from_secs(timeout))
    }

    #[test]
    fn no_settings_resolve_to_defaults() {
        let config = HeartbeatConfig::resolve(&HeartbeatSettings::default());
        assert_eq!(config, secs(300, 240));
        assert_eq!(config, HeartbeatConfig::default());
    }

    #[test]
    fn new_style_settings_are_used_as_given() {
        let config = HeartbeatConfig::resolve(&HeartbeatSettings {
            interval_seconds: Some(73),
            timeout_seconds: Some(42),
            legacy_interval_minutes: None,
        });
        assert_eq!(config, secs(73, 42));
    }

    #[test]
    fn legacy_minutes_become_seconds() {
        let config = HeartbeatConfig::resolve(&HeartbeatSettings {
            legacy_interval_minutes: Some(7),
            ..HeartbeatSettings::default()
        });
        assert_eq!(config, secs(420, 240));
    }

    #[test]
    fn new_style_interval_wins_over_legacy() {
        let config = HeartbeatConfig::resolve(&HeartbeatSettings {
            interval_seconds: Some(73),
            timeout_seconds: None,
            legacy_interval_minutes: Some(7),
        });
        assert_eq!(config.interval, Duration::from_secs(73));
    }

    #[test]
    fn zero_interval_disables() {
        let config = HeartbeatConfig::resolve(&HeartbeatSettings {
            interval_seconds: Some(0),
            ..HeartbeatSettings::default()
        });
        assert!(config.is_disabled());
    }

    #[test]
    fn peer_setup_ping_is_checked() {
        assert_eq!(
            HeartbeatConfig::from_setup_ping(73_000, 42_000).unwrap(),
            secs(73, 42)
        );
        assert!(HeartbeatConfig::from_setup_ping(0, 0).unwrap().is_disabled());
        assert!(matches!(
            HeartbeatConfig::from_setup_ping(5_000, 0),
            Err(ChannelError::Framing(_))
        ));
        let floored = HeartbeatConfig::from_setup_ping(1, 500).unwrap();
        assert_eq!(floored.interval, MIN_PEER_INTERVAL);
        assert_eq!(floored.timeout, Duration::from_millis(500));
    }

    #[test]
    fn setup_envelopes_compare_by_value() {
        assert_eq!(secs(73, 42).setup_envelope(), secs(73, 42).setup_envelope());
        assert_ne!(secs(73, 42).setup_envelope(), secs(42, 73).setup_envelope());
    }

    #[tokio::test]
    async fn install_sends_setup_ping_first() {
        let (a, b) = tokio::io::duplex(4096);
        let (a_rd, a_wr) = tokio::io::split(a);
        let (mut b_rd, _b_wr) = tokio::io::split(b);
        let conn = SecureConnection::open(a_rd, a_wr, SecurityPolicy::controller());
        let _monitor = HeartbeatMonitor::install(&conn.writer(), secs(73, 42))
            .await
            .unwrap();

        let len = b_rd.read_u32().await.unwrap() as usize;
        let mut body = vec![0u8; len];
        b_rd.read_exact(&mut body).await.unwrap();
        assert_eq!(body[0], frame_mode::PLAIN);
        assert_eq!(
            Envelope::parse(&body[1..]).unwrap(),
            Envelope::SetupPing {
                timeout_ms: 42_000,
                interval_ms: 73_000
            }
        );
    }

    #[tokio::test]
    async fn disabled_monitor_does_not_run() {
        let (a, _b) = tokio::io::duplex(4096);
        let (a_rd, a_wr) = tokio::io::split(a);
        let conn = SecureConnection::open(a_rd, a_wr, SecurityPolicy::controller());
        let monitor = HeartbeatMonitor::start_local(conn.writer(), secs(0, 10));
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn unanswered_ping_closes_with_liveness_timeout() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_rd, a_wr) = tokio::io::split(a);
        let (_b_rd, _b_wr) = tokio::io::split(b);
        let conn = SecureConnection::open(a_rd, a_wr, SecurityPolicy::controller());
        let (mut reader, writer) = conn.into_split();

        let config = HeartbeatConfig::new(Duration::from_millis(20), Duration::from_millis(60));
        let _monitor = HeartbeatMonitor::install(&writer, config).await.unwrap();

        // The peer never reads, so the blocked read is released by the timeout.
        let result = tokio::time::timeout(Duration::from_secs(5), reader.read_object())
            .await
            .unwrap();
        assert!(matches!(result, Err(ChannelError::LivenessTimeout)));
        assert!(matches!(
            writer.write_value("late").await,
            Err(ChannelError::LivenessTimeout)
        ));
        assert_eq!(writer.close_reason(), Some(CloseReason::LivenessTimeout));
    }

    #[tokio::test]
    async fn answered_pings_keep_the_connection_open() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_rd, a_wr) = tokio::io::split(a);
        let (b_rd, b_wr) = tokio::io::split(b);
        let controller = SecureConnection::open(a_rd, a_wr, SecurityPolicy::controller());
        let agent = SecureConnection::open(b_rd, b_wr, SecurityPolicy::agent());
        let (mut c_rd, c_wr) = controller.into_split();
        let (mut agent_rd, agent_wr) = agent.into_split();

        let agent_loop = tokio::spawn(async move {
            loop {
                if agent_rd.read_object().await.is_err() {
                    break;
                }
            }
        });
        let controller_loop = tokio::spawn(async move { c_rd.read_object().await });

        let config = HeartbeatConfig::new(Duration::from_millis(20), Duration::from_millis(500));
        let monitor = HeartbeatMonitor::install(&c_wr, config).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(monitor.is_running());
        assert!(!c_wr.is_closed());
        assert!(!agent_wr.is_closed());

        c_wr.close().await;
        agent_loop.await.unwrap();
        assert!(matches!(
            controller_loop.await.unwrap(),
            Err(ChannelError::Closed(CloseReason::Local))
        ));
    }
}
