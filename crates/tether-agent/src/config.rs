use clap::{ArgAction, Parser};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tether_common::marker::MARK;
use tether_common::CipherSpec;

/// Largest number of execution slots an agent will provision.
pub const MAX_SLOTS: usize = 1024;

/// Largest banner accepted, in bytes.
pub const MAX_BANNER_LEN: usize = 4096;

/// CLI arguments for the agent daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "tether-agent")]
#[command(about = "Tether execution agent")]
#[command(version)]
pub struct Args {
    /// Socket address to accept controller connections on.
    #[arg(long, default_value = "127.0.0.1:7800", env = "TETHER_AGENT_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the Prometheus endpoint. Disabled when unset.
    #[arg(long, env = "TETHER_AGENT_METRICS")]
    pub metrics_addr: Option<SocketAddr>,
    /// Number of execution slots.
    #[arg(long, default_value = "4", env = "TETHER_AGENT_SLOTS")]
    pub slots: usize,
    /// Milliseconds an interrupted task may keep running before it is aborted.
    #[arg(long, default_value = "5000", env = "TETHER_AGENT_KILL_GRACE_MS")]
    pub kill_grace_ms: u64,
    /// Text written before the channel marker on every connection.
    #[arg(long, default_value = "tether agent", env = "TETHER_AGENT_BANNER")]
    pub banner: String,
    /// File holding the shared session secret. Connections stay plaintext
    /// when unset.
    #[arg(long, env = "TETHER_AGENT_SESSION_KEY")]
    pub session_key: Option<PathBuf>,
    /// AEAD used once the connection is upgraded.
    #[arg(long, default_value = "chacha20-poly1305", env = "TETHER_AGENT_CIPHER")]
    pub cipher: CipherSpec,
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Socket address to accept controller connections on.
    pub listen: SocketAddr,
    /// Socket address for the Prometheus endpoint.
    pub metrics_addr: Option<SocketAddr>,
    /// Number of execution slots.
    pub slots: usize,
    /// Grace period before an interrupted task is aborted.
    pub kill_grace: Duration,
    /// Text written before the channel marker.
    pub banner: String,
    /// Session secret file.
    pub session_key: Option<PathBuf>,
    /// AEAD used after upgrade.
    pub cipher: CipherSpec,
}

impl AgentConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.slots == 0 {
            return Err("slots must be greater than 0".to_string());
        }
        if self.slots > MAX_SLOTS {
            return Err(format!("slots exceeds reasonable limit ({MAX_SLOTS})"));
        }

        if self.kill_grace > Duration::from_secs(600) {
            return Err("kill_grace exceeds reasonable limit (600 seconds)".to_string());
        }

        if self.banner.len() > MAX_BANNER_LEN {
            return Err(format!(
                "banner exceeds maximum length ({MAX_BANNER_LEN} bytes)"
            ));
        }
        // The controller would sync on a marker inside the banner.
        if self
            .banner
            .as_bytes()
            .windows(MARK.len())
            .any(|window| window == MARK)
        {
            return Err("banner must not contain the channel marker".to_string());
        }
        Ok(())
    }
}

impl From<Args> for AgentConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            slots: args.slots,
            kill_grace: Duration::from_millis(args.kill_grace_ms),
            banner: args.banner,
            session_key: args.session_key,
            cipher: args.cipher,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AgentConfig {
        AgentConfig {
            listen: "127.0.0.1:7800".parse().unwrap(),
            metrics_addr: None,
            slots: 4,
            kill_grace: Duration::from_secs(5),
            banner: "tether agent".into(),
            session_key: None,
            cipher: CipherSpec::default(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn slots_zero() {
        let mut c = valid_config();
        c.slots = 0;
        assert!(c.validate().unwrap_err().contains("slots"));
    }

    #[test]
    fn slots_too_large() {
        let mut c = valid_config();
        c.slots = MAX_SLOTS + 1;
        assert!(c.validate().unwrap_err().contains("slots"));
    }

    #[test]
    fn kill_grace_too_large() {
        let mut c = valid_config();
        c.kill_grace = Duration::from_secs(601);
        assert!(c.validate().unwrap_err().contains("kill_grace"));
    }

    #[test]
    fn banner_too_long() {
        let mut c = valid_config();
        c.banner = "x".repeat(MAX_BANNER_LEN + 1);
        assert!(c.validate().unwrap_err().contains("banner"));
    }

    #[test]
    fn banner_with_marker() {
        let mut c = valid_config();
        c.banner = format!("hello {}", String::from_utf8_lossy(MARK));
        assert!(c.validate().unwrap_err().contains("marker"));
    }

    #[test]
    fn boundary_values_valid() {
        let mut c = valid_config();
        c.slots = 1;
        c.kill_grace = Duration::ZERO;
        c.banner = String::new();
        assert!(c.validate().is_ok());
        c.slots = MAX_SLOTS;
        c.kill_grace = Duration::from_secs(600);
        c.banner = "x".repeat(MAX_BANNER_LEN);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn args_convert() {
        let args = Args::parse_from([
            "tether-agent",
            "--slots",
            "2",
            "--kill-grace-ms",
            "250",
            "--cipher",
            "aes-256-gcm",
        ]);
        let config = AgentConfig::from(args);
        assert_eq!(config.slots, 2);
        assert_eq!(config.kill_grace, Duration::from_millis(250));
        assert_eq!(config.cipher, CipherSpec::Aes256Gcm);
        assert!(config.session_key.is_none());
    }
}
