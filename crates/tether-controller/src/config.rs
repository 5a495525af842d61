use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_common::heartbeat::HeartbeatSettings;
use tether_common::{CipherSpec, HeartbeatConfig};

/// CLI interface for the controller.
#[derive(Parser)]
#[command(name = "tether-controller", about = "Tether controller")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a custom configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Agent address override (`host:port`).
    #[arg(long, global = true)]
    pub agent: Option<String>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run one task on the agent and print its outcome.
    Run {
        /// Registered task name.
        task: String,
        /// Task payload, passed as UTF-8 bytes.
        #[arg(default_value = "")]
        payload: String,
        /// Interrupt the task after this many milliseconds.
        #[arg(long)]
        interrupt_after_ms: Option<u64>,
        /// User named as the interrupt cause.
        #[arg(long, default_value = "controller")]
        user: String,
    },
    /// Print the heartbeat schedule the configuration resolves to.
    Heartbeat,
    /// Generate a session secret file for agent and controller.
    Keygen {
        /// Output path. Defaults to the platform config directory.
        path: Option<PathBuf>,
    },
}

/// Runtime configuration loaded from file, env, and defaults.
#[derive(Debug, Deserialize, Clone)]
pub struct ControllerConfig {
    /// Agent address, `host:port`.
    pub agent: String,
    /// Milliseconds allowed for the TCP connect and channel setup.
    pub connect_timeout_ms: u64,
    /// Channel encryption settings.
    #[serde(default)]
    pub session: SessionConfig,
    /// Liveness checking settings.
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
}

/// Channel encryption settings.
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Shared secret file. The channel stays plaintext when unset.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// AEAD name, `chacha20-poly1305` or `aes-256-gcm`.
    pub cipher: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            key_file: None,
            cipher: CipherSpec::default().name().to_string(),
        }
    }
}

/// The `[heartbeat]` table. Unset keys fall back to the built-in defaults.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatSection {
    /// Seconds between pings. `0` disables the heartbeat.
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    /// Seconds to wait for a pong.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Older minutes-based interval; ignored when `interval_seconds` is set.
    #[serde(default)]
    pub legacy_interval_minutes: Option<u64>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            agent: "127.0.0.1:7800".to_string(),
            connect_timeout_ms: 10_000,
            session: SessionConfig::default(),
            heartbeat: HeartbeatSection::default(),
        }
    }
}

impl ControllerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.agent.is_empty() {
            return Err("agent address must not be empty".to_string());
        }
        if !self.agent.contains(':') {
            return Err(format!(
                "agent address must be host:port, got: {}",
                self.agent
            ));
        }

        if self.connect_timeout_ms == 0 {
            return Err("connect_timeout_ms must be greater than 0".to_string());
        }

        if let Err(e) = self.cipher() {
            return Err(format!("session.cipher: {e}"));
        }

        if self.heartbeat.timeout_seconds == Some(0) {
            return Err("heartbeat.timeout_seconds must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Parsed `session.cipher`.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown cipher name.
    pub fn cipher(&self) -> Result<CipherSpec, tether_common::cipher::CipherError> {
        self.session.cipher.parse()
    }

    /// Connect and setup deadline.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Raw heartbeat keys as read from configuration.
    #[must_use]
    pub const fn heartbeat_settings(&self) -> HeartbeatSettings {
        HeartbeatSettings {
            interval_seconds: self.heartbeat.interval_seconds,
            timeout_seconds: self.heartbeat.timeout_seconds,
            legacy_interval_minutes: self.heartbeat.legacy_interval_minutes,
        }
    }

    /// Resolved heartbeat schedule.
    #[must_use]
    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig::resolve(&self.heartbeat_settings())
    }
}

/// Resolve path for controller data files (config.toml, session.key).
/// Checks platform-native config dir first, then falls back to ~/.config/tether/.
#[must_use]
pub fn resolve_data_path(filename: &str) -> PathBuf {
    let native = dirs::config_dir().map(|d| d.join("tether").join(filename));
    let xdg = dirs::home_dir().map(|d| d.join(".config").join("tether").join(filename));

    if let Some(p) = native.as_ref().filter(|p| p.exists()) {
        return p.clone();
    }
    if let Some(p) = xdg.as_ref().filter(|p| p.exists()) {
        return p.clone();
    }
    native.unwrap_or_else(|| PathBuf::from(filename))
}

/// Loads defaults, then the config file, then `TETHER_*` environment
/// variables (`TETHER_HEARTBEAT__INTERVAL_SECONDS=73`).
///
/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
#[allow(clippy::cast_possible_wrap)]
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ControllerConfig> {
    let defaults = ControllerConfig::default();
    let mut builder = config::Config::builder()
        .set_default("agent", defaults.agent.as_str())?
        .set_default("connect_timeout_ms", defaults.connect_timeout_ms as i64)?
        .set_default("session.cipher", defaults.session.cipher.as_str())?;

    if let Some(config_path) = path {
        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        }
    } else {
        let resolved = resolve_data_path("config.toml");
        if resolved.exists() {
            builder = builder.add_source(config::File::from(resolved));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TETHER")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let settings = builder.build()?;
    let config: ControllerConfig = settings.try_deserialize()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::field_reassign_with_default)]
    use super::*;
    use std::fs;

    fn temp_file(contents: &str) -> PathBuf {
        let suffix: u64 = rand::random();
        let path = std::env::temp_dir().join(format!("tether_config_{suffix}.toml"));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_default_config_passes_validation() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.agent, "127.0.0.1:7800");
    }

    #[test]
    fn test_load_config_with_no_file_returns_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/config.toml")))
            .expect("load_config should succeed with no file");

        assert_eq!(config.connect_timeout_ms, 10_000);
        assert_eq!(config.session.cipher, "chacha20-poly1305");
        assert!(config.session.key_file.is_none());
        assert_eq!(config.heartbeat, HeartbeatSection::default());
    }

    #[test]
    fn test_no_heartbeat_keys_resolve_to_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.heartbeat(), HeartbeatConfig::default());
    }

    #[test]
    fn test_heartbeat_table_from_file() {
        let path = temp_file(
            "agent = \"10.0.0.2:7800\"\n\n[heartbeat]\ninterval_seconds = 73\ntimeout_seconds = 42\n",
        );
        let config = load_config(Some(&path)).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(config.agent, "10.0.0.2:7800");
        let heartbeat = config.heartbeat();
        assert_eq!(heartbeat.interval, Duration::from_secs(73));
        assert_eq!(heartbeat.timeout, Duration::from_secs(42));
    }

    #[test]
    fn test_legacy_minutes_from_file() {
        let path = temp_file("[heartbeat]\nlegacy_interval_minutes = 7\n");
        let config = load_config(Some(&path)).unwrap();
        let _ = fs::remove_file(&path);

        let heartbeat = config.heartbeat();
        assert_eq!(heartbeat.interval, Duration::from_secs(420));
        assert_eq!(heartbeat.timeout, HeartbeatConfig::default().timeout);
    }

    #[test]
    fn test_session_table_from_file() {
        let path = temp_file("[session]\nkey_file = \"/etc/tether/session.key\"\ncipher = \"aes-256-gcm\"\n");
        let config = load_config(Some(&path)).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(
            config.session.key_file.as_deref(),
            Some(Path::new("/etc/tether/session.key"))
        );
        assert_eq!(config.cipher().unwrap(), CipherSpec::Aes256Gcm);
    }

    #[test]
    fn test_validate_rejects_empty_agent() {
        let mut config = ControllerConfig::default();
        config.agent = String::new();
        assert!(config.validate().unwrap_err().contains("must not be empty"));
    }

    #[test]
    fn test_validate_rejects_agent_without_port() {
        let mut config = ControllerConfig::default();
        config.agent = "localhost".to_string();
        assert!(config.validate().unwrap_err().contains("host:port"));
    }

    #[test]
    fn test_validate_rejects_unknown_cipher() {
        let mut config = ControllerConfig::default();
        config.session.cipher = "rot13".to_string();
        assert!(config.validate().unwrap_err().contains("session.cipher"));
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = ControllerConfig::default();
        config.connect_timeout_ms = 0;
        assert!(config.validate().unwrap_err().contains("connect_timeout_ms"));

        let mut config = ControllerConfig::default();
        config.heartbeat.timeout_seconds = Some(0);
        assert!(config.validate().unwrap_err().contains("heartbeat.timeout_seconds"));
    }

    #[test]
    fn test_zero_interval_is_valid_and_disables() {
        let mut config = ControllerConfig::default();
        config.heartbeat.interval_seconds = Some(0);
        assert!(config.validate().is_ok());
        assert!(config.heartbeat().is_disabled());
    }
}
