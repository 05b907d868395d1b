//! Defines all configuration structures for the Cadence router.
//!
//! These structs are designed to be deserialized from a configuration file
//! (e.g., a TOML file) using `serde`, layered with `CADENCE__*` environment
//! overrides through the `config` crate. Durations are written as milliseconds.

use config::{Config, Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The top-level configuration for the `Router`.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Pacing delay the default TICK routine sleeps between cycles.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Emit a heartbeat log every this many cycles. Zero disables it.
    #[serde(default = "default_heartbeat_every")]
    pub heartbeat_every: u64,

    /// Whether to trap OS interrupt/termination signals and turn them into
    /// faults on the loop thread.
    #[serde(default = "default_trap_signals")]
    pub trap_signals: bool,

    /// Settings for the agent operator, if one should be attached.
    #[serde(default)]
    pub operator: Option<OperatorConfig>,
}

/// Settings for the agent operator and its acceptor.
#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on. `0` lets the OS pick one.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Descriptor list loaded at STARTUP, if any.
    #[serde(default)]
    pub descriptors: Option<PathBuf>,

    /// How long SHUTDOWN waits for the acceptor thread to finish.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl RouterConfig {
    /// Loads a configuration file, then applies `CADENCE__*` environment
    /// overrides (e.g. `CADENCE__TICK_INTERVAL_MS=250`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, config::ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("CADENCE").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Defaults plus `CADENCE__*` environment overrides, without a file.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("CADENCE").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl OperatorConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// The address the acceptor binds, as `host:port`.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parses the listen address when the host is a literal IP.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.listen_address().parse().ok()
    }
}

// --- Default value functions for serde ---

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_heartbeat_every() -> u64 {
    50
}

fn default_trap_signals() -> bool {
    true
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    7777
}

fn default_shutdown_grace_ms() -> u64 {
    250
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            heartbeat_every: default_heartbeat_every(),
            trap_signals: default_trap_signals(),
            operator: None,
        }
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            descriptors: None,
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const ENV_KEYS: [&str; 3] = [
        "CADENCE__TICK_INTERVAL_MS",
        "CADENCE__TRAP_SIGNALS",
        "CADENCE__OPERATOR__PORT",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_defaults() {
        let config = RouterConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.heartbeat_every, 50);
        assert!(config.trap_signals);
        assert!(config.operator.is_none());

        let operator = OperatorConfig::default();
        assert_eq!(operator.listen_address(), "localhost:7777");
        assert_eq!(operator.shutdown_grace(), Duration::from_millis(250));
    }

    #[test]
    #[serial]
    fn test_load_from_toml_file() {
        clear_env();
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
tick_interval_ms = 5
trap_signals = false

[operator]
host = "127.0.0.1"
port = 0
descriptors = "agents.toml"
"#
        )
        .unwrap();

        let config = RouterConfig::load(file.path()).unwrap();
        assert_eq!(config.tick_interval(), Duration::from_millis(5));
        assert_eq!(config.heartbeat_every, 50);
        assert!(!config.trap_signals);

        let operator = config.operator.unwrap();
        assert_eq!(operator.socket_addr(), Some("127.0.0.1:0".parse().unwrap()));
        assert_eq!(operator.descriptors, Some(PathBuf::from("agents.toml")));
        assert_eq!(operator.shutdown_grace_ms, 250);
    }

    #[test]
    #[serial]
    fn test_from_env_applies_overrides() {
        clear_env();
        std::env::set_var("CADENCE__TICK_INTERVAL_MS", "250");
        std::env::set_var("CADENCE__TRAP_SIGNALS", "false");
        let config = RouterConfig::from_env();
        clear_env();

        let config = config.unwrap();
        assert_eq!(config.tick_interval(), Duration::from_millis(250));
        assert!(!config.trap_signals);
        assert_eq!(config.heartbeat_every, 50);
        assert!(config.operator.is_none());
    }

    #[test]
    #[serial]
    fn test_from_env_without_overrides_is_default() {
        clear_env();
        let config = RouterConfig::from_env().unwrap();
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
        assert!(config.trap_signals);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        clear_env();
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "tick_interval_ms = 5\n\n[operator]\nport = 9000").unwrap();
        std::env::set_var("CADENCE__OPERATOR__PORT", "9100");
        let config = RouterConfig::load(file.path());
        clear_env();

        let config = config.unwrap();
        assert_eq!(config.tick_interval(), Duration::from_millis(5));
        assert_eq!(config.operator.unwrap().port, 9100);
    }

    #[test]
    fn test_missing_file_is_a_config_error() {
        assert!(RouterConfig::load("/definitely/not/here.toml").is_err());
    }
}
