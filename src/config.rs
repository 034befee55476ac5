//! Client Configuration
//!
//! Defaults suit two clients on one machine. Every field can be overridden
//! from the environment (`PEER_CHESS_*`) and, in the binary, from flags.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::directory::DirectoryBackend;
use crate::network::connection::ConnectionConfig;
use crate::network::registrar::RegistrarConfig;

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// What went wrong.
        reason: String,
    },

    /// A duration that must be positive is zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    /// Heartbeats would not keep a room alive.
    #[error("heartbeat interval {heartbeat:?} must be less than half the liveness window {liveness:?}")]
    HeartbeatTooSlow {
        /// Configured heartbeat interval.
        heartbeat: Duration,
        /// Configured liveness window.
        liveness: Duration,
    },
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Address the host listens on for guests.
    pub bind_addr: SocketAddr,
    /// Host name written into the advertised endpoint.
    pub advertise_host: String,
    /// Upper bound for a dial.
    pub dial_timeout: Duration,
    /// Upper bound for an inbound guest's handshake.
    pub handshake_timeout: Duration,
    /// Heartbeat period while hosting.
    pub heartbeat_interval: Duration,
    /// Maximum record age since last heartbeat.
    pub liveness_window: Duration,
    /// Expired-room sweep period, `None` to disable.
    pub sweep_interval: Option<Duration>,
    /// Rooms created longer ago than this are swept.
    pub max_room_age: Duration,
    /// Open-room polling period.
    pub discovery_interval: Duration,
    /// Directory backend.
    pub directory: DirectoryBackend,
    /// File remembering hosted and joined rooms, `None` keeps them in memory.
    pub recent_rooms: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            advertise_host: "127.0.0.1".to_string(),
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(12),
            liveness_window: Duration::from_secs(120),
            sweep_interval: Some(Duration::from_secs(60)),
            max_room_age: Duration::from_secs(24 * 60 * 60),
            discovery_interval: Duration::from_secs(5),
            directory: DirectoryBackend::Memory,
            recent_rooms: None,
        }
    }
}

fn invalid(name: &'static str, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        reason: reason.to_string(),
    }
}

fn millis_var(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    match lookup(name) {
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| invalid(name, e)),
        None => Ok(None),
    }
}

impl ClientConfig {
    /// Load from `PEER_CHESS_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source over the defaults.
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `PEER_CHESS_BIND` | listen address |
    /// | `PEER_CHESS_ADVERTISE_HOST` | host in the advertised endpoint |
    /// | `PEER_CHESS_DIAL_TIMEOUT_MS` | dial timeout |
    /// | `PEER_CHESS_HEARTBEAT_MS` | heartbeat interval |
    /// | `PEER_CHESS_LIVENESS_MS` | liveness window |
    /// | `PEER_CHESS_SWEEP_MS` | sweep interval, `0` disables |
    /// | `PEER_CHESS_DIRECTORY` | `memory` or `file:<path>` |
    /// | `PEER_CHESS_RECENT` | recent-rooms file, empty for memory |
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(bind) = lookup("PEER_CHESS_BIND") {
            config.bind_addr = bind.trim().parse().map_err(|e| invalid("PEER_CHESS_BIND", e))?;
        }
        if let Some(host) = lookup("PEER_CHESS_ADVERTISE_HOST") {
            config.advertise_host = host.trim().to_string();
        }
        if let Some(timeout) = millis_var(&lookup, "PEER_CHESS_DIAL_TIMEOUT_MS")? {
            config.dial_timeout = timeout;
        }
        if let Some(interval) = millis_var(&lookup, "PEER_CHESS_HEARTBEAT_MS")? {
            config.heartbeat_interval = interval;
        }
        if let Some(window) = millis_var(&lookup, "PEER_CHESS_LIVENESS_MS")? {
            config.liveness_window = window;
        }
        if let Some(sweep) = millis_var(&lookup, "PEER_CHESS_SWEEP_MS")? {
            config.sweep_interval = (!sweep.is_zero()).then_some(sweep);
        }
        if let Some(directory) = lookup("PEER_CHESS_DIRECTORY") {
            config.directory = directory
                .trim()
                .parse()
                .map_err(|e| invalid("PEER_CHESS_DIRECTORY", e))?;
        }

        if let Some(recent) = lookup("PEER_CHESS_RECENT") {
            let recent = recent.trim();
            config.recent_rooms = (!recent.is_empty()).then(|| PathBuf::from(recent));
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the timing invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("dial_timeout", self.dial_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("liveness_window", self.liveness_window),
            ("max_room_age", self.max_room_age),
            ("discovery_interval", self.discovery_interval),
        ];
        for (name, value) in required {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.heartbeat_interval >= self.liveness_window / 2 {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                liveness: self.liveness_window,
            });
        }
        Ok(())
    }

    /// Registrar timing.
    pub fn registrar_config(&self) -> RegistrarConfig {
        RegistrarConfig {
            heartbeat_interval: self.heartbeat_interval,
            liveness_window: self.liveness_window,
            sweep_interval: self.sweep_interval,
            max_room_age: self.max_room_age,
            discovery_interval: self.discovery_interval,
        }
    }

    /// Connection timing.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            dial_timeout: self.dial_timeout,
            handshake_timeout: self.handshake_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.liveness_window, Duration::from_secs(120));
        assert!(config.heartbeat_interval < config.liveness_window / 2);
    }

    #[test]
    fn test_lookup_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("PEER_CHESS_BIND", "0.0.0.0:7000"),
            ("PEER_CHESS_ADVERTISE_HOST", "192.168.1.20"),
            ("PEER_CHESS_DIAL_TIMEOUT_MS", "2500"),
            ("PEER_CHESS_SWEEP_MS", "0"),
            ("PEER_CHESS_DIRECTORY", "file:/tmp/rooms.json"),
            ("PEER_CHESS_RECENT", " /tmp/recent.json "),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr.port(), 7000);
        assert_eq!(config.advertise_host, "192.168.1.20");
        assert_eq!(config.dial_timeout, Duration::from_millis(2500));
        assert_eq!(config.sweep_interval, None);
        assert_eq!(config.directory, DirectoryBackend::File(PathBuf::from("/tmp/rooms.json")));
        assert_eq!(config.recent_rooms, Some(PathBuf::from("/tmp/recent.json")));

        let config = ClientConfig::from_lookup(lookup(&[("PEER_CHESS_RECENT", "")])).unwrap();
        assert_eq!(config.recent_rooms, None);
    }

    #[test]
    fn test_bad_values_rejected() {
        let err = ClientConfig::from_lookup(lookup(&[("PEER_CHESS_DIAL_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "PEER_CHESS_DIAL_TIMEOUT_MS", .. }));

        let err = ClientConfig::from_lookup(lookup(&[("PEER_CHESS_DIRECTORY", "redis")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "PEER_CHESS_DIRECTORY", .. }));
    }

    #[test]
    fn test_heartbeat_must_beat_half_window() {
        let err = ClientConfig::from_lookup(lookup(&[("PEER_CHESS_HEARTBEAT_MS", "60000")])).unwrap_err();
        assert!(matches!(err, ConfigError::HeartbeatTooSlow { .. }));

        let config = ClientConfig {
            heartbeat_interval: Duration::from_secs(59),
            ..ClientConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_duration_rejected() {
        let config = ClientConfig {
            discovery_interval: Duration::ZERO,
            ..ClientConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroDuration("discovery_interval")));
    }
}
