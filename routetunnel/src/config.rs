use std::{net::SocketAddr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::{TunnelGrant, UserGrant};

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_FORWARD_TIMEOUT_SECS: f64 = 30.0;
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: f64 = 10.0;
pub const DEFAULT_KEEPALIVE_GRACE: u32 = 3;
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// What to do when a second control connection claims a route that is
/// already connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplacementPolicy {
    /// Last writer wins: the newcomer is installed and the old one closed.
    #[default]
    Replace,
    /// The newcomer is refused with `AlreadyExists`.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub forward_timeout_secs: f64,
    pub keepalive_interval_secs: f64,
    pub keepalive_grace: u32,
    pub max_body_bytes: usize,
    pub replacement: ReplacementPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            forward_timeout_secs: DEFAULT_FORWARD_TIMEOUT_SECS,
            keepalive_interval_secs: DEFAULT_KEEPALIVE_INTERVAL_SECS,
            keepalive_grace: DEFAULT_KEEPALIVE_GRACE,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            replacement: ReplacementPolicy::default(),
        }
    }
}

impl RelayConfig {
    pub fn forward_timeout(&self) -> Duration {
        secs_or(self.forward_timeout_secs, DEFAULT_FORWARD_TIMEOUT_SECS)
    }

    pub fn keepalive_interval(&self) -> Duration {
        secs_or(self.keepalive_interval_secs, DEFAULT_KEEPALIVE_INTERVAL_SECS)
    }

    /// Silence longer than this marks a tunnel dead.
    pub fn keepalive_deadline(&self) -> Duration {
        self.keepalive_interval() * self.keepalive_grace.max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive_secs("relay.forward_timeout_secs", self.forward_timeout_secs)?;
        positive_secs("relay.keepalive_interval_secs", self.keepalive_interval_secs)?;
        if self.keepalive_grace == 0 {
            return Err(ConfigError::InvalidValue {
                key: "relay.keepalive_grace",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "relay.max_body_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Everything the relay server binary needs to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub tunnels: Vec<TunnelGrant>,

    #[serde(default)]
    pub users: Vec<UserGrant>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            relay: RelayConfig::default(),
            tunnels: Vec::new(),
            users: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.relay.validate()?;
        let mut seen = std::collections::HashSet::new();
        for grant in &self.tunnels {
            if !seen.insert(grant.route.as_str()) {
                return Err(ConfigError::InvalidValue {
                    key: "tunnels",
                    reason: format!("route {} is declared twice", grant.route),
                });
            }
        }
        Ok(())
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
}

fn secs_or(value: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_else(|_| Duration::from_secs_f64(fallback))
}

fn positive_secs(key: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            key,
            reason: format!("expected a positive number of seconds, got {value}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.forward_timeout(), Duration::from_secs(30));
        assert_eq!(config.keepalive_interval(), Duration::from_secs(10));
        assert_eq!(config.keepalive_deadline(), Duration::from_secs(30));
        assert_eq!(config.replacement, ReplacementPolicy::Replace);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_and_negative_durations() {
        let config = RelayConfig {
            forward_timeout_secs: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            keepalive_interval_secs: -1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            keepalive_grace: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: ServerConfig = serde_json::from_str(
            r#"{ "relay": { "forward_timeout_secs": 2.5, "replacement": "reject" } }"#,
        )
        .unwrap();
        assert_eq!(config.listen, default_listen());
        assert_eq!(config.relay.forward_timeout(), Duration::from_millis(2500));
        assert_eq!(config.relay.keepalive_grace, DEFAULT_KEEPALIVE_GRACE);
        assert_eq!(config.relay.replacement, ReplacementPolicy::Reject);
    }
}
