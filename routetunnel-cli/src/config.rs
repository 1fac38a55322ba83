use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use ::config::{Config as Settings, Environment, File};
use routetunnel::{
    RelayConfig, ServerConfig,
    auth::{TunnelGrant, UserGrant},
    config::ConfigError,
};
use serde::Deserialize;
use thiserror::Error;

use crate::sys;

const USER_PATH: &str = "routetunnel/config.toml";
const ENV_PREFIX: &str = "ROUTETUNNEL";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to read configuration: {0}")]
    Source(#[from] ::config::ConfigError),

    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

/// Contents of the user config file, merged with `ROUTETUNNEL_*` overrides.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    server: ServerSection,

    #[serde(default)]
    relay: RelayConfig,

    #[serde(default)]
    tunnels: Vec<TunnelGrant>,

    #[serde(default)]
    users: Vec<UserGrant>,

    #[serde(default)]
    profile: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    #[serde(default = "default_listen")]
    listen: SocketAddr,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> SocketAddr {
    ServerConfig::default().listen
}

/// Tunnel client defaults for one named profile.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileConfig {
    pub server_url: Option<String>,
    pub token: Option<String>,
    pub route: Option<String>,
}

impl Config {
    pub fn user_path() -> Option<PathBuf> {
        sys::dirs::config_dir().map(|config_dir| config_dir.join(USER_PATH))
    }

    /// Loads `path`, or the user config file when none is given.
    ///
    /// An explicit path must exist; the default one is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, LoadError> {
        let mut builder = Settings::builder();
        match path {
            Some(path) => builder = builder.add_source(File::from(path).required(true)),
            None => {
                if let Some(path) = Self::user_path() {
                    builder = builder.add_source(File::from(path).required(false));
                }
            }
        }
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.server_config().validate()?;
        Ok(config)
    }

    pub fn get_profile(&self, name: &str) -> Option<&ProfileConfig> {
        self.profile.get(name)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen: self.server.listen,
            relay: self.relay.clone(),
            tunnels: self.tunnels.clone(),
            users: self.users.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use routetunnel::ReplacementPolicy;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_full_file() {
        let file = write_config(
            r#"
            [server]
            listen = "127.0.0.1:9000"

            [relay]
            forward_timeout_secs = 5
            keepalive_grace = 2
            replacement = "reject"

            [[tunnels]]
            route = "demo"
            token = "demo-token"
            owner = "alice"
            public = true

            [[users]]
            name = "alice"
            token = "alice-key"

            [profile.default]
            server_url = "http://relay.local:9000"
            route = "demo"
            token = "demo-token"
            "#,
        );
        let config = Config::load(Some(file.path())).unwrap();

        let server = config.server_config();
        assert_eq!(server.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(server.relay.forward_timeout_secs, 5.0);
        assert_eq!(server.relay.keepalive_grace, 2);
        assert_eq!(server.relay.keepalive_interval_secs, 10.0);
        assert_eq!(server.relay.replacement, ReplacementPolicy::Reject);
        assert_eq!(server.tunnels.len(), 1);
        assert_eq!(server.tunnels[0].route.as_str(), "demo");
        assert_eq!(server.users[0].name, "alice");

        let profile = config.get_profile("default").unwrap();
        assert_eq!(profile.server_url.as_deref(), Some("http://relay.local:9000"));
        assert!(config.get_profile("other").is_none());
    }

    #[test]
    fn test_defaults_for_empty_file() {
        let file = write_config("");
        let config = Config::load(Some(file.path())).unwrap();
        let server = config.server_config();
        assert_eq!(server.listen, "0.0.0.0:8000".parse().unwrap());
        assert_eq!(server.relay, RelayConfig::default());
        assert!(server.tunnels.is_empty());
    }

    #[test]
    fn test_rejects_invalid_values() {
        let file = write_config("[relay]\nkeepalive_grace = 0\n");
        assert!(matches!(
            Config::load(Some(file.path())),
            Err(LoadError::Invalid(_))
        ));

        let file = write_config("[[tunnels]]\nroute = \"no way\"\ntoken = \"t\"\nowner = \"o\"\n");
        assert!(matches!(
            Config::load(Some(file.path())),
            Err(LoadError::Source(_))
        ));
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(Config::load(Some(&missing)).is_err());
    }
}
