use config::{Config, ConfigError, Environment, File, Map};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_URL: &str = "http://bamboo.io";

#[derive(Debug, Clone, Deserialize)]
pub struct BambooSettings {
    pub connection: ConnectionSettings,
    pub poll: PollSettings,
}

/// Endpoint and credentials for a bamboo service.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollSettings {
    pub interval_ms: u64,
    pub max_interval_ms: u64,
    pub timeout_secs: u64,
}

impl BambooSettings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_dir(Path::new("config"))
    }

    pub fn from_dir(config_dir: &Path) -> Result<Self, ConfigError> {
        Self::load(config_dir, None)
    }

    /// `env` replaces the process environment when given.
    fn load(config_dir: &Path, env: Option<Map<String, String>>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let builder = Config::builder()
            .set_default("connection.url", defaults.connection.url)?
            .set_default("connection.timeout_secs", defaults.connection.timeout_secs)?
            .set_default("poll.interval_ms", defaults.poll.interval_ms)?
            .set_default("poll.max_interval_ms", defaults.poll.max_interval_ms)?
            .set_default("poll.timeout_secs", defaults.poll.timeout_secs)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // BAMBOO_CONNECTION__URL, BAMBOO_POLL__INTERVAL_MS, ...
            .add_source(
                Environment::with_prefix("BAMBOO")
                    .prefix_separator("_")
                    .separator("__")
                    .source(env),
            );

        builder.build()?.try_deserialize()
    }
}

impl ConnectionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Basic-auth pair, only when both halves are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

impl Default for BambooSettings {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            poll: PollSettings {
                interval_ms: 500,
                max_interval_ms: 8_000,
                timeout_secs: 120,
            },
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            username: None,
            password: None,
            timeout_secs: 30,
        }
    }
}
