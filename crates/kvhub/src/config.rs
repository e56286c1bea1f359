//! Connection configuration.
//!
//! A configuration file names every connection the process uses:
//!
//! ```toml
//! [connections.default]
//! host = "127.0.0.1"
//! port = 6379
//!
//! [connections.cache]
//! host = "cache.internal"
//! db = 2
//!
//! [logging]
//! level = "info"
//! ```
//!
//! `KVHUB_HOST`, `KVHUB_PORT`, `KVHUB_PASSWORD` and `KVHUB_LOG_LEVEL` override
//! the corresponding settings of the `default` connection and logging.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use percent_encoding::percent_decode_str;
use serde::Deserialize;
use url::Url;

/// Name of the connection the default router forwards to.
pub const DEFAULT_CONNECTION: &str = "default";

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: String },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("configuration must define a 'default' connection")]
    MissingDefault,

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Options for one named connection.
///
/// Reconnect backoff, offline queueing and per-request retries are not
/// configurable here; see [`ResiliencePolicy`](crate::ResiliencePolicy).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    /// Logical database index selected after connecting.
    pub db: u32,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Name announced with `CLIENT SETNAME`.
    pub connection_name: Option<String>,
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            username: None,
            password: None,
            connection_name: None,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ConnectionOptions {
    /// Options for `host:port` with every other setting at its default.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Parse a `redis://[user:password@]host[:port][/db]` URL.
    pub fn from_url(input: &str) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            field: "url".to_string(),
            message,
        };

        let url = Url::parse(input).map_err(|e| invalid(e.to_string()))?;
        if url.scheme() != "redis" {
            return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
        }

        let mut options = Self::default();
        options.host = url
            .host_str()
            .ok_or_else(|| invalid("missing host".to_string()))?
            .to_string();
        if let Some(port) = url.port() {
            options.port = port;
        }
        let decode = |raw: &str, part: &str| {
            percent_decode_str(raw)
                .decode_utf8()
                .map(|text| text.into_owned())
                .map_err(|_| invalid(format!("{} is not valid UTF-8", part)))
        };
        if !url.username().is_empty() {
            options.username = Some(decode(url.username(), "username")?);
        }
        options.password = url.password().map(|raw| decode(raw, "password")).transpose()?;

        let path = url.path().trim_start_matches('/');
        if !path.is_empty() {
            options.db = path
                .parse()
                .map_err(|_| invalid(format!("invalid database index '{}'", path)))?;
        }

        Ok(options)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `host:port` for dialing.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Mapping from connection name to its options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ConfigSet(BTreeMap<String, ConnectionOptions>);

impl ConfigSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the connection `name`.
    pub fn with(mut self, name: impl Into<String>, options: ConnectionOptions) -> Self {
        self.insert(name, options);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, options: ConnectionOptions) {
        self.0.insert(name.into(), options);
    }

    pub fn get(&self, name: &str) -> Option<&ConnectionOptions> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConnectionOptions)> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Check that the set can initialize a registry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.contains(DEFAULT_CONNECTION) {
            return Err(ConfigError::MissingDefault);
        }
        for (name, options) in self.iter() {
            if name.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "connections".to_string(),
                    message: "connection names must not be empty".to_string(),
                });
            }
            if options.host.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("connections.{}.host", name),
                    message: "must not be empty".to_string(),
                });
            }
            if options.port == 0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("connections.{}.port", name),
                    message: "must be between 1 and 65535".to_string(),
                });
            }
            if options.connect_timeout_ms == 0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("connections.{}.connect_timeout_ms", name),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}

impl FromIterator<(String, ConnectionOptions)> for ConfigSet {
    fn from_iter<I: IntoIterator<Item = (String, ConnectionOptions)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connections: ConfigSet,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    host: Option<String>,
    port: Option<String>,
    password: Option<String>,
    log_level: Option<String>,
}

/// Load configuration from a file, applying environment overrides.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            });
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, config_overrides_from_env())
}

/// Parse configuration from a TOML string, applying environment overrides.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides)?;
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        host: std::env::var("KVHUB_HOST").ok(),
        port: std::env::var("KVHUB_PORT").ok(),
        password: std::env::var("KVHUB_PASSWORD").ok(),
        log_level: std::env::var("KVHUB_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) -> Result<(), ConfigError> {
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }

    if overrides.host.is_none() && overrides.port.is_none() && overrides.password.is_none() {
        return Ok(());
    }

    let mut options = config
        .connections
        .get(DEFAULT_CONNECTION)
        .cloned()
        .unwrap_or_default();
    if let Some(host) = overrides.host {
        options.host = host;
    }
    if let Some(port) = overrides.port {
        options.port = port.parse().map_err(|_| ConfigError::InvalidValue {
            field: "KVHUB_PORT".to_string(),
            message: format!("'{}' is not a port number", port),
        })?;
    }
    if let Some(password) = overrides.password {
        options.password = Some(password);
    }
    config.connections.insert(DEFAULT_CONNECTION, options);
    Ok(())
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    config.connections.validate()?;

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    Ok(())
}
