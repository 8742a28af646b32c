//! Connection configuration and TOML loading.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::jid;

/// Default XMPP client-to-server port (RFC 6120).
pub const DEFAULT_XMPP_PORT: u16 = 5222;

const DEFAULT_RESOURCE: &str = "parlor";

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

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to open and negotiate one XMPP session.
///
/// The `username` may be a bare local part (`alice`) or a bare JID
/// (`alice@example.com`). The domain part is the realm used for every
/// user address the MUC extension builds; when absent, `host` stands in.
#[derive(Clone, Deserialize)]
pub struct ConnectionConfig {
    pub username: String,
    pub password: String,
    pub host: String,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_resource")]
    pub resource: String,
    /// Skips disco#items lookup when set.
    pub muc_server: Option<String>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// The three deadlines used while talking to the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimeoutConfig {
    /// Channel open (TCP connect plus optional TLS handshake).
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    /// Length of one readability poll inside `wait_for`.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Overall deadline for one correlated reply.
    #[serde(default = "default_response_secs")]
    pub response_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            response_secs: default_response_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn response(&self) -> Duration {
        Duration::from_secs(self.response_secs)
    }
}

fn default_port() -> u16 {
    DEFAULT_XMPP_PORT
}

fn default_resource() -> String {
    DEFAULT_RESOURCE.to_string()
}

fn default_connect_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_response_secs() -> u64 {
    10
}

impl ConnectionConfig {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            host: host.into(),
            use_encryption: false,
            port: DEFAULT_XMPP_PORT,
            resource: default_resource(),
            muc_server: None,
            timeouts: TimeoutConfig::default(),
        }
    }

    pub fn with_encryption(mut self, use_encryption: bool) -> Self {
        self.use_encryption = use_encryption;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    pub fn with_muc_server(mut self, muc_server: impl Into<String>) -> Self {
        self.muc_server = Some(muc_server.into());
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Realm of the account: domain part of `username`, or `host`.
    pub fn domain(&self) -> &str {
        jid::domain_part(&self.username).unwrap_or(&self.host)
    }

    /// Local part of the account (`alice` for `alice@example.com`).
    pub fn local_part(&self) -> &str {
        jid::local_part(&self.username)
    }

    /// Bare JID of the account, `local@realm`.
    pub fn bare_jid(&self) -> String {
        jid::full_user_id(self.local_part(), self.domain(), "")
    }

    /// `host:port` as handed to the channel.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("use_encryption", &self.use_encryption)
            .field("port", &self.port)
            .field("resource", &self.resource)
            .field("muc_server", &self.muc_server)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

#[derive(Debug, Default)]
struct ConfigOverrides {
    username: Option<String>,
    password: Option<String>,
    host: Option<String>,
    muc_server: Option<String>,
}

/// Load a connection configuration from a TOML file, merging
/// `PARLOR_*` environment overrides.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<ConnectionConfig, ConfigError> {
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

/// Parse a connection configuration from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<ConnectionConfig, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<ConnectionConfig, ConfigError> {
    let mut config: ConnectionConfig = toml::from_str(toml_str).map_err(|e| {
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

    apply_overrides(&mut config, overrides);
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        username: std::env::var("PARLOR_USERNAME").ok(),
        password: std::env::var("PARLOR_PASSWORD").ok(),
        host: std::env::var("PARLOR_HOST").ok(),
        muc_server: std::env::var("PARLOR_MUC_SERVER").ok(),
    }
}

fn apply_overrides(config: &mut ConnectionConfig, overrides: ConfigOverrides) {
    if let Some(username) = overrides.username {
        config.username = username;
    }
    if let Some(password) = overrides.password {
        config.password = password;
    }
    if let Some(host) = overrides.host {
        config.host = host;
    }
    if let Some(muc_server) = overrides.muc_server {
        config.muc_server = Some(muc_server);
    }
}

fn validate(config: &ConnectionConfig) -> Result<(), ConfigError> {
    let mut missing = Vec::new();

    if config.username.is_empty() {
        missing.push("username".to_string());
    }
    if config.password.is_empty() {
        missing.push("password".to_string());
    }
    if config.host.is_empty() {
        missing.push("host".to_string());
    }

    if !missing.is_empty() {
        return Err(ConfigError::MissingRequiredFields { fields: missing });
    }

    if config.port == 0 {
        return Err(ConfigError::InvalidValue {
            field: "port".to_string(),
            message: "must be non-zero".to_string(),
        });
    }

    if config.timeouts.poll_interval_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "timeouts.poll_interval_ms".to_string(),
            message: "must be non-zero".to_string(),
        });
    }

    Ok(())
}
