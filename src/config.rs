//! Configuration loading and defaults.
//!
//! Two independent files are understood: the gateway's ([`Config`]) and the
//! client connector's ([`ClientConfig`]). Both resolve in order of
//! precedence (highest wins):
//!
//! 1. **Environment variables**: `ACTIONS_GATEWAY_*` (gateway only)
//! 2. **Config file**: path via `--config <path>`
//! 3. **Compiled defaults**: see each field's default value below
//!
//! Gateway file:
//!
//! ```toml
//! [server]
//! addr = "0.0.0.0:18800"
//! url = "https://gateway.example.com"   # public base URL, used for tunnel URLs
//! expose_new_token = false
//!
//! [auth]
//! secret = "at-least-32-bytes-of-secret-material"
//!
//! [logging]
//! level = "info"
//!
//! [session]
//! activation_timeout_secs = 30
//! action_timeout_secs = 30
//! ping_interval_secs = 10
//! pong_wait_secs = 15
//! ```
//!
//! Client file:
//!
//! ```toml
//! server = "https://gateway.example.com"
//! token = "<bearer token>"
//! actions_dir = "actions"        # relative to this file's directory
//! status_file = "status.json"
//! max_reconnect_attempts = 10
//! max_reconnect_backoff = 32
//!
//! [spec_info]
//! title = "My actions"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Minimum HS256 secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Top-level gateway configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:18800`). Override with `ACTIONS_GATEWAY_ADDR`.
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Public base URL of the gateway. Override with `ACTIONS_GATEWAY_URL`.
    #[serde(default = "default_url")]
    pub url: String,
    /// Serve `POST /api/new-token` (default false).
    #[serde(default)]
    pub expose_new_token: bool,
}

/// Token signing settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret. Override with `ACTIONS_GATEWAY_SECRET`. Required.
    #[serde(default)]
    pub secret: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Timing knobs for sessions and tunnels.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// A created session that is not activated within this window is dropped (default 30).
    #[serde(default = "default_activation_timeout")]
    pub activation_timeout_secs: u64,
    /// How long `POST /actions/{name}` waits for the client's result (default 30).
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,
    /// Interval between gateway → client pings (default 10).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Silence on the tunnel longer than this closes it (default 15).
    #[serde(default = "default_pong_wait")]
    pub pong_wait_secs: u64,
}

fn default_addr() -> String {
    "0.0.0.0:18800".to_string()
}
fn default_url() -> String {
    "http://localhost:18800".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_activation_timeout() -> u64 {
    30
}
fn default_action_timeout() -> u64 {
    30
}
fn default_ping_interval() -> u64 {
    10
}
fn default_pong_wait() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            url: default_url(),
            expose_new_token: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            activation_timeout_secs: default_activation_timeout(),
            action_timeout_secs: default_action_timeout(),
            ping_interval_secs: default_ping_interval(),
            pong_wait_secs: default_pong_wait(),
        }
    }
}

impl SessionConfig {
    pub fn activation_timeout(&self) -> Duration {
        Duration::from_secs(self.activation_timeout_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// Fails if the file cannot be read or parsed, or if the resulting secret
    /// is unusable.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .map_err(|e| ConfigError::Read(p.to_string(), e.to_string()))?;
                toml::from_str(&content)
                    .map_err(|e| ConfigError::Parse(p.to_string(), e.to_string()))?
            }
            None => Config::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("ACTIONS_GATEWAY_ADDR") {
            self.server.addr = addr;
        }
        if let Ok(url) = std::env::var("ACTIONS_GATEWAY_URL") {
            self.server.url = url;
        }
        if let Ok(secret) = std::env::var("ACTIONS_GATEWAY_SECRET") {
            self.auth.secret = secret;
        }
        if let Ok(v) = std::env::var("ACTIONS_GATEWAY_EXPOSE_NEW_TOKEN") {
            self.server.expose_new_token = parse_flag(&v);
        }
        if let Ok(v) = std::env::var("ACTIONS_GATEWAY_DEBUG") {
            if parse_flag(&v) {
                self.logging.level = "debug".to_string();
            }
        }
    }

    /// Reject configurations the gateway cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        if self.auth.secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::ShortSecret);
        }
        require_nonzero("session.ping_interval_secs", self.session.ping_interval_secs)?;
        require_nonzero("session.pong_wait_secs", self.session.pong_wait_secs)?;
        Ok(())
    }

    /// Base URL for tunnel connections: `http(s)://` becomes `ws(s)://`.
    pub fn websocket_url(&self) -> String {
        websocket_url(&self.server.url)
    }
}

/// Timers built from these values panic on a zero period.
fn require_nonzero(field: &'static str, secs: u64) -> Result<(), ConfigError> {
    if secs == 0 {
        return Err(ConfigError::ZeroInterval(field));
    }
    Ok(())
}

fn parse_flag(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true")
}

/// Map an HTTP base URL onto its WebSocket equivalent, without a trailing slash.
pub fn websocket_url(url: &str) -> String {
    let ws = if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{url}")
    };
    ws.trim_end_matches('/').to_string()
}

/// Client connector configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Directory holding the config file; relative paths resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
    /// Gateway base URL (`http://` or `https://`).
    pub server: String,
    /// URL advertised in the capability document. Defaults to `server`.
    #[serde(default)]
    pub server_api_url: String,
    /// Bearer token issued by the gateway.
    #[serde(default)]
    pub token: String,
    /// Directory scanned for executable actions (default `actions`).
    #[serde(default = "default_actions_dir")]
    pub actions_dir: PathBuf,
    /// Where the connector status record is persisted. Optional.
    #[serde(default)]
    pub status_file: Option<PathBuf>,
    /// Consecutive failed attempts before giving up (default 10).
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Upper bound on the reconnect backoff in seconds (default 32).
    #[serde(default = "default_max_reconnect_backoff")]
    pub max_reconnect_backoff: u64,
    /// Seconds between keepalive pings (default 10).
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    /// Seconds without a pong before the tunnel is considered dead (default 15).
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,
    #[serde(default)]
    pub spec_info: SpecInfo,
}

/// `info` object of the generated capability document.
#[derive(Debug, Clone, Deserialize)]
pub struct SpecInfo {
    #[serde(default = "default_spec_text")]
    pub title: String,
    #[serde(default = "default_spec_text")]
    pub summary: String,
    #[serde(default = "default_spec_text")]
    pub description: String,
    #[serde(default = "default_spec_version")]
    pub version: String,
}

fn default_actions_dir() -> PathBuf {
    PathBuf::from("actions")
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_max_reconnect_backoff() -> u64 {
    32
}
fn default_keepalive_interval() -> u64 {
    10
}
fn default_liveness_timeout() -> u64 {
    15
}
fn default_spec_text() -> String {
    "Actions Gateway API".to_string()
}
fn default_spec_version() -> String {
    "1.0.0".to_string()
}

impl Default for SpecInfo {
    fn default() -> Self {
        Self {
            title: default_spec_text(),
            summary: default_spec_text(),
            description: default_spec_text(),
            version: default_spec_version(),
        }
    }
}

impl ClientConfig {
    /// Build a config with defaults for everything but the server and token.
    pub fn new(server: impl Into<String>, token: impl Into<String>) -> Self {
        let server = server.into();
        Self {
            base_dir: PathBuf::from("."),
            server_api_url: server.clone(),
            server,
            token: token.into(),
            actions_dir: default_actions_dir(),
            status_file: None,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            max_reconnect_backoff: default_max_reconnect_backoff(),
            keepalive_interval_secs: default_keepalive_interval(),
            liveness_timeout_secs: default_liveness_timeout(),
            spec_info: SpecInfo::default(),
        }
    }

    /// Load a client config file and resolve its relative paths.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(display.clone(), e.to_string()))?;
        let mut config: ClientConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(display, e.to_string()))?;
        config.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        config.resolve();
        config.validate()?;
        Ok(config)
    }

    fn resolve(&mut self) {
        if self.server_api_url.is_empty() {
            self.server_api_url.clone_from(&self.server);
        }
        if self.actions_dir.is_relative() {
            self.actions_dir = self.base_dir.join(&self.actions_dir);
        }
        if let Some(ref status) = self.status_file {
            if status.is_relative() {
                self.status_file = Some(self.base_dir.join(status));
            }
        }
    }

    /// Reject settings the connector cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero("keepalive_interval_secs", self.keepalive_interval_secs)?;
        require_nonzero("liveness_timeout_secs", self.liveness_timeout_secs)?;
        Ok(())
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_backoff)
    }
}

/// Fatal configuration problems, reported before anything starts.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read. Contains `(path, reason)`.
    Read(String, String),
    /// The file is not valid TOML for this schema. Contains `(path, reason)`.
    Parse(String, String),
    /// No signing secret was configured.
    MissingSecret,
    /// The signing secret is shorter than [`MIN_SECRET_LEN`].
    ShortSecret,
    /// An interval or timeout that must be positive is zero. Contains the field name.
    ZeroInterval(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read(p, e) => write!(f, "Failed to read config file {p}: {e}"),
            ConfigError::Parse(p, e) => write!(f, "Failed to parse config file {p}: {e}"),
            ConfigError::MissingSecret => write!(
                f,
                "No secret configured: set [auth] secret or ACTIONS_GATEWAY_SECRET"
            ),
            ConfigError::ShortSecret => {
                write!(f, "Secret must be at least {MIN_SECRET_LEN} bytes")
            }
            ConfigError::ZeroInterval(field) => write!(f, "{field} must be greater than 0"),
        }
    }
}

impl std::error::Error for ConfigError {}
