//! Client and server configuration.
//!
//! Both configs are plain serde structs so they can be loaded from JSON as
//! well as filled in through [`ClientBuilder`](crate::ClientBuilder) and
//! [`ServerBuilder`](crate::ServerBuilder). Durations are stored in
//! milliseconds (idle threshold in seconds).
//!
//! # Example
//!
//! ```
//! use pipelink::config::ServerConfig;
//!
//! let config = ServerConfig::from_json(r#"{"name":"EchoService","idle_seconds":5}"#).unwrap();
//! assert_eq!(config.request_pipe_name(), "EchoService_SERVER_PIPE");
//! assert_eq!(config.idle_threshold().as_secs(), 5);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::DEFAULT_MAX_LINE_LENGTH;
use crate::transport::{generate_pipe_token, PipeAddress, LOCAL_HOST};

/// How long a connector keeps retrying while the peer pipe does not exist.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a written frame may take to drain.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default quiet period before the idle action runs.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(60);

/// Suffix of the request pipe name.
pub const SERVER_PIPE_SUFFIX: &str = "_SERVER_PIPE";

/// Suffix of the callback pipe name.
pub const CALLBACK_PIPE_SUFFIX: &str = "_CALLBACK_PIPE";

/// Default request pipe name for a service: `<name>_SERVER_PIPE`.
pub fn server_pipe_name(name: &str) -> String {
    format!("{}{}", name, SERVER_PIPE_SUFFIX)
}

/// Default callback pipe name for a service: `<name>_CALLBACK_PIPE`.
pub fn callback_pipe_name(name: &str) -> String {
    format!("{}{}", name, CALLBACK_PIPE_SUFFIX)
}

/// Callback pipe name unique to one client: `<random>_CALLBACK_PIPE`.
pub fn random_callback_pipe_name() -> String {
    format!("{}{}", generate_pipe_token(), CALLBACK_PIPE_SUFFIX)
}

fn default_host() -> String {
    LOCAL_HOST.to_string()
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn default_connect_timeout_ms() -> u64 {
    duration_to_millis(DEFAULT_CONNECT_TIMEOUT)
}

fn default_drain_timeout_ms() -> u64 {
    duration_to_millis(DEFAULT_DRAIN_TIMEOUT)
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

fn default_idle_seconds() -> u64 {
    DEFAULT_IDLE_THRESHOLD.as_secs()
}

/// Configuration of a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Logical service name; pipe names derive from it.
    pub name: String,
    /// Request pipe override.
    #[serde(default)]
    pub server_pipe: Option<String>,
    /// Callback pipe override.
    #[serde(default)]
    pub callback_pipe: Option<String>,
    /// Host of the server's request pipe.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl ClientConfig {
    /// Defaults for service `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server_pipe: None,
            callback_pipe: None,
            host: default_host(),
            connect_timeout_ms: default_connect_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            max_line_length: default_max_line_length(),
        }
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Effective request pipe name.
    pub fn server_pipe_name(&self) -> String {
        self.server_pipe
            .clone()
            .unwrap_or_else(|| server_pipe_name(&self.name))
    }

    /// Effective callback pipe name.
    pub fn callback_pipe_name(&self) -> String {
        self.callback_pipe
            .clone()
            .unwrap_or_else(|| callback_pipe_name(&self.name))
    }

    /// Address of the server's request pipe.
    pub fn server_address(&self) -> PipeAddress {
        PipeAddress::on_host(self.server_pipe_name(), self.host.clone())
    }

    /// Address this client listens on for callbacks (always local).
    pub fn callback_address(&self) -> PipeAddress {
        PipeAddress::local(self.callback_pipe_name())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Configuration of a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Logical service name; pipe names derive from it.
    pub name: String,
    /// Request pipe override.
    #[serde(default)]
    pub request_pipe: Option<String>,
    /// Callback pipe override.
    #[serde(default)]
    pub callback_pipe: Option<String>,
    /// Host of the client's callback pipe.
    #[serde(default = "default_host")]
    pub callback_host: String,
    /// Quiet period before the idle action runs.
    #[serde(default = "default_idle_seconds")]
    pub idle_seconds: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Sub-second idle threshold; wins over `idle_seconds` when set.
    #[serde(skip)]
    pub idle_threshold_override: Option<Duration>,
}

impl ServerConfig {
    /// Defaults for service `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            request_pipe: None,
            callback_pipe: None,
            callback_host: default_host(),
            idle_seconds: default_idle_seconds(),
            connect_timeout_ms: default_connect_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            max_line_length: default_max_line_length(),
            idle_threshold_override: None,
        }
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Effective request pipe name.
    pub fn request_pipe_name(&self) -> String {
        self.request_pipe
            .clone()
            .unwrap_or_else(|| server_pipe_name(&self.name))
    }

    /// Effective callback pipe name.
    pub fn callback_pipe_name(&self) -> String {
        self.callback_pipe
            .clone()
            .unwrap_or_else(|| callback_pipe_name(&self.name))
    }

    /// Address this server listens on for requests (always local).
    pub fn request_address(&self) -> PipeAddress {
        PipeAddress::local(self.request_pipe_name())
    }

    /// Address of the client's callback pipe.
    pub fn callback_address(&self) -> PipeAddress {
        PipeAddress::on_host(self.callback_pipe_name(), self.callback_host.clone())
    }

    pub fn idle_threshold(&self) -> Duration {
        self.idle_threshold_override
            .unwrap_or_else(|| Duration::from_secs(self.idle_seconds))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
