//! Configuration for the chat server.
//!
//! Defaults match a stock local Ollama install. Every value can be overridden from
//! `OLLAMA_CHAT_*` environment variables.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::storage::session_store::DEFAULT_NAMESPACE;

/// Instructions appended to every prompt so replies render as markdown and `LaTeX`.
pub const DEFAULT_FORMAT_INSTRUCTIONS: &str = "Please format your response using markdown. \
Use **bold** for emphasis, - for bullet points, 1. for numbered lists, # for headings. \
If there are any scientific concepts, use $formula$ for inline math and $$formula$$ for block \
equations. Use `code` for inline code and ``` for code blocks.";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is out of range or cannot be parsed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A URL could not be parsed.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Convenience result alias for configuration.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Inference service settings.
    pub ollama: OllamaConfig,
    /// Session storage settings.
    pub storage: StorageConfig,
    /// HTTP server settings.
    pub server: ServerConfig,
}

/// Inference service settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Base URL of the Ollama API.
    pub base_url: String,
    /// Model to generate with.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// How long the service keeps the model loaded, e.g. `"30m"`.
    pub keep_alive: Option<String>,
    /// TCP connect timeout, in seconds.
    pub connect_timeout_secs: u64,
    /// Whole-request timeout, in seconds. Covers the full streamed reply.
    pub request_timeout_secs: u64,
    /// Text appended to every prompt; `None` sends the user text unchanged.
    pub format_instructions: Option<String>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            temperature: 0.7,
            keep_alive: None,
            connect_timeout_secs: 5,
            request_timeout_secs: 600,
            format_instructions: Some(DEFAULT_FORMAT_INSTRUCTIONS.to_string()),
        }
    }
}

impl OllamaConfig {
    /// Set the base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the model name.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set or clear the prompt formatting instructions.
    #[must_use]
    pub fn with_format_instructions(mut self, instructions: Option<String>) -> Self {
        self.format_instructions = instructions;
        self
    }

    /// Connect timeout as a [`Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Request timeout as a [`Duration`].
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Session storage settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `SQLite` database file; `None` keeps sessions in memory only.
    pub sqlite_path: Option<PathBuf>,
    /// Key the session collection is stored under.
    pub namespace: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: Some(PathBuf::from("ollama_chat.db")),
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

/// HTTP server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listening address. Loopback unless the UI is shared on the network.
    pub host: IpAddr,
    /// Listening port.
    pub port: u16,
    /// Directory of front-end assets served for unknown paths.
    pub static_dir: Option<PathBuf>,
    /// Capacity of the event broadcast channel.
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 3000,
            static_dir: None,
            event_buffer: 256,
        }
    }
}

impl ServerConfig {
    /// Socket address the server binds.
    #[must_use]
    pub const fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl ChatConfig {
    /// Defaults overridden by the process environment.
    ///
    /// # Errors
    /// Returns an error if a variable is set to an unparsable value.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup`, queried with `OLLAMA_CHAT_*` keys.
    ///
    /// # Errors
    /// Returns an error if a value cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = get("OLLAMA_CHAT_BASE_URL") {
            config.ollama.base_url = value;
        }
        if let Some(value) = get("OLLAMA_CHAT_MODEL") {
            config.ollama.model = value;
        }
        if let Some(value) = get("OLLAMA_CHAT_TEMPERATURE") {
            config.ollama.temperature = parse("OLLAMA_CHAT_TEMPERATURE", &value)?;
        }
        if let Some(value) = get("OLLAMA_CHAT_KEEP_ALIVE") {
            config.ollama.keep_alive = Some(value);
        }
        if let Some(value) = get("OLLAMA_CHAT_CONNECT_TIMEOUT_SECS") {
            config.ollama.connect_timeout_secs = parse("OLLAMA_CHAT_CONNECT_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = get("OLLAMA_CHAT_REQUEST_TIMEOUT_SECS") {
            config.ollama.request_timeout_secs = parse("OLLAMA_CHAT_REQUEST_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("OLLAMA_CHAT_FORMAT_INSTRUCTIONS") {
            // Set but empty disables the instructions.
            config.ollama.format_instructions = Some(value).filter(|text| !text.trim().is_empty());
        }
        if let Some(value) = lookup("OLLAMA_CHAT_DB_PATH") {
            config.storage.sqlite_path = Some(value)
                .filter(|path| !path.trim().is_empty() && path != ":memory:")
                .map(PathBuf::from);
        }
        if let Some(value) = get("OLLAMA_CHAT_NAMESPACE") {
            config.storage.namespace = value;
        }
        if let Some(value) = get("OLLAMA_CHAT_HOST") {
            config.server.host = parse("OLLAMA_CHAT_HOST", &value)?;
        }
        if let Some(value) = get("OLLAMA_CHAT_PORT") {
            config.server.port = parse("OLLAMA_CHAT_PORT", &value)?;
        }
        if let Some(value) = get("OLLAMA_CHAT_STATIC_DIR") {
            config.server.static_dir = Some(PathBuf::from(value));
        }

        Ok(config)
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> ConfigResult<()> {
        let base = Url::parse(&self.ollama.base_url)?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidConfig(format!(
                "ollama.base_url must be http or https, got {}",
                base.scheme()
            )));
        }

        if self.ollama.model.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "ollama.model must not be empty".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.ollama.temperature) {
            return Err(ConfigError::InvalidConfig(
                "ollama.temperature must be within 0.0..=2.0".to_string(),
            ));
        }

        if self.ollama.connect_timeout_secs == 0 || self.ollama.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "ollama timeouts must be > 0".to_string(),
            ));
        }

        if self.storage.namespace.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "storage.namespace must not be empty".to_string(),
            ));
        }

        if self.server.event_buffer == 0 {
            return Err(ConfigError::InvalidConfig(
                "server.event_buffer must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidConfig(format!("{key}: cannot parse {value:?}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ChatConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ollama.base_url, "http://localhost:11434");
        assert_eq!(config.ollama.model, "llama3.1:8b");
        assert_eq!(config.storage.namespace, "ollama_chat_history");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.bind_addr().to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn test_lookup_overrides() -> ConfigResult<()> {
        let config = ChatConfig::from_lookup(lookup(&[
            ("OLLAMA_CHAT_BASE_URL", "http://gpu-box:11434"),
            ("OLLAMA_CHAT_MODEL", "llava:13b"),
            ("OLLAMA_CHAT_TEMPERATURE", "0.2"),
            ("OLLAMA_CHAT_HOST", "0.0.0.0"),
            ("OLLAMA_CHAT_PORT", "8080"),
            ("OLLAMA_CHAT_FORMAT_INSTRUCTIONS", ""),
            ("OLLAMA_CHAT_DB_PATH", ":memory:"),
        ]))?;

        assert_eq!(config.ollama.base_url, "http://gpu-box:11434");
        assert_eq!(config.ollama.model, "llava:13b");
        assert!((config.ollama.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind_addr().to_string(), "0.0.0.0:8080");
        assert_eq!(config.ollama.format_instructions, None);
        assert_eq!(config.storage.sqlite_path, None);
        Ok(())
    }

    #[test]
    fn test_unparsable_value_is_rejected() {
        let result = ChatConfig::from_lookup(lookup(&[("OLLAMA_CHAT_PORT", "eighty")]));
        assert!(matches!(result, Err(ConfigError::InvalidConfig(msg)) if msg.contains("OLLAMA_CHAT_PORT")));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ChatConfig::default();
        config.ollama.base_url = "not a url".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Url(_))));

        let mut config = ChatConfig::default();
        config.ollama.model = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = ChatConfig::default();
        config.ollama.temperature = 3.5;
        assert!(config.validate().is_err());

        let mut config = ChatConfig::default();
        config.ollama.request_timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
