//! Proxy configuration: YAML schema, defaults, loading, validation.
//!
//! The config lives at `<state-dir>/config.yaml`. A missing file is not an
//! error — defaults cover the common providers and a loopback bind.

use crate::error::{CtrlAiError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level CtrlAI proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind address for the proxy server.
    pub server: ServerConfig,
    /// Upstream LLM providers, keyed by the URL path segment. A config
    /// that omits the table keeps the stock providers.
    #[serde(default = "default_providers")]
    pub providers: BTreeMap<String, ProviderConfig>,
    /// SSE response buffering behavior.
    pub streaming: StreamingConfig,
    /// Structured logging settings.
    pub logging: LoggingConfig,
}

/// Where the proxy listens. Defaults to loopback only — the proxy carries
/// upstream API credentials in forwarded headers and must not be exposed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// One upstream LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the real LLM API; the downstream path is appended.
    pub upstream: String,
}

/// SSE buffering behavior.
///
/// `buffer = true` (the default) buffers the entire event stream before
/// replaying it to the SDK so tool calls that arrive incrementally can be
/// inspected. `buffer_timeout_ms` bounds how long a stream is held before
/// the proxy proceeds with whatever events have arrived.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub buffer: bool,
    pub buffer_timeout_ms: u64,
}

/// Structured logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (`trace`..`error`). `RUST_LOG` wins.
    pub level: String,
    /// Output format: `text` or `json`.
    pub format: String,
}

fn default_providers() -> BTreeMap<String, ProviderConfig> {
    let mut providers = BTreeMap::new();
    for (key, upstream) in [
        ("anthropic", "https://api.anthropic.com"),
        ("openai", "https://api.openai.com"),
        ("moonshot", "https://api.moonshot.cn"),
        ("qwen", "https://dashscope.aliyuncs.com/compatible-mode"),
        ("minimax", "https://api.minimax.io"),
        ("zhipu", "https://open.bigmodel.cn/api"),
    ] {
        providers.insert(
            key.to_string(),
            ProviderConfig {
                upstream: upstream.to_string(),
            },
        );
    }
    providers
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            providers: default_providers(),
            streaming: StreamingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3100,
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffer: true,
            buffer_timeout_ms: 30_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// A missing file yields defaults (normal before first-run setup has
    /// written one). Invalid YAML or validation failures are errors.
    pub fn load(path: &Path) -> Result<Config> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Config::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => return Err(e.into()),
        };
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for logical errors after parsing.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(CtrlAiError::Config("server.host must not be empty".into()));
        }
        if self.server.port == 0 {
            return Err(CtrlAiError::Config("server.port must not be 0".into()));
        }
        for (name, provider) in &self.providers {
            if provider.upstream.is_empty() {
                return Err(CtrlAiError::Config(format!(
                    "provider {name:?}: upstream URL is required"
                )));
            }
        }
        Ok(())
    }

    /// The `host:port` string the server binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Default state directory: `~/.ctrlai`, falling back to the relative
/// `.ctrlai` when `HOME` is unset (containers).
pub fn default_state_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".ctrlai"),
        None => PathBuf::from(".ctrlai"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_yaml(yaml: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3100);
        assert!(config.streaming.buffer);
        assert_eq!(config.streaming.buffer_timeout_ms, 30_000);
        assert_eq!(config.logging.level, "info");
        assert_eq!(
            config.providers.get("anthropic").unwrap().upstream,
            "https://api.anthropic.com"
        );
        assert!(config.providers.contains_key("zhipu"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load(Path::new("/nonexistent/ctrlai/config.yaml")).unwrap();
        assert_eq!(config.server.port, 3100);
    }

    #[test]
    fn test_load_partial_yaml_keeps_defaults() {
        let f = write_yaml("server:\n  port: 4000\n");
        let config = Config::load(f.path()).unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(config.streaming.buffer);
        // Omitting the provider table keeps the stock providers.
        assert!(config.providers.contains_key("anthropic"));
    }

    #[test]
    fn test_load_full_yaml() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 3200
providers:
  anthropic:
    upstream: "http://localhost:9999"
streaming:
  buffer: false
  buffer_timeout_ms: 5000
logging:
  level: "debug"
  format: "json"
"#;
        let f = write_yaml(yaml);
        let config = Config::load(f.path()).unwrap();
        assert_eq!(config.server.port, 3200);
        assert!(!config.streaming.buffer);
        assert_eq!(config.streaming.buffer_timeout_ms, 5000);
        assert_eq!(
            config.providers.get("anthropic").unwrap().upstream,
            "http://localhost:9999"
        );
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_load_invalid_yaml() {
        let f = write_yaml("server: [not, a, map");
        assert!(Config::load(f.path()).is_err());
    }

    #[test]
    fn test_validate_empty_host() {
        let mut config = Config::default();
        config.server.host = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_upstream() {
        let mut config = Config::default();
        config.providers.insert(
            "broken".to_string(),
            ProviderConfig {
                upstream: String::new(),
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_listen_addr() {
        let config = Config::default();
        assert_eq!(config.listen_addr(), "127.0.0.1:3100");
    }

    #[test]
    fn test_config_round_trips_through_yaml() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
        assert_eq!(parsed.providers.len(), config.providers.len());
    }
}
