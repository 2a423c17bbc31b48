use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use chorus_sfu::SfuConfig;

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub webrtc: WebrtcConfig,
    pub sfu: SfuConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origins allowed to open the signaling WebSocket, any when empty
    pub allowed_origins: Vec<String>,
    /// Largest accepted signaling message, in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8100,
            allowed_origins: Vec::new(),
            max_message_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebrtcConfig {
    /// STUN servers handed to every peer connection
    pub stun_urls: Vec<String>,
}

impl Default for WebrtcConfig {
    fn default() -> Self {
        Self {
            stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // CHORUS_SERVER__PORT, CHORUS_SFU__MAX_SIZE, CHORUS_WEBRTC__STUN_URLS=a,b
        builder = builder.add_source(
            Environment::with_prefix("CHORUS")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("webrtc.stun_urls")
                .with_list_parse_key("server.allowed_origins")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Whether a WebSocket from `origin` may connect
    #[must_use]
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        self.server.allowed_origins.is_empty()
            || self.server.allowed_origins.iter().any(|allowed| allowed == origin)
    }

    /// Validate configuration, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }
        if self.server.max_message_size == 0 {
            errors.push("server.max_message_size must be greater than 0".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }
        if let Err(sfu_errors) = self.sfu.validate() {
            errors.extend(sfu_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Load configuration: explicit path > `CHORUS_CONFIG_PATH` > `./config.yaml` >
/// `/config/config.yaml` > environment only
pub fn load_config(explicit_path: Option<&str>) -> anyhow::Result<Config> {
    let config_path = explicit_path
        .map(str::to_string)
        .or_else(|| std::env::var("CHORUS_CONFIG_PATH").ok())
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| Path::new(p).exists())
                .map(str::to_string)
        });

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path)?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env().unwrap_or_else(|e| {
            eprintln!("Failed to load config: {e}");
            eprintln!("Using default configuration");
            Config::default()
        })
    };

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    info!("Configuration loaded and validated successfully");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.http_address(), "0.0.0.0:8100");
        assert_eq!(config.sfu.max_size, 8);
        assert!(config.validate().is_ok());
        assert!(config.is_origin_allowed("https://anywhere.example"));
    }

    #[test]
    fn test_origin_allow_list() {
        let mut config = Config::default();
        config.server.allowed_origins = vec!["https://app.example".to_string()];
        assert!(config.is_origin_allowed("https://app.example"));
        assert!(!config.is_origin_allowed("https://evil.example"));
    }

    #[test]
    fn test_validate_collects_errors() {
        let mut config = Config::default();
        config.server.port = 0;
        config.logging.format = "xml".to_string();
        config.sfu.mtu = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  port: 9000\nsfu:\n  max_size: 4\n  abort_after_secs: 15\n  video_bitrate:\n    default: 400000\n    min: 200000\n    max: 800000"
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.sfu.max_size, 4);
        assert_eq!(config.sfu.abort_after_secs, Some(15));
        assert_eq!(config.sfu.video_bitrate.default, 400_000);
        assert_eq!(config.sfu.default_size, 2);
    }
}
