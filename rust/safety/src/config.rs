use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::sync::RwLock;

use crate::error::{SafetyError, SafetyResult};

/// Global configuration instance
static CONFIG: RwLock<Option<Config>> = RwLock::new(None);

/// Mock server configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared-secret authentication
    #[serde(default)]
    pub auth: AuthConfig,

    /// Prometheus endpoint configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default: localhost)
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind (default: 9090)
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared secret; unset or empty disables authentication
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve `/metrics` over HTTP (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port (default: 2113)
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    9090
}
fn default_metrics_port() -> u16 {
    2113
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl AuthConfig {
    /// The configured token, empty when authentication is off.
    pub fn token(&self) -> &str {
        self.token.as_deref().unwrap_or_default()
    }
}

impl Config {
    /// Load configuration from file or environment
    pub fn load() -> SafetyResult<Self> {
        match env::var("SAFETY_CONFIG_PATH") {
            Ok(path) if !path.is_empty() => Self::from_file(&path),
            _ => Ok(Self::from_env(Self::default())),
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: &str) -> SafetyResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            SafetyError::ConfigurationError(format!("Failed to read config file: {e}"))
        })?;

        let config: Config = serde_yaml::from_str(&content).map_err(|e| {
            SafetyError::ConfigurationError(format!("Failed to parse config: {e}"))
        })?;

        // Apply environment overrides
        Ok(Self::from_env(config))
    }

    /// Override configuration with environment variables
    pub fn from_env(mut config: Config) -> Self {
        if let Ok(v) = env::var("AUTH_TOKEN") {
            config.auth.token = (!v.is_empty()).then_some(v);
        }

        if let Ok(v) = env::var("SAFETY_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                config.server.port = port;
            }
        }

        if let Ok(v) = env::var("METRICS_ENABLED") {
            if let Ok(enabled) = v.parse::<bool>() {
                config.metrics.enabled = enabled;
            }
        }
        if let Ok(v) = env::var("METRICS_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                config.metrics.port = port;
            }
        }

        config
    }

    /// Get the global configuration instance
    pub fn global() -> SafetyResult<Config> {
        let guard = CONFIG.read()?;

        if let Some(ref config) = *guard {
            Ok(config.clone())
        } else {
            drop(guard);
            Self::initialize()
        }
    }

    /// Initialize the global configuration
    pub fn initialize() -> SafetyResult<Config> {
        let config = Self::load()?;
        *CONFIG.write()? = Some(config.clone());
        Ok(config)
    }

    /// Update the global configuration
    pub fn update(config: Config) -> SafetyResult<()> {
        *CONFIG.write()? = Some(config);
        Ok(())
    }

    /// Address the binary listens on
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
