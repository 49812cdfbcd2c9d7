//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = self.to_toml()?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, crate::Error> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))
    }
}

/// Credentials accepted from clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub user: String,
    pub password: String,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Control and proxy connection listen address
    pub listen: String,
    /// Browser-facing HTTP listen address
    pub http_listen: Option<String>,
    /// Browser-facing HTTPS listen address (requires TLS)
    pub https_listen: Option<String>,
    /// Base domain for generated subdomains
    pub domain: String,
    /// Public HTTP port, shown in tunnel URLs unless it is 80
    pub http_port: u16,
    /// Public HTTPS port, shown in tunnel URLs unless it is 443
    pub https_port: u16,
    /// TLS certificate path (PEM)
    pub tls_cert: Option<String>,
    /// TLS key path (PEM)
    pub tls_key: Option<String>,
    /// Maximum concurrent control and proxy connections
    pub max_connections: usize,
    /// How long a proxy connection waits for a browser request
    pub assignment_timeout_secs: u64,
    /// Accepted credentials; empty accepts everyone
    pub users: Vec<UserConfig>,
    /// Bytes requested per socket read
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", crate::DEFAULT_PORT),
            http_listen: Some("0.0.0.0:80".to_string()),
            https_listen: None,
            domain: "tunnel.local".to_string(),
            http_port: 80,
            https_port: 443,
            tls_cert: None,
            tls_key: None,
            max_connections: 1000,
            assignment_timeout_secs: 30,
            users: Vec::new(),
            read_buffer_size: 16 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn assignment_timeout(&self) -> Duration {
        Duration::from_secs(self.assignment_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: ServerConfig {
            https_listen: Some("0.0.0.0:443".to_string()),
            domain: "tunnel.example.com".to_string(),
            tls_cert: Some("/etc/tunnel/cert.pem".to_string()),
            tls_key: Some("/etc/tunnel/key.pem".to_string()),
            users: vec![UserConfig {
                user: "demo".to_string(),
                password: "change-me".to_string(),
            }],
            ..Default::default()
        },
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_config() {
        let config = Config::parse(
            r#"
            [server]
            listen = "127.0.0.1:4000"
            domain = "t.example.com"
            assignment_timeout_secs = 5

            [[server.users]]
            user = "u"
            password = "p"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:4000");
        assert_eq!(config.server.domain, "t.example.com");
        assert_eq!(config.server.assignment_timeout(), Duration::from_secs(5));
        assert_eq!(config.server.users.len(), 1);
        assert_eq!(config.server.http_port, 80);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:4443");
        assert!(config.server.users.is_empty());
    }

    #[test]
    fn test_example_round_trips() {
        let example = generate_example_config();
        let text = example.to_toml().unwrap();
        let parsed = Config::parse(&text).unwrap();

        assert_eq!(parsed.server.domain, "tunnel.example.com");
        assert_eq!(parsed.server.users, example.server.users);
        assert_eq!(parsed.server.tls_cert, example.server.tls_cert);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            Config::parse("[server]\nmax_connections = \"lots\""),
            Err(crate::Error::Config(_))
        ));
    }
}
