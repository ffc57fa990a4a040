//! Configuration types for Tapedeck

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{Result, TapedeckError};

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Record mode: forward upstream and persist snapshots
    Record,
    /// Replay mode: serve from persisted snapshots only
    Replay,
}

impl Mode {
    /// Check if mode is Record
    #[must_use]
    pub fn is_record(&self) -> bool {
        matches!(self, Mode::Record)
    }

}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Fixture root directory
    pub out: PathBuf,
    /// Record (true) or replay (false)
    #[serde(default)]
    pub record: bool,
    /// Listen address
    #[serde(default = "default_listen_host")]
    pub host: String,
    /// Plain HTTP listen port; HTTPS listens on `port + 1`
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upstream identity
    pub mock: MockConfig,
    /// Route prefix to directory, served ahead of the proxy
    #[serde(default, rename = "static")]
    pub static_routes: IndexMap<String, PathBuf>,
    /// Listener certificate material
    #[serde(default)]
    pub ssl: Option<SslConfig>,
    /// Resource limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Upstream ("mock target") configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockConfig {
    /// Upstream host, optionally with port
    pub host: String,
    /// Upstream scheme; `https`, `https:` and `https://` are all accepted
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Validate the upstream certificate while recording
    #[serde(default)]
    pub verify_tls: bool,
}

impl MockConfig {
    /// Scheme without trailing `:` or `://`
    #[must_use]
    pub fn scheme(&self) -> &str {
        let protocol = self.protocol.trim();
        protocol
            .strip_suffix("://")
            .or_else(|| protocol.strip_suffix(':'))
            .unwrap_or(protocol)
    }

    /// Upstream origin, e.g. `https://api.example.com`
    #[must_use]
    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme(), self.host)
    }
}

/// Listener certificate and key (PEM files)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslConfig {
    /// Certificate chain file
    pub cert: PathBuf,
    /// Private key file
    pub key: PathBuf,
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent inbound connections
    pub max_connections: usize,
    /// Maximum inbound request body in bytes
    pub max_request_size: usize,
    /// Maximum decoded upstream response body in bytes
    pub max_response_size: usize,
    /// Upstream exchange timeout, redirects included
    pub upstream_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            max_request_size: 16 * 1024 * 1024,   // 16 MB
            max_response_size: 256 * 1024 * 1024, // 256 MB
            upstream_timeout_ms: 30_000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_protocol() -> String {
    "https".to_string()
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        Self::from_file_with_mode(path, None)
    }

    /// Load configuration from TOML file, letting `record` override the
    /// file's own mode before validation
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed, or the resulting
    /// configuration is invalid
    pub fn from_file_with_mode(path: &std::path::Path, record: Option<bool>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TapedeckError::ConfigError(format!("Failed to read config file: {e}")))?;

        let mut config = Self::parse(&content)?;
        if let Some(record) = record {
            config.record = record;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    ///
    /// # Errors
    ///
    /// Returns error if the document is invalid
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config = Self::parse(content)?;
        config.validate()?;
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| TapedeckError::ConfigError(format!("Failed to parse config: {e}")))
    }

    /// Current operating mode
    #[must_use]
    pub fn mode(&self) -> Mode {
        if self.record {
            Mode::Record
        } else {
            Mode::Replay
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        if self.mock.host.trim().is_empty() {
            return Err(TapedeckError::ConfigError(
                "mock.host cannot be empty".to_string(),
            ));
        }

        if !matches!(self.mock.scheme(), "http" | "https") {
            return Err(TapedeckError::ConfigError(format!(
                "mock.protocol must be http or https, got '{}'",
                self.mock.protocol
            )));
        }

        if self.port == 0 || self.port == u16::MAX {
            return Err(TapedeckError::ConfigError(format!(
                "port must be between 1 and {}, got {}",
                u16::MAX - 1,
                self.port
            )));
        }

        if self.out.as_os_str().is_empty() {
            return Err(TapedeckError::ConfigError("out cannot be empty".to_string()));
        }

        if !self.record && !self.out.is_dir() {
            return Err(TapedeckError::ConfigError(format!(
                "Fixture directory does not exist: {}",
                self.out.display()
            )));
        }

        for (route, dir) in &self.static_routes {
            if !route.starts_with('/') {
                return Err(TapedeckError::ConfigError(format!(
                    "static route '{route}' must start with '/'"
                )));
            }
            if !dir.is_dir() {
                return Err(TapedeckError::ConfigError(format!(
                    "static directory for '{route}' does not exist: {}",
                    dir.display()
                )));
            }
        }

        if self.limits.max_connections == 0
            || self.limits.max_request_size == 0
            || self.limits.max_response_size == 0
            || self.limits.upstream_timeout_ms == 0
        {
            return Err(TapedeckError::ConfigError(
                "limits must all be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_config_parse() {
        let config_toml = r#"
            out = "/tmp"
            record = true

            [mock]
            host = "api.example.com"
        "#;

        let config: Config = toml::from_str(config_toml).unwrap();
        assert_eq!(config.mode(), Mode::Record);
        assert_eq!(config.mock.host, "api.example.com");
        assert_eq!(config.mock.scheme(), "https");
        assert!(!config.mock.verify_tls);
        assert_eq!(config.port, 9000);
        assert!(config.ssl.is_none());
    }

    #[test]
    fn test_config_from_file() {
        let dir = TempDir::new().unwrap();
        let mut file = NamedTempFile::new().unwrap();
        let config_toml = format!(
            r#"
            out = "{}"
            port = 8080

            [mock]
            host = "api.example.com"
            protocol = "http:"

            [limits]
            upstream_timeout_ms = 500
        "#,
            dir.path().display()
        );
        file.write_all(config_toml.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.mode(), Mode::Replay);
        assert_eq!(config.mock.origin(), "http://api.example.com");
        assert_eq!(config.limits.upstream_timeout_ms, 500);
        assert_eq!(config.limits.max_connections, 1024);
    }

    #[test]
    fn test_scheme_normalization() {
        for protocol in ["https", "https:", "https://", " https:// "] {
            let mock = MockConfig {
                host: "example.com".to_string(),
                protocol: protocol.to_string(),
                verify_tls: false,
            };
            assert_eq!(mock.scheme(), "https", "protocol {protocol:?}");
        }
    }

    #[test]
    fn test_invalid_config_bad_protocol() {
        let config_toml = r#"
            out = "/tmp"
            record = true

            [mock]
            host = "api.example.com"
            protocol = "ftp"
        "#;

        assert!(Config::from_toml_str(config_toml).is_err());
    }

    #[test]
    fn test_replay_requires_existing_out() {
        let config_toml = r#"
            out = "/definitely/not/here/tapedeck"

            [mock]
            host = "api.example.com"
        "#;

        assert!(Config::from_toml_str(config_toml).is_err());
    }

    #[test]
    fn test_static_routes_keep_order() {
        let dir = TempDir::new().unwrap();
        let config_toml = format!(
            r#"
            out = "{0}"
            record = true

            [mock]
            host = "api.example.com"

            [static]
            "/assets" = "{0}"
            "/" = "{0}"
        "#,
            dir.path().display()
        );

        let config = Config::from_toml_str(&config_toml).unwrap();
        let routes: Vec<_> = config.static_routes.keys().cloned().collect();
        assert_eq!(routes, vec!["/assets".to_string(), "/".to_string()]);
    }

    #[test]
    fn test_record_flag_overrides_missing_out() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("not-yet-created");
        let mut file = NamedTempFile::new().unwrap();
        let config_toml = format!(
            r#"
            out = "{}"
            record = false

            [mock]
            host = "api.example.com"
        "#,
            out.display()
        );
        file.write_all(config_toml.as_bytes()).unwrap();

        assert!(Config::from_file(file.path()).is_err());
        assert!(Config::from_file_with_mode(file.path(), Some(false)).is_err());

        let config = Config::from_file_with_mode(file.path(), Some(true)).unwrap();
        assert_eq!(config.mode(), Mode::Record);
        assert!(!out.exists());
    }
}
