//! Configuration for the echo server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use serde::Deserialize;

use crate::common::{StreamLimits, TimeoutOptions, DEFAULT_MAX_FRAME_LEN, DEFAULT_MAX_STREAM_SIZE};

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "echo_server")]
#[command(about = "Echo benchmark server verifying payload integrity", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8010)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// TCP port of this server, replaces the port of the listen address
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Connection will be closed if there is no request during the last
    /// `idle_timeout_s` seconds, -1 keeps idle connections open
    #[arg(long, allow_negative_numbers = true)]
    pub idle_timeout_s: Option<i64>,

    /// Maximum duration of the server's shutdown phase, waiting for open
    /// streams to close
    #[arg(long)]
    pub logoff_ms: Option<u64>,

    /// Certificate file path to enable SSL
    #[arg(long)]
    pub certificate: Option<PathBuf>,

    /// Private key file path to enable SSL
    #[arg(long)]
    pub private_key: Option<PathBuf>,

    /// Cipher suite used for SSL connections
    #[arg(long)]
    pub ciphers: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub limits: LimitSection,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_workers: default_max_workers(),
            max_jobs: default_max_jobs(),
        }
    }
}

/// Timeouts, in the units of their names
#[derive(Debug, Deserialize)]
pub struct TimeoutSection {
    #[serde(default = "default_io_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_stream_idle_timeout_ms")]
    pub stream_idle_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_s")]
    pub idle_timeout_s: i64,
    #[serde(default = "default_logoff_ms")]
    pub logoff_ms: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_io_timeout_ms(),
            write_timeout_ms: default_io_timeout_ms(),
            stream_idle_timeout_ms: default_stream_idle_timeout_ms(),
            idle_timeout_s: default_idle_timeout_s(),
            logoff_ms: default_logoff_ms(),
        }
    }
}

/// Resource limits
#[derive(Debug, Deserialize)]
pub struct LimitSection {
    #[serde(default = "default_max_stream_size")]
    pub max_stream_size: u64,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u64,
}

impl Default for LimitSection {
    fn default() -> Self {
        Self {
            max_stream_size: default_max_stream_size(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

/// TLS settings. The TCP transport does not speak TLS; these are only
/// accepted so existing deployment configs keep parsing.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct TlsConfig {
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub ciphers: Option<String>,
}

impl TlsConfig {
    pub fn is_configured(&self) -> bool {
        self.certificate.is_some() || self.private_key.is_some() || self.ciphers.is_some()
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8010".to_string()
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_max_jobs() -> usize {
    1024
}

fn default_io_timeout_ms() -> u64 {
    10_000
}

fn default_stream_idle_timeout_ms() -> u64 {
    10_000
}

fn default_idle_timeout_s() -> i64 {
    -1
}

fn default_logoff_ms() -> u64 {
    2000
}

fn default_max_stream_size() -> u64 {
    DEFAULT_MAX_STREAM_SIZE
}

fn default_max_frame_len() -> u64 {
    DEFAULT_MAX_FRAME_LEN
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration, immutable after startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub max_workers: usize,
    pub max_jobs: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub stream_idle_timeout: Duration,
    /// `None` keeps idle connections open.
    pub idle_timeout: Option<Duration>,
    pub logoff: Duration,
    pub max_stream_size: u64,
    pub max_frame_len: u64,
    pub tls: TlsConfig,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl ServerConfig {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve already parsed CLI args, reading the TOML file they name.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };
        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args over TOML values.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let mut listen = cli.listen.unwrap_or(toml_config.server.listen);
        if let Some(port) = cli.port {
            let host = listen
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or(listen.clone());
            listen = format!("{}:{}", host, port);
        }

        let idle_timeout_s = cli.idle_timeout_s.unwrap_or(toml_config.timeouts.idle_timeout_s);
        let idle_timeout = u64::try_from(idle_timeout_s)
            .ok()
            .map(Duration::from_secs);

        let tls = TlsConfig {
            certificate: cli.certificate.or(toml_config.tls.certificate),
            private_key: cli.private_key.or(toml_config.tls.private_key),
            ciphers: cli.ciphers.or(toml_config.tls.ciphers),
        };

        Self {
            listen,
            max_workers: toml_config.server.max_workers,
            max_jobs: toml_config.server.max_jobs,
            read_timeout: Duration::from_millis(toml_config.timeouts.read_timeout_ms),
            write_timeout: Duration::from_millis(toml_config.timeouts.write_timeout_ms),
            stream_idle_timeout: Duration::from_millis(toml_config.timeouts.stream_idle_timeout_ms),
            idle_timeout,
            logoff: Duration::from_millis(cli.logoff_ms.unwrap_or(toml_config.timeouts.logoff_ms)),
            max_stream_size: toml_config.limits.max_stream_size,
            max_frame_len: toml_config.limits.max_frame_len,
            tls,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    pub fn timeout_options(&self) -> TimeoutOptions {
        TimeoutOptions {
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            idle_timeout: self.stream_idle_timeout,
        }
    }

    pub fn stream_limits(&self) -> StreamLimits {
        StreamLimits {
            max_stream_size: self.max_stream_size,
            max_frame_len: self.max_frame_len,
            connection_idle_timeout: self.idle_timeout,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen, "0.0.0.0:8010");
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.logoff, Duration::from_millis(2000));
        assert_eq!(config.max_stream_size, 1 << 30);
        assert!(!config.tls.is_configured());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:9000"
            max_workers = 2

            [timeouts]
            idle_timeout_s = 30
            stream_idle_timeout_ms = 500

            [limits]
            max_stream_size = 4096

            [tls]
            certificate = "/etc/echo/cert.pem"

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = ServerConfig::merge(CliArgs::default(), toml_config);
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.max_jobs, 1024);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.timeout_options().idle_timeout, Duration::from_millis(500));
        assert_eq!(config.stream_limits().max_stream_size, 4096);
        assert!(config.tls.is_configured());
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9000"
            [timeouts]
            idle_timeout_s = 30
            "#,
        )
        .unwrap();
        let cli = CliArgs::parse_from(["echo_server", "--port", "8011", "--idle-timeout-s", "-1"]);
        let config = ServerConfig::merge(cli, toml_config);
        assert_eq!(config.listen, "127.0.0.1:8011");
        assert_eq!(config.idle_timeout, None);
    }

    #[test]
    fn test_missing_file_is_reported() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/echo.toml")),
            ..Default::default()
        };
        assert!(matches!(
            ServerConfig::from_cli(cli),
            Err(ConfigError::FileRead(_, _))
        ));
    }
}
