//! Configuration for the completion server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the demo server
#[derive(Parser, Debug)]
#[command(name = "completion-server")]
#[command(version = "0.1.0")]
#[command(about = "A completion-queue TCP server running a demo protocol", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (0.0.0.0 binds every interface)
    #[arg(short = 'H', long)]
    pub host: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of worker threads (defaults to 2 x CPU cores + 2)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Number of accepts kept posted on the listener
    #[arg(long)]
    pub accept_depth: Option<usize>,

    /// Maximum number of live connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Size of each receive and send I/O buffer in bytes
    #[arg(long)]
    pub io_buffer_size: Option<usize>,

    /// Maximum unconsumed bytes kept per connection
    #[arg(long)]
    pub recv_cache_limit: Option<usize>,

    /// Demo protocol to serve
    #[arg(short = 'P', long, value_enum)]
    pub protocol: Option<ProtocolType>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Demo protocol served by the binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    /// Length-prefixed echo
    #[default]
    Echo,
    /// Line-based ping/pong
    Ping,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and worker pool configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of worker threads
    pub workers: Option<usize>,
    #[serde(default = "default_accept_depth")]
    pub accept_depth: usize,
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,
    /// Completion wait timeout; absent means wait forever
    pub wait_timeout_ms: Option<u64>,
    #[serde(default)]
    pub protocol: ProtocolType,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: None,
            accept_depth: default_accept_depth(),
            listen_backlog: default_listen_backlog(),
            wait_timeout_ms: None,
            protocol: ProtocolType::default(),
        }
    }
}

/// Per-connection limits
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_io_buffer_size")]
    pub io_buffer_size: usize,
    #[serde(default = "default_recv_cache_limit")]
    pub recv_cache_limit: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            io_buffer_size: default_io_buffer_size(),
            recv_cache_limit: default_recv_cache_limit(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    7878
}

fn default_accept_depth() -> usize {
    10
}

fn default_listen_backlog() -> i32 {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_io_buffer_size() -> usize {
    8 * 1024 // 8 KB
}

fn default_recv_cache_limit() -> usize {
    64 * 1024 // 64 KB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub workers: Option<usize>,
    pub accept_depth: usize,
    pub listen_backlog: i32,
    pub max_connections: usize,
    pub wait_timeout_ms: Option<u64>,
    pub io_buffer_size: usize,
    pub recv_cache_limit: usize,
    pub protocol: ProtocolType,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default_args(), TomlConfig::default())
    }
}

impl CliArgs {
    fn default_args() -> Self {
        Self {
            config: None,
            host: None,
            port: None,
            workers: None,
            accept_depth: None,
            max_connections: None,
            io_buffer_size: None,
            recv_cache_limit: None,
            protocol: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already parsed CLI args, reading the TOML file they name.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref path) => {
                let contents = std::fs::read_to_string(path).map_err(|source| {
                    ConfigError::FileRead {
                        path: path.clone(),
                        source,
                    }
                })?;
                toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                    path: path.clone(),
                    source,
                })?
            }
            None => TomlConfig::default(),
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            server,
            connection,
            logging,
        } = toml_config;

        Config {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            workers: cli.workers.or(server.workers),
            accept_depth: cli.accept_depth.unwrap_or(server.accept_depth),
            listen_backlog: server.listen_backlog,
            max_connections: cli.max_connections.unwrap_or(connection.max_connections),
            wait_timeout_ms: server.wait_timeout_ms,
            io_buffer_size: cli.io_buffer_size.unwrap_or(connection.io_buffer_size),
            recv_cache_limit: cli.recv_cache_limit.unwrap_or(connection.recv_cache_limit),
            protocol: cli.protocol.unwrap_or(server.protocol),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                logging.level
            },
        }
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.accept_depth == 0 {
            return Err(ConfigError::Invalid("accept_depth must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.listen_backlog <= 0 {
            return Err(ConfigError::Invalid("listen_backlog must be positive".into()));
        }
        if self.io_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "io_buffer_size must be at least 1".into(),
            ));
        }
        // One full receive must always fit into the cache.
        if self.recv_cache_limit < self.io_buffer_size {
            return Err(ConfigError::Invalid(format!(
                "recv_cache_limit ({}) must be at least io_buffer_size ({})",
                self.recv_cache_limit, self.io_buffer_size
            )));
        }
        Ok(())
    }

    /// Number of worker threads: configured, or 2 x hardware parallelism + 2.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            cpus * 2 + 2
        })
    }

    /// Timeout for a single completion wait; `None` blocks indefinitely.
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:7878".parse().unwrap());
        assert_eq!(config.accept_depth, 10);
        assert_eq!(config.io_buffer_size, 8 * 1024);
        assert_eq!(config.recv_cache_limit, 64 * 1024);
        assert_eq!(config.protocol, ProtocolType::Echo);
        assert!(config.wait_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_worker_count() {
        let config = Config::default();
        let cpus = std::thread::available_parallelism().unwrap().get();
        assert_eq!(config.worker_count(), cpus * 2 + 2);

        let config = Config {
            workers: Some(3),
            ..Config::default()
        };
        assert_eq!(config.worker_count(), 3);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            workers = 4
            accept_depth = 20
            wait_timeout_ms = 250
            protocol = "ping"

            [connection]
            max_connections = 500
            io_buffer_size = 4096
            recv_cache_limit = 16384

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.protocol, ProtocolType::Ping);
        assert_eq!(config.connection.max_connections, 500);
        assert_eq!(config.logging.level, "debug");

        let config = Config::merge(CliArgs::default_args(), config);
        assert_eq!(config.listen_addr(), "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.accept_depth, 20);
        assert_eq!(config.wait_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.io_buffer_size, 4096);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let cli = CliArgs::parse_from([
            "completion-server",
            "--port",
            "8000",
            "--protocol",
            "ping",
            "--log-level",
            "trace",
        ]);
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 9000
            protocol = "echo"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        let config = Config::merge(cli, toml_config);
        assert_eq!(config.port, 8000);
        assert_eq!(config.protocol, ProtocolType::Ping);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_validation() {
        let invalid = [
            Config {
                workers: Some(0),
                ..Config::default()
            },
            Config {
                accept_depth: 0,
                ..Config::default()
            },
            Config {
                io_buffer_size: 1024,
                recv_cache_limit: 512,
                ..Config::default()
            },
        ];
        for config in invalid {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs::parse_from(["completion-server", "-c", "/nonexistent/server.toml"]);
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::FileRead { .. })
        ));
    }
}
