//! CLI surface and resolved runtime configuration.
//!
//! Defines the clap [`Cli`] struct and the [`Config`] the rest of the
//! router consumes. Mapping values are parsed and validated here; fatal
//! configuration problems surface as [`ConfigError`] and exit the process
//! with status 1 before anything is spawned.

use clap::Parser;
use std::time::Duration;
use thiserror::Error;

use crate::cluster::{ClusterMapping, MappingError};

/// Multiplexing MCP router for Azure Data Explorer (Kusto) clusters
#[derive(Parser, Debug)]
#[command(name = "kustomux", version, about)]
pub struct Cli {
    /// Cluster mapping as URL or URL=IDENTITY (repeatable)
    #[arg(long = "mapping", value_name = "URL[=IDENTITY]")]
    pub mapping: Vec<String>,

    /// Pass --read-only to downstream servers (default)
    #[arg(long, overrides_with = "no_read_only")]
    pub read_only: bool,

    /// Allow downstream servers to perform write operations
    #[arg(long, overrides_with = "read_only")]
    pub no_read_only: bool,

    /// Seconds between health pings
    #[arg(long, value_name = "SECONDS", default_value_t = 60)]
    pub ping_interval: u64,

    /// Seconds before an unanswered ping counts as failed
    #[arg(long, value_name = "SECONDS", default_value_t = 10)]
    pub ping_timeout: u64,

    /// Ceiling for the reconnect backoff delay
    #[arg(long, value_name = "SECONDS", default_value_t = 300)]
    pub max_reconnect_backoff: u64,

    /// Log verbosity
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Downstream MCP server command line, whitespace-separated
    #[arg(long, value_name = "COMMAND", default_value = "azmcp server start")]
    pub server_command: String,

    /// Mirror log output into a file under logs/
    #[arg(long)]
    pub log_file: bool,
}

/// Log verbosity for the stderr (and optional file) output.
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fatal configuration problem; the process exits with status 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no cluster mappings provided (use --mapping URL[=IDENTITY])")]
    NoMappings,
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("--server-command must name a program to run")]
    EmptyServerCommand,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Parsed cluster mappings, in CLI order (dedup happens at init).
    pub mappings: Vec<ClusterMapping>,
    /// Whether `--read-only` is appended to the child command line.
    pub read_only: bool,
    /// Downstream MCP server argv (program + arguments).
    pub server_command: Vec<String>,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub max_reconnect_backoff: Duration,
    pub log_level: LogLevel,
    pub log_file: bool,
}

impl Config {
    /// Resolve the parsed CLI into a validated configuration.
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        if cli.mapping.is_empty() {
            return Err(ConfigError::NoMappings);
        }

        let mappings = cli
            .mapping
            .iter()
            .map(|value| ClusterMapping::parse(value))
            .collect::<Result<Vec<_>, _>>()?;

        let server_command: Vec<String> = cli
            .server_command
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if server_command.is_empty() {
            return Err(ConfigError::EmptyServerCommand);
        }

        // --read-only defaults on; --no-read-only switches it off, with
        // the later of the two flags winning if both are present.
        let read_only = cli.read_only || !cli.no_read_only;

        Ok(Self {
            mappings,
            read_only,
            server_command,
            ping_interval: Duration::from_secs(cli.ping_interval),
            ping_timeout: Duration::from_secs(cli.ping_timeout),
            max_reconnect_backoff: Duration::from_secs(cli.max_reconnect_backoff),
            log_level: cli.log_level,
            log_file: cli.log_file,
        })
    }
}
