//! Command-line interface parsing for fetchstash
//!
//! This module handles parsing of CLI arguments using clap, including TTL
//! values written with a unit suffix (`30s`, `5m`, `2h`).

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use thiserror::Error;

use crate::config::{default_cache_dir, CacheConfig, PersistMode};

/// Error types for CLI argument handling
#[derive(Debug, Error)]
pub enum CliError {
    /// The TTL string could not be parsed
    #[error("Invalid TTL: '{0}'. Use a number with an optional unit: 500ms, 30s, 5m, 2h")]
    InvalidTtl(String),

    /// No cache directory was given and none could be determined
    #[error("Could not determine a cache directory; pass --cache-dir")]
    NoCacheDir,
}

/// fetchstash - Cache JSON API responses on disk with request coalescing
#[derive(Parser, Debug)]
#[command(name = "fetchstash")]
#[command(about = "Fetch JSON resources through a persistent response cache")]
#[command(version)]
pub struct Cli {
    /// Directory holding persisted cache records (defaults to the XDG cache dir)
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Namespace for persisted records
    #[arg(long, global = true, default_value = "fetchstash")]
    pub namespace: String,

    /// Write records only at exit instead of on every change
    #[arg(long, global = true)]
    pub flush_only: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Operations on the cache
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Fetch a JSON resource, serving it from the cache when fresh
    ///
    /// Examples:
    ///   fetchstash get https://api.example.com/collections
    ///   fetchstash get https://api.example.com/collections --ttl 1h
    ///   fetchstash get https://api.example.com/collections --offline
    Get {
        /// URL of the resource
        url: String,

        /// How long the fetched value stays fresh
        #[arg(long, value_parser = parse_ttl_arg)]
        ttl: Option<Duration>,

        /// Bypass a fresh cached value
        #[arg(long)]
        no_cache: bool,

        /// Behave as if the network were unavailable
        #[arg(long)]
        offline: bool,

        /// Serve expired data if the request fails
        #[arg(long)]
        stale_on_error: bool,
    },
    /// List cached keys with their expiry
    List,
    /// Remove a cached entry
    Invalidate {
        /// Key to remove
        key: String,

        /// Treat KEY as a prefix and remove every matching entry
        #[arg(long)]
        prefix: bool,
    },
    /// Remove every cached entry
    Purge,
    /// Print cache statistics
    Stats,
}

/// Parses a TTL argument such as `500ms`, `30s`, `5m`, `2h`, or a bare number of seconds
pub fn parse_ttl_arg(s: &str) -> Result<Duration, CliError> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| CliError::InvalidTtl(s.to_string()))?;

    let seconds_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(amount)),
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => return Err(CliError::InvalidTtl(s.to_string())),
    };
    amount
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| CliError::InvalidTtl(s.to_string()))
}

/// Settings derived from CLI arguments for opening the cache
#[derive(Debug, Clone)]
pub struct StartupConfig {
    /// Directory for persisted records
    pub cache_dir: PathBuf,
    /// Store configuration
    pub cache: CacheConfig,
}

impl StartupConfig {
    /// Creates a StartupConfig from parsed CLI arguments
    ///
    /// # Returns
    /// * `Ok(StartupConfig)` with the resolved cache directory
    /// * `Err(CliError::NoCacheDir)` if no directory was given and none can be found
    pub fn from_cli(cli: &Cli) -> Result<Self, CliError> {
        let cache_dir = match &cli.cache_dir {
            Some(dir) => dir.clone(),
            None => default_cache_dir().ok_or(CliError::NoCacheDir)?,
        };

        let persist_mode = if cli.flush_only {
            PersistMode::OnFlush
        } else {
            PersistMode::WriteThrough
        };

        Ok(StartupConfig {
            cache_dir,
            cache: CacheConfig::default()
                .with_namespace(cli.namespace.clone())
                .with_persist_mode(persist_mode),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ttl_arg_units() {
        assert_eq!(parse_ttl_arg("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_ttl_arg("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_ttl_arg("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_ttl_arg("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_ttl_arg("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_ttl_arg("1d").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_parse_ttl_arg_invalid() {
        for input in ["", "abc", "5x", "m5", "-3s"] {
            let err = parse_ttl_arg(input).unwrap_err();
            assert!(err.to_string().contains("Invalid TTL"), "{}", input);
        }
    }

    #[test]
    fn test_cli_parse_get_with_options() {
        let cli = Cli::parse_from([
            "fetchstash",
            "get",
            "https://example.com/a",
            "--ttl",
            "10m",
            "--offline",
        ]);
        assert_eq!(
            cli.command,
            Command::Get {
                url: "https://example.com/a".to_string(),
                ttl: Some(Duration::from_secs(600)),
                no_cache: false,
                offline: true,
                stale_on_error: false,
            }
        );
    }

    #[test]
    fn test_cli_parse_invalidate_prefix() {
        let cli = Cli::parse_from(["fetchstash", "invalidate", "GET ", "--prefix"]);
        assert_eq!(
            cli.command,
            Command::Invalidate {
                key: "GET ".to_string(),
                prefix: true,
            }
        );
    }

    #[test]
    fn test_startup_config_from_cli_explicit_dir() {
        let cli = Cli::parse_from(["fetchstash", "--cache-dir", "/tmp/fs", "--flush-only", "stats"]);
        let config = StartupConfig::from_cli(&cli).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/fs"));
        assert_eq!(config.cache.persist_mode, PersistMode::OnFlush);
        assert_eq!(config.cache.namespace, "fetchstash");
    }

    #[test]
    fn test_startup_config_defaults_to_write_through() {
        let cli = Cli::parse_from(["fetchstash", "--cache-dir", "/tmp/fs", "list"]);
        let config = StartupConfig::from_cli(&cli).unwrap();
        assert_eq!(config.cache.persist_mode, PersistMode::WriteThrough);
    }
}
