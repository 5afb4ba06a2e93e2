//! Command line arguments and settings for the redquorum client
//!
//! Settings are layered: built-in defaults, then the YAML file, then
//! `REDQUORUM_*` environment variables, then command line flags.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use config::{Config, ConfigError, Environment, File};
use redquorum_core::{CoordinatorConfig, DEFAULT_REDIS_URL, RetryDelay};
use serde::Deserialize;
use tracing::Level;

use crate::logging::LoggingConfig;

pub const DEFAULT_CONFIG_FILE: &str = "conf/redquorum.yml";
pub const ENV_PREFIX: &str = "REDQUORUM";

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "redquorum", version, about = "Distributed locks over a quorum of Redis servers")]
pub struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "config", env = "REDQUORUM_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
    /// Store URL, repeat for each store. Replaces the configured list.
    #[arg(short = 's', long = "store")]
    pub stores: Vec<String>,
    /// Log level for this run
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Acquire or extend a lock and print its handle as JSON
    Lock {
        resource: String,
        /// Lock TTL in milliseconds
        #[arg(long)]
        ttl: u64,
        /// Extend the lock held with this token instead of acquiring a new one
        #[arg(long)]
        extend: Option<String>,
        /// Only extend a lock that is still held
        #[arg(long, requires = "extend")]
        only_if_locked: bool,
        /// Retries after the first attempt
        #[arg(long)]
        retry_count: Option<u32>,
    },
    /// Release a lock
    Unlock { resource: String, token: String },
    /// Print the remaining TTL of a resource, or of one lock with --token
    Ttl {
        resource: String,
        #[arg(long)]
        token: Option<String>,
    },
    /// Print whether a resource is locked
    Status { resource: String },
    /// Run a command while holding the lock, renewing it until the command exits
    Run {
        resource: String,
        /// Lock TTL in milliseconds
        #[arg(long)]
        ttl: u64,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

/// Client settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub stores: Vec<String>,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub retry_jitter_ms: u64,
    pub store_timeout_ms: u64,
    pub preload_scripts: bool,
    pub log: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let defaults = CoordinatorConfig::default();
        Self {
            stores: vec![DEFAULT_REDIS_URL.to_string()],
            retry_count: defaults.retry_count,
            retry_delay_ms: defaults.retry_delay.base_ms(1),
            retry_jitter_ms: defaults.retry_jitter_ms,
            store_timeout_ms: defaults.store_timeout.as_millis() as u64,
            preload_scripts: false,
            log: LogSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    /// Also write a daily rolling log file
    pub file: bool,
    pub dir: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: false,
            dir: None,
        }
    }
}

impl Settings {
    /// Load settings for `cli`, reading the process environment
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut settings = Self::from_sources(&cli.config, Self::environment())?;
        if !cli.stores.is_empty() {
            settings.stores = cli.stores.clone();
        }
        if let Some(level) = &cli.log_level {
            settings.log.level = level.clone();
        }
        Ok(settings)
    }

    /// Defaults, then `path` if it exists, then `environment`
    pub fn from_sources(path: &std::path::Path, environment: Environment) -> Result<Self, ConfigError> {
        let path = path.to_string_lossy();
        Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(environment)
            .build()?
            .try_deserialize()
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("stores")
            .try_parsing(true)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig::new()
            .with_retry_count(self.retry_count)
            .with_retry_delay(RetryDelay::Fixed(self.retry_delay_ms))
            .with_retry_jitter(self.retry_jitter_ms)
            .with_store_timeout(Duration::from_millis(self.store_timeout_ms))
    }

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.log.level.parse().unwrap_or(Level::WARN),
            file_logging: self.log.file,
            log_dir: self.log.dir.clone().unwrap_or_else(LoggingConfig::default_log_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn no_env() -> Environment {
        Settings::environment().source(Some(HashMap::new()))
    }

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        Settings::environment().source(Some(map))
    }

    #[test]
    fn test_defaults_without_file() {
        let settings =
            Settings::from_sources(std::path::Path::new("/nonexistent/redquorum.yml"), no_env())
                .unwrap();
        assert_eq!(settings.stores, vec![DEFAULT_REDIS_URL.to_string()]);
        assert_eq!(settings.retry_count, 3);
        assert_eq!(settings.retry_delay_ms, 200);
        assert_eq!(settings.retry_jitter_ms, 50);
        assert_eq!(settings.store_timeout_ms, 100);
        assert!(!settings.preload_scripts);
    }

    #[test]
    fn test_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(
            file,
            "stores:\n  - redis://a:6379\n  - redis://b:6379\n  - redis://c:6379\nretry_count: 7\nlog:\n  level: debug"
        )
        .unwrap();

        let settings = Settings::from_sources(file.path(), no_env()).unwrap();
        assert_eq!(settings.stores.len(), 3);
        assert_eq!(settings.retry_count, 7);
        // untouched keys keep their defaults
        assert_eq!(settings.retry_delay_ms, 200);
        assert_eq!(settings.log.level, "debug");
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(file, "retry_count: 7\nstore_timeout_ms: 100").unwrap();

        let settings = Settings::from_sources(
            file.path(),
            env(&[
                ("REDQUORUM_RETRY_COUNT", "1"),
                ("REDQUORUM_STORES", "redis://x:1,redis://y:2"),
                ("REDQUORUM_LOG__FILE", "true"),
            ]),
        )
        .unwrap();
        assert_eq!(settings.retry_count, 1);
        assert_eq!(settings.store_timeout_ms, 100);
        assert_eq!(settings.stores, vec!["redis://x:1", "redis://y:2"]);
        assert!(settings.log.file);
    }

    #[test]
    fn test_coordinator_config() {
        let settings = Settings {
            retry_count: 0,
            retry_delay_ms: 10,
            retry_jitter_ms: 0,
            store_timeout_ms: 25,
            ..Default::default()
        };
        let config = settings.coordinator_config();
        assert_eq!(config.retry_count, 0);
        assert_eq!(config.retry_delay.base_ms(2), 10);
        assert_eq!(config.retry_jitter_ms, 0);
        assert_eq!(config.store_timeout, Duration::from_millis(25));
    }

    #[test]
    fn test_logging_config_falls_back_to_warn() {
        let mut settings = Settings::default();
        settings.log.level = "loud".to_string();
        assert_eq!(settings.logging_config().level, Level::WARN);
        settings.log.level = "debug".to_string();
        assert_eq!(settings.logging_config().level, Level::DEBUG);
    }

    #[test]
    fn test_cli_parses_run_command() {
        let cli = Cli::try_parse_from([
            "redquorum", "-s", "redis://a:1", "-s", "redis://b:2", "run", "nightly", "--ttl",
            "30000", "--", "backup.sh", "--full",
        ])
        .unwrap();
        assert_eq!(cli.stores.len(), 2);
        match cli.command {
            Command::Run {
                resource,
                ttl,
                command,
            } => {
                assert_eq!(resource, "nightly");
                assert_eq!(ttl, 30000);
                assert_eq!(command, vec!["backup.sh", "--full"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_only_if_locked_requires_extend() {
        let result = Cli::try_parse_from([
            "redquorum", "lock", "r", "--ttl", "1000", "--only-if-locked",
        ]);
        assert!(result.is_err());
    }
}
