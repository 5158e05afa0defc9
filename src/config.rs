//! Configuration handling for the fake SQL server.
//!
//! Process settings come from CLI arguments and environment variables; the
//! targets to expose are listed in a YAML file (`config.yml`).

use crate::error::{ProxyError, ProxyResult};
use crate::executor::RunopsSettings;
use crate::executor::runops::{DEFAULT_QUERY_TIMEOUT_SECS, DEFAULT_RUNOPS_BIN, DEFAULT_TASK_MESSAGE};
use clap::Parser;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config.yml";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Separator between queries in a cache file.
const CACHE_FILE_SEPARATOR: &str = "|\n";

/// Configuration for the fake SQL server process.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "fake-sql-server",
    about = "Fake MySQL endpoint that runs queries through runops",
    version,
    author
)]
pub struct Config {
    /// Path to the YAML file listing the targets to expose
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = DEFAULT_CONFIG_PATH,
        env = "FAKE_SQL_CONFIG"
    )]
    pub config: PathBuf,

    /// Host every target listener binds to
    #[arg(long, default_value = DEFAULT_HOST, env = "FAKE_SQL_HOST")]
    pub host: String,

    /// runops binary to invoke
    #[arg(long, default_value = DEFAULT_RUNOPS_BIN, env = "FAKE_SQL_RUNOPS_BIN")]
    pub runops_bin: String,

    /// Message attached to every runops task
    #[arg(long, default_value = DEFAULT_TASK_MESSAGE, env = "FAKE_SQL_TASK_MESSAGE")]
    pub task_message: String,

    /// Query timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_QUERY_TIMEOUT_SECS,
        env = "FAKE_SQL_QUERY_TIMEOUT"
    )]
    pub query_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = DEFAULT_LOG_LEVEL, env = "FAKE_SQL_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "FAKE_SQL_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            config: PathBuf::from(DEFAULT_CONFIG_PATH),
            host: DEFAULT_HOST.to_string(),
            runops_bin: DEFAULT_RUNOPS_BIN.to_string(),
            task_message: DEFAULT_TASK_MESSAGE.to_string(),
            query_timeout: DEFAULT_QUERY_TIMEOUT_SECS,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            json_logs: false,
        }
    }

    /// Get the query timeout as a Duration.
    pub fn query_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.query_timeout)
    }

    /// Settings shared by every runops client.
    pub fn runops_settings(&self) -> RunopsSettings {
        RunopsSettings {
            binary: self.runops_bin.clone(),
            task_message: self.task_message.clone(),
            query_timeout: self.query_timeout_duration(),
        }
    }

    /// Load and validate the targets file.
    pub fn load_targets(&self) -> ProxyResult<Vec<TargetConfig>> {
        TargetConfig::load(&self.config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Kind of database behind a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum TargetType {
    #[default]
    MySql,
    /// Recognised so it can be rejected with a clear message.
    Postgres,
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MySql => write!(f, "MySql"),
            Self::Postgres => write!(f, "Postgres"),
        }
    }
}

/// One runops target exposed on a local port.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub port: u16,
    /// runops target name
    pub target: String,
    #[serde(default)]
    pub with_type_discovery: bool,
    /// Files listing queries whose results are cached for the process lifetime.
    #[serde(default)]
    pub query_cache: Vec<PathBuf>,
    #[serde(default)]
    pub target_type: TargetType,
}

impl TargetConfig {
    /// Read targets from a YAML file.
    ///
    /// Relative cache file paths are resolved against the file's directory.
    pub fn load(path: &Path) -> ProxyResult<Vec<Self>> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let mut targets = Self::parse_all(&text)?;

        if let Some(base) = path.parent() {
            for target in &mut targets {
                for file in &mut target.query_cache {
                    if file.is_relative() {
                        *file = base.join(&*file);
                    }
                }
            }
        }
        Ok(targets)
    }

    /// Parse and validate a YAML targets document.
    pub fn parse_all(yaml: &str) -> ProxyResult<Vec<Self>> {
        let targets: Vec<Self> = serde_yaml::from_str(yaml)?;
        Self::validate_all(&targets)?;
        Ok(targets)
    }

    fn validate_all(targets: &[Self]) -> ProxyResult<()> {
        if targets.is_empty() {
            return Err(ProxyError::config("At least one target must be configured"));
        }

        let mut ports = HashSet::new();
        for target in targets {
            target.validate()?;
            if !ports.insert(target.port) {
                return Err(ProxyError::config(format!(
                    "Port {} is used by more than one target",
                    target.port
                )));
            }
        }
        Ok(())
    }

    /// Validate a single target and return an error if invalid.
    pub fn validate(&self) -> ProxyResult<()> {
        if self.target.trim().is_empty() {
            return Err(ProxyError::config("Target name cannot be empty"));
        }
        if self.port == 0 {
            return Err(ProxyError::config(format!(
                "Target '{}' needs a non-zero port",
                self.target
            )));
        }
        if self.target_type != TargetType::MySql {
            return Err(ProxyError::config(format!(
                "Target '{}': target type {} is not supported, only MySql is",
                self.target, self.target_type
            )));
        }
        Ok(())
    }

    /// Read every cache file of this target into the set of cacheable queries.
    pub fn load_cacheable_queries(&self) -> ProxyResult<HashSet<String>> {
        let mut queries = HashSet::new();
        for path in &self.query_cache {
            let text = std::fs::read_to_string(path).map_err(|e| {
                ProxyError::config(format!("Cannot read cache file {}: {}", path.display(), e))
            })?;
            queries.extend(parse_cache_file(&text));
        }
        Ok(queries)
    }
}

/// Split a cache file into queries.
///
/// Queries are separated by a `|` at the end of a line.
pub fn parse_cache_file(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(CACHE_FILE_SEPARATOR)
        .map(|query| query.trim().trim_end_matches('|').trim())
        .filter(|query| !query.is_empty())
        .map(String::from)
}
