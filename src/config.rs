use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::filter::DEFAULT_FORBIDDEN_KEYWORDS;

#[derive(Parser)]
#[command(name = "sqlcheck", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Whether to delete the attempt history before serving
    #[arg(long = "flush-history", short = 'f', default_value_t = false)]
    pub flush_history: bool,

    /// Whether to drop every leftover sandbox namespace before serving
    #[arg(long = "sweep", short = 's', default_value_t = false)]
    pub sweep: bool,

    /// Verify a problem's canonical solution against itself, then exit
    #[arg(long = "self-check", value_name = "PROBLEM_ID")]
    pub self_check: Option<u32>,

    /// Print the expected output of a problem as JSON, then exit
    #[arg(long = "preview", value_name = "PROBLEM_ID")]
    pub preview: Option<u32>,

    /// Number of HTTP worker threads
    #[arg(long = "workers", short = 'w')]
    pub workers: Option<usize>,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> std::io::Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        let config: Config = serde_json::from_reader(reader)?;
        config
            .sandbox
            .validate()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub fixtures: FixtureConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Deserialize, Debug, Default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

/// Which engine hosts the sandbox namespaces
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "engine", rename_all = "snake_case")]
pub enum DatabaseConfig {
    Sqlite(SqliteConfig),
    Mysql(MySqlConfig),
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::Sqlite(SqliteConfig::default())
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SqliteConfig {
    /// Directory holding one database file per live sandbox
    pub scratch_dir: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MySqlConfig {
    #[serde(default = "default_mysql_host")]
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Size of the pool used for namespace drops, query kills and sweeps
    #[serde(default = "default_admin_connections")]
    pub admin_connections: u32,
}

fn default_mysql_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_admin_connections() -> u32 {
    4
}

#[derive(Deserialize, Debug, Clone)]
pub struct FixtureConfig {
    /// Root of the local catalog, holding one zero-padded directory per problem
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,
    /// Base URL of the object store consulted when a file is missing locally
    pub remote_base_url: Option<String>,
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout: MilliSecond,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            local_root: default_local_root(),
            remote_base_url: None,
            remote_timeout: default_remote_timeout(),
        }
    }
}

fn default_local_root() -> PathBuf {
    PathBuf::from("problems")
}

fn default_remote_timeout() -> MilliSecond {
    MilliSecond(5_000)
}

#[derive(Deserialize, Debug, Clone)]
pub struct SandboxConfig {
    #[serde(default = "default_schema_prefix")]
    pub schema_prefix: String,
    /// Overall deadline of one verification, fixture loading included
    #[serde(default = "default_timeout")]
    pub timeout: MilliSecond,
    #[serde(default = "default_forbidden_keywords")]
    pub forbidden_keywords: Vec<String>,
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,
    /// How often orphaned namespaces are retried
    #[serde(default = "default_janitor_interval")]
    pub janitor_interval: MilliSecond,
}

impl SandboxConfig {
    /// Namespace names are spliced into DDL, so the prefix is restricted to
    /// lowercase identifier characters
    pub fn validate(&self) -> Result<(), String> {
        let prefix = &self.schema_prefix;
        if prefix.is_empty() || prefix.len() > 32 {
            return Err(format!(
                "schema_prefix must be 1 to 32 characters long, got {}",
                prefix.len()
            ));
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(format!(
                "schema_prefix {prefix:?} may only contain [a-z0-9_]"
            ));
        }
        if self.max_query_length == 0 {
            return Err("max_query_length must not be 0".to_string());
        }
        Ok(())
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            schema_prefix: default_schema_prefix(),
            timeout: default_timeout(),
            forbidden_keywords: default_forbidden_keywords(),
            max_query_length: default_max_query_length(),
            janitor_interval: default_janitor_interval(),
        }
    }
}

fn default_schema_prefix() -> String {
    "sandbox_".to_string()
}

fn default_timeout() -> MilliSecond {
    MilliSecond(10_000)
}

fn default_forbidden_keywords() -> Vec<String> {
    DEFAULT_FORBIDDEN_KEYWORDS
        .iter()
        .map(|k| k.to_string())
        .collect()
}

fn default_max_query_length() -> usize {
    5_000
}

fn default_janitor_interval() -> MilliSecond {
    MilliSecond(300_000)
}

#[derive(Deserialize, Debug, Default)]
pub struct HistoryConfig {
    /// Submission history database, defaults to the user data directory
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

impl From<MilliSecond> for Duration {
    fn from(value: MilliSecond) -> Self {
        Duration::from_millis(value.0)
    }
}
