//! Core configuration types.

use serde::Deserialize;

use super::cluster::ClusterConfig;
use super::limits::LimitsConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

/// Top-level configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub matchmaker: MatchmakerConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// Scheduled tournaments registered at startup.
    #[serde(default)]
    pub tournaments: Vec<TournamentBlock>,
    /// Scheduled leaderboards registered at startup.
    #[serde(default)]
    pub leaderboards: Vec<LeaderboardBlock>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        Ok(config)
    }
}

/// Identity and observability settings for this node.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Stable node name used in `PresenceId.node` and on cluster links.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Prometheus HTTP port. 0 disables the endpoint (used by tests).
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            log_format: LogFormat::default(),
            metrics_port: None,
        }
    }
}

/// Realtime listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// WebSocket bind address for realtime sessions.
    #[serde(default = "default_realtime_addr")]
    pub realtime_addr: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            realtime_addr: default_realtime_addr(),
        }
    }
}

fn default_realtime_addr() -> String {
    "0.0.0.0:7350".to_string()
}

/// Matchmaker pass configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchmakerConfig {
    /// Seconds between matching passes.
    #[serde(default = "default_matchmaker_interval")]
    pub interval_secs: u64,
    /// Maximum concurrent tickets in the pool.
    #[serde(default = "default_matchmaker_max_tickets")]
    pub max_tickets: usize,
}

impl Default for MatchmakerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_matchmaker_interval(),
            max_tickets: default_matchmaker_max_tickets(),
        }
    }
}

fn default_matchmaker_interval() -> u64 {
    15
}

fn default_matchmaker_max_tickets() -> usize {
    10_000
}

/// SQLite database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// One scheduled tournament. The wider platform stores tournament records
/// elsewhere; this block only drives the reset/end timers.
#[derive(Debug, Clone, Deserialize)]
pub struct TournamentBlock {
    pub id: String,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub end_time: Option<i64>,
}

/// One scheduled leaderboard reset.
#[derive(Debug, Clone, Deserialize)]
pub struct LeaderboardBlock {
    pub id: String,
    pub cron: String,
}
