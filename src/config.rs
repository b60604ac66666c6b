//! Daemon configuration module
//!
//! Parses and manages the NAM configuration from YAML files.
//! serde does the structural work; `validate()` enforces the semantic rules
//! (interval bounds, unique ports, well-formed allow/deny entries) so that a
//! bad file is rejected at load or reload time, never mid-cycle.

use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

/// Eviction strategy for over-limit ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// Evict the sessions with the earliest first-seen timestamps.
    #[serde(rename = "FIFO")]
    Fifo,
    /// Evict the sessions with the latest first-seen timestamps.
    #[serde(rename = "LIFO")]
    Lifo,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Fifo => write!(f, "FIFO"),
            Strategy::Lifo => write!(f, "LIFO"),
        }
    }
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "FIFO" => Ok(Strategy::Fifo),
            "LIFO" => Ok(Strategy::Lifo),
            other => anyhow::bail!("unsupported strategy: {other} (expected FIFO or LIFO)"),
        }
    }
}

/// Per-rule strategy override. Absent or empty means "inherit global";
/// anything other than FIFO/LIFO is rejected during deserialisation.
fn strategy_override<'de, D>(de: D) -> std::result::Result<Option<Strategy>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(de)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub global: GlobalConfig,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Global settings shared by every rule unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    // ============================================
    // Core behaviour
    // ============================================
    /// Sampling period in seconds (1..=3600).
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    /// Default ban duration in seconds. 0 disconnects without filtering.
    #[serde(default = "default_ban_duration")]
    pub ban_duration: u64,

    /// Default eviction strategy.
    #[serde(default = "default_strategy")]
    pub strategy: Strategy,

    // ============================================
    // Logging
    // ============================================
    /// debug / info / warn / error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log file path. Empty disables file output.
    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// Maximum log file size in MB before rotation.
    #[serde(default = "default_log_max_size")]
    pub log_max_size: u32,

    /// Rotated files kept on disk.
    #[serde(default = "default_log_max_backups")]
    pub log_max_backups: u32,

    /// Days a rotated file is retained.
    #[serde(default = "default_log_max_age")]
    pub log_max_age: u32,

    // ============================================
    // Persistence
    // ============================================
    /// SQLite database path.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Days of history kept in the database. 0 disables pruning.
    #[serde(default = "default_history_days")]
    pub history_days: u32,

    /// Webhook notification settings (parsed, delivery handled elsewhere).
    #[serde(default)]
    pub notification: NotificationConfig,
}

/// Webhook notification settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub events: Vec<String>,
}

/// Per-port rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Monitored local port (1..=65535, unique across rules).
    pub port: u16,

    /// Transport protocol tag, informational.
    #[serde(default)]
    pub protocol: String,

    /// Maximum distinct remote IPs allowed to hold sessions concurrently.
    pub max_ips: usize,

    /// Free-form tag shown in logs and status output.
    #[serde(default)]
    pub tag: String,

    /// Strategy override. None inherits the global default.
    #[serde(
        default,
        deserialize_with = "strategy_override",
        skip_serializing_if = "Option::is_none"
    )]
    pub strategy: Option<Strategy>,

    /// Ban duration override in seconds. >0 wins over the global value.
    #[serde(default)]
    pub ban_duration: u64,

    /// Allow list: bare IPs or CIDR ranges that are never evicted.
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Deny list: bare IPs or CIDR ranges flagged by `is_denylisted`.
    #[serde(default)]
    pub blacklist: Vec<String>,
}

// ============================================
// Default value functions
// ============================================

fn default_check_interval() -> u64 {
    5
}

fn default_ban_duration() -> u64 {
    60
}

fn default_strategy() -> Strategy {
    Strategy::Fifo
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "/var/log/nam.log".to_string()
}

fn default_log_max_size() -> u32 {
    100
}

fn default_log_max_backups() -> u32 {
    5
}

fn default_log_max_age() -> u32 {
    30
}

fn default_database_path() -> String {
    "/var/lib/nam/nam.db".to_string()
}

fn default_history_days() -> u32 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            global: GlobalConfig {
                check_interval: default_check_interval(),
                ban_duration: default_ban_duration(),
                strategy: default_strategy(),
                log_level: default_log_level(),
                log_file: default_log_file(),
                log_max_size: default_log_max_size(),
                log_max_backups: default_log_max_backups(),
                log_max_age: default_log_max_age(),
                database_path: default_database_path(),
                history_days: default_history_days(),
                notification: NotificationConfig {
                    enabled: false,
                    webhook_url: String::new(),
                    events: vec!["ban".to_string(), "overlimit".to_string()],
                },
            },
            rules: Vec::new(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        Self::from_str_checked(&contents)
            .with_context(|| format!("invalid config file: {}", path.display()))
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_str_checked(contents: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(contents).context("failed to parse YAML config")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate and save the configuration to a YAML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.validate()?;

        let yaml = serde_yaml::to_string(self).context("failed to serialize config")?;

        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("failed to write config to {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Semantic validation beyond what serde can express.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.global.check_interval >= 1,
            "check_interval must be at least 1 second"
        );
        anyhow::ensure!(
            self.global.check_interval <= 3600,
            "check_interval must not exceed 3600 seconds"
        );

        let valid_levels = ["debug", "info", "warn", "error"];
        anyhow::ensure!(
            valid_levels.contains(&self.global.log_level.as_str()),
            "unsupported log_level: {} (expected debug, info, warn or error)",
            self.global.log_level
        );

        anyhow::ensure!(!self.rules.is_empty(), "at least one port rule is required");

        let mut seen = std::collections::HashSet::new();
        for rule in &self.rules {
            rule.validate()
                .with_context(|| format!("invalid rule for port {}", rule.port))?;
            anyhow::ensure!(seen.insert(rule.port), "port {} configured twice", rule.port);
        }

        Ok(())
    }

    /// Look up the rule for a port.
    pub fn rule_for_port(&self, port: u16) -> Option<&Rule> {
        self.rules.iter().find(|r| r.port == port)
    }
}

impl Rule {
    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.port >= 1, "port must be in 1..=65535");
        anyhow::ensure!(self.max_ips >= 1, "max_ips must be at least 1");

        for entry in &self.whitelist {
            validate_ip_or_cidr(entry)
                .with_context(|| format!("invalid whitelist entry: {entry}"))?;
        }
        for entry in &self.blacklist {
            validate_ip_or_cidr(entry)
                .with_context(|| format!("invalid blacklist entry: {entry}"))?;
        }

        Ok(())
    }

    /// Effective strategy for this rule, falling back to the global default.
    pub fn effective_strategy(&self, global: Strategy) -> Strategy {
        self.strategy.unwrap_or(global)
    }

    /// Effective ban duration for this rule. Only a positive override wins.
    pub fn effective_ban_duration(&self, global: u64) -> u64 {
        if self.ban_duration > 0 {
            self.ban_duration
        } else {
            global
        }
    }
}

/// Accepts a bare IP address or a CIDR range.
fn validate_ip_or_cidr(entry: &str) -> Result<()> {
    if entry.parse::<IpAddr>().is_ok() || entry.parse::<IpNet>().is_ok() {
        return Ok(());
    }
    anyhow::bail!("neither a valid IP nor a valid CIDR")
}
