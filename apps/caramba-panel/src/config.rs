use std::path::Path;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;

/// `--config <path>` + env overrides (env wins), matching the host's
/// `dotenvy::dotenv().ok()` + env-first convention. The TOML file
/// is optional — every field has a default so a bare `control-api` with no
/// file and no env still boots against a local Postgres.
#[derive(Debug, Parser)]
#[command(name = "control-api", author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a TOML config file; missing file is not an error.
    #[arg(long, env = "CONTROL_API_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the crate version and exit.
    Version,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_address: String,
    pub listen_port: u16,
    pub database_url: String,

    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub max_offline_time_secs: u64,
    pub command_queue_capacity: usize,
    pub traffic_retention_days: i64,
    pub summary_retention_days: i64,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 8080,
            database_url: "postgres://localhost/control_plane".to_string(),
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_offline_time_secs: 300,
            command_queue_capacity: 100,
            traffic_retention_days: 30,
            summary_retention_days: 90,
            request_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Loads the TOML file named by `--config` (if any and if it exists),
    /// then applies env-var overrides — env always wins.
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        let mut cfg = match config_path {
            Some(path) if Path::new(path).exists() => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)?
            }
            _ => Config::default(),
        };

        if let Ok(v) = std::env::var("LISTEN_ADDRESS") {
            cfg.listen_address = v;
        }
        if let Ok(v) = std::env::var("LISTEN_PORT") {
            cfg.listen_port = v.parse()?;
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            cfg.database_url = v;
        }
        if let Ok(v) = std::env::var("HEARTBEAT_INTERVAL") {
            cfg.heartbeat_interval_secs = v.parse()?;
        }
        if let Ok(v) = std::env::var("HEARTBEAT_TIMEOUT") {
            cfg.heartbeat_timeout_secs = v.parse()?;
        }
        if let Ok(v) = std::env::var("MAX_OFFLINE_TIME") {
            cfg.max_offline_time_secs = v.parse()?;
        }
        if let Ok(v) = std::env::var("COMMAND_QUEUE_CAPACITY") {
            cfg.command_queue_capacity = v.parse()?;
        }
        if let Ok(v) = std::env::var("TRAFFIC_RETENTION_DAYS") {
            cfg.traffic_retention_days = v.parse()?;
        }
        if let Ok(v) = std::env::var("SUMMARY_RETENTION_DAYS") {
            cfg.summary_retention_days = v.parse()?;
        }
        if let Ok(v) = std::env::var("REQUEST_TIMEOUT_SECS") {
            cfg.request_timeout_secs = v.parse()?;
        }

        Ok(cfg)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn max_offline_time(&self) -> Duration {
        Duration::from_secs(self.max_offline_time_secs)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_address, self.listen_port)
    }
}
