use std::{fs::read_to_string, net::SocketAddr, str::FromStr};

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Liveness {
    #[serde(default = "Liveness::heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "Liveness::reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "Liveness::dial_timeout_secs")]
    pub dial_timeout_secs: u64,
}

impl Liveness {
    fn heartbeat_interval_secs() -> u64 {
        15
    }

    fn reconnect_delay_secs() -> u64 {
        5
    }

    fn dial_timeout_secs() -> u64 {
        10
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: Self::heartbeat_interval_secs(),
            reconnect_delay_secs: Self::reconnect_delay_secs(),
            dial_timeout_secs: Self::dial_timeout_secs(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(default = "Config::admin")]
    pub admin: SocketAddr,
    #[serde(default)]
    pub cascade: Option<u16>,
    #[serde(default)]
    pub liveness: Liveness,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    fn admin() -> SocketAddr {
        "127.0.0.1:8443".parse().unwrap()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admin: Self::admin(),
            cascade: None,
            liveness: Liveness::default(),
            log: Log::default(),
        }
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Ok(serde_json5::from_str(value)?)
    }
}

/// `agent` command-line surface.
#[derive(Parser, Debug)]
#[command(about = env!("CARGO_PKG_DESCRIPTION"), version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Path to a JSON5 configuration file.
    #[arg(long, short)]
    pub config: Option<String>,

    #[arg(long)]
    pub admin: Option<SocketAddr>,

    #[arg(long)]
    pub cascade: Option<u16>,

    #[arg(long)]
    pub log_level: Option<LogLevel>,
}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => read_to_string(path)
                .with_context(|| format!("reading config file {path}"))?
                .parse::<Self>()?,
            None => Self::default(),
        };

        if let Some(admin) = cli.admin {
            config.admin = admin;
        }
        if let Some(cascade) = cli.cascade {
            config.cascade = Some(cascade);
        }
        if let Some(level) = cli.log_level {
            config.log.level = level;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_top_level_keys() {
        let err = "{ admin: \"127.0.0.1:9000\", bogus: true }".parse::<Config>();
        assert!(err.is_err());
    }

    #[test]
    fn rejects_unknown_keys_nested_under_liveness() {
        let err = "{ liveness: { heartbeat-interval-secs: 5, bogus: 1 } }".parse::<Config>();
        assert!(err.is_err());
    }
}
