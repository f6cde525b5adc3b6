use std::{fs::read_to_string, net::SocketAddr, str::FromStr};

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

/// TLS credential paths for the administrator's listener.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Ssl {
    pub certificate_chain: String,
    pub private_key: String,
}

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

/// Heartbeat/liveness tunables, exposed so tests don't need to wait
/// out the production 60-second timeout.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Liveness {
    #[serde(default = "Liveness::sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "Liveness::timeout_secs")]
    pub timeout_secs: u64,
}

impl Liveness {
    fn sweep_interval_secs() -> u64 {
        30
    }

    fn timeout_secs() -> u64 {
        60
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self {
            sweep_interval_secs: Self::sweep_interval_secs(),
            timeout_secs: Self::timeout_secs(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(default = "Config::listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub ssl: Option<Ssl>,
    #[serde(default)]
    pub liveness: Liveness,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    fn listen() -> SocketAddr {
        "0.0.0.0:8443".parse().unwrap()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            ssl: None,
            liveness: Liveness::default(),
            log: Log::default(),
        }
    }
}

/// `admin` / `admin-tui` command-line surface. Values set here take
/// priority over a `--config` file, which in turn takes priority
/// over the compiled-in defaults above.
#[derive(Parser, Debug)]
#[command(about = env!("CARGO_PKG_DESCRIPTION"), version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Path to a JSON5 configuration file.
    #[arg(long, short)]
    pub config: Option<String>,

    #[arg(long)]
    pub addr: Option<SocketAddr>,

    #[arg(long)]
    pub cert: Option<String>,

    #[arg(long)]
    pub key: Option<String>,

    #[arg(long)]
    pub log_level: Option<LogLevel>,
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Ok(serde_json5::from_str(value)?)
    }
}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => read_to_string(path)
                .with_context(|| format!("reading config file {path}"))?
                .parse::<Self>()?,
            None => Self::default(),
        };

        if let Some(addr) = cli.addr {
            config.listen = addr;
        }
        if let (Some(cert), Some(key)) = (&cli.cert, &cli.key) {
            config.ssl = Some(Ssl {
                certificate_chain: cert.clone(),
                private_key: key.clone(),
            });
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
        let err = "{ listen: \"127.0.0.1:9000\", bogus: true }".parse::<Config>();
        assert!(err.is_err());
    }

    #[test]
    fn rejects_unknown_keys_nested_under_liveness() {
        let err = "{ liveness: { timeout-secs: 5, bogus: 1 } }".parse::<Config>();
        assert!(err.is_err());
    }
}
