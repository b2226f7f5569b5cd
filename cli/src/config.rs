use anyhow::{anyhow, Error, Result};
use closer::Signal;
use figment::{
    providers::{Env, Format, Toml, Yaml},
    Figment,
};
use serde::Deserialize;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::filter::LevelFilter;

const DEFAULT_CONFIG_PATH: &str = "/etc/closer/config.toml";

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
    pub log: Option<String>,
    #[serde(default = "signals_default")]
    pub signals: Vec<Signal>,
    /// seconds to wait for close before giving up
    pub timeout: Option<u64>,
}

fn signals_default() -> Vec<Signal> {
    Signal::defaults()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: None,
            signals: signals_default(),
            timeout: None,
        }
    }
}

impl Config {
    /// Load from a toml or yaml file, overridden by `CLOSER_` env vars.
    /// A missing file is treated as empty.
    pub fn load(path: Option<PathBuf>) -> Result<Self, Error> {
        let path = path.unwrap_or(PathBuf::from(DEFAULT_CONFIG_PATH));
        let figment = Figment::new();
        let figment = match path.extension().and_then(OsStr::to_str) {
            Some("toml") => figment.merge(Toml::file(path)),
            Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
            Some(ext) => return Err(anyhow!("unexpected file extension '{}'", ext)),
            None => return Err(anyhow!("failed to parse path")),
        };

        let config: Config = figment
            .merge(Env::prefixed("CLOSER_").split("_"))
            .extract()?;
        Ok(config)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }

    pub fn log_level(&self) -> LevelFilter {
        match self
            .log
            .to_owned()
            .unwrap_or_else(|| "INFO".to_string())
            .to_uppercase()
            .as_str()
        {
            "TRACE" => LevelFilter::TRACE,
            "DEBUG" => LevelFilter::DEBUG,
            "WARN" => LevelFilter::WARN,
            "ERROR" => LevelFilter::ERROR,
            "INFO" => LevelFilter::INFO,
            _ => LevelFilter::INFO,
        }
    }
}
