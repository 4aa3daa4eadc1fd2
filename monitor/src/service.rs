use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use lazy_static::lazy_static;
use serde::Deserialize;

const CONFIG_FILE: &str = "/etc/lyrebird/lyrebird.conf";

lazy_static! {
    pub static ref MONITOR_SERVICE: MonitorService = MonitorService::new();
}

#[derive(Deserialize)]
#[serde(default)]
pub struct Config {
    pub sample_rate: u32,
    pub ptime: usize,
    pub record_dir: PathBuf,
    pub stop_retries: usize,
    pub stop_retry_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sample_rate: 8000,
            ptime: 20,
            record_dir: PathBuf::from("/var/spool/lyrebird"),
            stop_retries: 50,
            stop_retry_ms: 10,
        }
    }
}

impl Config {
    /// Load the host configuration, falling back to defaults when the
    /// conf file is absent: these modules are embedded in the engine
    /// process and must come up either way.
    pub fn new() -> Config {
        Self::load().unwrap_or_default()
    }

    fn load() -> Result<Config> {
        let contents = fs::read_to_string(CONFIG_FILE)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Samples per mixing tick at the configured rate and ptime.
    pub fn tick_samples(&self) -> usize {
        (self.sample_rate / 1000) as usize * self.ptime
    }

    /// Timestamp-qualified recording path for an auto-generated name.
    pub fn record_path(&self, basename: &str, ext: &str) -> PathBuf {
        self.record_dir
            .join(format!("{}.{}.{}", basename, Utc::now().timestamp(), ext))
    }
}

pub struct MonitorService {
    pub config: Config,
}

impl MonitorService {
    fn new() -> MonitorService {
        MonitorService {
            config: Config::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.tick_samples(), 160);
    }

    #[test]
    fn test_record_path_shape() {
        let config = Config::default();
        let path = config.record_path("muxmon", "wav");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("muxmon."));
        assert!(name.ends_with(".wav"));
        assert_eq!(name.split('.').count(), 3);
    }
}
