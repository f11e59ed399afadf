use serde::{Deserialize, Serialize};
use std::time::Duration;
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub geolocation: GeolocationConfig,
    pub logging: LoggingConfig,
    pub pipeline: PipelineConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeolocationConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout_ms: u64,
    pub cache_ttl_secs: Option<u64>,
    pub skip_private: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub concurrency: usize,
    pub procfs_root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub include_hostname: bool,
    pub include_readme: bool,
    /// Map center as (latitude, longitude).
    pub home_location: (f64, f64),
    pub map_output: String,
}

impl Default for GeolocationConfig {
    fn default() -> Self {
        Self {
            base_url: "https://ipinfo.io".to_string(),
            token: None,
            timeout_ms: 5000,
            cache_ttl_secs: None,
            skip_private: false,
        }
    }
}

impl GeolocationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_secs.map(Duration::from_secs)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            procfs_root: "/proc".to_string(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            include_hostname: false,
            include_readme: false,
            home_location: (8.2503495, 124.2547768),
            map_output: "connections.svg".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            geolocation: GeolocationConfig::default(),
            logging: LoggingConfig::default(),
            pipeline: PipelineConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
