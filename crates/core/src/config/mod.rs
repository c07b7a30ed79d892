// Copyright © 2026 Kirky.X
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_BASE_INTERVAL_SECS: u64 = 10;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RESEND_DELAY_SECS: u64 = 30;
const DEFAULT_RESEND_MULTIPLIER: u32 = 3;
const DEFAULT_STALE_MULTIPLIER: u32 = 2;
const DEFAULT_MAX_RESULTS: usize = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration value: {}", _0)]
    InvalidValue(String),

    #[error("Configuration file error: {}", _0)]
    FileError(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tick period; every rule interval must be a multiple of it.
    pub base_interval_secs: u64,
    /// Rule intervals below this are raised to it.
    pub min_interval_secs: u64,
    pub max_attempts: u32,
    pub disable_folder_label: bool,
    /// External URL used to build generator links on outgoing alerts.
    pub app_url: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: DEFAULT_BASE_INTERVAL_SECS,
            min_interval_secs: DEFAULT_BASE_INTERVAL_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            disable_folder_label: false,
            app_url: None,
        }
    }
}

impl SchedulerConfig {
    pub fn base_interval(&self) -> Duration {
        Duration::from_secs(self.base_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StateConfig {
    pub resend_delay_secs: u64,
    /// `EndsAt = EvaluatedAt + resend_multiplier * ResendDelay` while firing.
    pub resend_multiplier: u32,
    /// An unseen instance is stale after `stale_multiplier` rule intervals.
    pub stale_multiplier: u32,
    /// History length kept for rules without a `For` duration.
    pub max_results_per_instance: usize,
    pub metrics_interval_secs: u64,
    pub persist_interval_secs: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            resend_delay_secs: DEFAULT_RESEND_DELAY_SECS,
            resend_multiplier: DEFAULT_RESEND_MULTIPLIER,
            stale_multiplier: DEFAULT_STALE_MULTIPLIER,
            max_results_per_instance: DEFAULT_MAX_RESULTS,
            metrics_interval_secs: 15,
            persist_interval_secs: 300,
        }
    }
}

impl StateConfig {
    pub fn resend_delay(&self) -> Duration {
        Duration::from_secs(self.resend_delay_secs)
    }

    pub fn keep_alive_window(&self) -> Duration {
        self.resend_delay() * self.resend_multiplier
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            include_location: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub state: StateConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load_from_file(path: &str) -> ConfigResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_env() -> ConfigResult<Self> {
        let mut config = Config::default();

        if let Ok(v) = std::env::var("RULER_BASE_INTERVAL_SECS") {
            config.scheduler.base_interval_secs = parse_env("RULER_BASE_INTERVAL_SECS", &v)?;
        }
        if let Ok(v) = std::env::var("RULER_MIN_INTERVAL_SECS") {
            config.scheduler.min_interval_secs = parse_env("RULER_MIN_INTERVAL_SECS", &v)?;
        }
        if let Ok(v) = std::env::var("RULER_MAX_ATTEMPTS") {
            config.scheduler.max_attempts = parse_env("RULER_MAX_ATTEMPTS", &v)?;
        }
        if let Ok(v) = std::env::var("RULER_DISABLE_FOLDER_LABEL") {
            config.scheduler.disable_folder_label = parse_env("RULER_DISABLE_FOLDER_LABEL", &v)?;
        }
        if let Ok(url) = std::env::var("RULER_APP_URL") {
            config.scheduler.app_url = Some(url);
        }
        if let Ok(v) = std::env::var("RULER_RESEND_DELAY_SECS") {
            config.state.resend_delay_secs = parse_env("RULER_RESEND_DELAY_SECS", &v)?;
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let base = self.scheduler.base_interval_secs;
        if base == 0 {
            return Err(ConfigError::InvalidValue(
                "scheduler.base_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.scheduler.min_interval_secs % base != 0 {
            return Err(ConfigError::InvalidValue(format!(
                "scheduler.min_interval_secs ({}) must be a multiple of base_interval_secs ({})",
                self.scheduler.min_interval_secs, base
            )));
        }
        if self.scheduler.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "scheduler.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.state.resend_multiplier == 0 || self.state.stale_multiplier == 0 {
            return Err(ConfigError::InvalidValue(
                "state multipliers must be at least 1".to_string(),
            ));
        }
        if self.state.max_results_per_instance == 0 {
            return Err(ConfigError::InvalidValue(
                "state.max_results_per_instance must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> ConfigResult<T> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidValue(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.base_interval(), Duration::from_secs(10));
        assert_eq!(config.state.keep_alive_window(), Duration::from_secs(90));
    }

    #[test]
    fn test_load_from_file_with_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[scheduler]
base_interval_secs = 5
min_interval_secs = 15
app_url = "http://localhost:3000"

[state]
resend_delay_secs = 60
"#
        )
        .unwrap();

        let config = Config::load_from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.scheduler.base_interval_secs, 5);
        assert_eq!(config.scheduler.min_interval_secs, 15);
        assert_eq!(config.scheduler.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(
            config.scheduler.app_url.as_deref(),
            Some("http://localhost:3000")
        );
        assert_eq!(config.state.resend_delay_secs, 60);
        assert_eq!(config.state.stale_multiplier, DEFAULT_STALE_MULTIPLIER);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_rejects_misaligned_min_interval() {
        let mut config = Config::default();
        config.scheduler.min_interval_secs = 15;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(_))
        ));

        config.scheduler.min_interval_secs = 20;
        config.scheduler.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load_from_file("/nonexistent/ruler.toml");
        assert!(matches!(result, Err(ConfigError::FileError(_))));
    }
}
