use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    capture::command::default_capture_command,
    classify::{gemini, openai, ProviderKind},
    tracker::rate_limit::{DEFAULT_PER_HOUR, DEFAULT_PER_MINUTE},
};

pub const SETTINGS_FILE: &str = "settings.toml";
pub const MIN_INTERVAL_SECONDS: u64 = 5;
pub const MAX_INTERVAL_SECONDS: u64 = 24 * 60 * 60;
pub const MAX_AUTO_STOP_MINUTES: u64 = 7 * 24 * 60;
pub const DEFAULT_INTERVAL_SECONDS: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 60;

/// Tracker settings. Every field is optional in `settings.toml`; command line flags take
/// precedence over the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Settings {
    /// Base scan interval in seconds.
    pub interval: u64,
    pub auto_stop_minutes: Option<u64>,
    pub provider: ProviderKind,
    pub model: Option<String>,
    pub api_key_env: Option<String>,
    /// Alternative endpoint for OpenAI compatible servers.
    pub base_url: Option<String>,
    pub request_timeout: u64,
    pub per_minute: usize,
    pub per_hour: usize,
    pub capture_command: Option<Vec<String>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL_SECONDS,
            auto_stop_minutes: None,
            provider: ProviderKind::Gemini,
            model: None,
            api_key_env: None,
            base_url: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT_SECONDS,
            per_minute: DEFAULT_PER_MINUTE,
            per_hour: DEFAULT_PER_HOUR,
            capture_command: None,
        }
    }
}

impl Settings {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(SETTINGS_FILE)
    }

    /// Reads `settings.toml` from `dir`. A missing file gives the defaults.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = Self::path(dir);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No settings at {path:?}, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to read {path:?}")),
        };
        let settings = Self::parse(&raw).with_context(|| format!("Invalid settings in {path:?}"))?;
        info!("Loaded settings from {path:?}");
        Ok(settings)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let settings: Self = toml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_INTERVAL_SECONDS..=MAX_INTERVAL_SECONDS).contains(&self.interval) {
            bail!(
                "Scan interval must be between {MIN_INTERVAL_SECONDS} and {MAX_INTERVAL_SECONDS} seconds, got {}",
                self.interval
            );
        }
        if self
            .auto_stop_minutes
            .is_some_and(|m| m > MAX_AUTO_STOP_MINUTES)
        {
            bail!("Auto-stop can be at most {MAX_AUTO_STOP_MINUTES} minutes");
        }
        if self.per_minute == 0 || self.per_hour == 0 {
            bail!("Rate limits must allow at least one scan");
        }
        if self.request_timeout == 0 {
            bail!("Request timeout must be positive");
        }
        if self
            .capture_command
            .as_ref()
            .is_some_and(|c| c.first().map_or(true, |program| program.trim().is_empty()))
        {
            bail!("Capture command must name a program");
        }
        Ok(())
    }

    pub fn model(&self) -> String {
        self.model.clone().unwrap_or_else(|| {
            match self.provider {
                ProviderKind::Gemini => gemini::DEFAULT_MODEL,
                ProviderKind::OpenAi => openai::DEFAULT_MODEL,
            }
            .to_string()
        })
    }

    pub fn api_key_env(&self) -> String {
        self.api_key_env.clone().unwrap_or_else(|| {
            match self.provider {
                ProviderKind::Gemini => gemini::DEFAULT_API_KEY_ENV,
                ProviderKind::OpenAi => openai::DEFAULT_API_KEY_ENV,
            }
            .to_string()
        })
    }

    pub fn capture_command(&self) -> Vec<String> {
        self.capture_command
            .clone()
            .unwrap_or_else(default_capture_command)
    }

    pub fn auto_stop_seconds(&self) -> Option<u64> {
        self.auto_stop_minutes
            .filter(|m| *m > 0)
            .map(|m| m.saturating_mul(60))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() -> Result<()> {
        let dir = tempdir()?;
        assert_eq!(Settings::load(dir.path())?, Settings::default());
        Ok(())
    }

    #[test]
    fn test_partial_file() -> Result<()> {
        let dir = tempdir()?;
        std::fs::write(
            Settings::path(dir.path()),
            r#"
interval = 45
provider = "openai"
auto-stop-minutes = 90
capture-command = ["import", "-window", "root", "png:-"]
"#,
        )?;
        let settings = Settings::load(dir.path())?;
        assert_eq!(settings.interval, 45);
        assert_eq!(settings.provider, ProviderKind::OpenAi);
        assert_eq!(settings.auto_stop_seconds(), Some(5400));
        assert_eq!(settings.model(), openai::DEFAULT_MODEL);
        assert_eq!(settings.api_key_env(), "OPENAI_API_KEY");
        assert_eq!(settings.capture_command()[0], "import");
        assert_eq!(settings.per_minute, DEFAULT_PER_MINUTE);
        Ok(())
    }

    #[test]
    fn test_validation() {
        assert!(Settings::parse("interval = 4").is_err());
        assert!(Settings::parse("interval = 5").is_ok());
        assert!(Settings::parse("interval = 86400").is_ok());
        assert!(Settings::parse("interval = 86401").is_err());
        assert!(Settings::parse("interval = 9223372036854775807").is_err());
        assert!(Settings::parse("auto-stop-minutes = 10080").is_ok());
        assert!(Settings::parse("auto-stop-minutes = 9223372036854775807").is_err());
        assert!(Settings::parse("per-minute = 0").is_err());
        assert!(Settings::parse("per-hour = 0").is_err());
        assert!(Settings::parse("capture-command = []").is_err());
        assert!(Settings::parse("unknown-key = 1").is_err());
    }

    #[test]
    fn test_zero_auto_stop_is_disabled() {
        let settings = Settings {
            auto_stop_minutes: Some(0),
            ..Default::default()
        };
        assert_eq!(settings.auto_stop_seconds(), None);
    }
}
