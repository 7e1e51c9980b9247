use crate::error::{CoreError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunbeatConfig {
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Provider-specific sections, parsed lazily by the provider crates.
    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// Interval protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_high_intensity_secs")]
    pub high_intensity_secs: u64,
    #[serde(default = "default_rest_secs")]
    pub rest_secs: u64,
    #[serde(default = "default_total_intervals")]
    pub total_intervals: u32,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

const fn default_high_intensity_secs() -> u64 {
    240
}

const fn default_rest_secs() -> u64 {
    180
}

const fn default_total_intervals() -> u32 {
    8
}

const fn default_tick_ms() -> u64 {
    1000
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            high_intensity_secs: default_high_intensity_secs(),
            rest_secs: default_rest_secs(),
            total_intervals: default_total_intervals(),
            tick_ms: default_tick_ms(),
        }
    }
}

/// Error recovery limits and channel timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_critical_budget")]
    pub critical_budget: usize,
    #[serde(default = "default_single_budget")]
    pub enhancing_budget: usize,
    #[serde(default = "default_single_budget")]
    pub background_budget: usize,
    #[serde(default = "default_max_realtime_attempts")]
    pub max_realtime_attempts: u32,
    #[serde(default = "default_realtime_connect_timeout_ms")]
    pub realtime_connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_validation_timeout_secs")]
    pub validation_timeout_secs: u64,
}

const fn default_critical_budget() -> usize {
    2
}

const fn default_single_budget() -> usize {
    1
}

const fn default_max_realtime_attempts() -> u32 {
    3
}

const fn default_realtime_connect_timeout_ms() -> u64 {
    3500
}

const fn default_request_timeout_secs() -> u64 {
    10
}

const fn default_validation_timeout_secs() -> u64 {
    5
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            critical_budget: default_critical_budget(),
            enhancing_budget: default_single_budget(),
            background_budget: default_single_budget(),
            max_realtime_attempts: default_max_realtime_attempts(),
            realtime_connect_timeout_ms: default_realtime_connect_timeout_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            validation_timeout_secs: default_validation_timeout_secs(),
        }
    }
}

impl RecoveryConfig {
    #[must_use]
    pub const fn realtime_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.realtime_connect_timeout_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub const fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also write logs to a file in the cache directory
    #[serde(default)]
    pub enabled: bool,
}

/// Dynamic `[providers.*]` tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvidersConfig(toml::Table);

impl ProvidersConfig {
    /// Deserialize the section for `name`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the section exists but does not match `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.0
            .get(name)
            .cloned()
            .map(|value| value.try_into::<T>())
            .transpose()
            .map_err(CoreError::from)
    }
}

impl RunbeatConfig {
    /// Get the config file path (~/.config/runbeat/config.toml)
    #[must_use]
    pub fn config_path() -> PathBuf {
        crate::paths::config_path()
    }

    /// Load config from the default path, or write a template on first run.
    ///
    /// `provider_templates` are appended to the base template so that each provider
    /// crate can document its own section.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConfigNotFound`] when the template was just created, or an
    /// error if the file cannot be read or parsed.
    pub fn load_or_create(provider_templates: Option<&[&str]>) -> Result<Self> {
        Self::load_or_create_at(&Self::config_path(), provider_templates)
    }

    /// Same as [`Self::load_or_create`] for an explicit path.
    ///
    /// # Errors
    ///
    /// See [`Self::load_or_create`].
    pub fn load_or_create_at(path: &Path, provider_templates: Option<&[&str]>) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, build_config_template(provider_templates))?;
            return Err(CoreError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate config content.
    ///
    /// # Errors
    ///
    /// Returns an error on TOML syntax errors or invalid training values.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.training.total_intervals == 0 {
            return Err(CoreError::ConfigInvalid {
                message: "training.total_intervals must be at least 1".into(),
            });
        }
        if self.training.high_intensity_secs == 0 || self.training.rest_secs == 0 {
            return Err(CoreError::ConfigInvalid {
                message: "training phase lengths must be non-zero".into(),
            });
        }
        if self.training.tick_ms == 0 {
            return Err(CoreError::ConfigInvalid {
                message: "training.tick_ms must be non-zero".into(),
            });
        }
        Ok(())
    }
}

/// Build the full config template with optional provider sections appended.
#[must_use]
pub fn build_config_template(provider_templates: Option<&[&str]>) -> String {
    let mut template = CONFIG_TEMPLATE.to_string();
    for section in provider_templates.unwrap_or_default() {
        template.push('\n');
        template.push_str(section);
    }
    template
}

const CONFIG_TEMPLATE: &str = r"# RunBeat Configuration
# ~/.config/runbeat/config.toml

[training]
# Interval protocol: high intensity and rest phases alternate, starting with high intensity
high_intensity_secs = 240
rest_secs = 180
total_intervals = 8
tick_ms = 1000

[recovery]
# Concurrent recovery budgets per priority class
critical_budget = 2
enhancing_budget = 1
background_budget = 1
max_realtime_attempts = 3
realtime_connect_timeout_ms = 3500
request_timeout_secs = 10
validation_timeout_secs = 5

[logging]
# Also write logs to runbeat.log in the cache directory
enabled = false
";

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct DummyProvider {
        playlist: String,
    }

    #[test]
    fn test_template_parses_with_defaults() {
        let config = RunbeatConfig::parse(&build_config_template(None)).unwrap();
        assert_eq!(config.training.high_intensity_secs, 240);
        assert_eq!(config.training.rest_secs, 180);
        assert_eq!(config.training.total_intervals, 8);
        assert_eq!(config.recovery.critical_budget, 2);
        assert!(!config.logging.enabled);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = RunbeatConfig::parse("").unwrap();
        assert_eq!(config.recovery.realtime_connect_timeout(), Duration::from_millis(3500));
        assert_eq!(config.recovery.validation_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_provider_section_lookup() {
        let config = RunbeatConfig::parse(
            r#"
[providers.dummy]
playlist = "spotify:playlist:abc"
"#,
        )
        .unwrap();

        let dummy: Option<DummyProvider> = config.providers.get("dummy").unwrap();
        assert_eq!(dummy.unwrap().playlist, "spotify:playlist:abc");

        let missing: Option<DummyProvider> = config.providers.get("missing").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let result = RunbeatConfig::parse("[training]\ntotal_intervals = 0\n");
        assert!(matches!(result, Err(CoreError::ConfigInvalid { .. })));
    }

    #[test]
    fn test_parse_error_surfaces() {
        let result = RunbeatConfig::parse("[training\n");
        assert!(matches!(result, Err(CoreError::ConfigParseError(_))));
    }

    #[test]
    fn test_provider_templates_appended() {
        let template = build_config_template(Some(&["[providers.dummy]\nplaylist = \"x\"\n"]));
        assert!(template.contains("[providers.dummy]"));
        assert!(template.starts_with("# RunBeat Configuration"));
    }
}
