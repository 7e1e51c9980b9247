//! Spotify provider configuration.

use const_format::concatcp;
use runbeat_core::{CoreError, ProvidersConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Provider name used in config file
pub const PROVIDER_NAME: &str = "spotify";

/// Spotify accounts service token endpoint
pub const DEFAULT_ACCOUNTS_URL: &str = "https://accounts.spotify.com/api/token";

/// Spotify-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotifyProviderConfig {
    /// Spotify OAuth client ID
    pub client_id: String,
    /// Only needed when refreshing locally with a confidential client
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Token backend base URL (e.g. `https://runbeat.example.com`)
    #[serde(default)]
    pub backend_url: Option<String>,
    /// User id registered with the token backend
    #[serde(default)]
    pub user_id: Option<String>,
    /// Context URI played during high-intensity phases
    pub high_intensity_playlist: String,
    /// Context URI played during rest phases
    pub rest_playlist: String,
    /// Now-playing poll interval while the real-time channel is down
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Refresh tokens this long before they expire
    #[serde(default = "default_token_refresh_margin")]
    pub token_refresh_margin_secs: u64,
    #[serde(default = "default_accounts_url")]
    pub accounts_url: String,
}

const fn default_poll_interval() -> u64 {
    3000
}

const fn default_token_refresh_margin() -> u64 {
    300
}

fn default_accounts_url() -> String {
    DEFAULT_ACCOUNTS_URL.into()
}

impl SpotifyProviderConfig {
    /// Extract Spotify config from the dynamic providers config.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be parsed.
    pub fn from_providers(providers: &ProvidersConfig) -> Result<Option<Self>, CoreError> {
        providers.get(PROVIDER_NAME)
    }

    /// Validate that required fields are present.
    ///
    /// # Errors
    ///
    /// Returns an error if required fields are missing or empty.
    pub fn validate(&self) -> Result<(), CoreError> {
        let required = [
            ("providers.spotify.client_id", &self.client_id),
            (
                "providers.spotify.high_intensity_playlist",
                &self.high_intensity_playlist,
            ),
            ("providers.spotify.rest_playlist", &self.rest_playlist),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| value.is_empty()) {
            return Err(CoreError::ConfigMissingField {
                field: (*field).into(),
            });
        }

        if self.backend_url.is_some() != self.user_id.is_some() {
            return Err(CoreError::ConfigInvalid {
                message: "providers.spotify.backend_url and user_id must be set together".into(),
            });
        }
        if let Some(backend_url) = &self.backend_url {
            url::Url::parse(backend_url).map_err(|e| CoreError::ConfigInvalid {
                message: format!("providers.spotify.backend_url: {e}"),
            })?;
        }
        if self.poll_interval_ms == 0 {
            return Err(CoreError::ConfigInvalid {
                message: "providers.spotify.poll_interval_ms must be non-zero".into(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn token_refresh_margin(&self) -> Duration {
        Duration::from_secs(self.token_refresh_margin_secs)
    }
}

/// Config template for Spotify provider.
/// This is appended to the base config template when creating a new config file.
pub const CONFIG_TEMPLATE: &str = concatcp!(
    r#"[providers.spotify]
# Get the client id from https://developer.spotify.com/dashboard
client_id = ""
# Only needed for confidential clients refreshing tokens locally
# client_secret = ""
# Optional token backend; both must be set to use it
# backend_url = "https://runbeat.example.com"
# user_id = ""
high_intensity_playlist = "spotify:playlist:"
rest_playlist = "spotify:playlist:"
poll_interval_ms = 3000
token_refresh_margin_secs = 300
# accounts_url = ""#,
    DEFAULT_ACCOUNTS_URL,
    "\"\n"
);

#[cfg(test)]
mod tests {
    use super::*;
    use runbeat_core::RunbeatConfig;

    const VALID: &str = r#"
[providers.spotify]
client_id = "abc"
high_intensity_playlist = "spotify:playlist:hi"
rest_playlist = "spotify:playlist:rest"
"#;

    #[test]
    fn test_defaults() {
        let config = RunbeatConfig::parse(VALID).unwrap();
        let spotify = SpotifyProviderConfig::from_providers(&config.providers)
            .unwrap()
            .unwrap();
        spotify.validate().unwrap();
        assert_eq!(spotify.poll_interval(), Duration::from_secs(3));
        assert_eq!(spotify.token_refresh_margin(), Duration::from_secs(300));
        assert_eq!(spotify.accounts_url, DEFAULT_ACCOUNTS_URL);
        assert!(spotify.client_secret.is_none());
    }

    #[test]
    fn test_template_section_parses() {
        let template = runbeat_core::build_config_template(Some(&[CONFIG_TEMPLATE]));
        let config = RunbeatConfig::parse(&template).unwrap();
        let spotify = SpotifyProviderConfig::from_providers(&config.providers)
            .unwrap()
            .unwrap();
        assert_eq!(spotify.accounts_url, DEFAULT_ACCOUNTS_URL);
        // Template values must be filled in by the user
        assert!(matches!(
            spotify.validate(),
            Err(CoreError::ConfigMissingField { .. })
        ));
    }

    #[test]
    fn test_backend_requires_user_id() {
        let config = RunbeatConfig::parse(&format!(
            "{VALID}backend_url = \"https://runbeat.example.com\"\n"
        ))
        .unwrap();
        let spotify = SpotifyProviderConfig::from_providers(&config.providers)
            .unwrap()
            .unwrap();
        assert!(matches!(
            spotify.validate(),
            Err(CoreError::ConfigInvalid { .. })
        ));
    }
}
