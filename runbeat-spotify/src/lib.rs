pub mod config;
pub mod credentials;
pub mod error;
pub mod orchestrator;
pub mod poller;
pub mod realtime;
pub mod token;
pub mod web_api;

pub use config::{SpotifyProviderConfig, CONFIG_TEMPLATE as SPOTIFY_CONFIG_TEMPLATE};
pub use credentials::{FileCredentialStore, SPOTIFY_TOKEN_KEY};
pub use error::SpotifyError;
pub use orchestrator::{OrchestratorSettings, SpotifyChannels, SpotifyOrchestrator};
pub use poller::NowPlayingPoller;
pub use realtime::UnavailableRealtimeChannel;
pub use token::{BackendTokenClient, LocalTokenRefresher};
pub use web_api::SpotifyWebApi;
