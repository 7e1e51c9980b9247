use clap::{Parser, Subcommand};
use runbeat_core::{
    AccessToken, CoreError, CredentialStore, IntervalPhase, IntervalTrainingScheduler,
    RunbeatConfig, ServiceError, TrackUpdate, TrainingConfig,
};
use runbeat_spotify::{
    FileCredentialStore, SpotifyOrchestrator, SpotifyProviderConfig, SPOTIFY_CONFIG_TEMPLATE,
    SPOTIFY_TOKEN_KEY,
};
use std::fs::File;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Grace period for the final pause command after a session ends
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "runbeat")]
#[command(about = "Interval training synchronized with Spotify playback", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an interval training session
    Train {
        /// Override the number of intervals from the config file
        #[arg(short, long)]
        intervals: Option<u32>,
    },

    /// Store a Spotify refresh token and exchange it for an access token
    Login {
        #[arg(long, value_name = "TOKEN")]
        refresh_token: String,
    },

    /// Forget stored Spotify credentials
    Logout,
}

fn main() {
    let cli = Cli::parse();

    // Check config for logging.enabled before full config load
    init_tracing(check_file_logging_enabled());

    if matches!(cli.command, Commands::Logout) {
        logout();
        return;
    }

    let provider_templates: &[&str] = &[SPOTIFY_CONFIG_TEMPLATE];
    let config = match RunbeatConfig::load_or_create(Some(provider_templates)) {
        Ok(config) => config,
        Err(e @ CoreError::ConfigNotFound { .. }) => {
            info!("{e}");
            std::process::exit(0);
        }
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let spotify_config = match load_spotify_config(&config) {
        Ok(spotify_config) => spotify_config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    // Create shared cancellation token for graceful shutdown
    let cancel_token = CancellationToken::new();
    let ctrlc_token = cancel_token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received Ctrl+C, shutting down gracefully...");
        ctrlc_token.cancel();
    }) {
        error!("Failed to set Ctrl+C handler: {}", e);
    }

    let result = runtime.block_on(async move {
        let orchestrator = match SpotifyOrchestrator::from_config(&spotify_config, &config.recovery)
        {
            Ok(orchestrator) => orchestrator,
            Err(e) => {
                error!("Failed to set up Spotify: {e}");
                std::process::exit(1);
            }
        };

        let result = match cli.command {
            Commands::Train { intervals } => {
                let mut training = config.training.clone();
                if let Some(intervals) = intervals.filter(|&n| n > 0) {
                    training.total_intervals = intervals;
                }
                run_training(&training, &orchestrator, &cancel_token).await
            }
            Commands::Login { refresh_token } => login(&orchestrator, refresh_token).await,
            Commands::Logout => Ok(()),
        };
        orchestrator.shutdown();
        result
    });

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

fn load_spotify_config(config: &RunbeatConfig) -> Result<SpotifyProviderConfig, CoreError> {
    let spotify_config = SpotifyProviderConfig::from_providers(&config.providers)?.ok_or_else(
        || CoreError::ConfigMissingField {
            field: "providers.spotify".into(),
        },
    )?;
    spotify_config.validate()?;
    Ok(spotify_config)
}

fn logout() {
    let store = FileCredentialStore::at_default_path();
    match store.delete(SPOTIFY_TOKEN_KEY) {
        Ok(()) => info!("Removed stored Spotify credentials"),
        Err(e) => {
            error!("Failed to remove credentials at {}: {e}", store.path().display());
            std::process::exit(1);
        }
    }
}

async fn login(
    orchestrator: &Arc<SpotifyOrchestrator>,
    refresh_token: String,
) -> Result<(), ServiceError> {
    // An already expired access token forces an exchange on connect
    let seed = AccessToken::new(String::new(), Some(refresh_token), Duration::ZERO);
    let stored = seed
        .to_stored()
        .and_then(|stored| FileCredentialStore::at_default_path().put(SPOTIFY_TOKEN_KEY, &stored));
    if let Err(e) = stored {
        error!("Failed to store refresh token: {e}");
        std::process::exit(1);
    }

    orchestrator.connect().await?;
    info!("Signed in to Spotify");
    orchestrator.disconnect().await;
    Ok(())
}

async fn run_training(
    training: &TrainingConfig,
    orchestrator: &Arc<SpotifyOrchestrator>,
    cancel_token: &CancellationToken,
) -> Result<(), ServiceError> {
    orchestrator.connect().await?;

    let scheduler = IntervalTrainingScheduler::new(training, orchestrator.clone());
    let mut status = scheduler.subscribe();
    let mut tracks = orchestrator.current_track();
    let mut errors = orchestrator.displayed_errors();
    let mut connection = orchestrator.connection_state();

    scheduler.start().await;
    let mut announced = (IntervalPhase::NotStarted, 0);

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Stopping training");
                scheduler.stop().await;
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                if (current.phase, current.interval) != announced {
                    announced = (current.phase, current.interval);
                    match current.phase {
                        IntervalPhase::Completed => {
                            info!("Training complete");
                            break;
                        }
                        phase => info!(
                            "Interval {}/{}: {} ({}s)",
                            current.interval,
                            current.total_intervals,
                            phase,
                            current.remaining_secs
                        ),
                    }
                }
            }
            update = tracks.recv() => match update {
                Ok(TrackUpdate { track: Some(track), source }) => {
                    info!(
                        "Now playing: {} - {} (playing: {}, via {:?})",
                        track.artist, track.name, track.is_playing, source
                    );
                }
                Ok(TrackUpdate { track: None, .. }) => info!("Nothing playing"),
                Err(RecvError::Lagged(n)) => debug!("Missed {} track updates", n),
                Err(RecvError::Closed) => break,
            },
            changed = errors.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(shown) = errors.borrow_and_update().clone() {
                    warn!("{}: {}", shown.operation, shown.error);
                }
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                debug!("Connection state: {}", connection.borrow_and_update().name());
            }
        }
    }

    tokio::time::sleep(SHUTDOWN_GRACE).await;
    orchestrator.disconnect().await;
    Ok(())
}

/// Check if file logging is enabled by reading the config file.
/// Returns `false` if config doesn't exist or can't be parsed.
fn check_file_logging_enabled() -> bool {
    #[derive(serde::Deserialize)]
    struct PartialConfig {
        #[serde(default)]
        logging: PartialLoggingConfig,
    }
    #[derive(serde::Deserialize, Default)]
    struct PartialLoggingConfig {
        #[serde(default)]
        enabled: bool,
    }

    let Ok(content) = std::fs::read_to_string(RunbeatConfig::config_path()) else {
        return false;
    };

    toml::from_str::<PartialConfig>(&content)
        .map(|c| c.logging.enabled)
        .unwrap_or(false)
}

/// Initialize tracing with console output and optional file logging
fn init_tracing(file_logging_enabled: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rspotify_http=warn"));

    let fmt_layer = tracing_subscriber::fmt::layer();

    if file_logging_enabled {
        let log_path = runbeat_core::log_file_path();
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        match File::create(&log_path) {
            Ok(file) => {
                let file_layer = tracing_subscriber::fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(file_layer)
                    .init();
                return;
            }
            Err(e) => {
                eprintln!("Failed to create log file at {}: {e}", log_path.display());
            }
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
