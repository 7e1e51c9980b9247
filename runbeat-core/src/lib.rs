pub mod channel;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod intent;
pub mod paths;
pub mod recovery;
pub mod time;
pub mod track;
pub mod training;

pub use channel::{
    CredentialStore, MemoryCredentialStore, PlaybackDevice, RealtimeChannel, RealtimeEvent,
    RequestApiChannel, ServiceResult, TokenSource,
};
pub use config::{
    build_config_template, LoggingConfig, ProvidersConfig, RecoveryConfig, RunbeatConfig,
    TrainingConfig,
};
pub use connection::{AccessToken, ConnectionEvent, ConnectionState, ConnectionStateMachine};
pub use coordinator::{TrackDataCoordinator, TrackUpdate, STALENESS_WINDOW};
pub use error::{CoreError, ErrorCategory, ServiceError};
pub use intent::{Intent, IntentTransition};
pub use paths::{
    config_dir, config_path, credentials_path, log_file_path, CONFIG_DIR_NAME,
    CONFIG_FILE_NAME, CREDENTIALS_FILE_NAME, LOG_FILE_NAME,
};
pub use recovery::{
    decide, ChannelKind, DisplayedError, ErrorRecoveryEngine, ExecuteOutcome, FallbackStrategy,
    Priority, RecoveryContext, RecoveryDecision, RecoveryHandler, RecoveryOperation,
};
pub use time::DurationExt;
pub use track::{SnapshotSource, TrackSnapshot};
pub use training::{
    IntervalPhase, IntervalState, IntervalTrainingScheduler, TrainingPlayback, TrainingProtocol,
    TrainingStatus,
};
