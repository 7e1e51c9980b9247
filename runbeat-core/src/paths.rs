//! Where RunBeat keeps its files. Config and credentials live in `~/.config/runbeat/`,
//! the log in the platform cache directory.

use std::path::PathBuf;

pub const CONFIG_DIR_NAME: &str = "runbeat";
pub const CONFIG_FILE_NAME: &str = "config.toml";
/// Hidden so it is not mistaken for something to edit by hand.
pub const CREDENTIALS_FILE_NAME: &str = ".credentials.json";
pub const LOG_FILE_NAME: &str = "runbeat.log";

/// Falls back to the working directory when no home directory is known.
#[must_use]
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join(CONFIG_DIR_NAME)
}

#[must_use]
pub fn config_path() -> PathBuf {
    config_dir().join(CONFIG_FILE_NAME)
}

#[must_use]
pub fn credentials_path() -> PathBuf {
    config_dir().join(CREDENTIALS_FILE_NAME)
}

/// Uses the config directory on platforms without a cache directory.
#[must_use]
pub fn log_file_path() -> PathBuf {
    dirs::cache_dir()
        .map_or_else(config_dir, |dir| dir.join(CONFIG_DIR_NAME))
        .join(LOG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_files_share_config_dir() {
        let dir = config_dir();
        assert!(dir.ends_with(".config/runbeat"));
        assert_eq!(config_path().parent(), Some(dir.as_path()));
        assert_eq!(credentials_path().parent(), Some(dir.as_path()));
        assert!(log_file_path().ends_with("runbeat/runbeat.log"));
    }
}
