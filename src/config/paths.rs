//! Data directory resolution.
//!
//! Everything the core persists (config file, log, models) lives under one
//! per-user directory:
//!
//!   macOS:   ~/Library/Application Support/assistant-core/data
//!   Linux:   $XDG_CONFIG_HOME/assistant-core/data (default ~/.config/...)
//!   Windows: %APPDATA%\assistant-core\data
//!
//! `ASSISTANT_CORE_DATA_DIR` overrides the whole path, which is how tests
//! and portable installs point the core at a scratch directory.

use std::path::PathBuf;

const APP_NAME: &str = "assistant-core";

/// Environment override for the data directory.
pub const DATA_DIR_ENV: &str = "ASSISTANT_CORE_DATA_DIR";

/// Resolve the assistant data directory.
///
/// `dirs::config_dir` already maps to the right per-platform base
/// (Application Support, XDG config, %APPDATA%); a homeless environment
/// falls back to the working directory rather than failing.
pub fn get_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
        .join("data")
}

/// Directory holding the ONNX models (wake word, VAD).
pub fn get_model_dir() -> PathBuf {
    get_data_dir().join("models")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_dir_is_under_data_dir() {
        let data = get_data_dir();
        let models = get_model_dir();
        assert!(models.starts_with(&data));
        assert!(models.ends_with("models"));
    }

    #[test]
    fn data_dir_is_namespaced_unless_overridden() {
        if std::env::var_os(DATA_DIR_ENV).is_none() {
            let dir = get_data_dir();
            assert!(dir.to_str().is_some_and(|s| s.contains(APP_NAME)));
        }
    }
}
