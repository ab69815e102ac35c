//! Configuration loading.
//!
//! The config is a single JSON5 file. Resolution order:
//! `SWITCHBOARD_CONFIG_PATH` > `SWITCHBOARD_STATE_DIR/switchboard.json5` >
//! `~/.switchboard/switchboard.json5`. A missing file yields the built-in
//! defaults so a bare binary still starts (and rejects everything via the
//! default final rule).

pub mod model;
pub mod validate;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

pub use model::{AppConfig, ConfigSnapshot};
pub use validate::{has_errors, validate, Issue, Severity};

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("failed to parse JSON5 at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("validation error at {path}: {message}")]
    ValidationError { path: String, message: String },
}

/// Get the config file path.
/// Priority: SWITCHBOARD_CONFIG_PATH > SWITCHBOARD_STATE_DIR/switchboard.json5
/// > ~/.switchboard/switchboard.json5
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var("SWITCHBOARD_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    state_dir().join("switchboard.json5")
}

/// Resolve the state directory used for config and persisted user records.
/// Priority: SWITCHBOARD_STATE_DIR > ~/.switchboard
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = env::var("SWITCHBOARD_STATE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".switchboard")
}

/// Load and parse the config file. Returns defaults if the file is absent.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&get_config_path())
}

/// Load and parse a config file at an explicit path.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    json5::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Load, parse, and validate the config.
///
/// Validation warnings are logged; the first hard error aborts the load.
pub fn load_validated() -> Result<AppConfig, ConfigError> {
    let config = load_config()?;
    check(&config)?;
    Ok(config)
}

/// Run the validation pass over an already-parsed config, logging warnings
/// and failing on the first hard error. Used by both startup and reload.
pub fn check(config: &AppConfig) -> Result<(), ConfigError> {
    let issues = validate(config);
    for issue in &issues {
        if issue.severity == Severity::Warning {
            warn!(target: "config", path = %issue.path, "{}", issue.message);
        }
    }
    if let Some(err) = issues.iter().find(|i| i.severity == Severity::Error) {
        return Err(ConfigError::ValidationError {
            path: err.path.clone(),
            message: err.message.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = load_config_from(Path::new("/nonexistent/switchboard.json5")).unwrap();
        assert!(config.command_sets.is_empty());
        assert_eq!(config.server.ws_port, 8765);
    }

    #[test]
    fn test_load_json5_with_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                // inline comment, trailing comma
                server: {{ ws_port: 9001 }},
                connections: [
                    {{ id: "c1", name: "backend", url: "ws://localhost:6700" }},
                ],
            }}"#
        )
        .unwrap();

        let config = load_config_from(file.path()).unwrap();
        assert_eq!(config.server.ws_port, 9001);
        assert_eq!(config.connections.len(), 1);
        assert_eq!(config.connections[0].id, "c1");
    }

    #[test]
    fn test_parse_error_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not valid").unwrap();

        let err = load_config_from(file.path()).unwrap_err();
        match err {
            ConfigError::ParseError { path, .. } => {
                assert!(path.contains(file.path().file_name().unwrap().to_str().unwrap()))
            }
            other => panic!("expected ParseError, got {other:?}"),
        }
    }

    #[test]
    fn test_check_rejects_invalid_reference() {
        let config: AppConfig = json5::from_str(
            r#"{
                command_sets: [
                    { id: "a", name: "a", target_ws: "missing",
                      commands: [{ name: "/x" }] },
                ],
            }"#,
        )
        .unwrap();
        assert!(check(&config).is_err());
    }
}
