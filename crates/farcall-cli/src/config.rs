//! Configuration loading from `~/.farcall/config.toml` with defaults.

use farcall_types::config::FarcallConfig;
use std::path::{Path, PathBuf};
use tracing::info;

/// Load configuration from a TOML file, falling back to defaults when the
/// file is missing or unreadable.
pub fn load_config(path: Option<&Path>) -> FarcallConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if config_path.exists() {
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<FarcallConfig>(&contents) {
                Ok(config) => {
                    info!(path = %config_path.display(), "Loaded configuration");
                    return config;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %config_path.display(),
                        "Failed to parse config, using defaults"
                    );
                }
            },
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to read config file, using defaults"
                );
            }
        }
    } else {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
    }

    FarcallConfig::default()
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".farcall")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/config.toml")));
        assert_eq!(config, FarcallConfig::default());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            log_level = "debug"

            [protocol]
            reject_unknown_operations = false
            "#
        )
        .unwrap();

        let config = load_config(Some(file.path()));
        assert_eq!(config.log_level, "debug");
        assert!(!config.log_json);
        assert!(!config.protocol.reject_unknown_operations);
        assert!(config.protocol.finalize_on_release);
    }

    #[test]
    fn test_load_config_invalid_toml_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "log_level = [not toml").unwrap();
        assert_eq!(load_config(Some(&path)), FarcallConfig::default());
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with(".farcall/config.toml"));
    }
}
