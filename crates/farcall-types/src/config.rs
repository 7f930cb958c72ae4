//! Configuration types.

use serde::{Deserialize, Serialize};

/// Protocol behavior switches shared by every dispatcher created from a codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Reply to requests of an unknown operation type with a `TypeError`.
    ///
    /// When `false`, such requests are logged and dropped without a reply,
    /// leaving the caller's request pending.
    pub reject_unknown_operations: bool,
    /// Run the exposed root's finalizer when a handle releases its channel.
    pub finalize_on_release: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            reject_unknown_operations: true,
            finalize_on_release: true,
        }
    }
}

/// Top-level configuration for the `farcall` binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FarcallConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit logs as JSON lines.
    pub log_json: bool,
    /// Protocol switches.
    pub protocol: ProtocolConfig,
}

impl Default for FarcallConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            protocol: ProtocolConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FarcallConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(!config.log_json);
        assert!(config.protocol.reject_unknown_operations);
        assert!(config.protocol.finalize_on_release);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: FarcallConfig = toml::from_str(
            r#"
            log_level = "debug"

            [protocol]
            reject_unknown_operations = false
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(!config.protocol.reject_unknown_operations);
        assert!(config.protocol.finalize_on_release);
    }
}
