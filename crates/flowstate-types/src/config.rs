//! Engine configuration types.
//!
//! `EngineConfig` is the optional `flowstate.toml` that tunes interpreter
//! behavior. All fields have defaults, so an empty file is valid.

use serde::{Deserialize, Serialize};

/// Tunables for the interpreter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum nesting of intrinsic calls inside one expression.
    #[serde(default = "default_max_intrinsic_depth")]
    pub max_intrinsic_depth: usize,

    /// Also compare `ErrorEquals` entries against the error message.
    #[serde(default)]
    pub match_error_messages: bool,

    /// Concurrency used by Map states that set neither `MaxConcurrency`
    /// nor `MaxConcurrencyPath`. `None` means unbounded.
    #[serde(default)]
    pub default_max_concurrency: Option<usize>,

    /// Suppress per-effect logging.
    #[serde(default)]
    pub quiet: bool,
}

fn default_max_intrinsic_depth() -> usize {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_intrinsic_depth: default_max_intrinsic_depth(),
            match_error_messages: false,
            default_max_concurrency: None,
            quiet: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_intrinsic_depth, 10);
        assert!(!config.match_error_messages);
        assert_eq!(config.default_max_concurrency, None);
        assert!(!config.quiet);
    }

    #[test]
    fn test_engine_config_deserialize_empty() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
max_intrinsic_depth = 4
match_error_messages = true
default_max_concurrency = 8
quiet = true
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_intrinsic_depth, 4);
        assert!(config.match_error_messages);
        assert_eq!(config.default_max_concurrency, Some(8));
        assert!(config.quiet);
    }
}
