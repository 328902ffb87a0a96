//! Configuration for a kernel compile

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CompileError, CompileResult};

/// Environment variable that switches development mode on
pub const DEV_MODE_ENV: &str = "KERNEL_IR_DEV_MODE";

/// Configuration for the kernel parser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Surface errors verbatim instead of wrapping them into an opaque failure
    pub dev_mode: bool,
    /// Upper bound on dependency analysis passes
    pub max_analysis_passes: usize,
    /// File name recorded in IR spans
    pub file_name: String,
    /// Line of the source file where the kernel source starts (1-based)
    pub first_line: usize,
    /// Name of the trailing session-handle parameter
    pub handle_name: String,
}

impl ParserConfig {
    pub fn new(dev_mode: bool) -> Self {
        Self {
            dev_mode,
            ..Self::default()
        }
    }

    /// Default configuration, with `dev_mode` taken from the environment
    pub fn from_env() -> Self {
        let dev_mode = std::env::var(DEV_MODE_ENV)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        Self::new(dev_mode)
    }

    /// Load a configuration from a JSON file; missing fields take defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> CompileResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CompileError::config(format!("failed to read '{}': {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> CompileResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| CompileError::config(format!("invalid JSON: {}", e)))
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            dev_mode: false,
            max_analysis_passes: 64,
            file_name: "<kernel>".to_string(),
            first_line: 1,
            handle_name: "__session_handle".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ParserConfig::from_json(r#"{ "dev_mode": true }"#).unwrap();
        assert!(config.dev_mode);
        assert_eq!(config.max_analysis_passes, 64);
        assert_eq!(config.handle_name, "__session_handle");
    }

    #[test]
    fn test_bad_json_is_a_config_error() {
        let err = ParserConfig::from_json("{ dev_mode: }").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().starts_with("Config error: invalid JSON"));
    }

    #[test]
    fn test_missing_file_is_a_config_error() {
        let err = ParserConfig::from_json_file("/nonexistent/kernel-ir.json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
