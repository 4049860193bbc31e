//! Configuration Error Types
//!
//! Specific, actionable errors for configuration loading and validation.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors with detailed context
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Configuration file not found at expected locations
    #[error("Configuration file not found. Searched paths: {searched_paths:?}")]
    ConfigFileNotFound { searched_paths: Vec<PathBuf> },

    /// Invalid YAML syntax in configuration file
    #[error("Invalid YAML in configuration file '{file_path}': {error}")]
    InvalidYaml { file_path: String, error: String },

    /// Missing required configuration field
    #[error("Missing required configuration field '{field}' in {context}")]
    MissingRequiredField { field: String, context: String },

    /// Invalid configuration value
    #[error("Invalid value '{value}' for field '{field}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },

    /// File I/O errors during configuration loading
    #[error("Failed to read configuration file '{file_path}': {error}")]
    FileReadError { file_path: String, error: String },
}

impl ConfigurationError {
    /// Create a configuration file not found error
    pub fn config_file_not_found(searched_paths: Vec<PathBuf>) -> Self {
        Self::ConfigFileNotFound { searched_paths }
    }

    /// Create an invalid YAML error
    pub fn invalid_yaml<P: Into<String>, E: std::fmt::Display>(file_path: P, error: E) -> Self {
        Self::InvalidYaml {
            file_path: file_path.into(),
            error: error.to_string(),
        }
    }

    /// Create a missing required field error
    pub fn missing_required_field<F: Into<String>, C: Into<String>>(field: F, context: C) -> Self {
        Self::MissingRequiredField {
            field: field.into(),
            context: context.into(),
        }
    }

    /// Create an invalid value error
    pub fn invalid_value<F: Into<String>, V: Into<String>, C: Into<String>>(
        field: F,
        value: V,
        context: C,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            context: context.into(),
        }
    }

    /// Create a file read error
    pub fn file_read_error<P: Into<String>, E: std::fmt::Display>(file_path: P, error: E) -> Self {
        Self::FileReadError {
            file_path: file_path.into(),
            error: error.to_string(),
        }
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigurationError>;

impl From<ConfigurationError> for crate::error::EngineError {
    fn from(err: ConfigurationError) -> Self {
        crate::error::EngineError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_not_found_error() {
        let paths = vec![PathBuf::from("/path/1"), PathBuf::from("/path/2")];
        let error = ConfigurationError::config_file_not_found(paths);

        let error_string = error.to_string();
        assert!(error_string.contains("Configuration file not found"));
        assert!(error_string.contains("/path/1"));
        assert!(error_string.contains("/path/2"));
    }

    #[test]
    fn test_invalid_value_error() {
        let error = ConfigurationError::invalid_value(
            "messaging.workers_per_type",
            "0",
            "at least one worker is required",
        );

        let error_string = error.to_string();
        assert!(error_string.contains("Invalid value '0' for field 'messaging.workers_per_type'"));
        assert!(error_string.contains("at least one worker is required"));
    }

    #[test]
    fn test_converts_into_engine_error() {
        let err: crate::error::EngineError =
            ConfigurationError::missing_required_field("database.host", "database configuration")
                .into();
        assert!(err.to_string().starts_with("configuration error:"));
    }
}
