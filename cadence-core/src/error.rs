//! Error types for the cadence training loop.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering configuration, checkpoint I/O, optimizer stepping and the run
//! itself. Every variant that concerns a file or an optimizer names it.

use std::path::PathBuf;

/// Top-level error type for the cadence core library.
#[derive(Debug, thiserror::Error)]
pub enum CadenceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from run and observer configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Reduced precision requires exactly one optimizer, found {found}: [{keys}]")]
    HalfPrecisionOptimizers { found: usize, keys: String },

    #[error("Optimizer '{key}' is not registered")]
    UnknownOptimizer { key: String },

    #[error("Parameter mismatch between model and master copy: {message}")]
    ParameterMismatch { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from checkpoint persistence.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("No checkpoint found at {path}")]
    NotFound { path: PathBuf },

    #[error("Checkpoint {path} is missing key '{key}'")]
    MissingKey { path: PathBuf, key: String },

    #[error("Checkpoint {path} is malformed: {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("Main metric '{metric}' is missing from validation metrics")]
    MissingMetric { metric: String },

    #[error("No validation metrics recorded for epoch {epoch}")]
    NoValidationMetrics { epoch: usize },

    #[error("Checkpoint directory is not configured")]
    NoLogDirectory,
}

/// Errors from optimizer stepping and state restore.
#[derive(Debug, thiserror::Error)]
pub enum OptimizerError {
    #[error("Optimizer '{key}' has no parameter groups")]
    NoParamGroups { key: String },

    #[error("Failed to load state for optimizer '{key}': {message}")]
    StateLoad { key: String, message: String },

    #[error("Parameter '{name}' has no gradient")]
    MissingGradient { name: String },

    #[error("Gradient scale must be non-zero and finite, got {scale}")]
    InvalidGradScale { scale: f32 },
}

/// Errors raised while driving the phase sequence.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Batch has no loss; the batch processor must set one during training")]
    MissingLoss,

    #[error("Loader '{name}' is empty")]
    EmptyLoader { name: String },

    #[error("Batch processing failed: {message}")]
    Batch { message: String },
}

/// A type alias for results using the top-level `CadenceError`.
pub type Result<T> = std::result::Result<T, CadenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_checkpoint_not_found() {
        let err = CadenceError::Checkpoint(CheckpointError::NotFound {
            path: PathBuf::from("/tmp/missing.json"),
        });
        assert_eq!(
            err.to_string(),
            "Checkpoint error: No checkpoint found at /tmp/missing.json"
        );
    }

    #[test]
    fn test_error_display_half_precision() {
        let err = CadenceError::Config(ConfigError::HalfPrecisionOptimizers {
            found: 2,
            keys: "encoder, head".into(),
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: Reduced precision requires exactly one optimizer, found 2: [encoder, head]"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: CadenceError = io.into();
        assert!(matches!(err, CadenceError::Io(_)));
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_error_from_sub_enum() {
        let err: CadenceError = OptimizerError::NoParamGroups { key: "main".into() }.into();
        assert_eq!(
            err.to_string(),
            "Optimizer error: Optimizer 'main' has no parameter groups"
        );
    }
}
