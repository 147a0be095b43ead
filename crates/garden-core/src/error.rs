//! Error kinds for the core engine.
//!
//! The solver classifies errors into task-fatal kinds (the task fails, the
//! pass continues on independent branches) and command-fatal kinds
//! (configuration and internal errors abort the pass).

use thiserror::Error;

use garden_config::ConfigError;
use garden_template::TemplateError;

/// Unified error type for the engine.
#[derive(Debug, Clone, Error)]
pub enum GardenError {
    /// Schema or template failure; fatal for the command.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Bad CLI input; fatal for the command.
    #[error("parameter error: {0}")]
    Parameter(String),

    /// Handler-internal failure; task-fatal, not command-fatal.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Plugin-reported execution failure.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// A required handler is missing from the provider.
    #[error("provider '{provider}' does not implement handler '{handler}'")]
    NotImplemented { provider: String, handler: String },

    /// A task exceeded its declared timeout.
    #[error("timed out after {0} seconds")]
    Timeout(u64),

    /// The pass was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invariant violation; fatal, surfaces a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GardenError {
    pub fn not_implemented(provider: impl Into<String>, handler: impl Into<String>) -> Self {
        Self::NotImplemented {
            provider: provider.into(),
            handler: handler.into(),
        }
    }

    /// Whether this error aborts the whole pass rather than a single task.
    pub fn is_command_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Parameter(_) | Self::Internal(_)
        )
    }

    /// Process exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) | Self::Parameter(_) => 2,
            Self::Cancelled => 130,
            _ => 1,
        }
    }
}

impl From<ConfigError> for GardenError {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<TemplateError> for GardenError {
    fn from(err: TemplateError) -> Self {
        Self::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_per_kind() {
        assert_eq!(GardenError::Configuration("x".into()).exit_code(), 2);
        assert_eq!(GardenError::Parameter("x".into()).exit_code(), 2);
        assert_eq!(GardenError::Runtime("x".into()).exit_code(), 1);
        assert_eq!(GardenError::Cancelled.exit_code(), 130);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(GardenError::Internal("bug".into()).is_command_fatal());
        assert!(!GardenError::Plugin("boom".into()).is_command_fatal());
        assert!(!GardenError::Timeout(5).is_command_fatal());
    }
}
