//! Template error types.

use thiserror::Error;

/// Errors produced while parsing or resolving template strings.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TemplateError {
    /// The expression inside a `${...}` clause could not be parsed.
    #[error("invalid template expression: {0}")]
    Parse(String),

    /// Unbalanced `${if}`/`${else}`/`${endif}` structure.
    #[error("invalid template structure: {0}")]
    Structure(String),

    /// A referenced key could not be found in any context layer.
    #[error("could not find key {path}{}", format_detail(.message))]
    MissingKey {
        path: String,
        message: Option<String>,
    },

    /// An operator was applied to operands of the wrong type.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// A lazy context re-entered an entity that is already being resolved.
    #[error("circular reference detected when resolving {path}")]
    Circular { path: String },
}

impl TemplateError {
    /// Create a missing-key error for the given path.
    pub fn missing(path: impl Into<String>) -> Self {
        Self::MissingKey {
            path: path.into(),
            message: None,
        }
    }

    /// Create a missing-key error with an explanatory message.
    pub fn missing_with(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MissingKey {
            path: path.into(),
            message: Some(message.into()),
        }
    }

    pub fn is_missing_key(&self) -> bool {
        matches!(self, Self::MissingKey { .. })
    }
}

fn format_detail(message: &Option<String>) -> String {
    match message {
        Some(m) => format!(" ({})", m),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_display_includes_detail() {
        let err = TemplateError::missing_with("var.foo", "no variable named foo");
        assert_eq!(
            err.to_string(),
            "could not find key var.foo (no variable named foo)"
        );
        assert!(err.is_missing_key());
    }
}
