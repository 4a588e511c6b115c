use std::path::PathBuf;

use thiserror::Error;

/// Every failure the expansion pipeline can report. Any of them aborts the
/// whole suite.
#[derive(Debug, Error)]
pub enum DesignError {
    #[error("schema_error: {path}: {message}")]
    Schema { path: String, message: String },

    #[error("duplicate_identifiers: {}", .0.join(", "))]
    Uniqueness(Vec<String>),

    #[error("factor_mismatch: experiment {experiment}: {message}")]
    FactorMismatch { experiment: String, message: String },

    #[error("inclusion_error: {0}")]
    Inclusion(String),

    #[error("template_error: {path}: {message}")]
    Template { path: String, message: String },

    #[error("reference_not_found: {0}")]
    ReferenceNotFound(String),

    #[error("io_error: {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse_error: {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

impl DesignError {
    pub(crate) fn schema(path: impl Into<String>, message: impl Into<String>) -> Self {
        DesignError::Schema {
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn factor(experiment: &str, message: impl Into<String>) -> Self {
        DesignError::FactorMismatch {
            experiment: experiment.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn template(path: impl Into<String>, message: impl Into<String>) -> Self {
        DesignError::Template {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Stable short code, used by the CLI json envelope.
    pub fn code(&self) -> &'static str {
        match self {
            DesignError::Schema { .. } => "schema_error",
            DesignError::Uniqueness(_) => "duplicate_identifiers",
            DesignError::FactorMismatch { .. } => "factor_mismatch",
            DesignError::Inclusion(_) => "inclusion_error",
            DesignError::Template { .. } => "template_error",
            DesignError::ReferenceNotFound(_) => "reference_not_found",
            DesignError::Io { .. } => "io_error",
            DesignError::Parse { .. } => "parse_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, DesignError>;
