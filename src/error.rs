use thiserror::Error;

use crate::issues::ValidationIssue;

#[derive(Error, Debug)]
pub enum HarmonizeError {
    /// Malformed specification or dependency cycle, detected before any stage runs.
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("Constraint violation in entity '{entity}': {}", summarize(.issues))]
    ConstraintViolation {
        entity: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("Source extraction failed for entity '{entity}': {message}")]
    Source { entity: String, message: String },

    /// Transform failure inside a stage (missing column, bad pattern).
    #[error("Stage '{stage}' failed for entity '{entity}': {message}")]
    Stage {
        entity: String,
        stage: &'static str,
        message: String,
    },

    #[error("Reconciliation service error: {0}")]
    ReconciliationService(String),

    #[error("Store failed for entity '{entity}': {message}")]
    Store { entity: String, message: String },

    #[error("Mapping registry error: {0}")]
    Registry(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarmonizeError {
    pub fn configuration(message: impl Into<String>, issues: Vec<ValidationIssue>) -> Self {
        Self::Configuration {
            message: message.into(),
            issues,
        }
    }

    pub fn source(entity: &str, message: impl Into<String>) -> Self {
        Self::Source {
            entity: entity.to_string(),
            message: message.into(),
        }
    }

    pub fn stage(entity: &str, stage: &'static str, message: impl Into<String>) -> Self {
        Self::Stage {
            entity: entity.to_string(),
            stage,
            message: message.into(),
        }
    }

    pub fn store(entity: &str, message: impl Into<String>) -> Self {
        Self::Store {
            entity: entity.to_string(),
            message: message.into(),
        }
    }

    /// Issues carried by this error, if any.
    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            Self::Configuration { issues, .. } | Self::ConstraintViolation { issues, .. } => issues,
            _ => &[],
        }
    }
}

fn summarize(issues: &[ValidationIssue]) -> String {
    match issues {
        [] => "no details".to_string(),
        [only] => only.message.clone(),
        [first, rest @ ..] => format!("{} (and {} more)", first.message, rest.len()),
    }
}

pub type Result<T> = std::result::Result<T, HarmonizeError>;
