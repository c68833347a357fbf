use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity levels for validation issues
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational note, never blocks a run
    Info,
    /// Notable issue worth flagging
    Warning,
    /// Blocks execution unless the run collects issues
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Machine-readable classification of an issue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    // Specification problems
    DuplicateEntity,
    MissingSurrogateId,
    UnknownEntity,
    SelfReference,
    KeyLengthMismatch,
    EmptyKeys,
    UnknownFilterKind,
    UnknownLoaderKind,
    MissingSource,
    InvalidThreshold,
    InvalidUnnest,
    DependencyCycle,
    UnresolvedPlaceholder,

    // Link constraints
    MissingColumn,
    NullKeys,
    DuplicateLeftKeys,
    DuplicateRightKeys,
    CardinalityViolation,
    UnmatchedLeft,
    UnmatchedRight,
    RowDecrease,

    // Runtime
    SourceFailure,
    StageFailure,
    StoreFailure,
    UpstreamFailed,
    ReconciliationDegraded,
    PendingReview,
    Cancelled,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCode::DuplicateEntity => "duplicate_entity",
            IssueCode::MissingSurrogateId => "missing_surrogate_id",
            IssueCode::UnknownEntity => "unknown_entity",
            IssueCode::SelfReference => "self_reference",
            IssueCode::KeyLengthMismatch => "key_length_mismatch",
            IssueCode::EmptyKeys => "empty_keys",
            IssueCode::UnknownFilterKind => "unknown_filter_kind",
            IssueCode::UnknownLoaderKind => "unknown_loader_kind",
            IssueCode::MissingSource => "missing_source",
            IssueCode::InvalidThreshold => "invalid_threshold",
            IssueCode::InvalidUnnest => "invalid_unnest",
            IssueCode::DependencyCycle => "dependency_cycle",
            IssueCode::UnresolvedPlaceholder => "unresolved_placeholder",
            IssueCode::MissingColumn => "missing_column",
            IssueCode::NullKeys => "null_keys",
            IssueCode::DuplicateLeftKeys => "duplicate_left_keys",
            IssueCode::DuplicateRightKeys => "duplicate_right_keys",
            IssueCode::CardinalityViolation => "cardinality_violation",
            IssueCode::UnmatchedLeft => "unmatched_left",
            IssueCode::UnmatchedRight => "unmatched_right",
            IssueCode::RowDecrease => "row_decrease",
            IssueCode::SourceFailure => "source_failure",
            IssueCode::StageFailure => "stage_failure",
            IssueCode::StoreFailure => "store_failure",
            IssueCode::UpstreamFailed => "upstream_failed",
            IssueCode::ReconciliationDegraded => "reconciliation_degraded",
            IssueCode::PendingReview => "pending_review",
            IssueCode::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single problem found while validating a specification or running the pipeline.
///
/// Issues are always collected into lists; they are never raised on their own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationIssue {
    pub severity: Severity,
    /// Entity the issue belongs to
    pub entity: String,
    /// Field, column or constraint key that triggered the issue
    pub field: Option<String>,
    pub code: IssueCode,
    /// Human-readable description
    pub message: String,
    /// Suggested fix, when one is obvious
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    pub fn error(entity: impl Into<String>, code: IssueCode, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, entity, code, message)
    }

    pub fn warning(entity: impl Into<String>, code: IssueCode, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, entity, code, message)
    }

    pub fn info(entity: impl Into<String>, code: IssueCode, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, entity, code, message)
    }

    fn new(
        severity: Severity,
        entity: impl Into<String>,
        code: IssueCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            entity: entity.into(),
            field: None,
            code,
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.entity)?;
        if let Some(field) = &self.field {
            write!(f, ".{}", field)?;
        }
        write!(f, " ({}): {}", self.code, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (hint: {})", suggestion)?;
        }
        Ok(())
    }
}

/// True when any issue in the list is an error.
pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues.iter().any(ValidationIssue::is_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_display_includes_context() {
        let issue = ValidationIssue::error("sample", IssueCode::UnmatchedLeft, "1 unmatched row")
            .with_field("fk:site")
            .with_suggestion("add the missing site rows");

        let rendered = issue.to_string();
        assert!(rendered.starts_with("[error] sample.fk:site (unmatched_left)"));
        assert!(rendered.contains("add the missing site rows"));
    }

    #[test]
    fn test_has_errors_ignores_warnings() {
        let issues = vec![
            ValidationIssue::warning("site", IssueCode::PendingReview, "review"),
            ValidationIssue::info("site", IssueCode::PendingReview, "note"),
        ];
        assert!(!has_errors(&issues));

        let mut issues = issues;
        issues.push(ValidationIssue::error("site", IssueCode::RowDecrease, "lost rows"));
        assert!(has_errors(&issues));
    }
}
