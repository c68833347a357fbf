//! Specification validators.
//!
//! Validators are registered by name on a [`ValidatorRegistry`]; the built-in set
//! is installed by [`ValidatorRegistry::with_builtins`] and callers may register
//! their own before a run.

use std::collections::HashSet;

use crate::issues::{IssueCode, ValidationIssue};
use crate::spec::ProjectSpec;

/// Names of pluggable components known at validation time
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    pub loader_kinds: Vec<String>,
    pub filter_kinds: Vec<String>,
}

/// A single specification check
pub trait SpecValidator: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(&self, project: &ProjectSpec, ctx: &ValidationContext) -> Vec<ValidationIssue>;
}

/// Ordered set of validators
pub struct ValidatorRegistry {
    validators: Vec<Box<dyn SpecValidator>>,
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ValidatorRegistry {
    pub fn empty() -> Self {
        Self {
            validators: Vec::new(),
        }
    }

    /// Registry with every built-in validator
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(UniqueNamesValidator));
        registry.register(Box::new(IdentifierValidator));
        registry.register(Box::new(ReferenceValidator));
        registry.register(Box::new(ForeignKeyShapeValidator));
        registry.register(Box::new(SourceValidator));
        registry.register(Box::new(ReconciliationValidator));
        registry.register(Box::new(UnnestValidator));
        registry
    }

    /// Register a validator; a validator with the same name is replaced.
    pub fn register(&mut self, validator: Box<dyn SpecValidator>) {
        if let Some(existing) = self
            .validators
            .iter_mut()
            .find(|v| v.name() == validator.name())
        {
            *existing = validator;
        } else {
            self.validators.push(validator);
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.validators.iter().map(|v| v.name()).collect()
    }

    /// Run every validator and collect all issues.
    pub fn validate(&self, project: &ProjectSpec, ctx: &ValidationContext) -> Vec<ValidationIssue> {
        self.validators
            .iter()
            .flat_map(|v| v.validate(project, ctx))
            .collect()
    }
}

pub struct UniqueNamesValidator;

impl SpecValidator for UniqueNamesValidator {
    fn name(&self) -> &'static str {
        "unique_names"
    }

    fn validate(&self, project: &ProjectSpec, _ctx: &ValidationContext) -> Vec<ValidationIssue> {
        let mut seen = HashSet::new();
        project
            .entities
            .iter()
            .filter(|e| !seen.insert(e.name.as_str()))
            .map(|e| {
                ValidationIssue::error(&e.name, IssueCode::DuplicateEntity, format!("Entity '{}' is declared more than once", e.name))
            })
            .collect()
    }
}

pub struct IdentifierValidator;

impl SpecValidator for IdentifierValidator {
    fn name(&self) -> &'static str {
        "identifiers"
    }

    fn validate(&self, project: &ProjectSpec, _ctx: &ValidationContext) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for entity in &project.entities {
            if entity.surrogate_id.trim().is_empty() {
                issues.push(
                    ValidationIssue::error(&entity.name, IssueCode::MissingSurrogateId, "Entity has no surrogate_id")
                        .with_field("surrogate_id")
                        .with_suggestion(format!("Add surrogate_id = \"{}_id\"", entity.name)),
                );
            } else if entity.keys.iter().any(|k| k == &entity.surrogate_id) {
                issues.push(
                    ValidationIssue::warning(
                        &entity.name,
                        IssueCode::MissingSurrogateId,
                        "surrogate_id is also listed as a business key; its values will be replaced by system ids",
                    )
                    .with_field("surrogate_id"),
                );
            }
        }
        issues
    }
}

pub struct ReferenceValidator;

impl SpecValidator for ReferenceValidator {
    fn name(&self) -> &'static str {
        "references"
    }

    fn validate(&self, project: &ProjectSpec, _ctx: &ValidationContext) -> Vec<ValidationIssue> {
        let known: HashSet<&str> = project.entities.iter().map(|e| e.name.as_str()).collect();
        let mut issues = Vec::new();
        for entity in &project.entities {
            for reference in entity.referenced_entities() {
                if reference == entity.name {
                    issues.push(ValidationIssue::error(
                        &entity.name,
                        IssueCode::SelfReference,
                        "Entity references itself",
                    ));
                } else if !known.contains(reference) {
                    issues.push(
                        ValidationIssue::error(
                            &entity.name,
                            IssueCode::UnknownEntity,
                            format!("References unknown entity '{}'", reference),
                        )
                        .with_field(reference.to_string()),
                    );
                }
            }
        }
        issues
    }
}

pub struct ForeignKeyShapeValidator;

impl SpecValidator for ForeignKeyShapeValidator {
    fn name(&self) -> &'static str {
        "foreign_key_shape"
    }

    fn validate(&self, project: &ProjectSpec, _ctx: &ValidationContext) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for entity in &project.entities {
            for fk in &entity.foreign_keys {
                let field = fk.constraint_key();
                if fk.local_keys.is_empty() || fk.remote_keys.is_empty() {
                    issues.push(
                        ValidationIssue::error(&entity.name, IssueCode::EmptyKeys, "Foreign key has no key columns")
                            .with_field(field.clone()),
                    );
                }
                if fk.local_keys.len() != fk.remote_keys.len() {
                    issues.push(
                        ValidationIssue::error(
                            &entity.name,
                            IssueCode::KeyLengthMismatch,
                            format!(
                                "local_keys has {} columns but remote_keys has {}",
                                fk.local_keys.len(),
                                fk.remote_keys.len()
                            ),
                        )
                        .with_field(field.clone()),
                    );
                }

                if let Some(parent) = project.entity(&fk.entity) {
                    if !parent.columns.is_empty() {
                        for key in &fk.remote_keys {
                            if !parent.columns.contains(key) && key != &parent.surrogate_id {
                                issues.push(
                                    ValidationIssue::warning(
                                        &entity.name,
                                        IssueCode::MissingColumn,
                                        format!("Remote key '{}' is not a declared column of '{}'", key, parent.name),
                                    )
                                    .with_field(field.clone()),
                                );
                            }
                        }
                    }
                }
            }
        }
        issues
    }
}

pub struct SourceValidator;

impl SpecValidator for SourceValidator {
    fn name(&self) -> &'static str {
        "sources"
    }

    fn validate(&self, project: &ProjectSpec, ctx: &ValidationContext) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for entity in &project.entities {
            match &entity.loader {
                Some(loader) => {
                    if !ctx.loader_kinds.iter().any(|k| k == &loader.kind) {
                        issues.push(
                            ValidationIssue::error(
                                &entity.name,
                                IssueCode::UnknownLoaderKind,
                                format!("No loader registered for kind '{}'", loader.kind),
                            )
                            .with_field("loader.kind")
                            .with_suggestion(format!("Known kinds: {}", ctx.loader_kinds.join(", "))),
                        );
                    }
                }
                None if entity.source.is_none() && entity.values.is_empty() => {
                    issues.push(
                        ValidationIssue::error(&entity.name, IssueCode::MissingSource, "Entity has no loader, source entity or values")
                            .with_suggestion("Add a loader table, a source entity or inline values"),
                    );
                }
                None => {}
            }

            for filter in &entity.filters {
                if !ctx.filter_kinds.iter().any(|k| k == &filter.kind) {
                    issues.push(
                        ValidationIssue::error(
                            &entity.name,
                            IssueCode::UnknownFilterKind,
                            format!("No filter registered for kind '{}'", filter.kind),
                        )
                        .with_field("filters")
                        .with_suggestion(format!("Known kinds: {}", ctx.filter_kinds.join(", "))),
                    );
                }
            }
        }
        issues
    }
}

pub struct ReconciliationValidator;

impl SpecValidator for ReconciliationValidator {
    fn name(&self) -> &'static str {
        "reconciliation"
    }

    fn validate(&self, project: &ProjectSpec, _ctx: &ValidationContext) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for entity in &project.entities {
            let Some(recon) = &entity.reconciliation else {
                continue;
            };
            let in_range = |t: f64| (0.0..=100.0).contains(&t);
            if !in_range(recon.auto_accept_threshold) || !in_range(recon.review_threshold) {
                issues.push(
                    ValidationIssue::error(&entity.name, IssueCode::InvalidThreshold, "Thresholds must lie between 0 and 100")
                        .with_field("reconciliation"),
                );
            }
            if recon.review_threshold > recon.auto_accept_threshold {
                issues.push(
                    ValidationIssue::error(
                        &entity.name,
                        IssueCode::InvalidThreshold,
                        format!(
                            "review_threshold ({}) is above auto_accept_threshold ({})",
                            recon.review_threshold, recon.auto_accept_threshold
                        ),
                    )
                    .with_field("reconciliation"),
                );
            }
            if recon.batch_size == 0 {
                issues.push(
                    ValidationIssue::error(&entity.name, IssueCode::InvalidThreshold, "batch_size must be at least 1")
                        .with_field("reconciliation.batch_size"),
                );
            }
            if recon.target_field.trim().is_empty() {
                issues.push(
                    ValidationIssue::error(&entity.name, IssueCode::MissingColumn, "Reconciliation has no target_field")
                        .with_field("reconciliation.target_field"),
                );
            }
            if recon.entity != entity.name {
                issues.push(
                    ValidationIssue::error(
                        &entity.name,
                        IssueCode::UnknownEntity,
                        format!(
                            "Reconciliation is keyed on '{}' but declared on '{}'",
                            recon.entity, entity.name
                        ),
                    )
                    .with_field("reconciliation.entity")
                    .with_suggestion(format!("Set entity = \"{}\" or leave it out", entity.name)),
                );
            }
        }
        issues
    }
}

pub struct UnnestValidator;

impl SpecValidator for UnnestValidator {
    fn name(&self) -> &'static str {
        "unnest"
    }

    fn validate(&self, project: &ProjectSpec, _ctx: &ValidationContext) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for entity in &project.entities {
            let Some(unnest) = &entity.unnest else {
                continue;
            };
            if unnest.value_vars.is_empty() {
                issues.push(
                    ValidationIssue::error(&entity.name, IssueCode::InvalidUnnest, "unnest needs at least one value column")
                        .with_field("unnest.value_vars"),
                );
            }
            if unnest.var_name.is_empty() || unnest.value_name.is_empty() || unnest.var_name == unnest.value_name {
                issues.push(
                    ValidationIssue::error(&entity.name, IssueCode::InvalidUnnest, "var_name and value_name must be distinct and non-empty")
                        .with_field("unnest"),
                );
            }
            if let Some(overlap) = unnest.value_vars.iter().find(|v| unnest.id_vars.contains(v)) {
                issues.push(
                    ValidationIssue::error(
                        &entity.name,
                        IssueCode::InvalidUnnest,
                        format!("Column '{}' is both an id and a value column", overlap),
                    )
                    .with_field("unnest"),
                );
            }
        }
        issues
    }
}
