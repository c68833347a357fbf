use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{HarmonizeError, Result};
use crate::issues::{IssueCode, ValidationIssue};
use crate::spec::ProjectSpec;

/// `${NAME}` or `${NAME:-default}`
static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("placeholder pattern is valid")
});

/// Load a project file, resolving placeholders from the process environment.
///
/// A `.env` file next to the working directory is honored.
pub fn load_project<P: AsRef<Path>>(path: P) -> Result<ProjectSpec> {
    dotenv::dotenv().ok();

    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        HarmonizeError::configuration(
            format!("Failed to read project file '{}': {}", path.display(), e),
            Vec::new(),
        )
    })?;

    let spec = parse_project(&content, |name| std::env::var(name).ok())?;
    info!(
        "📋 Loaded project '{}' with {} entities from {}",
        spec.project.name,
        spec.entities.len(),
        path.display()
    );
    Ok(spec)
}

/// Parse project TOML and resolve placeholders with the given lookup.
///
/// Parsing and resolution are two separate passes: the document is parsed into a
/// value tree, every placeholder is resolved, and only then is the typed
/// specification built. Nothing downstream sees an unresolved value.
pub fn parse_project<F>(content: &str, lookup: F) -> Result<ProjectSpec>
where
    F: Fn(&str) -> Option<String>,
{
    let mut tree: toml::Value = toml::from_str(content)?;

    let mut unresolved = Vec::new();
    resolve_placeholders(&mut tree, &lookup, &mut unresolved);
    if !unresolved.is_empty() {
        let issues: Vec<ValidationIssue> = unresolved
            .iter()
            .map(|name| {
                ValidationIssue::error("project", IssueCode::UnresolvedPlaceholder, format!("Environment variable '{}' is not set", name))
                    .with_field(name.clone())
                    .with_suggestion(format!("Set {} or give a default with ${{{}:-value}}", name, name))
            })
            .collect();
        return Err(HarmonizeError::configuration(
            format!("unresolved placeholders: {}", unresolved.join(", ")),
            issues,
        ));
    }

    let mut spec: ProjectSpec = tree.try_into()?;
    spec.normalize();
    debug!("Parsed project with entities {:?}", spec.entity_names());
    Ok(spec)
}

/// Replace placeholders in every string of the tree, recording names that could not be resolved.
pub fn resolve_placeholders<F>(value: &mut toml::Value, lookup: &F, unresolved: &mut Vec<String>)
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        toml::Value::String(s) => {
            if let Some(resolved) = resolve_str(s, lookup, unresolved) {
                *s = resolved;
            }
        }
        toml::Value::Array(items) => {
            for item in items {
                resolve_placeholders(item, lookup, unresolved);
            }
        }
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                resolve_placeholders(item, lookup, unresolved);
            }
        }
        _ => {}
    }
}

/// Resolved copy of `s`, or `None` when it contains no placeholder.
fn resolve_str<F>(s: &str, lookup: &F, unresolved: &mut Vec<String>) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    if !PLACEHOLDER.is_match(s) {
        return None;
    }

    let resolved = PLACEHOLDER.replace_all(s, |caps: &regex::Captures| {
        let name = &caps[1];
        match (lookup(name), caps.get(2)) {
            (Some(v), _) => v,
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => {
                if !unresolved.iter().any(|u| u == name) {
                    unresolved.push(name.to_string());
                }
                String::new()
            }
        }
    });
    Some(resolved.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const PROJECT: &str = r#"
[project]
name = "sead"

[target]
kind = "csv"
path = "${OUTPUT_DIR:-out}/tables"

[[entities]]
name = "site"
surrogate_id = "site_id"
keys = ["site_name"]
columns = ["site_name"]
loader = { kind = "csv", path = "${DATA_DIR}/sites.csv" }

[[entities]]
name = "sample"
surrogate_id = "sample_id"
columns = ["site_name", "sample_name"]
depends_on = ["site"]
loader = { kind = "csv", path = "${DATA_DIR}/samples.csv" }

[[entities.foreign_keys]]
entity = "site"
local_keys = ["site_name"]
remote_keys = ["site_name"]
constraints = { cardinality = "many_to_one", allow_unmatched_left = false }

[entities.reconciliation]
target_field = "sample_name"
service_type = "sample"
"#;

    #[test]
    fn test_placeholders_resolve_before_typing() {
        let spec = parse_project(PROJECT, env(&[("DATA_DIR", "/data")])).unwrap();

        let site = spec.entity("site").unwrap();
        let loader = site.loader.as_ref().unwrap();
        assert_eq!(loader.path.as_ref().unwrap().to_str(), Some("/data/sites.csv"));

        let target = spec.target.as_ref().unwrap();
        assert_eq!(target.path.as_ref().unwrap().to_str(), Some("out/tables"));
    }

    #[test]
    fn test_declaration_order_and_nested_tables() {
        let spec = parse_project(PROJECT, env(&[("DATA_DIR", "/data")])).unwrap();
        assert_eq!(spec.entity_names(), vec!["site", "sample"]);

        let sample = spec.entity("sample").unwrap();
        assert_eq!(sample.foreign_keys.len(), 1);
        assert!(!sample.foreign_keys[0].constraints.allow_unmatched_left);
        assert!(sample.foreign_keys[0].constraints.allow_unmatched_right);

        let recon = sample.reconciliation.as_ref().unwrap();
        assert_eq!(recon.entity, "sample");
        assert_eq!(recon.auto_accept_threshold, 95.0);
    }

    #[test]
    fn test_missing_variable_is_configuration_error() {
        let err = parse_project(PROJECT, env(&[])).unwrap_err();
        match err {
            HarmonizeError::Configuration { issues, .. } => {
                assert_eq!(issues.len(), 1);
                assert_eq!(issues[0].code, IssueCode::UnresolvedPlaceholder);
                assert_eq!(issues[0].field.as_deref(), Some("DATA_DIR"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
