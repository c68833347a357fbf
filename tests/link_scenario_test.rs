use anyhow::Result;
use serde_json::{json, Value};

use harmonize::issues::IssueCode;
use harmonize::spec::{ForeignKeySpec, JoinType};
use harmonize::{CancellationToken, EntitySpec, EntityState, HarmonizeError, Pipeline, ProjectSpec, RunOptions};

fn site_and_sample() -> ProjectSpec {
    let mut site = EntitySpec::new("site", "site_id");
    site.keys = vec!["site_name".to_string()];
    site.columns = vec!["site_name".to_string()];
    site.values = vec![vec![json!("Uppsala")]];

    let mut sample = EntitySpec::new("sample", "sample_id");
    sample.depends_on = vec!["site".to_string()];
    sample.columns = vec!["site_name".to_string(), "sample_name".to_string()];
    sample.values = vec![
        vec![json!("Uppsala"), json!("core-1")],
        vec![json!("Lund"), json!("core-2")],
    ];
    sample
        .foreign_keys
        .push(ForeignKeySpec::new("site", &["site_name"], &["site_name"]));

    ProjectSpec::new(vec![site, sample])
}

#[tokio::test]
async fn test_unmatched_left_stops_execute_run() -> Result<()> {
    let pipeline = Pipeline::new(site_and_sample());

    let err = pipeline
        .run(RunOptions::execute(), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        HarmonizeError::ConstraintViolation { entity, issues } => {
            assert_eq!(entity, "sample");
            assert_eq!(issues.len(), 1);
            assert_eq!(issues[0].code, IssueCode::UnmatchedLeft);
            assert!(issues[0].message.contains("Lund"));
            assert_eq!(issues[0].field.as_deref(), Some("fk:site(site_name)"));
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_validate_mode_collects_and_keeps_linking() -> Result<()> {
    let pipeline = Pipeline::new(site_and_sample());

    let report = pipeline.run(RunOptions::validate(), &CancellationToken::new()).await?;

    assert!(report.has_errors());
    assert_eq!(report.state("sample"), Some(EntityState::Completed));
    assert!(report.issues.iter().any(|i| i.code == IssueCode::UnmatchedLeft));

    let sample = report.table("sample").expect("sample table");
    assert_eq!(sample.value(0, "site_id"), Some(&json!(1)));
    assert_eq!(sample.value(1, "site_id"), Some(&Value::Null));
    assert_eq!(report.entity("sample").unwrap().link[0].unmatched_left, 1);
    Ok(())
}

#[tokio::test]
async fn test_continue_on_error_runs_independent_entities() -> Result<()> {
    let mut project = site_and_sample();
    let mut method = EntitySpec::new("method", "method_id");
    method.columns = vec!["method_name".to_string()];
    method.values = vec![vec![json!("pH")], vec![json!("LOI")]];
    project.entities.push(method);

    let mut analysis = EntitySpec::new("analysis", "analysis_id");
    analysis.columns = vec!["sample_name".to_string()];
    analysis.values = vec![vec![json!("core-1")]];
    analysis
        .foreign_keys
        .push(ForeignKeySpec::new("sample", &["sample_name"], &["sample_name"]));
    project.entities.push(analysis);

    let pipeline = Pipeline::new(project);
    let options = RunOptions::execute().stop_on_error(false);
    let report = pipeline.run(options, &CancellationToken::new()).await?;

    assert_eq!(report.state("site"), Some(EntityState::Completed));
    assert_eq!(report.state("method"), Some(EntityState::Completed));
    assert_eq!(report.state("sample"), Some(EntityState::Failed));
    assert_eq!(report.entity("sample").unwrap().failed_stage, Some(EntityState::Linking));
    assert_eq!(report.state("analysis"), Some(EntityState::Skipped));
    assert!(report.issues.iter().any(|i| i.code == IssueCode::UpstreamFailed && i.entity == "analysis"));
    assert!(!report.success());
    Ok(())
}

#[tokio::test]
async fn test_inner_join_row_decrease_is_reported() -> Result<()> {
    let mut project = site_and_sample();
    let fk = &mut project.entities[1].foreign_keys[0];
    fk.join_type = JoinType::Inner;
    fk.constraints.allow_unmatched_left = true;

    let report = Pipeline::new(project)
        .run(RunOptions::validate(), &CancellationToken::new())
        .await?;

    let codes: Vec<IssueCode> = report.errors().map(|i| i.code).collect();
    assert_eq!(codes, vec![IssueCode::RowDecrease]);
    assert_eq!(report.table("sample").unwrap().len(), 1);
    Ok(())
}
