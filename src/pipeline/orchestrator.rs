use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, info_span, warn, Instrument};

use super::report::{EntityReport, EntityState, RunMode, RunReport};
use super::stages;
use crate::dispatch::{dispatcher_for, Dispatcher};
use crate::error::{HarmonizeError, Result};
use crate::filters::{FilterRegistry, FrozenTables};
use crate::issues::{has_errors, IssueCode, ValidationIssue};
use crate::link::{fk_column, LinkEngine};
use crate::mapping::{InMemoryRegistry, MappingRegistry, SqliteRegistry};
use crate::observability::pipeline as metrics;
use crate::reconcile::{HttpReconciliationService, ReconciliationService, Reconciler, ReconcilerConfig};
use crate::resolver::DependencyGraph;
use crate::sources::LoaderRegistry;
use crate::spec::validators::{ValidationContext, ValidatorRegistry};
use crate::spec::{EntitySpec, ProjectSpec, ReconciliationSpec, TargetSpec};
use crate::table::{EntityTable, FrozenTable};

/// Cooperative cancellation, checked before each level and each entity.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub mode: RunMode,
    /// Execute mode only: return the first failure instead of failing the
    /// entity and continuing with independent ones
    pub stop_on_error: bool,
}

impl RunOptions {
    pub fn execute() -> Self {
        Self {
            mode: RunMode::Execute,
            stop_on_error: true,
        }
    }

    pub fn validate() -> Self {
        Self {
            mode: RunMode::Validate,
            stop_on_error: false,
        }
    }

    pub fn stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }
}

/// Everything one entity produced, handed back to the run loop
struct EntityRun {
    report: EntityReport,
    issues: Vec<ValidationIssue>,
    table: Option<FrozenTable>,
    error: Option<HarmonizeError>,
}

impl EntityRun {
    fn new(name: &str) -> Self {
        Self {
            report: EntityReport::pending(name),
            issues: Vec::new(),
            table: None,
            error: None,
        }
    }
}

/// Runs a project's entities in dependency order.
///
/// Entities in the same dependency level run concurrently; each works on
/// its own table and sees its parents only as frozen tables.
#[derive(Clone)]
pub struct Pipeline {
    project: Arc<ProjectSpec>,
    loaders: LoaderRegistry,
    filters: FilterRegistry,
    validators: Arc<ValidatorRegistry>,
    link: LinkEngine,
    registry: Arc<dyn MappingRegistry>,
    service: Option<(Arc<dyn ReconciliationService>, ReconcilerConfig)>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    target: Option<TargetSpec>,
}

impl Pipeline {
    /// Built-in loaders, filters and validators with an in-memory registry.
    /// No reconciliation service and no dispatcher.
    pub fn new(project: ProjectSpec) -> Self {
        let target = project.target.clone();
        Self {
            project: Arc::new(project),
            loaders: LoaderRegistry::with_builtins(),
            filters: FilterRegistry::with_builtins(),
            validators: Arc::new(ValidatorRegistry::with_builtins()),
            link: LinkEngine::default(),
            registry: Arc::new(InMemoryRegistry::new()),
            service: None,
            dispatcher: None,
            target,
        }
    }

    /// Wire up the registry, service and target declared in the project file.
    pub fn from_config(project: ProjectSpec) -> Result<Self> {
        let mut pipeline = Self::new(project);

        if let Some(path) = pipeline.project.registry.path.clone() {
            pipeline = pipeline.with_registry(Arc::new(SqliteRegistry::open(path)?));
        }
        if let Some(service) = pipeline.project.service.clone() {
            let timeout = Duration::from_secs(service.timeout_secs);
            let http = HttpReconciliationService::new(&service.url, timeout)?;
            info!("🌐 Reconciliation service at {}", service.url);
            pipeline = pipeline.with_service(
                Arc::new(http),
                ReconcilerConfig {
                    timeout,
                    max_concurrency: service.max_concurrency,
                },
            );
        }
        if let Some(target) = pipeline.project.target.clone() {
            pipeline.dispatcher = Some(dispatcher_for(&target)?);
        }
        Ok(pipeline)
    }

    pub fn with_loaders(mut self, loaders: LoaderRegistry) -> Self {
        self.loaders = loaders;
        self
    }

    pub fn with_filters(mut self, filters: FilterRegistry) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_validators(mut self, validators: ValidatorRegistry) -> Self {
        self.validators = Arc::new(validators);
        self
    }

    pub fn with_link_engine(mut self, link: LinkEngine) -> Self {
        self.link = link;
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn MappingRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_service(mut self, service: Arc<dyn ReconciliationService>, config: ReconcilerConfig) -> Self {
        self.service = Some((service, config));
        self
    }

    /// Store through `dispatcher`. Without a declared target the dispatcher
    /// gets a bare target of its own kind.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        if self.target.is_none() {
            self.target = Some(TargetSpec {
                kind: dispatcher.kind().to_string(),
                path: None,
                options: BTreeMap::new(),
            });
        }
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn project(&self) -> &ProjectSpec {
        &self.project
    }

    pub fn registry(&self) -> Arc<dyn MappingRegistry> {
        self.registry.clone()
    }

    /// Processing order, or a configuration error naming the cycle.
    pub fn order(&self) -> Result<Vec<String>> {
        DependencyGraph::from_specs(&self.project.entities).resolve()
    }

    /// Run every registered validator against the project.
    pub fn validate_spec(&self) -> Vec<ValidationIssue> {
        let ctx = ValidationContext {
            loader_kinds: self.loaders.kinds(),
            filter_kinds: self.filters.kinds(),
        };
        self.validators.validate(&self.project, &ctx)
    }

    /// Run the project.
    ///
    /// In `Execute` mode an invalid specification is an error and, with
    /// `stop_on_error`, so is the first failing entity. `Validate` mode
    /// never touches the reconciliation service or the target and always
    /// returns the report with every issue it found.
    pub async fn run(&self, options: RunOptions, cancel: &CancellationToken) -> Result<RunReport> {
        let name = self.project.project.name.clone();
        let mode = options.mode;
        let mut report = RunReport::new(&name, mode);
        metrics::run_started();
        info!("🚀 Starting {:?} run of project '{}' ({})", mode, name, report.run_id);

        let spec_issues = self.validate_spec();
        if has_errors(&spec_issues) {
            error!("❌ Project '{}' has {} specification errors", name, spec_issues.iter().filter(|i| i.is_error()).count());
            if mode == RunMode::Execute {
                return Err(HarmonizeError::configuration("project specification is invalid", spec_issues));
            }
            report.issues = spec_issues;
            report.complete();
            return Ok(report);
        }
        report.issues.extend(spec_issues);

        let graph = DependencyGraph::from_specs(&self.project.entities);
        let levels = match graph.levels() {
            Ok(levels) => levels,
            Err(err) if mode == RunMode::Validate => {
                report.issues.extend(err.issues().iter().cloned());
                report.complete();
                return Ok(report);
            }
            Err(err) => return Err(err),
        };
        report.order = levels.concat();
        report.entities = report.order.iter().map(|n| EntityReport::pending(n)).collect();
        info!("📋 Processing order: {}", report.order.join(" -> "));

        let reconciler = self.reconciler(mode);
        let mut frozen = FrozenTables::new();
        let mut blocked: HashSet<String> = HashSet::new();

        for (depth, level) in levels.iter().enumerate() {
            if cancel.is_cancelled() {
                self.cancel_remaining(&mut report);
                break;
            }
            debug!("🔄 Level {}/{}: {}", depth + 1, levels.len(), level.join(", "));

            let mut handles = Vec::with_capacity(level.len());
            for entity in level {
                if cancel.is_cancelled() {
                    self.cancel_remaining(&mut report);
                    break;
                }
                let Some(spec) = self.project.entity(entity).cloned() else {
                    continue;
                };
                if let Some(upstream) = graph.dependencies(entity).into_iter().find(|d| blocked.contains(*d)) {
                    info!("⏭️ Skipping '{}': upstream '{}' did not complete", entity, upstream);
                    report.issues.push(
                        ValidationIssue::error(
                            entity.as_str(),
                            IssueCode::UpstreamFailed,
                            format!("Entity '{}' skipped because '{}' did not complete", entity, upstream),
                        )
                        .with_field(upstream),
                    );
                    set_state(&mut report, entity, EntityState::Skipped);
                    blocked.insert(entity.clone());
                    metrics::entity_skipped();
                    continue;
                }

                set_state(&mut report, entity, EntityState::Extracting);
                let pipeline = self.clone();
                let parents = frozen.clone();
                let reconciler = reconciler.clone();
                let span = info_span!("entity", entity = %spec.name, run_id = %report.run_id);
                let handle = tokio::spawn(
                    async move { pipeline.process_entity(&spec, &parents, reconciler.as_deref(), mode).await }
                        .instrument(span),
                );
                handles.push((entity.clone(), handle));
            }

            let mut failures: Vec<(usize, HarmonizeError)> = Vec::new();
            for (entity, handle) in handles {
                let mut run = match handle.await {
                    Ok(run) => run,
                    Err(join_error) => {
                        let mut run = EntityRun::new(&entity);
                        let err = HarmonizeError::stage(&entity, "run", join_error.to_string());
                        run.issues.push(issue_for(&entity, &err));
                        run.report.state = EntityState::Failed;
                        run.error = Some(err);
                        run
                    }
                };

                report.issues.append(&mut run.issues);
                if let Some(table) = run.table.take() {
                    frozen.insert(entity.clone(), table.clone());
                    report.tables.insert(entity.clone(), table);
                }
                if let Some(err) = run.error.take() {
                    blocked.insert(entity.clone());
                    let position = self.project.entities.iter().position(|e| e.name == entity).unwrap_or(usize::MAX);
                    failures.push((position, err));
                }
                if let Some(slot) = report.entity_mut(&entity) {
                    *slot = run.report;
                }
            }

            if mode == RunMode::Execute && options.stop_on_error && !failures.is_empty() {
                failures.sort_by_key(|(position, _)| *position);
                if let Some((_, err)) = failures.into_iter().next() {
                    error!("💥 Run of '{}' stopped: {}", name, err);
                    return Err(err);
                }
            }
        }

        report.complete();
        let completed = report.count(EntityState::Completed);
        if report.success() {
            info!("🎉 Project '{}' completed: {} entities in {:?}", name, completed, report.duration());
        } else {
            warn!(
                "⚠️ Project '{}' finished with {} completed, {} failed, {} skipped, {} errors",
                name,
                completed,
                report.count(EntityState::Failed),
                report.count(EntityState::Skipped),
                report.errors().count()
            );
        }
        Ok(report)
    }

    /// Only execute runs talk to the reconciliation service.
    fn reconciler(&self, mode: RunMode) -> Option<Arc<Reconciler>> {
        if mode != RunMode::Execute {
            return None;
        }
        self.service
            .as_ref()
            .map(|(service, config)| Arc::new(Reconciler::new(service.clone(), self.registry.clone(), config.clone())))
    }

    fn cancel_remaining(&self, report: &mut RunReport) {
        if !report.cancelled {
            warn!("🛑 Run of '{}' cancelled", report.project);
        }
        report.cancelled = true;
        let pending: Vec<String> = report
            .entities
            .iter()
            .filter(|e| e.state == EntityState::Pending)
            .map(|e| e.name.clone())
            .collect();
        for entity in pending {
            report.issues.push(ValidationIssue::warning(
                entity.as_str(),
                IssueCode::Cancelled,
                format!("Entity '{}' not processed: run cancelled", entity),
            ));
            set_state(report, &entity, EntityState::Skipped);
            metrics::entity_skipped();
        }
    }

    async fn process_entity(
        &self,
        spec: &EntitySpec,
        frozen: &FrozenTables,
        reconciler: Option<&Reconciler>,
        mode: RunMode,
    ) -> EntityRun {
        let started = Instant::now();
        let mut run = EntityRun::new(&spec.name);
        info!("🔄 Processing entity '{}'", spec.name);

        let result = self.run_stages(spec, frozen, reconciler, mode, &mut run).await;
        run.report.duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(table) => {
                run.report.state = EntityState::Completed;
                run.report.rows_final = table.len();
                run.table = Some(table);
                metrics::entity_completed(&spec.name, started.elapsed().as_secs_f64());
                info!("✅ Entity '{}' completed with {} rows", spec.name, run.report.rows_final);
            }
            Err(err) => {
                error!("❌ Entity '{}' failed while {}: {}", spec.name, run.report.state, err);
                run.report.failed_stage = Some(run.report.state);
                run.report.state = EntityState::Failed;
                if !matches!(err, HarmonizeError::ConstraintViolation { .. }) {
                    run.issues.push(issue_for(&spec.name, &err));
                }
                run.error = Some(err);
                metrics::entity_failed(&spec.name);
            }
        }
        run
    }

    async fn run_stages(
        &self,
        spec: &EntitySpec,
        frozen: &FrozenTables,
        reconciler: Option<&Reconciler>,
        mode: RunMode,
        run: &mut EntityRun,
    ) -> Result<FrozenTable> {
        run.report.state = EntityState::Extracting;
        let mut table = stages::extract(spec, &self.loaders, frozen).await?;
        run.report.rows_extracted = table.len();
        metrics::rows_extracted(table.len());

        run.report.state = EntityState::Filtering;
        let removed = stages::filter(spec, &mut table, &self.filters, frozen)?;
        if removed > 0 {
            debug!("Filtered {} rows from '{}'", removed, spec.name);
        }

        run.report.state = EntityState::Linking;
        let outcome = self.link.link_all(&self.project, spec, &mut table, frozen)?;
        let violations: Vec<ValidationIssue> = outcome.issues.iter().filter(|i| i.is_error()).cloned().collect();
        run.report.link = outcome.stats;
        run.issues.extend(outcome.issues);
        if !violations.is_empty() && mode == RunMode::Execute {
            return Err(HarmonizeError::ConstraintViolation {
                entity: spec.name.clone(),
                issues: violations,
            });
        }

        if let Some(unnest) = &spec.unnest {
            run.report.state = EntityState::Unnesting;
            let keep: Vec<String> = spec.foreign_keys.iter().map(|fk| fk_column(&self.project, fk)).collect();
            stages::unnest(&spec.name, unnest, &mut table, &keep)?;
        }

        run.report.state = EntityState::Translating;
        stages::translate(spec, &mut table)?;

        if let Some(recon) = &spec.reconciliation {
            run.report.state = EntityState::Reconciling;
            self.reconcile(spec, recon, &table, reconciler, mode, run).await?;
        }

        run.report.state = EntityState::Storing;
        self.store(spec, table, mode, run).await
    }

    async fn reconcile(
        &self,
        spec: &EntitySpec,
        recon: &ReconciliationSpec,
        table: &EntityTable,
        reconciler: Option<&Reconciler>,
        mode: RunMode,
        run: &mut EntityRun,
    ) -> Result<()> {
        match (mode, reconciler) {
            (RunMode::Validate, _) => {
                debug!("Validate mode: not reconciling '{}.{}'", spec.name, recon.target_field);
            }
            (RunMode::Execute, Some(reconciler)) => {
                let mut outcome = reconciler.reconcile(recon, table).await?;
                run.issues.append(&mut outcome.issues);
                run.report.reconciliation = Some(outcome);
            }
            (RunMode::Execute, None) => {
                warn!("⚠️ No reconciliation service configured for '{}'", spec.name);
                run.issues.push(
                    ValidationIssue::warning(
                        spec.name.as_str(),
                        IssueCode::ReconciliationDegraded,
                        format!(
                            "No reconciliation service configured; '{}' keeps only existing mappings",
                            recon.target_field
                        ),
                    )
                    .with_field(recon.target_field.as_str()),
                );
            }
        }
        Ok(())
    }

    async fn store(&self, spec: &EntitySpec, mut table: EntityTable, mode: RunMode, run: &mut EntityRun) -> Result<FrozenTable> {
        let published = stages::published_ids(spec, self.registry.as_ref()).await?;
        let external = stages::assign_ids(spec, &mut table, &published);
        if external > 0 {
            debug!("{} rows of '{}' carry external ids", external, spec.name);
        }
        let table = table.freeze();

        if mode == RunMode::Execute {
            if let (Some(dispatcher), Some(target)) = (&self.dispatcher, &self.target) {
                let ack = dispatcher
                    .store(&spec.name, table.clone(), target)
                    .await
                    .map_err(|err| match err {
                        HarmonizeError::Store { .. } => err,
                        other => HarmonizeError::store(&spec.name, other.to_string()),
                    })?;
                metrics::rows_stored(ack.rows);
                run.report.ack = Some(ack);
            }
        }
        Ok(table)
    }
}

fn set_state(report: &mut RunReport, entity: &str, state: EntityState) {
    if let Some(slot) = report.entity_mut(entity) {
        slot.state = state;
    }
}

/// Issue recorded for an entity that failed with `err`
fn issue_for(entity: &str, err: &HarmonizeError) -> ValidationIssue {
    let code = match err {
        HarmonizeError::Source { .. } => IssueCode::SourceFailure,
        HarmonizeError::Store { .. } => IssueCode::StoreFailure,
        HarmonizeError::ReconciliationService(_) => IssueCode::ReconciliationDegraded,
        _ => IssueCode::StageFailure,
    };
    ValidationIssue::error(entity, code, err.to_string())
}
