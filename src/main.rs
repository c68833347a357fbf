use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

use harmonize::issues::ValidationIssue;
use harmonize::mapping::{HumanDecision, MappingKey, OverrideDecision};
use harmonize::pipeline::{CancellationToken, EntityState, Pipeline, RunOptions, RunReport};
use harmonize::{load_project, logging, observability, HarmonizeError};

#[derive(Parser)]
#[command(name = "harmonize")]
#[command(about = "Harmonize tabular sources into a target relational schema")]
#[command(version = "0.1.0")]
struct Cli {
    /// Project file (TOML)
    #[arg(long, short, global = true, default_value = "harmonize.toml")]
    project: PathBuf,

    /// Directory for the rotating JSON log
    #[arg(long, global = true, default_value = "logs")]
    log_dir: PathBuf,

    /// Print a Prometheus snapshot of run metrics on exit
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage without dispatching or querying services; report all issues
    Validate,
    /// Run the project and store every entity in the target
    Run {
        /// Fail the entity and keep going instead of stopping at the first failure
        #[arg(long)]
        continue_on_error: bool,
    },
    /// Print the processing order
    Order,
    /// Inspect and override reconciliation mappings
    Mappings {
        #[command(subcommand)]
        command: MappingCommands,
    },
}

#[derive(Subcommand)]
enum MappingCommands {
    /// List mappings of an entity as JSON
    List { entity: String },
    /// Accept the stored candidate, or the given external id
    Accept {
        #[command(flatten)]
        target: MappingTarget,
        /// External id to publish instead of the stored candidate
        #[arg(long)]
        id: Option<String>,
    },
    /// Reject the proposed candidate
    Reject {
        #[command(flatten)]
        target: MappingTarget,
    },
    /// Treat the value as a new local entity
    Unmatch {
        #[command(flatten)]
        target: MappingTarget,
    },
}

#[derive(Args)]
struct MappingTarget {
    entity: String,
    field: String,
    value: String,
    /// Who made the decision
    #[arg(long)]
    by: Option<String>,
    #[arg(long)]
    note: Option<String>,
}

impl MappingTarget {
    fn key(&self) -> MappingKey {
        MappingKey::new(&self.entity, &self.field, &self.value)
    }

    fn decision(&self, decision: OverrideDecision) -> HumanDecision {
        let mut decision = HumanDecision::new(decision);
        if let Some(by) = &self.by {
            decision = decision.by(by);
        }
        if let Some(note) = &self.note {
            decision = decision.with_note(note);
        }
        decision
    }
}

fn print_issues(issues: &[ValidationIssue]) {
    for issue in issues {
        println!("   - {}", issue);
    }
}

fn print_report(report: &RunReport) {
    println!("\n📊 Run {} of '{}' ({:?}):", report.run_id, report.project, report.mode);
    for entity in &report.entities {
        let rows = match entity.state {
            EntityState::Completed => format!("{} -> {} rows", entity.rows_extracted, entity.rows_final),
            _ => String::new(),
        };
        println!("   {:<24} {:<10} {}", entity.name, entity.state.as_str(), rows);
    }
    if let Some(duration) = report.duration() {
        println!("   Duration: {} ms", duration.num_milliseconds());
    }
    if !report.issues.is_empty() {
        println!("\n⚠️  Issues:");
        print_issues(&report.issues);
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let project = load_project(&cli.project)
        .with_context(|| format!("loading project {}", cli.project.display()))?;
    let pipeline = Pipeline::from_config(project)?;

    match cli.command {
        Commands::Order => {
            for (i, name) in pipeline.order()?.iter().enumerate() {
                println!("{:>3}. {}", i + 1, name);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate => {
            let report = pipeline.run(RunOptions::validate(), &CancellationToken::new()).await?;
            print_report(&report);
            if report.has_errors() {
                println!("\n❌ Validation found {} errors", report.errors().count());
                Ok(ExitCode::FAILURE)
            } else {
                println!("\n✅ Project is valid");
                Ok(ExitCode::SUCCESS)
            }
        }
        Commands::Run { continue_on_error } => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, finishing entities in flight");
                    on_signal.cancel();
                }
            });

            let stop_on_error = pipeline.project().options.stop_on_error && !continue_on_error;
            let options = RunOptions::execute().stop_on_error(stop_on_error);
            match pipeline.run(options, &cancel).await {
                Ok(report) => {
                    print_report(&report);
                    if report.success() {
                        println!("\n✅ Run completed successfully");
                        Ok(ExitCode::SUCCESS)
                    } else {
                        println!("\n❌ Run finished with failures");
                        Ok(ExitCode::FAILURE)
                    }
                }
                Err(err) => {
                    error!("Run failed: {}", err);
                    println!("❌ {}", err);
                    print_issues(err.issues());
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Mappings { command } => {
            if pipeline.project().registry.path.is_none() {
                warn!("⚠️ No [registry] path configured; mappings are not persisted");
            }
            let registry = pipeline.registry();
            match command {
                MappingCommands::List { entity } => {
                    let entries = registry.list(&entity).await?;
                    println!("{}", serde_json::to_string_pretty(&entries)?);
                }
                MappingCommands::Accept { target, id } => {
                    let decision = target.decision(OverrideDecision::Accept { external_id: id });
                    let entry = registry.record_override(&target.key(), decision).await?;
                    println!("✅ {} -> {}", entry.key, entry.external_id.as_deref().unwrap_or("-"));
                }
                MappingCommands::Reject { target } => {
                    let entry = registry.record_override(&target.key(), target.decision(OverrideDecision::Reject)).await?;
                    println!("✅ {} rejected", entry.key);
                }
                MappingCommands::Unmatch { target } => {
                    let decision = target.decision(OverrideDecision::MarkUnmatched);
                    let entry = registry.record_override(&target.key(), decision).await?;
                    println!("✅ {} marked unmatched", entry.key);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let _guard = logging::init_logging(&cli.log_dir).context("initializing logging")?;

    let metrics = cli.metrics;
    if metrics {
        if let Err(e) = observability::init() {
            warn!("Metrics recorder not installed: {}", e);
        }
    }

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            if let Some(HarmonizeError::Configuration { issues, .. }) = err.downcast_ref::<HarmonizeError>() {
                print_issues(issues);
            }
            error!("💥 {:#}", err);
            eprintln!("❌ {:#}", err);
            ExitCode::from(2)
        }
    };

    if metrics {
        match observability::render() {
            Some(snapshot) => println!("\n{}", snapshot),
            None => info!("No metrics recorded"),
        }
    }
    Ok(code)
}
