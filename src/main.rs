mod capabilities;

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use drover_core::config::AppConfig;
use drover_core::types::{JobId, JobStatus};
use drover_engine::{BatchPlan, JobSnapshot, Orchestrator, Workflow, WorkflowReport};

#[derive(Parser)]
#[command(name = "drover", version, about = "Durable multi-step job orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "drover.toml", env = "DROVER_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow with an in-process worker pool
    Run {
        /// Workflow definition (TOML)
        workflow: PathBuf,
        /// Owner recorded on the job
        #[arg(long, default_value = "cli")]
        owner: String,
        /// Worker count (default: worker.count from config)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Show the execution plan for a workflow without running it
    Plan {
        workflow: PathBuf,
    },
    /// Run worker loops only, draining the shared queue
    Worker {
        #[arg(long)]
        count: Option<usize>,
    },
    /// Show a job, or list recent jobs when no id is given
    Status {
        job_id: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Cancel a job
    Cancel {
        job_id: String,
    },
    /// List dead-lettered work items
    DeadLetters {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Re-enqueue work items abandoned by crashed workers
    Recover,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("drover=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "drover", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "No config file found, using defaults");
        AppConfig::default()
    };

    match &cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            return Ok(());
        }
        Commands::Plan { workflow } => {
            let workflow = Workflow::load(workflow)?;
            print_plan(&workflow);
            return Ok(());
        }
        _ => {}
    }

    let orch = Orchestrator::open(config.clone(), capabilities::builtin_registry())?;

    match cli.command {
        Commands::Run {
            workflow,
            owner,
            workers,
        } => {
            let workflow = Workflow::load(&workflow)?;
            let cancel = shutdown_token();
            let pool = orch.spawn_workers(workers.unwrap_or(config.worker.count), cancel.clone());

            let job_id = orch.submit_workflow(&owner, &workflow).await?;
            println!("Job {} submitted ({} steps)", job_id, workflow.step_count());

            let outcome = tokio::select! {
                report = orch.execute(&job_id, &workflow) => Some(report),
                _ = cancel.cancelled() => None,
            };
            pool.shutdown().await;

            match outcome {
                Some(report) => {
                    let report = report?;
                    print_report(&report);
                    if !report.succeeded() {
                        anyhow::bail!("job {} {}", report.job_id, report.status);
                    }
                }
                None => {
                    orch.cancel_job(&job_id).await?;
                    println!("Job {} cancelled", job_id);
                }
            }
        }
        Commands::Worker { count } => {
            let recovered = orch.recover_stale().await?;
            if recovered > 0 {
                warn!(count = recovered, "Recovered stale work items on startup");
            }
            let cancel = shutdown_token();
            let pool = orch.spawn_workers(count.unwrap_or(config.worker.count), cancel);
            println!("{} worker(s) running, Ctrl-C to stop", pool.size());
            pool.join().await;
        }
        Commands::Status { job_id, limit } => match job_id {
            Some(id) => {
                let snapshot = orch.job_status(&JobId::from_string(&id)).await?;
                print_snapshot(&snapshot);
            }
            None => {
                let jobs = orch.list_jobs(limit).await?;
                if jobs.is_empty() {
                    println!("No jobs.");
                }
                for job in jobs {
                    println!(
                        "{}  {:<10} {}  {}",
                        job.id,
                        job.status.as_str(),
                        job.created_at.format("%Y-%m-%d %H:%M:%S"),
                        job.description
                    );
                }
            }
        },
        Commands::Cancel { job_id } => {
            let job_id = JobId::from_string(&job_id);
            if orch.cancel_job(&job_id).await? {
                println!("Job {} cancelled", job_id);
            } else {
                println!("Job {} already finished", job_id);
            }
        }
        Commands::DeadLetters { limit } => {
            let dead = orch.dead_letters(limit).await?;
            if dead.is_empty() {
                println!("No dead-lettered work items.");
            }
            for entry in dead {
                println!(
                    "{}  retries={}  {}  {}",
                    entry.item_id,
                    entry.retries,
                    entry.failed_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.error
                );
            }
        }
        Commands::Recover => {
            let recovered = orch.recover_stale().await?;
            println!("Re-enqueued {} stale work item(s)", recovered);
        }
        Commands::Config | Commands::Plan { .. } | Commands::Completions { .. } => {
            unreachable!("handled before store open")
        }
    }

    Ok(())
}

/// A token cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        cancel_clone.cancel();
    });
    cancel
}

fn print_plan(workflow: &Workflow) {
    println!("Workflow: {}", workflow.name);
    if !workflow.description.is_empty() {
        println!("  {}", workflow.description);
    }
    for (i, phase) in workflow.phases.iter().enumerate() {
        let ids: Vec<&str> = phase.steps.iter().map(|s| s.id.as_str()).collect();
        println!(
            "Phase {} '{}' [{:?}, on failure: {}]: {}",
            i + 1,
            phase.name,
            phase.mode,
            phase.failure_policy(),
            ids.join(", ")
        );
    }
    println!();
    println!("{}", BatchPlan::from_workflow(workflow));
}

fn print_report(report: &WorkflowReport) {
    for phase in &report.phases {
        let retried = if phase.attempts > 1 { " (retried)" } else { "" };
        println!(
            "  {:<20} {:<10} {} done{}",
            phase.name,
            phase.status.as_str(),
            phase.completed.len(),
            retried
        );
        if !phase.unfinished.is_empty() {
            println!("    unfinished: {}", phase.unfinished.join(", "));
        }
    }
    println!(
        "Job {} {} in {:.1}s",
        report.job_id,
        report.status,
        report.elapsed_ms as f64 / 1000.0
    );
    if let Some(output) = &report.output {
        println!();
        println!("{}", output);
    }
    if let Some(error) = &report.error {
        if report.status != JobStatus::Completed {
            eprintln!();
            eprintln!("Error: {}", error);
        }
    }
}

fn print_snapshot(snapshot: &JobSnapshot) {
    let job = &snapshot.job;
    println!("Job {} [{}]", job.id, job.status);
    println!("  owner: {}", job.owner);
    println!("  description: {}", job.description);
    println!("  created: {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(done) = job.completed_at {
        println!("  finished: {}", done.format("%Y-%m-%d %H:%M:%S"));
    }

    if !snapshot.steps.is_empty() {
        println!("Steps:");
        for step in &snapshot.steps {
            let error = step
                .error
                .as_deref()
                .map(|e| format!("  ({})", e))
                .unwrap_or_default();
            println!(
                "  {:<20} {:<12} {:<12} {}{}",
                step.id,
                step.phase_name,
                step.capability,
                step.status.as_str(),
                error
            );
        }
    }
    if !snapshot.items.is_empty() {
        println!(
            "Work items: {} total, {} active",
            snapshot.items.len(),
            snapshot.active_items()
        );
    }
    if let Some(output) = &job.output {
        println!();
        println!("{}", output);
    }
    if let Some(error) = &job.error {
        println!();
        println!("Error: {}", error);
    }
}
