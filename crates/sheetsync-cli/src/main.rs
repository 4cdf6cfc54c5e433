use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sheetsync_core::JobRunState;
use sheetsync_sync::{load_jobs, Decision, SyncConfig, SyncEngine};

#[derive(Debug, Parser)]
#[command(name = "sheetsync-cli")]
#[command(about = "Scheduled sheet synchronizer")]
struct Cli {
    /// Job registry to load instead of SHEETSYNC_JOBS_FILE.
    #[arg(long, global = true)]
    jobs_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List configured jobs and their slots.
    Jobs,
    /// Evaluate one job without writing.
    Check { job_id: String },
    /// Run one job now.
    Run { job_id: String },
    /// Run every job, one after another.
    RunAll,
    /// Automatic mode until Ctrl-C.
    Daemon,
    /// Operator API, automatic mode per SHEETSYNC_AUTO_MODE.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sheetsync_sync=info,sheetsync_fetch=info,sheetsync_web=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(path) = cli.jobs_file {
        config.jobs_file = path;
    }
    let jobs = load_jobs(&config.jobs_file)
        .with_context(|| format!("loading jobs from {}", config.jobs_file.display()))?;
    let engine = Arc::new(SyncEngine::from_config(&config, jobs)?);
    tracing::info!(
        jobs = engine.jobs().len(),
        registry = %config.jobs_file.display(),
        "engine ready"
    );

    match cli.command.unwrap_or(Commands::Jobs) {
        Commands::Jobs => {
            for (job, status) in engine.statuses() {
                let schedule = match job.schedule_label() {
                    label if label.is_empty() => "manual".to_string(),
                    label => label,
                };
                println!(
                    "{}  [{:?}]  {}  schedule={}  key={}  state={}",
                    job.id, job.kind, job.name, schedule, job.key_column, status.state
                );
            }
        }
        Commands::Check { job_id } => match engine.evaluate(&job_id).await? {
            Decision::NeedsSync { key, rows } => {
                println!("{job_id}: needs-sync key={key} rows={}", rows.len())
            }
            Decision::UpToDate { key } => println!("{job_id}: up-to-date key={key}"),
            Decision::Failed(err) => bail!("{job_id}: check failed: {err}"),
        },
        Commands::Run { job_id } => {
            let outcome = engine.run_job(&job_id).await?;
            println!("{job_id}: {outcome}");
            if outcome == JobRunState::Error {
                bail!("job {job_id} failed");
            }
        }
        Commands::RunAll => {
            let results = engine.run_all().await?;
            for (job_id, outcome) in &results {
                println!("{job_id}: {outcome}");
            }
            let failed = results
                .iter()
                .filter(|(_, outcome)| *outcome == JobRunState::Error)
                .count();
            if failed > 0 {
                bail!("{failed} of {} jobs failed", results.len());
            }
        }
        Commands::Daemon => {
            engine.start_auto().await;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            engine.stop_auto().await;
        }
        Commands::Serve => {
            if config.auto_mode {
                engine.start_auto().await;
            }
            sheetsync_web::serve(engine, config.web_port).await?;
        }
    }

    Ok(())
}
