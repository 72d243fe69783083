use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use otb_core::{Domain, SyncTarget};
use otb_storage::{EntityStore, MemoryStore, PgStore};
use otb_sync::{maybe_build_scheduler, run_jobs, JobPlan, JobStatus, SyncConfig, SyncContext, SyncParams, SyncReport};
use tracing::{info, warn};

mod logging;

/// Exit status when any job ends in a state other than `success`.
const EXIT_JOB_FAILED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "otb-cli")]
#[command(about = "Over The Board: CBX and FIDE federation sync")]
struct Cli {
    /// Reconcile into an in-memory store instead of Postgres.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync job.
    Sync {
        #[arg(value_enum)]
        target: TargetArg,
        #[command(flatten)]
        args: SyncArgs,
    },
    /// Run several sync jobs in order, each under a timeout.
    SyncAll(SyncAllArgs),
    /// Apply pending SQL migrations.
    Migrate,
    /// List the most recent sync jobs.
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Run the daily plan on the configured cron expressions until interrupted.
    Schedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TargetArg {
    Tournaments,
    Players,
    News,
    Announcements,
    Fide,
}

impl From<TargetArg> for SyncTarget {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::Tournaments => SyncTarget::cbx(Domain::Tournaments),
            TargetArg::Players => SyncTarget::cbx(Domain::Players),
            TargetArg::News => SyncTarget::cbx(Domain::News),
            TargetArg::Announcements => SyncTarget::cbx(Domain::Announcements),
            TargetArg::Fide => SyncTarget::fide_tournaments(),
        }
    }
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long)]
    year: Option<i32>,
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=12))]
    month: Option<u32>,
    /// Two-letter UF, or ALL.
    #[arg(long)]
    state: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
    /// Stop after this many pages; disables page discovery.
    #[arg(long)]
    pages: Option<u32>,
    /// Wipe the target's rows, then import every combination.
    #[arg(long)]
    full: bool,
    #[arg(long)]
    start_year: Option<i32>,
    #[arg(long)]
    end_year: Option<i32>,
    /// FIDE country codes, comma separated. Defaults to every listed country.
    #[arg(long, value_delimiter = ',')]
    countries: Vec<String>,
    #[arg(long)]
    start_date: Option<NaiveDate>,
    #[arg(long)]
    end_date: Option<NaiveDate>,
}

impl From<SyncArgs> for SyncParams {
    fn from(args: SyncArgs) -> Self {
        SyncParams {
            year: args.year,
            month: args.month,
            state: args.state,
            limit: args.limit,
            max_pages: args.pages,
            full: args.full,
            start_year: args.start_year,
            end_year: args.end_year,
            countries: args.countries,
            start_date: args.start_date,
            end_date: args.end_date,
        }
    }
}

#[derive(Debug, Args)]
struct SyncAllArgs {
    #[arg(long, value_enum, value_delimiter = ',', default_value = "tournaments,players,news,announcements")]
    jobs: Vec<TargetArg>,
    #[arg(long)]
    state: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    pages: Option<u32>,
    /// Per-job timeout in seconds. Defaults to OTB_JOB_TIMEOUT_SECS.
    #[arg(long)]
    timeout: Option<u64>,
    #[arg(long, conflicts_with = "daily")]
    full: bool,
    /// Current year and month only.
    #[arg(long)]
    daily: bool,
    /// Wipe each target's rows before an incremental run.
    #[arg(long)]
    clean: bool,
    #[arg(long)]
    start_year: Option<i32>,
    #[arg(long)]
    end_year: Option<i32>,
}

impl SyncAllArgs {
    fn into_plan(self, config: &SyncConfig) -> JobPlan {
        JobPlan {
            jobs: self.jobs.into_iter().map(SyncTarget::from).collect(),
            state: self.state,
            limit: self.limit,
            pages: self.pages,
            timeout: Duration::from_secs(self.timeout.unwrap_or(config.job_timeout_secs)),
            full: self.full,
            daily: self.daily,
            clean: self.clean,
            start_year: self.start_year,
            end_year: self.end_year,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    logging::init_subscriber()?;
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Sync { target, args } => {
            let ctx = SyncContext::from_config(&config, open_store(&config, cli.dry_run).await?);
            let params = SyncParams::from(args);
            let report = ctx.sync(target.into(), &params).await?;
            print_report(&report);
            Ok(exit_for(report.is_success()))
        }
        Commands::SyncAll(args) => {
            let plan = args.into_plan(&config);
            let ctx = SyncContext::from_config(&config, open_store(&config, cli.dry_run).await?);
            let summary = run_jobs(&ctx, &plan).await?;
            for outcome in &summary.outcomes {
                match &outcome.report {
                    Some(report) => print_report(report),
                    None => println!(
                        "{} {} error={}",
                        outcome.target,
                        outcome.status.as_str(),
                        outcome.error.as_deref().unwrap_or_default()
                    ),
                }
            }
            let failed = summary
                .outcomes
                .iter()
                .filter(|o| o.status != JobStatus::Success)
                .count();
            println!("run {}: {} jobs, {} not successful", summary.run_id, summary.outcomes.len(), failed);
            Ok(exit_for(summary.all_succeeded()))
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Jobs { limit } => {
            let store = open_store(&config, cli.dry_run).await?;
            for job in store.recent_jobs(limit).await.context("listing sync jobs")? {
                println!(
                    "{:>6} {:<20} {:<8} {} created={} updated={} {}",
                    job.id,
                    job.federation,
                    job.status.as_str(),
                    job.started_at.format("%Y-%m-%d %H:%M:%S"),
                    job.created,
                    job.updated,
                    job.error.as_deref().unwrap_or_default()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule => {
            let ctx = Arc::new(SyncContext::from_config(&config, open_store(&config, cli.dry_run).await?));
            let plan = JobPlan::daily(Duration::from_secs(config.job_timeout_secs));
            let Some(mut sched) = maybe_build_scheduler(ctx, &config, plan).await? else {
                warn!("scheduler disabled; set OTB_SCHEDULER_ENABLED=1");
                return Ok(ExitCode::from(EXIT_JOB_FAILED));
            };
            sched.start().await.context("starting scheduler")?;
            info!(crons = ?config.sync_crons, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn open_store(config: &SyncConfig, dry_run: bool) -> Result<Arc<dyn EntityStore>> {
    if dry_run {
        info!("dry run: reconciling into memory");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

fn print_report(report: &SyncReport) {
    println!(
        "{} job={} status={} created={} updated={} skipped={} record_errors={} row_errors={} failed_pages={} failed_combinations={}",
        report.target,
        report.job_id,
        report.status.as_str(),
        report.created,
        report.updated,
        report.skipped,
        report.record_errors,
        report.row_errors,
        report.failed_pages.len(),
        report.failed_combinations.len()
    );
    if let Some(error) = &report.error {
        println!("  {error}");
    }
}

fn exit_for(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_JOB_FAILED)
    }
}
