use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use labforge::cleanup::CleanupReport;
use labforge::core::component::ComponentTracker;
use labforge::orchestration::{RollbackEngine, SchedulerEvent};
use labforge::plan::DeploymentPlan;
use labforge::report::StatusReport;
use labforge::{flog, flog_warn, Config, Error, Orchestrator, Result, RollbackMode, RunOptions};

/// labforge - dependency-ordered deployments with retries and rollback
#[derive(Parser, Debug)]
#[command(name = "labforge")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    LABFORGE_DEBUG=1            Enable debug logging (alternative to --debug)\n    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY, DEFAULT_TIMEOUT,\n    DEFAULT_BACKOFF_MULTIPLIER  Retry defaults for tasks\n    LABFORGE_MAX_PARALLEL       Concurrent task limit\n    LABFORGE_GLOBAL_TIMEOUT     Run budget in seconds\n\nEXIT CODES:\n    0 success, 1 execution failure, 2 configuration error, 3 cleanup declined or partial"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.labforge/labforge.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Echo log lines to stderr
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a deployment plan
    Run {
        /// Path to the plan TOML file
        plan: PathBuf,

        /// Maximum number of tasks running at once
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Cancel the run after this many seconds
        #[arg(long)]
        global_timeout: Option<f64>,

        /// Where to write the JSON status report
        #[arg(long)]
        report: Option<PathBuf>,

        /// Rollback mode: component, full or disabled
        #[arg(long)]
        rollback: Option<RollbackMode>,

        /// Print the JSON report instead of the summary
        #[arg(long)]
        json: bool,
    },

    /// Check a plan for errors without running it
    Validate {
        plan: PathBuf,
    },

    /// Show the report of the last run
    Status {
        #[arg(long)]
        report: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },

    /// Delete resources recorded by previous runs
    Cleanup {
        /// Skip confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,

        /// Delete everything without checking component state
        #[arg(long)]
        emergency: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    labforge::log::init_with_debug(cli.debug);
    labforge::log::set_echo(cli.verbose);

    let result = match cli.command {
        Command::Run {
            plan,
            max_parallel,
            global_timeout,
            report,
            rollback,
            json,
        } => run_plan(&plan, max_parallel, global_timeout, report, rollback, json),
        Command::Validate { plan } => run_validate(&plan),
        Command::Status { report, json } => run_status(report, json),
        Command::Cleanup { yes, emergency } => run_cleanup(yes, emergency),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("\x1b[31merror:\x1b[0m {}", e);
            flog!("Exiting with error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

fn load_config() -> Result<Config> {
    Config::load()
}

fn load_plan(path: &Path) -> Result<DeploymentPlan> {
    let plan = DeploymentPlan::load(path)?;
    for (place, program) in plan.missing_programs() {
        flog_warn!("{}: '{}' not found on PATH", place, program);
        eprintln!(
            "\x1b[33mwarning:\x1b[0m {}: '{}' not found on PATH",
            place, program
        );
    }
    Ok(plan)
}

/// Run a plan to completion, printing progress as tasks finish.
fn run_plan(
    path: &Path,
    max_parallel: Option<usize>,
    global_timeout: Option<f64>,
    report_path: Option<PathBuf>,
    rollback: Option<RollbackMode>,
    json: bool,
) -> Result<i32> {
    flog!(
        "Run command: plan={}, max_parallel={:?}, global_timeout={:?}, rollback={:?}",
        path.display(),
        max_parallel,
        global_timeout,
        rollback
    );
    let config = load_config()?;
    let plan = load_plan(path)?;
    let global_timeout = global_timeout
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .map_err(|_| Error::InvalidConfig("--global-timeout must be positive".into()))
        })
        .transpose()?;
    let report_path = match report_path {
        Some(p) => p,
        None => config.report_path()?,
    };
    let ledger_path = config.ledger_path()?;

    let rt = tokio::runtime::Runtime::new()?;
    let run = rt.block_on(async {
        let mut orchestrator = Orchestrator::new(config);
        plan.apply(&mut orchestrator).await?;
        orchestrator.validate()?;

        let previous = orchestrator.engine().load_ledger(&ledger_path).await?;
        if previous > 0 {
            println!(
                "Note: {} resource(s) from earlier runs are still tracked (see `labforge cleanup`)",
                previous
            );
        }

        let cancel = CancellationToken::new();
        let ctrl_c = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                flog_warn!("Interrupted, cancelling run");
                eprintln!("\nInterrupted, cancelling run and rolling back...");
                ctrl_c.cancel();
            }
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let printer = tokio::spawn(print_progress(rx, json));

        let report = orchestrator
            .run(RunOptions {
                max_parallel,
                global_timeout,
                rollback_mode: rollback,
                cancel: Some(cancel),
                observer: Some(tx),
            })
            .await;
        let _ = printer.await;
        let report = report?;

        orchestrator.engine().save_ledger(&ledger_path).await?;
        Ok::<_, Error>(report)
    })?;

    let status = StatusReport::from(&run);
    status.save(&report_path)?;
    if json {
        println!("{}", status.to_json()?);
    } else {
        println!();
        print!("{}", status.render());
        println!("Report written to {}", report_path.display());
    }

    Ok(if run.overall_success { 0 } else { 1 })
}

async fn print_progress(mut rx: mpsc::UnboundedReceiver<SchedulerEvent>, quiet: bool) {
    while let Some(event) = rx.recv().await {
        if quiet {
            continue;
        }
        match event {
            SchedulerEvent::TaskStarted { task, .. } => println!("  -> {}", task),
            SchedulerEvent::TaskSucceeded { task, attempts, .. } => {
                println!("  \x1b[32mok\x1b[0m {} ({} attempt(s))", task, attempts)
            }
            SchedulerEvent::TaskFailed { task, error, .. } => {
                println!("  \x1b[31mFAILED\x1b[0m {}: {}", task, error)
            }
            SchedulerEvent::TaskSkipped { task, reason, .. } => {
                println!("  \x1b[90mskipped\x1b[0m {}: {}", task, reason)
            }
            SchedulerEvent::Progress(p) => println!("     [{}]", p),
            SchedulerEvent::Cancelled { reason } => {
                println!("  \x1b[33mcancelled\x1b[0m: {}", reason)
            }
            SchedulerEvent::AllTasksComplete => {}
        }
    }
}

fn run_validate(path: &Path) -> Result<i32> {
    let config = load_config()?;
    let plan = load_plan(path)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let mut orchestrator = Orchestrator::new(config);
        plan.apply(&mut orchestrator).await?;
        orchestrator.validate()
    })?;

    println!(
        "\x1b[32mPlan OK:\x1b[0m {} task(s), {} rollback action(s), {} cleanup action(s)",
        plan.tasks.len(),
        plan.rollbacks.len(),
        plan.cleanups.len()
    );
    Ok(0)
}

fn run_status(report_path: Option<PathBuf>, json: bool) -> Result<i32> {
    let path = match report_path {
        Some(p) => p,
        None => load_config()?.report_path()?,
    };
    if !path.exists() {
        println!("No report found at {}. Run a plan first.", path.display());
        return Ok(1);
    }

    let report = StatusReport::load(&path)?;
    if json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report.render());
    }
    Ok(if report.overall_success { 0 } else { 1 })
}

/// Delete resources left in the ledger by earlier runs.
fn run_cleanup(skip_confirm: bool, emergency: bool) -> Result<i32> {
    let config = load_config()?;
    let ledger_path = config.ledger_path()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let engine = RollbackEngine::new(config.rollback_timeout());
        engine.load_ledger(&ledger_path).await?;

        let tracked = engine.ledger().all().await;
        println!();
        println!("Tracked resources: {}", tracked.len());
        for resource in &tracked {
            println!("   - {}", resource);
        }
        println!();

        if tracked.is_empty() && !emergency {
            println!("\x1b[32mNothing to clean up.\x1b[0m");
            return Ok(0);
        }

        let confirmed = skip_confirm || confirm(emergency)?;
        let report = if emergency {
            if !confirmed {
                return Err(Error::CleanupNotConfirmed);
            }
            engine.emergency_cleanup().await
        } else {
            engine
                .safe_cleanup(confirmed, &ComponentTracker::new())
                .await?
        };

        engine.save_ledger(&ledger_path).await?;
        print_cleanup(&report);
        Ok::<_, Error>(if report.is_success() { 0 } else { 3 })
    })
}

fn confirm(emergency: bool) -> Result<bool> {
    if emergency {
        println!("\x1b[33mWarning: emergency cleanup deletes everything tracked and runs every cleanup action.\x1b[0m");
    } else {
        println!("\x1b[33mWarning: this will permanently delete the resources above.\x1b[0m");
    }
    print!("Continue? [y/N] ");
    std::io::Write::flush(&mut std::io::stdout())?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    let input = input.trim().to_lowercase();
    Ok(input == "y" || input == "yes")
}

fn print_cleanup(report: &CleanupReport) {
    println!("Removed: {}", report.removed.len());
    for (resource, reason) in &report.skipped {
        println!("   skipped {}: {}", resource, reason);
    }
    if !report.failed.is_empty() {
        println!(
            "\x1b[31mFailed to remove {} resource(s). Manual intervention required:\x1b[0m",
            report.failed.len()
        );
        for (resource, reason) in &report.failed {
            println!("   - {}: {}", resource, reason);
        }
    }
    for (component, description, error) in &report.actions_failed {
        println!("   cleanup action '{}' for {} failed: {}", description, component, error);
    }
}
