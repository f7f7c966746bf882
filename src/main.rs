use clap::{Parser, Subcommand};
use leadrun::agents::AgentRegistry;
use leadrun::config::EngineConfig;
use leadrun::db::open_database;
use leadrun::executor::{ExecutorSettings, LeadRunExecutor};
use leadrun::jobs::{enqueue_resumed, InMemoryJobQueue, JobQueue, LeadRunJob, LeadRunJobPayload, WorkerPool};
use leadrun::lead_runs::{cancel_run, ensure_active_run, status_payload_for};
use leadrun::pause::{AnyPauseGate, EnvPauseGate, FlagFilePauseGate, PauseGate};
use leadrun::resume::{sweep, Resume};
use leadrun::telemetry::init_tracing;
use rusqlite::Connection;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "leadrun", about = "Lead run execution engine")]
struct Cli {
    /// Path to a TOML config file. Falls back to LEADRUN_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the worker pool and the periodic resume sweep.
    Worker {
        /// Process whatever the first sweep finds, then exit.
        #[arg(long)]
        drain: bool,
    },
    /// Print resume decisions for every active run.
    Sweep,
    /// Print the status payload for a lead.
    Status {
        #[arg(long)]
        lead: i64,
    },
    /// Evaluate a run and, when it needs work, drive it in this process.
    Resume {
        #[arg(long)]
        run: i64,
    },
    /// Plan a run for a lead, or return the active one.
    Plan {
        #[arg(long)]
        lead: i64,
    },
    /// Cancel a run.
    Cancel {
        #[arg(long)]
        run: i64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match EngineConfig::resolve(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("leadrun: {err}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.logging);

    match run(cli.command, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "command failed");
            eprintln!("leadrun: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command, config: &EngineConfig) -> Result<(), String> {
    let mut connection = open_connection(config)?;
    let settings = config.executor_settings();
    match command {
        Command::Worker { drain } => run_worker(config, connection, drain),
        Command::Sweep => {
            let decisions =
                sweep(&mut connection, &settings, config.sweep.batch_size).map_err(|e| e.to_string())?;
            print_json(&decisions)
        }
        Command::Status { lead } => {
            let status = status_payload_for(&connection, lead).map_err(|e| e.to_string())?;
            print_json(&status)
        }
        Command::Resume { run } => {
            let decision = Resume::call(&mut connection, run, &settings).map_err(|e| e.to_string())?;
            print_json(&decision)?;
            let pause = pause_gate(config);
            if decision.enqueue && !pause.is_paused() {
                let queue = Arc::new(InMemoryJobQueue::new());
                queue.enqueue(LeadRunJobPayload::new(run, None).to_value(), Duration::ZERO);
                let pool = worker_pool(config, settings, queue, pause);
                let processed = pool.drain_due(&mut connection, usize::MAX);
                info!(run_id = run, processed, "resume drained");
                let status = leadrun::store::get_run(&connection, run).map_err(|e| e.to_string())?;
                print_json(&status)?;
            }
            Ok(())
        }
        Command::Plan { lead } => {
            let run = ensure_active_run(&mut connection, lead).map_err(|e| e.to_string())?;
            print_json(&run)
        }
        Command::Cancel { run } => {
            let status = cancel_run(&mut connection, run).map_err(|e| e.to_string())?;
            print_json(&serde_json::json!({"run_id": run, "run_status": status}))
        }
    }
}

fn open_connection(config: &EngineConfig) -> Result<Connection, String> {
    open_database(&config.database.path, config.busy_timeout())
}

fn pause_gate(config: &EngineConfig) -> Arc<dyn PauseGate> {
    let mut gate = AnyPauseGate::new().with(EnvPauseGate::default());
    if let Some(flag) = &config.pause.flag_file {
        gate = gate.with(FlagFilePauseGate::new(flag));
    }
    Arc::new(gate)
}

fn worker_pool(
    config: &EngineConfig,
    settings: ExecutorSettings,
    queue: Arc<dyn JobQueue>,
    pause: Arc<dyn PauseGate>,
) -> WorkerPool {
    // No agent backends ship with the engine; dry-run agents keep the
    // pipeline observable end to end.
    let executor = Arc::new(LeadRunExecutor::new(AgentRegistry::dry_run(), settings));
    let job = Arc::new(LeadRunJob::new(executor, pause, config.paused_interval()));
    WorkerPool::new(
        job,
        queue,
        config.retry_policy(),
        config.database.path.clone(),
        config.busy_timeout(),
    )
}

fn enqueue_sweep(connection: &mut Connection, queue: &dyn JobQueue, settings: &ExecutorSettings, limit: usize) -> usize {
    match sweep(connection, settings, limit) {
        Ok(decisions) => {
            let enqueued = enqueue_resumed(queue, &decisions);
            info!(evaluated = decisions.len(), enqueued, "sweep finished");
            enqueued
        }
        Err(err) => {
            warn!(error = %err, "sweep failed");
            0
        }
    }
}

fn run_worker(config: &EngineConfig, mut connection: Connection, drain: bool) -> Result<(), String> {
    let settings = config.executor_settings();
    let queue = Arc::new(InMemoryJobQueue::new());
    let pool = Arc::new(worker_pool(config, settings, queue.clone(), pause_gate(config)));

    enqueue_sweep(&mut connection, queue.as_ref(), &settings, config.sweep.batch_size);
    if drain {
        let processed = pool.drain_due(&mut connection, usize::MAX);
        info!(processed, remaining = queue.len(), "drain finished");
        return Ok(());
    }

    let stop = Arc::new(AtomicBool::new(false));
    let handles = pool.spawn(
        config.jobs.workers,
        Duration::from_millis(config.jobs.poll_ms),
        Arc::clone(&stop),
    );
    info!(workers = handles.len(), "worker pool running");

    let interval = Duration::from_secs(config.sweep.interval_secs.max(1));
    while !stop.load(Ordering::Relaxed) {
        thread::sleep(interval);
        if config.sweep.enabled {
            enqueue_sweep(&mut connection, queue.as_ref(), &settings, config.sweep.batch_size);
        }
    }
    for handle in handles {
        if handle.join().is_err() {
            error!("worker thread panicked");
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let rendered = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{rendered}");
    Ok(())
}
