use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use log::*;
use std::path::PathBuf;
use std::process::{Command as Process, ExitCode, ExitStatus};
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::thread;
use std::time::Duration;
use storelock::store::DEFAULT_TABLE;
use storelock::{
    Backoff, Counter, DEFAULT_COUNTER_KEY, DEFAULT_PREFIX, FsStore, Lock, ObjectStore,
    RetryPolicy, SpannerStore, run_locked,
};

/// Exit code when the lock could not be acquired within the wait budget.
const NOT_ACQUIRED: u8 = 3;
const INTERRUPTED: u8 = 130;
const FAILURE: u8 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "storelock",
    version,
    about = "Run jobs under a distributed lock kept in a shared store."
)]
struct Cli {
    #[command(flatten)]
    backend: Backend,

    /// Spanner table holding the objects.
    #[arg(long, env = "STORELOCK_TABLE", default_value = DEFAULT_TABLE)]
    table: String,

    /// Key of the shared active-holder counter.
    #[arg(long, env = "STORELOCK_COUNTER", default_value = DEFAULT_COUNTER_KEY)]
    counter: String,

    /// Key prefix for lock markers.
    #[arg(long, default_value = DEFAULT_PREFIX)]
    prefix: String,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct Backend {
    /// Directory on a shared filesystem used as the store.
    #[arg(long, env = "STORELOCK_DIR")]
    dir: Option<PathBuf>,

    /// Spanner database, e.g. projects/p/instances/i/databases/d.
    #[arg(long, env = "STORELOCK_DB")]
    db: Option<String>,
}

#[derive(Args, Debug)]
struct JobName {
    /// The name of the job (used as the lock name).
    #[arg(long, alias = "job_name")]
    job_name: String,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Acquire the lock, run a command, then release.
    Run {
        #[command(flatten)]
        job: JobName,

        /// Maximum concurrent holders sharing the counter.
        #[arg(long, default_value_t = 1)]
        limit: u64,

        /// Seconds to keep trying before giving up.
        #[arg(long, default_value_t = 30)]
        wait: u64,

        /// Seconds between attempts.
        #[arg(long, default_value_t = 2)]
        retry: u64,

        /// Randomize pauses between --retry and this many seconds.
        #[arg(long)]
        jitter_max: Option<u64>,

        /// Command to run while holding the lock.
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },

    /// Show the active count and the holder of a lock.
    Status {
        #[command(flatten)]
        job: JobName,
    },

    /// Remove a lock marker regardless of who holds it.
    Release {
        #[command(flatten)]
        job: JobName,
    },

    /// Set the active count back to zero.
    ResetCounter,
}

fn open_store(cli: &Cli) -> Result<Arc<dyn ObjectStore>> {
    if let Some(dir) = &cli.backend.dir {
        let store = FsStore::new(dir.clone())
            .with_context(|| format!("open store directory {}", dir.display()))?;
        return Ok(Arc::new(store));
    }

    let Some(db) = &cli.backend.db else {
        bail!("either --dir or --db is required");
    };

    // Pick a crypto provider before any TLS connection is made.
    let _ = rustls::crypto::ring::default_provider().install_default();
    let store = SpannerStore::connect(db.clone(), cli.table.clone())
        .with_context(|| format!("connect to {db}"))?;
    Ok(Arc::new(store))
}

fn lock_for(cli: &Cli, store: Arc<dyn ObjectStore>, name: &str) -> Result<Lock> {
    let lock = Lock::builder()
        .store(store)
        .name(name.to_string())
        .prefix(cli.prefix.clone())
        .counter_key(cli.counter.clone())
        .build()?;
    Ok(lock)
}

fn exit_code(status: ExitStatus) -> u8 {
    status
        .code()
        .and_then(|c| u8::try_from(c).ok())
        .unwrap_or(FAILURE)
}

/// Runs `command` to completion. Ctrl-C kills the child and returns, so the
/// caller's release still happens.
fn supervise(command: &[String]) -> Result<u8> {
    let Some((prog, args)) = command.split_first() else {
        bail!("no command given");
    };

    let (tx, rx) = channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("install Ctrl-C handler")?;

    let mut child = Process::new(prog)
        .args(args)
        .spawn()
        .with_context(|| format!("start {prog}"))?;

    loop {
        if let Some(status) = child.try_wait()? {
            info!("{prog} exited with {status}");
            return Ok(exit_code(status));
        }

        if rx.try_recv().is_ok() {
            warn!("interrupted, stopping {prog}");
            if let Err(e) = child.kill() {
                error!("kill {prog} failed: {e}");
            }
            child.wait()?;
            return Ok(INTERRUPTED);
        }

        thread::sleep(Duration::from_millis(100));
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let store = open_store(&cli)?;
    match &cli.command {
        Cmd::Run {
            job,
            limit,
            wait,
            retry,
            jitter_max,
            command,
        } => {
            let backoff = match jitter_max {
                Some(max) => Backoff::Jittered {
                    max: Duration::from_secs(*max),
                },
                None => Backoff::Fixed,
            };

            let policy = RetryPolicy::new(Duration::from_secs(*wait), Duration::from_secs(*retry))
                .with_backoff(backoff);
            let mut lock = Lock::builder()
                .store(store)
                .name(job.job_name.clone())
                .prefix(cli.prefix.clone())
                .counter_key(cli.counter.clone())
                .limit(*limit)
                .policy(policy)
                .build()?;

            match run_locked(&mut lock, || supervise(command)) {
                Ok(res) => res.map(ExitCode::from),
                Err(e) => {
                    warn!("{e}");
                    warn!(
                        "could not acquire lock for job: {}, job will not run",
                        job.job_name
                    );
                    Ok(ExitCode::from(NOT_ACQUIRED))
                }
            }
        }
        Cmd::Status { job } => {
            let lock = lock_for(&cli, store, &job.job_name)?;
            println!("active: {}", lock.counter().read()?.count);
            match lock.holder()? {
                Some(m) => println!(
                    "{}: held by {} since {}",
                    job.job_name, m.holder, m.acquired_at
                ),
                None if lock.is_locked()? => println!("{}: held", job.job_name),
                None => println!("{}: free", job.job_name),
            }
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Release { job } => {
            let mut lock = lock_for(&cli, store, &job.job_name)?;
            lock.force_release();
            Ok(ExitCode::SUCCESS)
        }
        Cmd::ResetCounter => {
            Counter::new(store, cli.counter.clone()).reset()?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(FAILURE)
        }
    }
}
