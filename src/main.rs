//! Tidepool CLI
//!
//! A command-line front end that exercises the runtime end to end: async
//! file reads, an HTTP GET and an interval timer, each followed by a wait
//! for the loop to go idle.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tidepool::native::Builtin;
use tidepool::{Completion, Runtime, RuntimeConfig, ScriptDriver, VERSION};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tidepool")]
#[command(
    author,
    version,
    about = "An embeddable host runtime for JavaScript engines",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Runtime configuration file (JSON)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Print scheduler statistics as JSON when done
    #[arg(long, global = true)]
    stats: bool,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Read files concurrently and print them
    Cat {
        /// Files to read
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Fetch a URL over plain HTTP and print the body
    Fetch {
        /// The URL to fetch
        url: String,
    },

    /// Run an interval timer a number of times, then clear it
    Tick {
        /// Interval between ticks
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
        /// Number of ticks before the interval is cleared
        #[arg(long, default_value_t = 3)]
        count: u64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match run(cli) {
        Ok(Completion::Idle) => ExitCode::SUCCESS,
        Ok(Completion::Pending { outstanding }) => {
            eprintln!("error: timed out with {} operation(s) still pending", outstanding);
            ExitCode::from(2)
        }
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<RuntimeConfig> {
    let config = match path {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    Ok(config.with_env_overrides()?)
}

fn run(cli: Cli) -> Result<Completion> {
    let config = load_config(cli.config.as_ref())?;
    let runtime = Runtime::with_config(config).context("failed to start runtime")?;
    tracing::info!(version = VERSION, "tidepool runtime started");

    let started = Instant::now();
    let completion = match cli.command {
        Commands::Cat { files } => cat(&runtime, files)?,
        Commands::Fetch { url } => fetch(&runtime, url)?,
        Commands::Tick { interval_ms, count } => tick(&runtime, interval_ms, count)?,
    };
    tracing::info!(elapsed = ?started.elapsed(), ?completion, "script finished");

    if cli.stats {
        let stats = serde_json::to_string_pretty(&runtime.stats())?;
        println!("{}", stats);
    }
    runtime.shutdown();
    Ok(completion)
}

fn cat(runtime: &Runtime, files: Vec<PathBuf>) -> Result<Completion> {
    let Builtin::Fs(fs) = runtime.require("fs")? else {
        bail!("fs module unavailable");
    };
    let failures = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&failures);

    let completion = ScriptDriver::new(runtime).run_script(move || {
        for path in files {
            let failures = Arc::clone(&seen);
            let shown = path.display().to_string();
            fs.read_file(path, move |result| {
                match result {
                    Ok(bytes) => println!("==> {} <==\n{}", shown, String::from_utf8_lossy(&bytes)),
                    Err(err) => {
                        failures.fetch_add(1, Ordering::Relaxed);
                        eprintln!("{}: {}", shown, err);
                    }
                }
                Ok(())
            });
        }
        Ok(())
    })?;

    let failed = failures.load(Ordering::Relaxed);
    if failed > 0 {
        bail!("{} file(s) could not be read", failed);
    }
    Ok(completion)
}

fn fetch(runtime: &Runtime, url: String) -> Result<Completion> {
    let Builtin::Http(http) = runtime.require("http")? else {
        bail!("http module unavailable");
    };
    let failed = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&failed);

    let completion = ScriptDriver::new(runtime).run_script(move || {
        let target = url.clone();
        http.get(&target, move |result| {
            match result {
                Ok(response) => {
                    eprintln!("{} {}", response.status, response.status_text);
                    print!("{}", response.text());
                }
                Err(err) => {
                    seen.fetch_add(1, Ordering::Relaxed);
                    eprintln!("{}: {}", url, err);
                }
            }
            Ok(())
        });
        Ok(())
    })?;

    if failed.load(Ordering::Relaxed) > 0 {
        bail!("request failed");
    }
    Ok(completion)
}

fn tick(runtime: &Runtime, interval_ms: u64, count: u64) -> Result<Completion> {
    if count == 0 {
        bail!("--count must be at least 1");
    }
    let context = runtime.context();
    let completion = ScriptDriver::new(runtime).run_script(move || {
        let ticks = Arc::new(AtomicU64::new(0));
        let timers = context.clone();
        let id = Arc::new(AtomicU64::new(0));
        let own_id = Arc::clone(&id);
        let assigned = context.set_interval(std::time::Duration::from_millis(interval_ms), move || {
            let n = ticks.fetch_add(1, Ordering::SeqCst) + 1;
            println!("tick {}", n);
            if n == count {
                timers.clear_timer(own_id.load(Ordering::SeqCst).into());
            }
            Ok(())
        });
        // runs on the loop, so the first tick cannot fire before this store
        id.store(assigned.as_u64(), Ordering::SeqCst);
        Ok(())
    })?;
    Ok(completion)
}
