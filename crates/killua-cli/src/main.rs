//! Killua Sandbox Command-Line Interface
//!
//! This CLI provides tools for:
//! - Running a snippet through a guest module in an isolated worker
//! - Checking that a guest module's imports are all provided by the host
//!
//! The hidden `worker` subcommand is the other end of the isolation
//! boundary: the parent re-executes this binary with it for every run.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use killua_sandbox::worker::serve_stdio;
use killua_sandbox::{IsolationConfig, Outcome, SandboxRunner, WasmSandbox};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "killua")]
#[command(author, version, about = "Run custom command snippets in a WASM sandbox", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// JSON config file (isolation and runtime settings)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a snippet through a guest module in a worker process
    Run {
        /// Guest module (.wasm or .wat)
        module: PathBuf,

        /// Snippet to run (read from stdin when neither this nor --file is given)
        source: Option<String>,

        /// Read the snippet from a file
        #[arg(short, long, conflicts_with = "source")]
        file: Option<PathBuf>,

        /// Wall-clock budget in milliseconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Copy guest stdout/stderr to this process's stderr
        #[arg(long)]
        echo: bool,
    },

    /// List guest imports the host does not provide
    Imports {
        /// Guest module (.wasm or .wat)
        module: PathBuf,
    },

    /// Serve one job on stdin/stdout (used by `run`)
    #[command(hide = true)]
    Worker,
}

fn load_config(path: Option<&Path>) -> Result<IsolationConfig> {
    match path {
        Some(path) => IsolationConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {:?}", path)),
        None => Ok(IsolationConfig::default()),
    }
}

fn read_source(source: Option<String>, file: Option<PathBuf>) -> Result<String> {
    if let Some(source) = source {
        return Ok(source);
    }
    if let Some(file) = file {
        return std::fs::read_to_string(&file).with_context(|| format!("Failed to read {:?}", file));
    }
    let mut source = String::new();
    std::io::stdin()
        .read_to_string(&mut source)
        .context("Failed to read snippet from stdin")?;
    Ok(source)
}

fn cmd_run(
    mut config: IsolationConfig,
    verbose: u8,
    module: PathBuf,
    source: String,
    timeout: Option<u64>,
    echo: bool,
) -> Result<()> {
    if let Some(ms) = timeout {
        config = config.timeout(Duration::from_millis(ms));
    }
    if echo {
        config.wasm = config.wasm.echo_output(true);
    }
    // Workers are this binary; pass the verbosity on.
    if config.worker_program.is_none() && verbose > 0 {
        config.worker_args = vec![format!("-{}", "v".repeat(verbose as usize)), "worker".to_string()];
    }

    let runner = SandboxRunner::new(config, &module)
        .with_context(|| format!("Failed to prepare guest module {:?}", module))?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let start = Instant::now();
    let mut replies = 0usize;
    let outcome = runtime.block_on(async {
        let mut stream = runner.run_sandboxed(&source);
        while let Some(reply) = stream.next_reply().await {
            replies += 1;
            println!("{}", reply);
        }
        stream.outcome().await
    });

    info!(
        "{} replies, {} in {:.1} ms",
        replies,
        outcome,
        start.elapsed().as_secs_f64() * 1000.0
    );

    match outcome {
        Outcome::Completed => Ok(()),
        other => bail!("{}", other.describe()),
    }
}

fn cmd_imports(config: IsolationConfig, module: PathBuf) -> Result<()> {
    let sandbox = WasmSandbox::new(config.wasm)?;
    let module = sandbox
        .load_module(&module)
        .with_context(|| format!("Failed to load guest module {:?}", module))?;

    let missing = sandbox.check_imports(&module)?;
    if missing.is_empty() {
        println!("{}: all imports resolved", module.name());
        return Ok(());
    }

    println!("{}: {} unresolved imports", module.name(), missing.len());
    for import in &missing {
        println!("  {}", import);
    }
    bail!("guest module has unresolved imports")
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    // Stdout is the reply channel (and the protocol pipe in a worker).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::from_level(log_level).into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            module,
            source,
            file,
            timeout,
            echo,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let source = read_source(source, file)?;
            cmd_run(config, cli.verbose, module, source, timeout, echo)
        }

        Commands::Imports { module } => cmd_imports(load_config(cli.config.as_deref())?, module),

        Commands::Worker => std::process::exit(serve_stdio().code()),
    }
}
