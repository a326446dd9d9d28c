//! pysandbox CLI - run Python code in sandboxed containers from the terminal
//!
//! Drives the orchestrator in-process: each invocation connects to the local
//! container runtime, runs the requested command and tears every container
//! down again before exiting (also on Ctrl-C).

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde_json::Value;
use tracing::info;

use pysandbox_orchestrator::logging::init_logging;
use pysandbox_orchestrator::{
    metrics, ExecutionRequest, ExecutionResult, Orchestrator, SandboxConfig, StateMap,
};

/// pysandbox - execute Python safely in isolated containers
#[derive(Parser)]
#[command(name = "pysandbox")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sandboxed Python execution with warm pools and persistent sessions", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/pysandbox.* and PYSANDBOX__* env vars)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Print Prometheus metrics after the command completes
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute code once in a fresh container
    Exec {
        /// Code to execute (or path to file with @ prefix)
        code: String,

        /// Initial variables as a JSON object (or path to file with @ prefix)
        #[arg(short, long)]
        state: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        output: OutputFormat,
    },

    /// Execute snippets one after another in a single persistent session
    Session {
        /// Snippets to execute in order (each may be a path with @ prefix)
        #[arg(required = true)]
        snippets: Vec<String>,

        /// Session id (a random one is generated when omitted)
        #[arg(short, long)]
        id: Option<String>,

        /// Packages to install into the session before running the snippets
        #[arg(short, long = "install")]
        packages: Vec<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        output: OutputFormat,
    },

    /// Install a package in a throwaway container and print the installer log
    Install {
        /// Package specifier, e.g. "requests" or "numpy==1.26.4"
        package: String,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SandboxConfig::from_file(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?,
        None => SandboxConfig::load().context("Failed to load configuration")?,
    };
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }

    init_logging(&config.log_level).context("Failed to initialize logging")?;
    if cli.metrics {
        metrics::init_metrics().context("Failed to install metrics recorder")?;
    }

    if matches!(cli.command, Commands::Config) {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let engine = Orchestrator::connect(config)
        .await
        .context("Failed to connect to container runtime")?;
    engine.start().await;
    info!(image = %engine.config().docker.image, "Connected to container runtime");

    let outcome = tokio::select! {
        result = run(&engine, cli.command) => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{}", "Interrupted, cleaning up containers...".yellow());
            Err(anyhow::anyhow!("interrupted"))
        }
    };

    engine.shutdown().await;

    if cli.metrics {
        if let Some(rendered) = metrics::render() {
            println!("\n{}", "METRICS:".bright_magenta().bold());
            print!("{}", rendered);
        }
    }

    outcome
}

async fn run(engine: &Orchestrator, command: Commands) -> Result<()> {
    match command {
        Commands::Exec { code, state, output } => {
            let code = read_argument(&code, "code")?;
            let state = state.map(|s| parse_state(&s)).transpose()?;

            let result = engine
                .execute(ExecutionRequest::transient(code, state))
                .await
                .context("Execution failed")?;
            print_result(&result, output)?;
        }

        Commands::Session {
            snippets,
            id,
            packages,
            output,
        } => {
            let mut session_id = id;

            if !packages.is_empty() {
                // installs need the session container to exist already
                let (_, id) = engine
                    .execute_persistent(session_id.as_deref(), "pass")
                    .await
                    .context("Failed to start session")?;
                for package in &packages {
                    let log = engine
                        .install_package(Some(&id), package)
                        .await
                        .with_context(|| format!("Failed to install {}", package))?;
                    if output == OutputFormat::Text {
                        println!("{} {}", "Installed:".bright_cyan(), package);
                        println!("{}", log.trim_end().dimmed());
                    }
                }
                session_id = Some(id);
            }

            for (index, snippet) in snippets.iter().enumerate() {
                let code = read_argument(snippet, "snippet")?;
                let result = engine
                    .execute(ExecutionRequest::persistent(code, session_id.clone()))
                    .await
                    .with_context(|| format!("Snippet {} failed", index + 1))?;

                if let ExecutionResult::Persistent { session_id: id, .. } = &result {
                    session_id = Some(id.clone());
                }

                if output == OutputFormat::Text {
                    println!("{}", format!("--- [{}] ---", index + 1).bright_blue());
                }
                print_result(&result, output)?;
            }
        }

        Commands::Install { package } => {
            let log = engine
                .install_package(None, &package)
                .await
                .with_context(|| format!("Failed to install {}", package))?;
            println!("{}", log);
        }

        Commands::Config => {}
    }

    Ok(())
}

/// Inline value, or file contents when prefixed with @
fn read_argument(value: &str, what: &str) -> Result<String> {
    match value.strip_prefix('@') {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read {} file: {}", what, path)),
        None => Ok(value.to_string()),
    }
}

fn parse_state(value: &str) -> Result<StateMap> {
    let raw = read_argument(value, "state")?;
    match serde_json::from_str::<Value>(&raw).context("State is not valid JSON")? {
        Value::Object(map) => Ok(map),
        _ => bail!("State must be a JSON object"),
    }
}

fn print_result(result: &ExecutionResult, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    let (error, session) = match result {
        ExecutionResult::Transient(r) => (r.error.as_deref(), None),
        ExecutionResult::Persistent { session_id, output } => {
            (output.error.as_deref(), Some(session_id.as_str()))
        }
    };

    println!("{}", "=".repeat(60).bright_blue());
    if let Some(session_id) = session {
        println!("{} {}", "Session ID:".bright_cyan(), session_id);
    }
    println!(
        "{} {}",
        "Status:".bright_cyan(),
        if error.is_none() { "success".green() } else { "error".red() }
    );

    match result {
        ExecutionResult::Transient(r) => {
            if !r.stdout.is_empty() {
                println!("\n{}", "STDOUT:".bright_green().bold());
                print!("{}", r.stdout);
            }
            if !r.stderr.is_empty() {
                println!("\n{}", "STDERR:".bright_red().bold());
                print!("{}", r.stderr);
            }
            if let Some(value) = &r.result {
                println!("\n{} {}", "Result:".bright_cyan(), value);
            }
            if !r.state.is_empty() {
                println!("\n{}", "STATE:".bright_yellow().bold());
                println!("{}", serde_json::to_string_pretty(&r.state)?);
            }
        }
        ExecutionResult::Persistent { output, .. } => {
            if !output.output.is_empty() {
                println!("\n{}", "STDOUT:".bright_green().bold());
                print!("{}", output.output);
            }
            if let Some(stderr) = output.stderr.as_deref().filter(|s| !s.is_empty()) {
                println!("\n{}", "STDERR:".bright_red().bold());
                print!("{}", stderr);
            }
            if let Some(value) = &output.result {
                println!("\n{} {}", "Result:".bright_cyan(), value);
            }
        }
    }

    if let Some(error) = error {
        println!("\n{}", "ERROR:".bright_red().bold());
        println!("{}", error.trim_end());
    }
    println!("{}", "=".repeat(60).bright_blue());

    Ok(())
}
