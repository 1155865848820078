//! `gitops` binary: serve tool calls over stdin/stdout, list tools, or run one
//! call from the command line.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use gitops::dispatch::Dispatcher;
use gitops::exit_codes;
use gitops::io::config::load_config;
use gitops::logging;
use gitops::ops::Orchestrator;
use gitops::registry::Registry;

#[derive(Parser)]
#[command(
    name = "gitops",
    version,
    about = "Approval-gated, conflict-aware git operations for automated callers"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ServerArgs {
    /// Repository used when a call omits `repo_path`.
    #[arg(long)]
    repository: Option<PathBuf>,
    /// TOML config file; defaults apply when it does not exist.
    #[arg(long, default_value = "gitops.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Answer one JSON request per stdin line with one JSON response line.
    Serve {
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Print every tool with its approval class and input schema.
    Tools,
    /// Run a single tool call and print the envelope.
    Call {
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
        #[command(flatten)]
        server: ServerArgs,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { server } => cmd_serve(&server),
        Command::Tools => cmd_tools(),
        Command::Call { tool, args, server } => cmd_call(&tool, &args, &server),
    }
}

fn build_dispatcher(server: &ServerArgs) -> Result<Dispatcher> {
    let config = load_config(&server.config)?;
    debug!(config = %server.config.display(), mode = ?config.approval.mode, "config loaded");
    let orchestrator = Orchestrator::from_config(&config).context("build orchestrator")?;
    Dispatcher::new(orchestrator, server.repository.clone())
}

fn cmd_serve(server: &ServerArgs) -> Result<i32> {
    let dispatcher = build_dispatcher(server)?;
    let stdout = Mutex::new(io::stdout());
    info!("serving requests on stdin");

    thread::scope(|scope| -> Result<()> {
        for line in io::stdin().lock().lines() {
            let line = line.context("read request line")?;
            if line.trim().is_empty() {
                continue;
            }
            let dispatcher = &dispatcher;
            let stdout = &stdout;
            scope.spawn(move || {
                let response = dispatcher.handle_line(&line);
                if let Err(err) = write_line(stdout, &response) {
                    warn!(err = %format!("{err:#}"), "failed to write response");
                }
            });
        }
        Ok(())
    })?;
    Ok(exit_codes::OK)
}

/// Write one whole JSON line; the lock keeps concurrent responses apart.
fn write_line<T: Serialize>(stdout: &Mutex<io::Stdout>, value: &T) -> Result<()> {
    let mut line = serde_json::to_string(value).context("serialize response")?;
    line.push('\n');
    let mut out = stdout
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    out.write_all(line.as_bytes()).context("write response")?;
    out.flush().context("flush response")?;
    Ok(())
}

fn cmd_tools() -> Result<i32> {
    let registry = Registry::builtin()?;
    let payload = serde_json::to_string_pretty(&registry.list()).context("serialize tools")?;
    println!("{payload}");
    Ok(exit_codes::OK)
}

fn cmd_call(tool: &str, args: &str, server: &ServerArgs) -> Result<i32> {
    let arguments: Value = serde_json::from_str(args).context("parse --args as JSON")?;
    let dispatcher = build_dispatcher(server)?;
    let envelope = dispatcher.dispatch(tool, &arguments);
    let payload = serde_json::to_string_pretty(&envelope).context("serialize envelope")?;
    println!("{payload}");
    Ok(envelope.exit_code())
}
