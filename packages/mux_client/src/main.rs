use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use session_mux::{ClientConfig, MuxClient, NoView, load_config};
use tracing::info;
use tracing_subscriber::prelude::*;

mod repl;

use crate::repl::Target;

#[derive(Parser)]
#[command(name = "mux")]
#[command(about = "Shell and agent sessions over one multiplexed socket")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file; missing is fine, defaults and MUX_* env vars still apply
    #[arg(long, global = true, default_value = "mux.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also append logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open an agent session and talk to it
    Agent(AgentArgs),

    /// Open a remote shell
    Shell(ShellArgs),

    /// Print the resolved configuration as TOML
    Config,
}

#[derive(Parser)]
struct AgentArgs {
    /// Display name for the session
    #[arg(long, default_value = "agent")]
    name: String,

    /// Extra connect parameters, as a JSON object
    #[arg(long)]
    params: Option<String>,

    /// Re-attach to this server session key instead of starting a new one
    #[arg(long)]
    session: Option<String>,
}

#[derive(Parser)]
struct ShellArgs {
    #[arg(long, default_value = "shell")]
    name: String,

    #[arg(long, default_value = "80")]
    cols: u16,

    #[arg(long, default_value = "24")]
    rows: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Config => {
            let text = toml::to_string_pretty(&config).context("rendering config")?;
            print!("{text}");
            Ok(())
        }
        Commands::Agent(args) => {
            init_logging(cli.verbose, cli.log_file.as_deref())?;
            run_agent(&config, args).await
        }
        Commands::Shell(args) => {
            init_logging(cli.verbose, cli.log_file.as_deref())?;
            run_shell(&config, args).await
        }
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default_directive = if verbose {
        "mux_client=debug,session_mux=debug,info"
    } else {
        "mux_client=info,session_mux=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    // stdout belongs to the session
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(env_filter)
        .init();
    Ok(())
}

async fn run_agent(config: &ClientConfig, args: AgentArgs) -> Result<()> {
    let params = match &args.params {
        Some(raw) => serde_json::from_str(raw).context("--params must be JSON")?,
        None => serde_json::json!({}),
    };

    let client = MuxClient::websocket(config, Arc::new(NoView));
    let key = match args.session {
        Some(key) => {
            client.registry().open(&key, &args.name);
            client.agent().connect(&key, params)?;
            key
        }
        None => client.open_agent(&args.name, params)?,
    };
    info!(url = %config.server.url, session = %key, "agent session opened");
    repl::run(client, key, Target::Agent).await
}

async fn run_shell(config: &ClientConfig, args: ShellArgs) -> Result<()> {
    let client = MuxClient::websocket(config, Arc::new(NoView));
    let key = client.open_shell(&args.name, args.cols, args.rows)?;
    info!(url = %config.server.url, session = %key, "shell session opened");
    repl::run(client, key, Target::Shell).await
}
