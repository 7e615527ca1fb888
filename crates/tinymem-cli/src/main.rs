#![forbid(unsafe_code)]

//! **tinymem** – Command-line entry point.
//!
//! Subcommands: `serve` runs the HTTP proxy, `mcp` runs the stdio tool
//! server, `doctor` runs the integrity checks against the local store, and
//! `init` writes a commented default configuration.
//!
//! Exit codes: 0 on success, 1 on startup failure (configuration, store,
//! migrations, FTS5 absence), 2 on a runtime-fatal transport error.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tinymem_config::{Config, DEFAULT_CONFIG_TEMPLATE};
use tinymem_store::Store;
use tinymem_types::TinyMemError;
use tinymem_upstream::{HttpUpstream, UpstreamConfig};

const EXIT_STARTUP: i32 = 1;
const EXIT_RUNTIME: i32 = 2;

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "tinymem")]
#[command(about = "tinyMem - evidence-gated persistence between a chat client and an LLM backend")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(long, default_value = "tinymem.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the OpenAI-compatible HTTP proxy
    Serve,
    /// Run the MCP tool server over stdio
    Mcp,
    /// Run integrity checks against the local store
    Doctor,
    /// Write a commented default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

//─────────────────────────────
//  Main application
//─────────────────────────────

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    // `init` must work before any configuration exists.
    if let Commands::Init { force } = &cli.command {
        return match write_default_config(&cli.config, *force) {
            Ok(()) => {
                println!("wrote {}", cli.config.display());
                0
            }
            Err(e) => {
                eprintln!("tinymem: {e:#}");
                EXIT_STARTUP
            }
        };
    }

    let config = match Config::load(Some(cli.config.as_path())) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tinymem: {e}");
            return EXIT_STARTUP;
        }
    };
    if let Err(e) = init_tracing(&config) {
        eprintln!("tinymem: failed to initialize logging: {e:#}");
        return EXIT_STARTUP;
    }
    info!(version = env!("CARGO_PKG_VERSION"), "tinymem starting");

    match cli.command {
        Commands::Serve => match tinymem_proxy::serve(config).await {
            Ok(()) => 0,
            Err(e) => exit_code_for(&e),
        },
        Commands::Mcp => run_mcp(config).await,
        Commands::Doctor => run_doctor(config).await,
        Commands::Init { .. } => 0,
    }
}

async fn run_mcp(config: Config) -> i32 {
    let server = match build_mcp(&config).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "mcp startup failed");
            return EXIT_STARTUP;
        }
    };
    match server.run_stdio().await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "mcp transport failed");
            exit_code_for(&e)
        }
    }
}

async fn run_doctor(config: Config) -> i32 {
    let server = match build_mcp(&config).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "doctor startup failed");
            return EXIT_STARTUP;
        }
    };
    match tinymem_mcp::tools::run_doctor(server.state()).await {
        Ok(findings) if findings.is_empty() => {
            println!("store is healthy");
            0
        }
        Ok(findings) => {
            println!("{} finding(s):", findings.len());
            for finding in findings {
                println!("  - {finding}");
            }
            0
        }
        Err(e) => {
            error!(error = %e, "doctor failed");
            exit_code_for(&e)
        }
    }
}

async fn build_mcp(config: &Config) -> std::result::Result<tinymem_mcp::McpServer, TinyMemError> {
    let store = Store::open(config.store_path()).await?;
    let backend = Arc::new(HttpUpstream::new(UpstreamConfig {
        base_url: config.upstream_base_url.clone(),
        model: config.cove_model().to_string(),
        timeout: Duration::from_secs(config.upstream_timeout_seconds),
    })?);
    Ok(tinymem_mcp::McpServer::from_config(config, store, backend))
}

fn exit_code_for(error: &TinyMemError) -> i32 {
    if error.is_startup_fatal() {
        EXIT_STARTUP
    } else {
        EXIT_RUNTIME
    }
}

fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            path.display()
        );
    }
    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn init_tracing(config: &Config) -> Result<()> {
    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    match &config.log_file {
        Some(path) => {
            let path = Path::new(path);
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
