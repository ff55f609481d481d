//! kprof CLI
//!
//! Captures a pprof profile from a Go process running in a Kubernetes pod:
//! finds the pod's diagnostic port, tunnels it to this machine and opens
//! `go tool pprof` against the tunnel.

mod commands;
mod config;
mod output;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use kprof_lib::ProfileKind;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::CliConfig;
use crate::output::print_error;

/// kprof: pprof go binaries running in kubernetes cluster
#[derive(Debug, Parser)]
#[command(name = "kprof")]
#[command(author, version, about = "kprof: pprof go binaries running in kubernetes cluster", long_about = None)]
pub struct Cli {
    /// Namespace to use (defaults to the current context's namespace)
    #[arg(long, short, env = "NAMESPACE", global = true)]
    pub namespace: Option<String>,

    /// Container to use when the pod declares ports in several containers
    #[arg(long, short, global = true)]
    pub container: Option<String>,

    /// Port the pprof endpoint is listening on (0 = auto-detect)
    #[arg(long, short, default_value_t = 0, global = true)]
    pub port: u16,

    /// Path to kubeconfig file (uses default if not specified)
    #[arg(long, global = true, value_name = "FILE")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use instead of the current one
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Capture and explore CPU profile
    Cpu(ProfileArgs),

    /// Capture and explore heap memory profile
    Memory(ProfileArgs),

    /// Capture and explore allocations profile
    Allocs(ProfileArgs),

    /// Print a shell completion script
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Args)]
pub struct ProfileArgs {
    /// Pod to profile
    pub pod: Option<String>,
}

fn init_tracing(verbose: bool) {
    let default_directives = if verbose {
        "kprof=debug,kprof_lib=debug"
    } else {
        "warn"
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives)),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let (kind, args) = match &cli.command {
        Commands::Cpu(args) => (ProfileKind::Cpu, args),
        Commands::Memory(args) => (ProfileKind::Memory, args),
        Commands::Allocs(args) => (ProfileKind::Allocs, args),
        Commands::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "kprof", &mut std::io::stdout());
            return Ok(());
        }
    };

    let config = CliConfig::load()?;
    debug!(?config, "Loaded configuration");

    commands::profile::run(&cli, kind, args, &config).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    debug!("Args: {:?}", cli);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            print_error(&format!("fail to run: {:#}", err));
            ExitCode::from(1)
        }
    }
}
