//! mesh-cli: Command-line interface for mesh registration.
//!
//! Registers a source mesh onto a target mesh (rigid ICP followed by a
//! deformation-graph refinement) and writes the deformed source.
//!
//! # Logging
//!
//! Set the `RUST_LOG` environment variable to control log output:
//! - `RUST_LOG=mesh_registration=info` - Stage summaries
//! - `RUST_LOG=mesh_registration=debug` - Per-iteration energies
//! - `RUST_LOG=mesh_registration::timing=debug` - Phase timing
//! - `RUST_LOG=debug` - All debug output
//!
//! # Example
//!
//! ```bash
//! # Register with stage logging
//! RUST_LOG=mesh_registration=info mesh register source.obj target.ply -o out.obj
//!
//! # Start from a configuration file
//! mesh init-config -o registration.toml
//! mesh register source.obj target.ply -o out.obj --config registration.toml
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod commands;
mod output;

use commands::{info, init_config, register};

/// mesh - Robust rigid and non-rigid mesh registration.
#[derive(Parser)]
#[command(name = "mesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format for results
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Suppress all non-error output
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Increase output verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Deform a source mesh onto a target mesh
    Register(register::RegisterArgs),

    /// Display mesh statistics
    Info {
        /// Input mesh file
        input: PathBuf,
    },

    /// Write the default registration configuration as TOML
    InitConfig {
        /// Output file (prints to stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Start from a preset instead of the defaults
        #[arg(long, value_enum)]
        preset: Option<init_config::Preset>,
    },
}

/// Initialize the tracing subscriber based on verbosity level.
fn init_tracing(verbose: u8, quiet: bool) {
    if quiet {
        return;
    }

    // RUST_LOG wins over -v flags
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match verbose {
            0 => "warn",
            1 => "mesh_registration=info",
            2 => "mesh_registration=debug",
            _ => "trace",
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    #[cfg(debug_assertions)]
    miette::set_panic_hook();

    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    let result = match &cli.command {
        Commands::Register(args) => register::run(args, &cli),
        Commands::Info { input } => info::run(input, &cli),
        Commands::InitConfig { output, preset } => {
            init_config::run(output.as_deref(), *preset, &cli)
        }
    };

    if let Err(e) = &result {
        if !cli.quiet {
            if let Some(mesh_err) = e.downcast_ref::<mesh_registration::MeshError>() {
                eprintln!("{}: {}", "Error".red().bold(), mesh_err);
                eprintln!("  {}: {}", "Code".cyan(), mesh_err.code());
                eprintln!(
                    "  {}: {}",
                    "Suggestion".green(),
                    mesh_err.recovery_suggestion()
                );
                if let Some(location) = mesh_err.location() {
                    eprintln!("  {}: {}", "Location".yellow(), location);
                }
            } else {
                eprintln!("{}: {}", "Error".red().bold(), e);
                for cause in e.chain().skip(1) {
                    eprintln!("  {}: {}", "Caused by".yellow(), cause);
                }
            }
        }
        std::process::exit(1);
    }

    Ok(())
}
