//! Meridian operational tool.
//!
//! Inspects and repairs the commit/apply state of the tables under a data
//! directory.
//!
//! # Usage
//!
//! ```bash
//! # Commit and apply progress of every table
//! meridian --data-dir /var/lib/meridian status
//!
//! # One table, as JSON
//! meridian -d /var/lib/meridian -o json status trades
//!
//! # Resume a suspended table, skipping transactions before 42
//! meridian -d /var/lib/meridian resume trades --from 42
//!
//! # Apply everything pending, then purge
//! meridian -d /var/lib/meridian drain
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod formatter;

use config::CliConfig;
use formatter::OutputFormat;
use meridian_engine::Engine;

/// Meridian operational tool
#[derive(Parser, Debug)]
#[command(
    name = "meridian",
    version,
    about = "Operational tool for Meridian tables",
    long_about = "Inspects the commit and apply state of Meridian tables, resumes suspended\n\
                  tables and runs the apply and purge jobs on demand."
)]
struct Args {
    /// Engine data directory
    #[arg(short = 'd', long, global = true, default_value = ".", env = "MERIDIAN_DATA_DIR")]
    data_dir: PathBuf,

    /// Configuration file path (default: <data-dir>/meridian.toml)
    #[arg(short = 'c', long, global = true, value_name = "FILE", env = "MERIDIAN_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter, e.g. "info" or "meridian_engine=debug"
    #[arg(long, global = true, default_value = "warn", env = "MERIDIAN_LOG")]
    log_level: String,

    /// Enable verbose output
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Output format
    #[arg(short = 'o', long, global = true, value_enum, default_value = "table")]
    output: OutputFormatArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show last committed and applied txn, suspension and apply state
    Status {
        /// Table name (all tables if omitted)
        table: Option<String>,
    },
    /// Resume a suspended table
    Resume {
        /// Table name
        table: String,
        /// Skip every transaction before this one
        #[arg(long, value_name = "TXN")]
        from: Option<u64>,
    },
    /// Apply pending transactions and purge until idle
    Drain,
    /// Delete unneeded WAL segments, partition versions and dropped tables
    Purge,
    /// Print the effective configuration
    PrintConfig,
}

/// Output format argument
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormatArg {
    /// Display results in a formatted table
    Table,
    /// Display results as JSON
    Json,
    /// Display tab-separated values
    Raw,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Table => OutputFormat::Table,
            OutputFormatArg::Json => OutputFormat::Json,
            OutputFormatArg::Raw => OutputFormat::Raw,
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.verbose);

    let config = CliConfig::load(&args.data_dir, args.config.as_deref())?;
    let format = OutputFormat::from(args.output);

    if let Command::PrintConfig = args.command {
        println!("{}", commands::print_config(&config)?);
        return Ok(());
    }

    info!(data_dir = %config.data_dir.display(), "opening engine");
    let engine = Engine::open(&config.data_dir, config.engine.clone())
        .with_context(|| format!("failed to open engine at {}", config.data_dir.display()))?;

    let output = match &args.command {
        Command::Status { table } => commands::status(&engine, table.as_deref(), format)?,
        Command::Resume { table, from } => commands::resume(&engine, table, *from)?,
        Command::Drain => commands::drain(&engine, format)?,
        Command::Purge => commands::purge(&engine, format)?,
        Command::PrintConfig => commands::print_config(&config)?,
    };
    println!("{output}");
    Ok(())
}

fn init_logging(level: &str, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("meridian_cli=debug,meridian_engine=debug,meridian_storage=debug,meridian_sequencer=debug,meridian_wal=debug")
    } else {
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
