//! Subcommand implementations. Each returns the text to print.

use anyhow::{bail, Context, Result};

use meridian_engine::{Engine, TxnId};

use crate::config::CliConfig;
use crate::formatter::{format_drain, format_status, OutputFormat};

/// Shows the status of one table, or of every table.
pub fn status(engine: &Engine, table: Option<&str>, format: OutputFormat) -> Result<String> {
    let names: Vec<String> = match table {
        Some(name) => vec![name.to_string()],
        None => engine.tables().iter().map(|t| t.name().to_string()).collect(),
    };
    let statuses = names
        .iter()
        .map(|name| engine.status(name).with_context(|| format!("failed to read status of {name}")))
        .collect::<Result<Vec<_>>>()?;
    Ok(format_status(&statuses, format))
}

/// Resumes a suspended table, optionally skipping transactions before
/// `from`.
pub fn resume(engine: &Engine, table: &str, from: Option<u64>) -> Result<String> {
    match from {
        Some(txn) => {
            engine
                .resume_from(table, TxnId::new(txn))
                .with_context(|| format!("failed to resume {table} from txn {txn}"))?;
            Ok(format!("resumed {table} from txn {txn}"))
        }
        None => {
            let resumed = engine
                .resume(table)
                .with_context(|| format!("failed to resume {table}"))?;
            if !resumed {
                bail!("table {table} is not suspended");
            }
            Ok(format!("resumed {table}"))
        }
    }
}

/// Applies everything pending and purges what is no longer needed.
pub fn drain(engine: &Engine, format: OutputFormat) -> Result<String> {
    let stats = engine.drain().context("drain failed")?;
    Ok(format_drain(&stats, format))
}

/// Runs the purge jobs once.
pub fn purge(engine: &Engine, format: OutputFormat) -> Result<String> {
    let stats = engine.purge().context("purge failed")?;
    Ok(format_drain(&stats, format))
}

/// Prints the effective engine configuration as TOML.
pub fn print_config(config: &CliConfig) -> Result<String> {
    let mut output = String::new();
    if let Some(source) = &config.source {
        output.push_str(&format!("# loaded from {}\n", source.display()));
    }
    output.push_str(&config.engine.to_toml()?);
    Ok(output)
}
