//! Output formatting for command results.
//!
//! Supports table, JSON and raw output formats.

use comfy_table::{Cell, ContentArrangement, Table};
use serde_json::{json, Value as JsonValue};

use meridian_engine::{DrainStats, TableStatus};

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Formatted table output.
    Table,
    /// JSON output.
    Json,
    /// Raw output (values separated by tabs).
    Raw,
}

const STATUS_COLUMNS: [&str; 8] = [
    "table", "id", "last_txn", "applied_txn", "lag", "structure", "state", "reason",
];

fn status_row(status: &TableStatus) -> Vec<String> {
    let reason = status
        .suspend_reason
        .as_ref()
        .map(|r| format!("txn {}: {} ({})", r.txn, r.message, r.class))
        .unwrap_or_default();
    vec![
        status.token.name().to_string(),
        status.token.table_id().to_string(),
        status.last_txn.to_string(),
        status.applied_txn.to_string(),
        status.lag().to_string(),
        status.structure_version.to_string(),
        status.state.to_string(),
        reason,
    ]
}

/// Formats table statuses.
pub fn format_status(statuses: &[TableStatus], format: OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            let rows: Vec<Vec<String>> = statuses.iter().map(status_row).collect();
            format_table(&STATUS_COLUMNS, &rows)
        }
        OutputFormat::Json => {
            let values: Vec<JsonValue> = statuses.iter().map(status_to_json).collect();
            serde_json::to_string_pretty(&values).unwrap_or_else(|_| "[]".to_string())
        }
        OutputFormat::Raw => {
            let rows: Vec<Vec<String>> = statuses.iter().map(status_row).collect();
            format_raw(&STATUS_COLUMNS, &rows)
        }
    }
}

fn status_to_json(status: &TableStatus) -> JsonValue {
    json!({
        "table": status.token.name(),
        "table_id": status.token.table_id().get(),
        "dir": status.token.dir_name(),
        "last_txn": status.last_txn.get(),
        "applied_txn": status.applied_txn.get(),
        "lag": status.lag(),
        "structure_version": status.structure_version.get(),
        "state": status.state.to_string(),
        "suspended": status.suspend_reason.is_some(),
        "reason": status.suspend_reason,
        "partitions": status.partitions,
        "rows": status.rows,
        "writers": status.writers,
    })
}

/// Formats what a drain or purge did.
pub fn format_drain(stats: &DrainStats, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(&json!({
            "txns": stats.txns,
            "segments": stats.segments,
            "versions": stats.versions,
            "tables": stats.tables,
        }))
        .unwrap_or_else(|_| "{}".to_string()),
        OutputFormat::Table | OutputFormat::Raw => format!(
            "applied {} txn(s), deleted {} wal segment(s), {} partition version(s), {} dropped table(s)",
            stats.txns, stats.segments, stats.versions, stats.tables
        ),
    }
}

fn format_table(columns: &[&str], rows: &[Vec<String>]) -> String {
    let mut table = Table::new();

    table
        .set_content_arrangement(ContentArrangement::Dynamic)
        .load_preset(comfy_table::presets::UTF8_FULL)
        .apply_modifier(comfy_table::modifiers::UTF8_ROUND_CORNERS);

    table.set_header(columns.iter().map(Cell::new));
    for row in rows {
        table.add_row(row.iter().map(Cell::new));
    }

    table.to_string()
}

fn format_raw(columns: &[&str], rows: &[Vec<String>]) -> String {
    let mut output = columns.join("\t");
    output.push('\n');
    for row in rows {
        output.push_str(&row.join("\t"));
        output.push('\n');
    }
    output
}
