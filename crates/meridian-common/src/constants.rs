//! System-wide constants for Meridian.
//!
//! File names, magic numbers and limits shared between the crates that
//! read and write the on-disk layout of a table directory:
//!
//! ```text
//! <root>/<name>~<table_id>/
//!     _name                   table name (rewritten on rename)
//!     _txn                    applied watermark + current partition versions
//!     _dropped                present once the table is dropped
//!     txn_seq/_txnlog         sequencer commit log
//!     txn_seq/_meta           structure change log
//!     txn_seq/_status.json    suspension status
//!     wal<N>/<S>/events.wal   WAL segment S of writer N
//!     data/<partition>.<v>/   partition version v
//! ```

// =============================================================================
// Table Directory Layout
// =============================================================================

/// Separator between table name and table id in a table directory name.
pub const TABLE_DIR_SEPARATOR: char = '~';

/// File holding the current table name.
pub const TABLE_NAME_FILE: &str = "_name";

/// Marker file written when a table is dropped.
pub const TABLE_DROPPED_FILE: &str = "_dropped";

/// Table state file (applied watermark and partition versions).
pub const TABLE_STATE_FILE: &str = "_txn";

/// Directory holding the sequencer files of a table.
pub const SEQUENCER_DIR: &str = "txn_seq";

/// Sequencer commit log file.
pub const TXN_LOG_FILE: &str = "_txnlog";

/// Sequencer structure log file.
pub const STRUCTURE_LOG_FILE: &str = "_meta";

/// Sequencer suspension status file.
pub const STATUS_FILE: &str = "_status.json";

/// Prefix of a writer's WAL directory (`wal1`, `wal2`, ...).
pub const WAL_DIR_PREFIX: &str = "wal";

/// File holding the events of one WAL segment.
pub const WAL_EVENTS_FILE: &str = "events.wal";

/// Directory holding partition versions.
pub const DATA_DIR: &str = "data";

/// Suffix for files written before an atomic rename.
pub const TEMP_SUFFIX: &str = ".tmp";

// =============================================================================
// Magic Numbers and Format Versions
// =============================================================================

/// Magic number of the sequencer commit log ("MRDX").
pub const TXN_LOG_MAGIC: u32 = 0x4D52_4458;

/// Magic number of the sequencer structure log ("MRDM").
pub const STRUCTURE_LOG_MAGIC: u32 = 0x4D52_444D;

/// Magic number of a WAL segment ("MRDW").
pub const WAL_SEGMENT_MAGIC: u32 = 0x4D52_4457;

/// Magic number of the table state file ("MRDT").
pub const TABLE_STATE_MAGIC: u32 = 0x4D52_4454;

/// Current version of every binary format written by Meridian.
pub const FORMAT_VERSION: u32 = 1;

// =============================================================================
// Limits
// =============================================================================

/// Maximum number of columns in a table, including dropped ones.
pub const MAX_COLUMNS: usize = 2048;

/// Maximum length of a table or column name in bytes.
pub const MAX_NAME_LEN: usize = 127;

/// Maximum size of a single WAL event (64 MB).
pub const MAX_WAL_EVENT_SIZE: usize = 64 * 1024 * 1024;

/// Wal id used in commit records that carry no WAL data (structure changes, truncates).
pub const METADATA_WAL_ID: u32 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magics_are_distinct() {
        let magics = [
            TXN_LOG_MAGIC,
            STRUCTURE_LOG_MAGIC,
            WAL_SEGMENT_MAGIC,
            TABLE_STATE_MAGIC,
        ];
        for (i, a) in magics.iter().enumerate() {
            for b in &magics[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_event_size_fits_u32_length_prefix() {
        assert!(MAX_WAL_EVENT_SIZE < u32::MAX as usize);
    }
}
