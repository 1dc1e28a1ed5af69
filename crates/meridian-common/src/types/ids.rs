//! Core identifier types for Meridian.
//!
//! These types provide type-safe wrappers around numeric identifiers,
//! preventing accidental misuse of different ID types (a segment id passed
//! where a wal id is expected, a structure version compared with a txn).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{MAX_NAME_LEN, TABLE_DIR_SEPARATOR};

macro_rules! numeric_id {
    (
        $(#[$meta:meta])*
        $name:ident($repr:ty), label = $label:literal
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        #[repr(transparent)]
        pub struct $name($repr);

        impl $name {
            /// Creates a new id from its raw value.
            #[inline]
            #[must_use]
            pub const fn new(id: $repr) -> Self {
                Self(id)
            }

            /// Returns the raw value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> $repr {
                self.0
            }

            /// Returns the next id.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                Self(self.0.saturating_add(1))
            }

            /// Returns the previous id, saturating at zero.
            #[inline]
            #[must_use]
            pub const fn prev(self) -> Self {
                Self(self.0.saturating_sub(1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$repr> for $name {
            #[inline]
            fn from(id: $repr) -> Self {
                Self::new(id)
            }
        }

        impl From<$name> for $repr {
            #[inline]
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

numeric_id! {
    /// Transaction identifier, assigned by the table sequencer.
    ///
    /// Transaction ids are dense and monotonically increasing per table. Their
    /// order is the canonical commit order: the apply engine merges
    /// transactions into table storage strictly in this order.
    ///
    /// # Example
    ///
    /// ```rust
    /// use meridian_common::types::TxnId;
    ///
    /// let first = TxnId::NONE.next();
    /// assert_eq!(first, TxnId::FIRST);
    /// ```
    TxnId(u64), label = "TxnId"
}

impl TxnId {
    /// No transaction. The applied watermark of an empty table.
    pub const NONE: Self = Self(0);

    /// The first transaction a sequencer hands out.
    pub const FIRST: Self = Self(1);
}

numeric_id! {
    /// Structure (schema) version of a table.
    ///
    /// Bumped on every structure change. Rows in the WAL are valid only under
    /// the structure version they were written against.
    StructureVersion(u64), label = "StructureVersion"
}

impl StructureVersion {
    /// Version of a freshly created table.
    pub const INITIAL: Self = Self(0);
}

numeric_id! {
    /// Table identifier, unique within one engine root and never reused.
    TableId(u32), label = "TableId"
}

numeric_id! {
    /// Identifier of a writer's WAL directory (`wal<N>`).
    ///
    /// Every writer session owns exactly one wal id while it is open. Id 0 is
    /// reserved for commit records that carry no WAL data.
    WalId(u32), label = "WalId"
}

impl WalId {
    /// Wal id of commit records without WAL data (structure changes, truncates).
    pub const METADATA: Self = Self(crate::constants::METADATA_WAL_ID);

    /// First wal id handed to a writer.
    pub const FIRST: Self = Self(1);

    /// Returns true if this id refers to WAL data.
    #[inline]
    #[must_use]
    pub const fn is_data(self) -> bool {
        self.0 != crate::constants::METADATA_WAL_ID
    }
}

numeric_id! {
    /// Segment identifier within one writer's WAL directory.
    SegmentId(u32), label = "SegmentId"
}

/// Stable identity of a table.
///
/// The table id and the directory name never change for the life of the
/// table; the name changes on rename. Two tokens refer to the same table iff
/// their table ids are equal.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableToken {
    name: String,
    table_id: TableId,
    dir_name: String,
}

impl TableToken {
    /// Creates the token of a new table. The directory name is derived from
    /// the initial name and the id.
    #[must_use]
    pub fn new(name: impl Into<String>, table_id: TableId) -> Self {
        let name = name.into();
        let dir_name = format!("{name}{TABLE_DIR_SEPARATOR}{table_id}");
        Self {
            name,
            table_id,
            dir_name,
        }
    }

    /// Rebuilds a token from persisted parts.
    #[must_use]
    pub fn from_parts(name: impl Into<String>, table_id: TableId, dir_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_id,
            dir_name: dir_name.into(),
        }
    }

    /// Parses `<name>~<id>` directory names.
    #[must_use]
    pub fn parse_dir_name(dir_name: &str) -> Option<(String, TableId)> {
        let (name, id) = dir_name.rsplit_once(TABLE_DIR_SEPARATOR)?;
        let id = id.parse::<u32>().ok()?;
        if name.is_empty() {
            return None;
        }
        Some((name.to_string(), TableId::new(id)))
    }

    /// Returns the same table under a new name.
    #[must_use]
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_id: self.table_id,
            dir_name: self.dir_name.clone(),
        }
    }

    /// Current table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table id.
    #[must_use]
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Directory name under the engine root.
    #[must_use]
    pub fn dir_name(&self) -> &str {
        &self.dir_name
    }
}

impl fmt::Debug for TableToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableToken({}, id={})", self.name, self.table_id)
    }
}

impl fmt::Display for TableToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Checks that a table or column name can be stored and used as a path
/// component.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_id_ordering() {
        assert!(TxnId::FIRST > TxnId::NONE);
        assert_eq!(TxnId::new(5).next(), TxnId::new(6));
        assert_eq!(TxnId::NONE.prev(), TxnId::NONE);
        assert_eq!(format!("{:?}", TxnId::new(7)), "TxnId(7)");
        assert_eq!(u64::from(TxnId::new(9)), 9);
    }

    #[test]
    fn test_wal_id_metadata() {
        assert!(!WalId::METADATA.is_data());
        assert!(WalId::FIRST.is_data());
    }

    #[test]
    fn test_table_token_dir_name() {
        let token = TableToken::new("trades", TableId::new(3));
        assert_eq!(token.dir_name(), "trades~3");

        let (name, id) = TableToken::parse_dir_name(token.dir_name()).unwrap();
        assert_eq!(name, "trades");
        assert_eq!(id, TableId::new(3));

        assert!(TableToken::parse_dir_name("no_separator").is_none());
        assert!(TableToken::parse_dir_name("~4").is_none());
        assert!(TableToken::parse_dir_name("x~abc").is_none());
    }

    #[test]
    fn test_rename_keeps_identity() {
        let token = TableToken::new("trades", TableId::new(3));
        let renamed = token.renamed("fills");
        assert_eq!(renamed.name(), "fills");
        assert_eq!(renamed.table_id(), token.table_id());
        assert_eq!(renamed.dir_name(), token.dir_name());
    }

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("trades_2024"));
        assert!(is_valid_name("a-b"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name(".hidden"));
        assert!(!is_valid_name("a/b"));
        assert!(!is_valid_name(&"x".repeat(MAX_NAME_LEN + 1)));
    }
}
