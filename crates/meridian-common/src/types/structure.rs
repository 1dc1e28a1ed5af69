//! Versioned table structure.
//!
//! A [`TableStructure`] is an immutable snapshot: applying a
//! [`StructureChange`] produces a new snapshot with the next version.
//! Columns are addressed by a stable index that never changes for the life
//! of the table; dropping a column only marks its slot.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::ids::{is_valid_name, StructureVersion};
use super::timestamps::PartitionBy;
use super::values::{ensure_remaining, get_str, put_str, ColumnType, DecodeError};
use crate::constants::MAX_COLUMNS;
use crate::error::ErrorClass;

/// Error building or changing a table structure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructureError {
    /// Name is empty, too long or contains invalid characters.
    #[error("invalid column name: {0:?}")]
    InvalidName(String),

    /// A visible column (or the designated timestamp) already has this name.
    #[error("duplicate column: {0}")]
    DuplicateColumn(String),

    /// No visible column has this name.
    #[error("unknown column: {0}")]
    UnknownColumn(String),

    /// The change targets the designated timestamp column.
    #[error("designated timestamp column {0} cannot be changed")]
    TimestampColumn(String),

    /// Column limit reached.
    #[error("too many columns (max {MAX_COLUMNS})")]
    TooManyColumns,

    /// The column already has the requested type.
    #[error("column {name} already has type {column_type}")]
    SameType {
        /// Column name.
        name: String,
        /// Its current type.
        column_type: ColumnType,
    },

    /// Malformed persisted structure data.
    #[error("structure decode failed: {0}")]
    Decode(#[from] DecodeError),
}

impl StructureError {
    /// Classifies the error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Decode(_) => ErrorClass::Fatal,
            _ => ErrorClass::Rejected,
        }
    }
}

/// Result type for structure operations.
pub type StructureResult<T> = Result<T, StructureError>;

/// One column slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    /// Column name.
    pub name: String,
    /// Column type.
    pub column_type: ColumnType,
    /// Dropped columns keep their slot but are invisible.
    pub dropped: bool,
}

/// A schema-affecting operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructureChange {
    /// Adds a column at the next free index.
    AddColumn {
        /// Column name.
        name: String,
        /// Column type.
        column_type: ColumnType,
    },
    /// Hides a column.
    DropColumn {
        /// Column name.
        name: String,
    },
    /// Renames a column.
    RenameColumn {
        /// Current name.
        from: String,
        /// New name.
        to: String,
    },
    /// Changes a column's type; existing values are converted.
    ChangeColumnType {
        /// Column name.
        name: String,
        /// New type.
        column_type: ColumnType,
    },
}

const CHANGE_ADD: u8 = 1;
const CHANGE_DROP: u8 = 2;
const CHANGE_RENAME: u8 = 3;
const CHANGE_TYPE: u8 = 4;

impl StructureChange {
    /// Returns true if applying this change requires rewriting stored data.
    #[must_use]
    pub const fn rewrites_data(&self) -> bool {
        matches!(self, Self::ChangeColumnType { .. })
    }

    /// Writes the binary encoding of the change.
    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Self::AddColumn { name, column_type } => {
                buf.put_u8(CHANGE_ADD);
                put_str(buf, name);
                buf.put_u8(column_type.as_u8());
            }
            Self::DropColumn { name } => {
                buf.put_u8(CHANGE_DROP);
                put_str(buf, name);
            }
            Self::RenameColumn { from, to } => {
                buf.put_u8(CHANGE_RENAME);
                put_str(buf, from);
                put_str(buf, to);
            }
            Self::ChangeColumnType { name, column_type } => {
                buf.put_u8(CHANGE_TYPE);
                put_str(buf, name);
                buf.put_u8(column_type.as_u8());
            }
        }
    }

    /// Reads a change written by [`StructureChange::encode`].
    ///
    /// # Errors
    ///
    /// Fails on malformed input.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure_remaining(buf, 1)?;
        let change = match buf.get_u8() {
            CHANGE_ADD => {
                let name = get_str(buf)?;
                ensure_remaining(buf, 1)?;
                Self::AddColumn {
                    name,
                    column_type: ColumnType::from_u8(buf.get_u8())?,
                }
            }
            CHANGE_DROP => Self::DropColumn {
                name: get_str(buf)?,
            },
            CHANGE_RENAME => Self::RenameColumn {
                from: get_str(buf)?,
                to: get_str(buf)?,
            },
            CHANGE_TYPE => {
                let name = get_str(buf)?;
                ensure_remaining(buf, 1)?;
                Self::ChangeColumnType {
                    name,
                    column_type: ColumnType::from_u8(buf.get_u8())?,
                }
            }
            tag => {
                return Err(DecodeError::UnknownTag {
                    what: "structure change",
                    tag,
                })
            }
        };
        Ok(change)
    }
}

impl fmt::Display for StructureChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddColumn { name, column_type } => write!(f, "add column {name} {column_type}"),
            Self::DropColumn { name } => write!(f, "drop column {name}"),
            Self::RenameColumn { from, to } => write!(f, "rename column {from} to {to}"),
            Self::ChangeColumnType { name, column_type } => {
                write!(f, "alter column {name} type {column_type}")
            }
        }
    }
}

/// Immutable snapshot of a table's structure at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStructure {
    version: StructureVersion,
    timestamp_column: String,
    partition_by: PartitionBy,
    columns: Vec<ColumnMeta>,
}

impl TableStructure {
    /// Starts building the initial structure of a table.
    #[must_use]
    pub fn builder(timestamp_column: impl Into<String>, partition_by: PartitionBy) -> TableStructureBuilder {
        TableStructureBuilder {
            timestamp_column: timestamp_column.into(),
            partition_by,
            columns: Vec::new(),
        }
    }

    /// Structure version.
    #[must_use]
    pub fn version(&self) -> StructureVersion {
        self.version
    }

    /// Name of the designated timestamp column.
    #[must_use]
    pub fn timestamp_column(&self) -> &str {
        &self.timestamp_column
    }

    /// Partitioning of the table.
    #[must_use]
    pub fn partition_by(&self) -> PartitionBy {
        self.partition_by
    }

    /// All column slots, dropped ones included, in index order.
    #[must_use]
    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    /// Number of column slots, dropped ones included.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Column slot at `index`.
    #[must_use]
    pub fn column(&self, index: usize) -> Option<&ColumnMeta> {
        self.columns.get(index)
    }

    /// Iterates over visible columns with their indexes.
    pub fn visible_columns(&self) -> impl Iterator<Item = (usize, &ColumnMeta)> + '_ {
        self.columns.iter().enumerate().filter(|(_, c)| !c.dropped)
    }

    /// Index of the visible column called `name`.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.visible_columns()
            .find(|(_, c)| c.name == name)
            .map(|(index, _)| index)
    }

    /// Applies `change` and returns the structure at the next version.
    ///
    /// # Errors
    ///
    /// Returns a [`StructureError`] if the change is invalid for this
    /// structure. `self` is never modified.
    pub fn apply(&self, change: &StructureChange) -> StructureResult<Self> {
        let mut next = self.clone();
        match change {
            StructureChange::AddColumn { name, column_type } => {
                self.check_new_name(name)?;
                if self.columns.len() >= MAX_COLUMNS {
                    return Err(StructureError::TooManyColumns);
                }
                next.columns.push(ColumnMeta {
                    name: name.clone(),
                    column_type: *column_type,
                    dropped: false,
                });
            }
            StructureChange::DropColumn { name } => {
                let index = self.existing_index(name)?;
                next.columns[index].dropped = true;
            }
            StructureChange::RenameColumn { from, to } => {
                let index = self.existing_index(from)?;
                self.check_new_name(to)?;
                next.columns[index].name = to.clone();
            }
            StructureChange::ChangeColumnType { name, column_type } => {
                let index = self.existing_index(name)?;
                let current = self.columns[index].column_type;
                if current == *column_type {
                    return Err(StructureError::SameType {
                        name: name.clone(),
                        column_type: current,
                    });
                }
                next.columns[index].column_type = *column_type;
            }
        }
        next.version = self.version.next();
        Ok(next)
    }

    fn check_new_name(&self, name: &str) -> StructureResult<()> {
        if !is_valid_name(name) {
            return Err(StructureError::InvalidName(name.to_string()));
        }
        if name == self.timestamp_column || self.column_index(name).is_some() {
            return Err(StructureError::DuplicateColumn(name.to_string()));
        }
        Ok(())
    }

    fn existing_index(&self, name: &str) -> StructureResult<usize> {
        if name == self.timestamp_column {
            return Err(StructureError::TimestampColumn(name.to_string()));
        }
        self.column_index(name)
            .ok_or_else(|| StructureError::UnknownColumn(name.to_string()))
    }

    /// Writes the full structure (used for the create record).
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.version.get());
        put_str(buf, &self.timestamp_column);
        buf.put_u8(self.partition_by.as_u8());
        buf.put_u32(self.columns.len() as u32);
        for column in &self.columns {
            put_str(buf, &column.name);
            buf.put_u8(column.column_type.as_u8());
            buf.put_u8(u8::from(column.dropped));
        }
    }

    /// Reads a structure written by [`TableStructure::encode`].
    ///
    /// # Errors
    ///
    /// Fails on malformed input.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure_remaining(buf, 8)?;
        let version = StructureVersion::new(buf.get_u64());
        let timestamp_column = get_str(buf)?;
        ensure_remaining(buf, 5)?;
        let code = buf.get_u8();
        let partition_by = PartitionBy::from_u8(code).ok_or(DecodeError::UnknownTag {
            what: "partition by",
            tag: code,
        })?;
        let count = buf.get_u32() as usize;
        let mut columns = Vec::with_capacity(count.min(MAX_COLUMNS));
        for _ in 0..count {
            let name = get_str(buf)?;
            ensure_remaining(buf, 2)?;
            let column_type = ColumnType::from_u8(buf.get_u8())?;
            let dropped = buf.get_u8() != 0;
            columns.push(ColumnMeta {
                name,
                column_type,
                dropped,
            });
        }
        Ok(Self {
            version,
            timestamp_column,
            partition_by,
            columns,
        })
    }
}

/// Builder for the initial [`TableStructure`].
#[derive(Debug, Clone)]
pub struct TableStructureBuilder {
    timestamp_column: String,
    partition_by: PartitionBy,
    columns: Vec<(String, ColumnType)>,
}

impl TableStructureBuilder {
    /// Adds a column.
    #[must_use]
    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push((name.into(), column_type));
        self
    }

    /// Validates names and builds the structure at version 0.
    ///
    /// # Errors
    ///
    /// Fails on invalid or duplicate names or too many columns.
    pub fn build(self) -> StructureResult<TableStructure> {
        if !is_valid_name(&self.timestamp_column) {
            return Err(StructureError::InvalidName(self.timestamp_column));
        }
        let mut structure = TableStructure {
            version: StructureVersion::INITIAL,
            timestamp_column: self.timestamp_column,
            partition_by: self.partition_by,
            columns: Vec::with_capacity(self.columns.len()),
        };
        for (name, column_type) in self.columns {
            structure = structure.apply(&StructureChange::AddColumn { name, column_type })?;
        }
        structure.version = StructureVersion::INITIAL;
        Ok(structure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn trades() -> TableStructure {
        TableStructure::builder("ts", PartitionBy::Day)
            .column("sym", ColumnType::Symbol)
            .column("price", ColumnType::Double)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder() {
        let s = trades();
        assert_eq!(s.version(), StructureVersion::INITIAL);
        assert_eq!(s.column_index("price"), Some(1));
        assert_eq!(s.column_index("ts"), None);

        let err = TableStructure::builder("ts", PartitionBy::Day)
            .column("a", ColumnType::Int)
            .column("a", ColumnType::Long)
            .build()
            .unwrap_err();
        assert_eq!(err, StructureError::DuplicateColumn("a".into()));

        let err = TableStructure::builder("ts", PartitionBy::Day)
            .column("ts", ColumnType::Int)
            .build()
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Rejected);
    }

    #[test]
    fn test_apply_bumps_version() {
        let s0 = trades();
        let s1 = s0
            .apply(&StructureChange::AddColumn {
                name: "qty".into(),
                column_type: ColumnType::Long,
            })
            .unwrap();
        assert_eq!(s1.version(), StructureVersion::new(1));
        assert_eq!(s1.column_index("qty"), Some(2));
        assert_eq!(s0.column_count(), 2);
    }

    #[test]
    fn test_drop_keeps_index() {
        let s = trades()
            .apply(&StructureChange::DropColumn { name: "sym".into() })
            .unwrap()
            .apply(&StructureChange::AddColumn {
                name: "sym".into(),
                column_type: ColumnType::Varchar,
            })
            .unwrap();
        assert_eq!(s.column_count(), 3);
        assert!(s.column(0).unwrap().dropped);
        assert_eq!(s.column_index("sym"), Some(2));
        assert_eq!(s.visible_columns().count(), 2);
    }

    #[test]
    fn test_rename_and_type_change() {
        let s = trades()
            .apply(&StructureChange::RenameColumn {
                from: "price".into(),
                to: "px".into(),
            })
            .unwrap();
        assert_eq!(s.column_index("px"), Some(1));
        assert_eq!(s.column_index("price"), None);

        let err = s
            .apply(&StructureChange::ChangeColumnType {
                name: "px".into(),
                column_type: ColumnType::Double,
            })
            .unwrap_err();
        assert!(matches!(err, StructureError::SameType { .. }));

        let err = s
            .apply(&StructureChange::DropColumn { name: "ts".into() })
            .unwrap_err();
        assert_eq!(err, StructureError::TimestampColumn("ts".into()));

        let err = s
            .apply(&StructureChange::DropColumn { name: "nope".into() })
            .unwrap_err();
        assert_eq!(err, StructureError::UnknownColumn("nope".into()));
    }

    #[test]
    fn test_codec() {
        let s = trades()
            .apply(&StructureChange::DropColumn { name: "sym".into() })
            .unwrap();
        let mut buf = BytesMut::new();
        s.encode(&mut buf);
        assert_eq!(TableStructure::decode(&mut buf.freeze()).unwrap(), s);

        let changes = [
            StructureChange::AddColumn {
                name: "a".into(),
                column_type: ColumnType::Int,
            },
            StructureChange::RenameColumn {
                from: "a".into(),
                to: "b".into(),
            },
        ];
        let mut buf = BytesMut::new();
        for c in &changes {
            c.encode(&mut buf);
        }
        let mut read = buf.freeze();
        for c in &changes {
            assert_eq!(&StructureChange::decode(&mut read).unwrap(), c);
        }
    }
}
