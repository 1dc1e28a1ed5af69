//! Column-major row batches.
//!
//! A batch holds the designated timestamps of its rows plus one value vector
//! per column, indexed by the column's stable index in the table structure.
//! Dropped columns keep their slot and hold nulls.

use bytes::{Buf, BufMut};

use super::timestamps::Timestamp;
use super::values::{ensure_remaining, ColumnValue, DecodeError};

/// A set of rows stored column by column.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ColumnBatch {
    timestamps: Vec<Timestamp>,
    columns: Vec<Vec<ColumnValue>>,
}

impl ColumnBatch {
    /// Creates an empty batch with `column_count` columns.
    #[must_use]
    pub fn new(column_count: usize) -> Self {
        Self {
            timestamps: Vec::new(),
            columns: vec![Vec::new(); column_count],
        }
    }

    /// Builds a batch from column vectors.
    ///
    /// Returns `None` if a column's length differs from the timestamp count.
    #[must_use]
    pub fn from_columns(timestamps: Vec<Timestamp>, columns: Vec<Vec<ColumnValue>>) -> Option<Self> {
        if columns.iter().any(|c| c.len() != timestamps.len()) {
            return None;
        }
        Some(Self {
            timestamps,
            columns,
        })
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Returns true if the batch has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Number of columns, excluding the designated timestamp.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Designated timestamps, one per row.
    #[must_use]
    pub fn timestamps(&self) -> &[Timestamp] {
        &self.timestamps
    }

    /// Values of column `index`.
    #[must_use]
    pub fn column(&self, index: usize) -> Option<&[ColumnValue]> {
        self.columns.get(index).map(Vec::as_slice)
    }

    /// Mutable values of column `index`.
    pub fn column_mut(&mut self, index: usize) -> Option<&mut Vec<ColumnValue>> {
        self.columns.get_mut(index)
    }

    /// Appends a row. Missing trailing values are filled with nulls and
    /// extra values are ignored.
    pub fn push_row(&mut self, ts: Timestamp, values: impl IntoIterator<Item = ColumnValue>) {
        self.timestamps.push(ts);
        let mut values = values.into_iter();
        for column in &mut self.columns {
            column.push(values.next().unwrap_or_default());
        }
    }

    /// Returns row `index` as a timestamp and its values.
    #[must_use]
    pub fn row(&self, index: usize) -> Option<(Timestamp, Vec<ColumnValue>)> {
        let ts = *self.timestamps.get(index)?;
        let values = self.columns.iter().map(|c| c[index].clone()).collect();
        Some((ts, values))
    }

    /// Iterates over rows.
    pub fn rows(&self) -> impl Iterator<Item = (Timestamp, Vec<ColumnValue>)> + '_ {
        (0..self.len()).filter_map(move |i| self.row(i))
    }

    /// Smallest timestamp, if any.
    #[must_use]
    pub fn min_timestamp(&self) -> Option<Timestamp> {
        self.timestamps.iter().min().copied()
    }

    /// Largest timestamp, if any.
    #[must_use]
    pub fn max_timestamp(&self) -> Option<Timestamp> {
        self.timestamps.iter().max().copied()
    }

    /// Returns true if timestamps never decrease.
    #[must_use]
    pub fn is_time_ordered(&self) -> bool {
        self.timestamps.windows(2).all(|w| w[0] <= w[1])
    }

    /// Copies rows `lo..hi` into a new batch.
    #[must_use]
    pub fn slice(&self, lo: usize, hi: usize) -> Self {
        let hi = hi.min(self.len());
        let lo = lo.min(hi);
        Self {
            timestamps: self.timestamps[lo..hi].to_vec(),
            columns: self.columns.iter().map(|c| c[lo..hi].to_vec()).collect(),
        }
    }

    /// Copies the rows at `indexes`, in that order.
    #[must_use]
    pub fn take(&self, indexes: &[usize]) -> Self {
        Self {
            timestamps: indexes.iter().map(|&i| self.timestamps[i]).collect(),
            columns: self
                .columns
                .iter()
                .map(|c| indexes.iter().map(|&i| c[i].clone()).collect())
                .collect(),
        }
    }

    /// Adds null columns until the batch has `column_count` columns.
    pub fn pad_columns(&mut self, column_count: usize) {
        let rows = self.len();
        while self.columns.len() < column_count {
            self.columns.push(vec![ColumnValue::Null; rows]);
        }
    }

    /// Appends all rows of `other`. Both batches are padded to the wider
    /// column count first.
    pub fn extend(&mut self, other: &Self) {
        let width = self.column_count().max(other.column_count());
        self.pad_columns(width);
        self.timestamps.extend_from_slice(&other.timestamps);
        for (index, column) in self.columns.iter_mut().enumerate() {
            match other.columns.get(index) {
                Some(values) => column.extend_from_slice(values),
                None => column.extend(std::iter::repeat(ColumnValue::Null).take(other.len())),
            }
        }
    }

    /// Stable sort by timestamp: rows with equal timestamps keep their
    /// relative order.
    #[must_use]
    pub fn sorted_by_timestamp(&self) -> Self {
        if self.is_time_ordered() {
            return self.clone();
        }
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by_key(|&i| self.timestamps[i]);
        self.take(&order)
    }

    /// Writes the batch column by column.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.len() as u32);
        buf.put_u32(self.columns.len() as u32);
        for ts in &self.timestamps {
            buf.put_i64(ts.as_micros());
        }
        for column in &self.columns {
            for value in column {
                value.encode(buf);
            }
        }
    }

    /// Reads a batch written by [`ColumnBatch::encode`].
    ///
    /// # Errors
    ///
    /// Fails on truncated or malformed input.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure_remaining(buf, 8)?;
        let rows = buf.get_u32() as usize;
        let column_count = buf.get_u32() as usize;
        ensure_remaining(buf, rows.saturating_mul(8))?;
        let timestamps = (0..rows)
            .map(|_| Timestamp::from_micros(buf.get_i64()))
            .collect();
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let mut column = Vec::with_capacity(rows);
            for _ in 0..rows {
                column.push(ColumnValue::decode(buf)?);
            }
            columns.push(column);
        }
        Ok(Self {
            timestamps,
            columns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn ts(v: i64) -> Timestamp {
        Timestamp::from_micros(v)
    }

    fn sample() -> ColumnBatch {
        let mut batch = ColumnBatch::new(2);
        batch.push_row(ts(30), [ColumnValue::Int(3), ColumnValue::from("c")]);
        batch.push_row(ts(10), [ColumnValue::Int(1)]);
        batch.push_row(ts(30), [ColumnValue::Int(4), ColumnValue::from("d")]);
        batch.push_row(ts(20), [ColumnValue::Null, ColumnValue::from("b")]);
        batch
    }

    #[test]
    fn test_push_row_pads() {
        let batch = sample();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.row(1), Some((ts(10), vec![ColumnValue::Int(1), ColumnValue::Null])));
        assert_eq!(batch.min_timestamp(), Some(ts(10)));
        assert_eq!(batch.max_timestamp(), Some(ts(30)));
        assert!(!batch.is_time_ordered());
    }

    #[test]
    fn test_stable_sort() {
        let sorted = sample().sorted_by_timestamp();
        assert_eq!(sorted.timestamps(), &[ts(10), ts(20), ts(30), ts(30)]);
        assert_eq!(
            sorted.column(0).unwrap(),
            &[ColumnValue::Int(1), ColumnValue::Null, ColumnValue::Int(3), ColumnValue::Int(4)]
        );
    }

    #[test]
    fn test_extend_pads_columns() {
        let mut narrow = ColumnBatch::new(1);
        narrow.push_row(ts(1), [ColumnValue::Long(1)]);
        let mut wide = ColumnBatch::new(2);
        wide.push_row(ts(2), [ColumnValue::Long(2), ColumnValue::Bool(true)]);

        narrow.extend(&wide);
        assert_eq!(narrow.column_count(), 2);
        assert_eq!(narrow.column(1).unwrap(), &[ColumnValue::Null, ColumnValue::Bool(true)]);
    }

    #[test]
    fn test_codec() {
        let batch = sample();
        let mut buf = BytesMut::new();
        batch.encode(&mut buf);
        let decoded = ColumnBatch::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_slice() {
        let batch = sample();
        let part = batch.slice(1, 3);
        assert_eq!(part.timestamps(), &[ts(10), ts(30)]);
        assert!(batch.slice(3, 10).len() == 1);
        assert!(batch.slice(5, 2).is_empty());
    }
}
