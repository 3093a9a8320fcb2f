//! Result materialization.
//!
//! A [`ResultSet`] buffers the complete row/column matrix of one executed
//! query and never mutates it afterwards. Raw cells stay as the driver
//! delivered them; decoding happens per row during iteration, using the
//! declared type tags and the configured server timezone. A shared read
//! cursor (`tell`/`seek`/`rewind`) makes iteration restartable — any
//! number of independent passes over the same buffer.

use std::cell::Cell;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::driver::{RawResult, RawRow};
use crate::error::Result;
use crate::value::{decode, TypeTag, Value};

/// A buffered, immutable query result.
pub struct ResultSet {
    fields: Arc<Vec<String>>,
    types: Vec<TypeTag>,
    data: Vec<RawRow>,
    affected: u64,
    insert_id: Option<i64>,
    tzoffset: i32,
    cursor: Cell<usize>,
    released: Cell<bool>,
}

impl ResultSet {
    pub(crate) fn new(raw: RawResult, tzoffset: i32) -> Self {
        Self {
            fields: Arc::new(raw.fields),
            types: raw.types,
            data: raw.rows,
            affected: raw.affected,
            insert_id: raw.insert_id,
            tzoffset,
            cursor: Cell::new(0),
            released: Cell::new(false),
        }
    }

    /// Ordered field names.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Declared type tag per column.
    pub fn types(&self) -> &[TypeTag] {
        &self.types
    }

    /// Number of buffered rows.
    pub fn rows(&self) -> usize {
        self.data.len()
    }

    /// Number of columns.
    pub fn columns(&self) -> usize {
        self.fields.len()
    }

    /// Affected-row count reported by the driver.
    pub fn affected_rows(&self) -> u64 {
        self.affected
    }

    /// Identity value of the last inserted row. Defined only when the
    /// statement affected at least one row.
    pub fn insert_id(&self) -> Option<i64> {
        if self.affected > 0 {
            self.insert_id
        } else {
            None
        }
    }

    /// Raw cell access: bytes and length, or `None` for an absent cell.
    pub fn read(&self, row: usize, col: usize) -> Option<(&[u8], usize)> {
        self.data
            .get(row)?
            .get(col)?
            .as_ref()
            .map(|cell| (cell.as_ref(), cell.len()))
    }

    /// Current cursor position.
    pub fn tell(&self) -> usize {
        self.cursor.get()
    }

    /// Move the cursor to the given row (clamped to the row count).
    pub fn seek(&self, row: usize) {
        self.cursor.set(row.min(self.data.len()));
    }

    /// Reset the cursor to the first row.
    pub fn rewind(&self) {
        self.cursor.set(0);
    }

    /// Decode and return the row at the cursor, then advance. `None` once
    /// the cursor has passed the last row.
    pub fn next_row(&self) -> Option<Result<Row>> {
        let at = self.cursor.get();
        if at >= self.data.len() {
            return None;
        }
        self.cursor.set(at + 1);
        Some(self.decode_row(at))
    }

    /// Iterate decoded rows from the current cursor position.
    pub fn iter(&self) -> Rows<'_> {
        Rows { set: self }
    }

    /// Rewind, then yield every row to `body` in order.
    pub fn each<F: FnMut(Row)>(&self, mut body: F) -> Result<()> {
        self.rewind();
        while let Some(row) = self.next_row() {
            body(row?);
        }
        Ok(())
    }

    /// Rewind, then shape every row through `T`'s record constructor.
    pub fn iter_as<T: FromRow>(&self) -> impl Iterator<Item = Result<T>> + '_ {
        self.rewind();
        self.iter().map(|row| T::from_row(&row?))
    }

    /// Release the underlying driver resource. The first call releases,
    /// every later call is a no-op; returns whether this call released.
    pub fn finish(&self) -> bool {
        !self.released.replace(true)
    }

    fn decode_row(&self, at: usize) -> Result<Row> {
        let cells = &self.data[at];
        let mut values: SmallVec<[Value; 16]> = SmallVec::with_capacity(self.types.len());
        for (col, tag) in self.types.iter().enumerate() {
            let value = match cells.get(col).and_then(|cell| cell.as_ref()) {
                Some(raw) => decode(*tag, raw, self.tzoffset)?,
                None => Value::Null,
            };
            values.push(value);
        }
        Ok(Row {
            fields: Arc::clone(&self.fields),
            values,
        })
    }
}

impl std::fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("rows", &self.rows())
            .field("columns", &self.columns())
            .field("affected", &self.affected)
            .finish()
    }
}

/// Cursor-driven iterator over decoded rows.
pub struct Rows<'a> {
    set: &'a ResultSet,
}

impl Iterator for Rows<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.set.next_row()
    }
}

/// One decoded row: ordered field names (shared across the result) mapped
/// to typed values.
#[derive(Debug, Clone)]
pub struct Row {
    fields: Arc<Vec<String>>,
    values: SmallVec<[Value; 16]>,
}

impl Row {
    /// Look a value up by field name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let at = self.fields.iter().position(|f| f == name)?;
        self.values.get(at)
    }

    /// Look a value up by column index.
    pub fn get_index(&self, at: usize) -> Option<&Value> {
        self.values.get(at)
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Record constructor hook: shape a raw row mapping into a caller type
/// during iteration.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self>;
}
