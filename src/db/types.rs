//! Result set types.
//!
//! A `ResultSet` is a fully fetched query result, read back one row at a time
//! through the `RowSource` trait the encoder consumes.

use std::time::Duration;

/// A single cell: raw bytes, or `None` for SQL NULL.
pub type Cell = Option<Vec<u8>>;

/// A row of cells, one per column.
pub type Row = Vec<Cell>;

/// Metadata describing one column of a result set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Column name, if the driver reported one.
    pub name: Option<String>,

    /// Driver type name (e.g. `VARCHAR`, `INT4`).
    pub data_type: String,
}

impl FieldDescriptor {
    /// Creates a descriptor with the given name and type.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            data_type: data_type.into(),
        }
    }

    /// Creates a descriptor whose name is missing.
    pub fn unnamed(data_type: impl Into<String>) -> Self {
        Self {
            name: None,
            data_type: data_type.into(),
        }
    }
}

/// Anything that exposes column metadata and yields rows one at a time.
///
/// A row returned by `next_row` borrows the source and is only valid until the
/// next call.
pub trait RowSource {
    /// Number of columns in the result.
    fn num_fields(&self) -> usize;

    /// Descriptor for the column at `index`, or `None` if unavailable.
    fn field_at(&self, index: usize) -> Option<&FieldDescriptor>;

    /// Fetches the next row, or `None` once the rows are exhausted.
    fn next_row(&mut self) -> Option<&[Cell]>;
}

/// A buffered query result with a read cursor.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    fields: Vec<FieldDescriptor>,
    rows: Vec<Row>,
    cursor: usize,

    /// Time taken to execute the query.
    pub execution_time: Duration,

    /// Whether rows were dropped because of a row limit.
    pub was_truncated: bool,
}

impl ResultSet {
    /// Creates a result set with the given fields and rows, cursor at the start.
    pub fn new(fields: Vec<FieldDescriptor>, rows: Vec<Row>) -> Self {
        Self {
            fields,
            rows,
            ..Default::default()
        }
    }

    /// Sets the execution time.
    pub fn with_execution_time(mut self, duration: Duration) -> Self {
        self.execution_time = duration;
        self
    }

    /// Marks the result as truncated.
    pub fn truncated(mut self, was_truncated: bool) -> Self {
        self.was_truncated = was_truncated;
        self
    }

    /// Column descriptors.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Total number of rows held, regardless of cursor position.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the result holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Drops rows beyond `limit`, marking the result as truncated if any were dropped.
    pub fn truncate_rows(&mut self, limit: usize) {
        if self.rows.len() > limit {
            self.rows.truncate(limit);
            self.was_truncated = true;
        }
    }

    /// Moves the cursor back to the first row.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }
}

impl RowSource for ResultSet {
    fn num_fields(&self) -> usize {
        self.fields.len()
    }

    fn field_at(&self, index: usize) -> Option<&FieldDescriptor> {
        self.fields.get(index)
    }

    fn next_row(&mut self) -> Option<&[Cell]> {
        let row = self.rows.get(self.cursor)?;
        self.cursor += 1;
        Some(row.as_slice())
    }
}
