//! Result-set to JSON encoding.
//!
//! Produces an array of objects, one per row, keyed by column name:
//!
//! ```text
//! [{"id": "1", "title": "Home"}, {"id": "2", "title": null}]
//! ```
//!
//! Every non-null cell is emitted as a JSON string; no type inference is done.

use std::borrow::Cow;
use std::fmt;

use crate::db::{Cell, RowSource};
use crate::error::EncodeError;

/// Separator between fields of an object and between objects.
const ITEM_SEPARATOR: &str = ", ";

/// Separator between a key and its value.
const KEY_SEPARATOR: &str = ": ";

const NULL: &str = "null";

/// Per-field punctuation overhead used when reserving space for a row: the
/// key separator, two value quotes and the item separator. Keys are stored
/// already quoted.
const FIELD_OVERHEAD: usize = KEY_SEPARATOR.len() + 2 + ITEM_SEPARATOR.len();

/// A finished JSON document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonDocument {
    text: String,
    rows: usize,
}

impl JsonDocument {
    /// The JSON text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Number of row objects in the document.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Length of the JSON text in bytes.
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Returns true if the text is empty. Never the case for a finished document.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Consumes the document, returning its text.
    pub fn into_string(self) -> String {
        self.text
    }
}

impl fmt::Display for JsonDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Reads the column names of `source`, in order.
///
/// Fails if any descriptor or name is missing; a partial catalog is never
/// returned. Does not touch the row cursor.
pub fn extract_column_names<S>(source: &S) -> Result<Vec<String>, EncodeError>
where
    S: RowSource + ?Sized,
{
    (0..source.num_fields())
        .map(|index| {
            source
                .field_at(index)
                .and_then(|field| field.name.clone())
                .ok_or(EncodeError::MissingFieldMetadata { index })
        })
        .collect()
}

/// Encodes every remaining row of `source` into a fresh document.
pub fn encode<S>(source: &mut S) -> Result<JsonDocument, EncodeError>
where
    S: RowSource + ?Sized,
{
    let mut text = String::new();
    let rows = encode_into(source, &mut text)?;
    Ok(JsonDocument { text, rows })
}

/// Appends the JSON encoding of every remaining row of `source` to `out`.
///
/// Returns the number of rows written. On error `out` is left exactly as it
/// was before the call.
pub fn encode_into<S>(source: &mut S, out: &mut String) -> Result<usize, EncodeError>
where
    S: RowSource + ?Sized,
{
    let columns = extract_column_names(source)?;
    let start = out.len();

    let result = write_array(source, &columns, out);
    if result.is_err() {
        out.truncate(start);
    }
    result
}

fn write_array<S>(source: &mut S, columns: &[String], out: &mut String) -> Result<usize, EncodeError>
where
    S: RowSource + ?Sized,
{
    let keys = columns
        .iter()
        .map(|name| serde_json::to_string(name))
        .collect::<Result<Vec<_>, _>>()?;
    let keys_len: usize = keys.iter().map(String::len).sum();

    out.try_reserve(2)?;
    out.push('[');

    let mut rows = 0;
    while let Some(row) = source.next_row() {
        if row.len() != keys.len() {
            return Err(EncodeError::RowShapeMismatch {
                row: rows,
                expected: keys.len(),
                actual: row.len(),
            });
        }

        let cells_len: usize = row.iter().flatten().map(Vec::len).sum();
        out.try_reserve(keys_len + cells_len + keys.len() * FIELD_OVERHEAD + 4)?;

        if rows > 0 {
            out.push_str(ITEM_SEPARATOR);
        }
        write_object(&keys, row, out)?;
        rows += 1;
    }

    out.push(']');
    Ok(rows)
}

fn write_object(keys: &[String], row: &[Cell], out: &mut String) -> Result<(), EncodeError> {
    out.push('{');
    for (i, (key, cell)) in keys.iter().zip(row).enumerate() {
        if i > 0 {
            out.push_str(ITEM_SEPARATOR);
        }
        out.push_str(key);
        out.push_str(KEY_SEPARATOR);
        match cell {
            None => out.push_str(NULL),
            Some(bytes) => {
                let escaped = serde_json::to_string(&cell_text(bytes))?;
                out.try_reserve(escaped.len())?;
                out.push_str(&escaped);
            }
        }
    }
    out.push('}');
    Ok(())
}

/// Cell bytes as text. Invalid UTF-8 sequences become U+FFFD.
fn cell_text(bytes: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}
