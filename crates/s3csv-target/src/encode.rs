//! Delimited-text encoding of row batches

use csv::{QuoteStyle, Terminator, WriterBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;

use crate::transform::Row;

/// How the column list of an object is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderPolicy {
    /// Each part uses the key order of its first row. Keys first seen in
    /// later rows are dropped.
    #[default]
    FirstRow,
    /// The union of every key in the first part, in first-seen order, fixed
    /// for the rest of the object
    Union,
}

impl HeaderPolicy {
    pub fn columns(&self, rows: &[Row]) -> Vec<String> {
        match self {
            HeaderPolicy::FirstRow => rows
                .first()
                .map(|row| row.keys().cloned().collect())
                .unwrap_or_default(),
            HeaderPolicy::Union => {
                let mut columns: Vec<String> = Vec::new();
                for key in rows.iter().flat_map(|row| row.keys()) {
                    if !columns.contains(key) {
                        columns.push(key.clone());
                    }
                }
                columns
            },
        }
    }
}

/// Output of [`CsvEncoder::encode`]
#[derive(Debug, Clone, Default)]
pub struct EncodedBatch {
    pub bytes: Vec<u8>,
    /// Keys present in some row but not in the header, in first-seen order
    pub dropped_columns: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct CsvEncoder {
    delimiter: u8,
    quote: u8,
}

impl Default for CsvEncoder {
    fn default() -> Self {
        Self::new(b',', b'"')
    }
}

impl CsvEncoder {
    pub fn new(delimiter: u8, quote: u8) -> Self {
        Self { delimiter, quote }
    }

    /// Encode `rows` under `columns`, with minimal quoting and CRLF line ends
    pub fn encode(&self, columns: &[String], rows: &[Row], include_header: bool) -> Result<EncodedBatch, csv::Error> {
        let mut writer = WriterBuilder::new()
            .delimiter(self.delimiter)
            .quote(self.quote)
            .quote_style(QuoteStyle::Necessary)
            .terminator(Terminator::CRLF)
            .from_writer(Vec::new());

        if include_header {
            writer.write_record(columns)?;
        }

        let mut dropped_columns: Vec<String> = Vec::new();
        for row in rows {
            writer.write_record(columns.iter().map(|column| render_cell(row.get(column)).into_owned()))?;

            for key in row.keys() {
                if !columns.contains(key) && !dropped_columns.contains(key) {
                    dropped_columns.push(key.clone());
                }
            }
        }

        let bytes = writer.into_inner().map_err(|e| csv::Error::from(e.into_error()))?;
        Ok(EncodedBatch { bytes, dropped_columns })
    }
}

/// Absent and null cells are empty; strings are written as-is; booleans
/// and numbers keep their JSON spelling
fn render_cell(value: Option<&Value>) -> Cow<'_, str> {
    match value {
        None | Some(Value::Null) => Cow::Borrowed(""),
        Some(Value::String(s)) => Cow::Borrowed(s),
        Some(Value::Bool(b)) => Cow::Borrowed(if *b { "true" } else { "false" }),
        Some(other) => Cow::Owned(other.to_string()),
    }
}
