//! Delimited-text row scanning and field parsing.
//!
//! The scanner reads `buffer_size` bytes at a time and looks for an
//! unquoted line delimiter, doubling its window up to the wrapper's
//! maximum buffer resize when a row does not fit. Field splitting honors
//! the table's quote, escape, and array options.

use std::io::Read;

use chrono::NaiveDateTime;
use fstore_result::{Error, Result};
use fstore_types::{ColumnType, CsvParseOptions};

use crate::encoder::Datum;

/// One scanned row with its absolute byte range in the source stream.
#[derive(Debug)]
pub struct Row {
    pub bytes: Vec<u8>,
    /// Offset of the first byte of the row.
    pub start: u64,
    /// Offset one past the line delimiter; where the next row begins.
    pub end: u64,
    /// 1-based data row number (the header does not count).
    pub number: u64,
}

pub struct RowScanner<R: Read> {
    reader: R,
    opts: CsvParseOptions,
    max_buffer_resize: usize,
    /// Unconsumed bytes; `offset` is the stream position of `window[0]`.
    window: Vec<u8>,
    offset: u64,
    eof: bool,
    next_row_number: u64,
}

impl<R: Read> RowScanner<R> {
    pub fn new(reader: R, opts: &CsvParseOptions, max_buffer_resize: usize, start_offset: u64) -> Self {
        Self {
            reader,
            opts: opts.clone(),
            max_buffer_resize,
            window: Vec::with_capacity(opts.buffer_size.min(max_buffer_resize)),
            offset: start_offset,
            eof: false,
            next_row_number: 1,
        }
    }

    /// Consume the header row without assigning it a data row number.
    pub fn skip_header(&mut self) -> Result<()> {
        self.next_row()?;
        self.next_row_number = 1;
        Ok(())
    }

    pub fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(pos) = self.find_row_end() {
                let mut bytes: Vec<u8> = self.window.drain(..=pos).collect();
                let end = self.offset + bytes.len() as u64;
                let start = self.offset;
                self.offset = end;
                bytes.pop();
                if bytes.last() == Some(&b'\r') && self.opts.line_delimiter == b'\n' {
                    bytes.pop();
                }
                let number = self.next_row_number;
                self.next_row_number += 1;
                return Ok(Some(Row { bytes, start, end, number }));
            }
            if self.eof {
                if self.window.is_empty() {
                    return Ok(None);
                }
                // Final row without a trailing delimiter.
                let bytes: Vec<u8> = std::mem::take(&mut self.window);
                let start = self.offset;
                let end = start + bytes.len() as u64;
                self.offset = end;
                let number = self.next_row_number;
                self.next_row_number += 1;
                return Ok(Some(Row { bytes, start, end, number }));
            }
            self.fill()?;
        }
    }

    /// Position of the first unquoted line delimiter in the window.
    fn find_row_end(&self) -> Option<usize> {
        let mut in_quote = false;
        let mut i = 0;
        while i < self.window.len() {
            let b = self.window[i];
            if self.opts.quoted {
                if in_quote && b == self.opts.escape && self.window.get(i + 1) == Some(&self.opts.quote)
                {
                    i += 2;
                    continue;
                }
                if b == self.opts.quote {
                    in_quote = !in_quote;
                    i += 1;
                    continue;
                }
            }
            if b == self.opts.line_delimiter && !in_quote {
                return Some(i);
            }
            i += 1;
        }
        None
    }

    fn fill(&mut self) -> Result<()> {
        let cap = self.max_buffer_resize.saturating_sub(1);
        if self.window.len() >= cap {
            let preview_len = self.window.len().min(cap);
            return Err(Error::ParseBufferExhausted(format!(
                "Unable to find an end of line character after reading {cap} characters. \
                 Please ensure that the correct \"line_delimiter\" option is specified or update \
                 the \"buffer_size\" option appropriately. Row number: {}. \
                 First few characters in row: {}",
                self.next_row_number,
                String::from_utf8_lossy(&self.window[..preview_len])
            )));
        }
        let target = self
            .window
            .len()
            .max(self.opts.buffer_size / 2)
            .saturating_mul(2)
            .clamp(self.opts.buffer_size.min(cap), cap);
        let mut remaining = target - self.window.len();
        let mut chunk = [0u8; 8192];
        while remaining > 0 {
            let want = remaining.min(chunk.len());
            let n = self.reader.read(&mut chunk[..want])?;
            if n == 0 {
                self.eof = true;
                return Ok(());
            }
            self.window.extend_from_slice(&chunk[..n]);
            remaining -= n;
        }
        Ok(())
    }
}

/// One split field: its text with quotes stripped and escapes resolved,
/// and whether it was quoted (an unquoted empty field is NULL; a quoted
/// one is an empty string).
#[derive(Debug, PartialEq, Eq)]
pub struct Field {
    pub text: String,
    pub quoted: bool,
}

pub fn split_fields(row: &[u8], opts: &CsvParseOptions) -> Vec<Field> {
    let mut fields = Vec::new();
    let mut current = Vec::new();
    let mut quoted = false;
    let mut in_quote = false;
    // Unquoted array fields contain the field delimiter; track marker depth
    // so `a,{1,2,3}` splits into two fields.
    let mut array_depth = 0usize;
    let mut i = 0;
    while i < row.len() {
        let b = row[i];
        if opts.quoted {
            if in_quote && b == opts.escape && row.get(i + 1) == Some(&opts.quote) {
                current.push(opts.quote);
                i += 2;
                continue;
            }
            if b == opts.quote {
                in_quote = !in_quote;
                quoted = true;
                i += 1;
                continue;
            }
        }
        if !in_quote {
            if b == opts.array_marker.0 {
                array_depth += 1;
            } else if b == opts.array_marker.1 {
                array_depth = array_depth.saturating_sub(1);
            }
        }
        if b == opts.delimiter && !in_quote && array_depth == 0 {
            fields.push(Field {
                text: String::from_utf8_lossy(&current).into_owned(),
                quoted,
            });
            current.clear();
            quoted = false;
            i += 1;
            continue;
        }
        current.push(b);
        i += 1;
    }
    fields.push(Field {
        text: String::from_utf8_lossy(&current).into_owned(),
        quoted,
    });
    fields
}

fn is_null(field: &Field, opts: &CsvParseOptions) -> bool {
    (!field.quoted && field.text.is_empty()) || field.text == opts.nulls
}

/// Parse one field into a typed datum.
pub fn parse_datum(field: &Field, column_type: &ColumnType, opts: &CsvParseOptions) -> Result<Datum> {
    if is_null(field, opts) && !matches!(column_type, ColumnType::Text if field.quoted) {
        return Ok(Datum::Null);
    }
    match column_type {
        ColumnType::Text => Ok(Datum::Text(field.text.clone())),
        ColumnType::Array(elem) => parse_array(&field.text, elem, opts),
        scalar => parse_scalar(field.text.trim(), scalar, opts),
    }
}

fn parse_scalar(text: &str, column_type: &ColumnType, opts: &CsvParseOptions) -> Result<Datum> {
    if text == opts.nulls {
        return Ok(Datum::Null);
    }
    let invalid = || {
        Error::SourceInvalid(format!(
            "Invalid value \"{text}\" for column type {column_type}."
        ))
    };
    match column_type {
        ColumnType::Boolean => match text.to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Ok(Datum::Int(1)),
            "false" | "f" | "0" => Ok(Datum::Int(0)),
            _ => Err(invalid()),
        },
        ColumnType::SmallInt | ColumnType::Int | ColumnType::BigInt => {
            text.parse::<i64>().map(Datum::Int).map_err(|_| invalid())
        }
        ColumnType::Float | ColumnType::Double => {
            text.parse::<f64>().map(Datum::Float).map_err(|_| invalid())
        }
        ColumnType::Timestamp => {
            if let Ok(epoch) = text.parse::<i64>() {
                return Ok(Datum::Int(epoch));
            }
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
                .map(|dt| Datum::Int(dt.and_utc().timestamp()))
                .map_err(|_| invalid())
        }
        ColumnType::Text | ColumnType::Array(_) => Err(Error::Internal(format!(
            "{column_type} is not a scalar type"
        ))),
    }
}

fn parse_array(text: &str, elem: &ColumnType, opts: &CsvParseOptions) -> Result<Datum> {
    let trimmed = text.trim();
    let (open, close) = (opts.array_marker.0 as char, opts.array_marker.1 as char);
    let inner = trimmed
        .strip_prefix(open)
        .and_then(|rest| rest.strip_suffix(close))
        .ok_or_else(|| {
            Error::SourceInvalid(format!("Malformed array value \"{text}\"."))
        })?;
    if inner.trim().is_empty() {
        return Ok(Datum::Array(Vec::new()));
    }
    let mut values = Vec::new();
    for raw in inner.split(opts.array_delimiter as char) {
        let element = strip_element_quotes(raw.trim());
        if element.is_empty() || element == opts.nulls {
            values.push(Datum::Null);
        } else {
            values.push(parse_scalar(element, elem, opts)?);
        }
    }
    Ok(Datum::Array(values))
}

/// Array elements may carry single or double quotes around each value.
fn strip_element_quotes(element: &str) -> &str {
    for quote in ['\'', '"'] {
        if element.len() >= 2 && element.starts_with(quote) && element.ends_with(quote) {
            return &element[1..element.len() - 1];
        }
    }
    element
}
