//! Header-plus-rows CSV decoding for published spreadsheet feeds.
//!
//! Feeds arrive through proxies that sometimes answer with an HTML page (login wall,
//! "sheet not published", relay error page) and a 200 status. [`decode`] refuses those
//! payloads instead of turning markup into rows.

use sheetsync_core::Row;
use thiserror::Error;

pub const CRATE_NAME: &str = "sheetsync-csv";

const HTML_MARKERS: [&str; 3] = ["<!doctype", "<html", "<body"];

const NOT_TABULAR_HINT: &str = "the sheet may not be published to the web, \
a proxy may have blocked the request, or a login page was returned";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("received an HTML page instead of CSV data: {hint}")]
    NotTabularData { hint: String },
    #[error("unterminated quoted field starting on line {line}")]
    UnterminatedQuote { line: usize },
}

/// Decode CSV text into rows keyed by the header's column names.
///
/// Empty (or whitespace-only) input is the "no data yet" signal and decodes to no rows.
/// Short lines are padded with empty cells; cells beyond the header are dropped.
pub fn decode(raw: &str) -> Result<Vec<Row>, DecodeError> {
    let text = raw.strip_prefix('\u{feff}').unwrap_or(raw);
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    if looks_like_html(text) {
        return Err(DecodeError::NotTabularData {
            hint: NOT_TABULAR_HINT.to_string(),
        });
    }

    let mut records = split_records(text)?
        .into_iter()
        .filter(|record| !record.is_blank());

    let Some(header) = records.next() else {
        return Ok(Vec::new());
    };
    let columns = header_columns(header.fields);
    if columns.iter().all(|c| c.trim().is_empty()) {
        return Ok(Vec::new());
    }

    Ok(records
        .map(|record| {
            let mut cells = record.fields.into_iter();
            let mut row = Row::with_capacity(columns.len());
            for column in &columns {
                row.insert(column.clone(), cells.next().unwrap_or_default());
            }
            row
        })
        .collect())
}

/// True when the payload carries a doctype, an `<html>` tag or a `<body>` tag.
pub fn looks_like_html(raw: &str) -> bool {
    let lowered = raw.trim().to_ascii_lowercase();
    HTML_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Encode rows back into header-plus-rows CSV using `columns` as the header.
pub fn encode(columns: &[String], rows: &[Row]) -> String {
    let mut out = String::new();
    push_line(&mut out, columns.iter().map(String::as_str), columns.len());
    for row in rows {
        let cells = columns
            .iter()
            .map(|c| row.get(c).map(String::as_str).unwrap_or_default());
        push_line(&mut out, cells, columns.len());
    }
    out
}

fn push_line<'a>(out: &mut String, cells: impl Iterator<Item = &'a str>, width: usize) {
    for (i, cell) in cells.enumerate() {
        if i > 0 {
            out.push(',');
        }
        // A lone empty cell would otherwise read back as a blank line.
        let needs_quotes = cell.contains([',', '"', '\n', '\r']) || (width == 1 && cell.trim().is_empty());
        if needs_quotes {
            out.push('"');
            out.push_str(&cell.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(cell);
        }
    }
    out.push('\n');
}

#[derive(Debug)]
struct Record {
    fields: Vec<String>,
    quoted: bool,
}

impl Record {
    fn is_blank(&self) -> bool {
        !self.quoted && self.fields.len() == 1 && self.fields[0].trim().is_empty()
    }
}

fn split_records(text: &str) -> Result<Vec<Record>, DecodeError> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut quoted = false;
    let mut line = 1usize;
    let mut quote_line = 1usize;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.is_empty() => {
                in_quotes = true;
                quoted = true;
                quote_line = line;
            }
            ',' => fields.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\r' | '\n' => {
                fields.push(std::mem::take(&mut field));
                records.push(Record {
                    fields: std::mem::take(&mut fields),
                    quoted,
                });
                quoted = false;
                line += 1;
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(DecodeError::UnterminatedQuote { line: quote_line });
    }
    if quoted || !field.is_empty() || !fields.is_empty() {
        fields.push(field);
        records.push(Record { fields, quoted });
    }
    Ok(records)
}

/// Header names in order; repeated names get a `_1`, `_2`, ... suffix so no column is lost.
fn header_columns(names: Vec<String>) -> Vec<String> {
    let mut columns: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let mut candidate = name.clone();
        let mut n = 0;
        while columns.contains(&candidate) {
            n += 1;
            candidate = format!("{name}_{n}");
        }
        columns.push(candidate);
    }
    columns
}
