//! Table structure detection
//!
//! Works out what kind of table a stored file holds and what its columns are:
//!
//! 1. Reject empty files and binary content
//! 2. Pick the source kind (spreadsheet by magic bytes, or binary content
//!    declared as a spreadsheet, otherwise delimited text) and the delimiter
//! 3. Decide whether the first row is a header
//! 4. Guess one type per column from a sample of data rows. A single sampled
//!    value that does not fit demotes the whole column to text.

use std::io::Read;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use tracing::{debug, info};

use crate::ckan::DatastoreField;
use crate::config::SniffConfig;
use crate::error::{JobError, Result};
use crate::fetch::SourceFile;
use crate::rows::{is_blank, open_rows, RawRow};

const DELIMITER_CANDIDATES: [u8; 4] = [b',', b'\t', b';', b'|'];
const DELIMITER_SAMPLE_RECORDS: usize = 50;
const OLE2_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const ZIP_MAGIC: [u8; 4] = [b'P', b'K', 0x03, 0x04];
/// Share of control characters above which a sample is treated as binary
const MAX_CONTROL_RATIO: f64 = 0.1;

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y"];
const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// How the rows of a file are encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Delimited { delimiter: u8 },
    Spreadsheet,
}

/// Column types, narrowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    Date,
    Timestamp,
    Text,
}

/// Types tried in order before falling back to text
const TYPE_CANDIDATES: [ColumnType; 5] = [
    ColumnType::Integer,
    ColumnType::Float,
    ColumnType::Boolean,
    ColumnType::Date,
    ColumnType::Timestamp,
];

impl ColumnType {
    /// Datastore (PostgreSQL) type name
    ///
    /// Integers are parsed as `i64`, so they need `bigint`; `int` is 32-bit.
    pub fn datastore_type(&self) -> &'static str {
        match self {
            ColumnType::Integer => "bigint",
            ColumnType::Float => "numeric",
            ColumnType::Boolean => "bool",
            ColumnType::Date => "date",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Text => "text",
        }
    }

    /// Convert a non-empty, trimmed cell to its JSON value, or `None` if it
    /// does not fit this type
    pub fn coerce(&self, raw: &str) -> Option<Value> {
        match self {
            ColumnType::Integer => parse_integer(raw).map(Value::from),
            ColumnType::Float => parse_float(raw).and_then(Number::from_f64).map(Value::Number),
            ColumnType::Boolean => parse_bool(raw).map(Value::Bool),
            ColumnType::Date => parse_date(raw).map(|d| Value::String(d.format("%Y-%m-%d").to_string())),
            ColumnType::Timestamp => parse_timestamp(raw)
                .map(|ts| Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
            ColumnType::Text => Some(Value::String(raw.to_string())),
        }
    }

    pub fn accepts(&self, raw: &str) -> bool {
        self.coerce(raw).is_some()
    }

    /// Narrowest type that accepts every value; text when there are none
    pub fn infer(values: &[&str]) -> ColumnType {
        if values.is_empty() {
            return ColumnType::Text;
        }

        TYPE_CANDIDATES
            .into_iter()
            .find(|candidate| values.iter().all(|v| candidate.accepts(v)))
            .unwrap_or(ColumnType::Text)
    }
}

/// "007" and "-01.5" are identifiers, not numbers
fn has_leading_zero(raw: &str) -> bool {
    let digits = raw.trim_start_matches(['+', '-']);
    let mut chars = digits.chars();
    matches!((chars.next(), chars.next()), (Some('0'), Some(c)) if c.is_ascii_digit())
}

fn parse_integer(raw: &str) -> Option<i64> {
    if has_leading_zero(raw) {
        return None;
    }
    raw.parse().ok()
}

fn parse_float(raw: &str) -> Option<f64> {
    // Keeps "inf", "NaN" and friends out
    let numeric = raw
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'));
    if !numeric || !raw.chars().any(|c| c.is_ascii_digit()) || has_leading_zero(raw) {
        return None;
    }
    raw.parse::<f64>().ok().filter(|f| f.is_finite())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.naive_utc());
    }

    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| parse_date(raw).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

/// Ordered column names and types of a table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn datastore_fields(&self) -> Vec<DatastoreField> {
        self.columns
            .iter()
            .map(|c| DatastoreField {
                id: c.name.clone(),
                field_type: c.column_type.datastore_type().to_string(),
            })
            .collect()
    }
}

/// Result of sniffing a file
#[derive(Debug, Clone, PartialEq)]
pub struct TableLayout {
    pub kind: SourceKind,
    /// The first non-blank row holds column names
    pub has_header: bool,
    pub schema: TableSchema,
    /// Data rows inspected for type inference
    pub sampled_rows: usize,
    pub sampled_malformed: usize,
}

/// Detect the structure of `source`
///
/// `format_hint` is the resource's declared format; the response content type
/// stored on `source` is used as a second hint.
pub fn sniff(source: &SourceFile, format_hint: Option<&str>, config: &SniffConfig) -> Result<TableLayout> {
    let sample = read_sample(source, config.sample_bytes)?;
    if sample.is_empty() {
        return Err(JobError::unsupported_format("Source file is empty"));
    }

    let kind = detect_kind(&sample, format_hint, source.content_type.as_deref())?;
    debug!(?kind, format_hint, "Detected source kind");

    let rows: Vec<RawRow> = open_rows(source, kind)?
        .filter(|row| !matches!(row, Ok(cells) if is_blank(cells)))
        .take(config.sample_rows + 1)
        .collect();

    let layout = infer_layout(kind, rows, config)?;
    info!(
        columns = layout.schema.len(),
        has_header = layout.has_header,
        sampled_rows = layout.sampled_rows,
        "Sniffed table structure"
    );
    Ok(layout)
}

fn read_sample(source: &SourceFile, limit: usize) -> Result<Vec<u8>> {
    let file = source
        .reopen()
        .map_err(|e| JobError::unsupported_format(format!("Cannot read stored file: {}", e)))?;

    let mut sample = Vec::with_capacity(limit.min(64 * 1024));
    file.take(limit as u64)
        .read_to_end(&mut sample)
        .map_err(|e| JobError::unsupported_format(format!("Cannot read stored file: {}", e)))?;
    Ok(sample)
}

/// Magic bytes decide first. Spreadsheet hints only count for binary content:
/// servers often label plain CSV as `application/vnd.ms-excel`.
fn detect_kind(sample: &[u8], format_hint: Option<&str>, content_type: Option<&str>) -> Result<SourceKind> {
    if sample.starts_with(&OLE2_MAGIC) || sample.starts_with(&ZIP_MAGIC) {
        return Ok(SourceKind::Spreadsheet);
    }

    if looks_binary(sample) {
        if is_spreadsheet_hint(format_hint) || is_spreadsheet_hint(content_type) {
            return Ok(SourceKind::Spreadsheet);
        }
        return Err(JobError::unsupported_format(
            "Source file looks like binary data, not a table",
        ));
    }

    let delimiter = if is_tsv_hint(format_hint) || is_tsv_hint(content_type) {
        b'\t'
    } else {
        guess_delimiter(sample)
    };

    Ok(SourceKind::Delimited { delimiter })
}

fn is_tsv_hint(hint: Option<&str>) -> bool {
    hint.map(|h| h.to_ascii_lowercase())
        .is_some_and(|h| h == "tsv" || h.contains("tab-separated"))
}

fn is_spreadsheet_hint(hint: Option<&str>) -> bool {
    hint.map(|h| h.to_ascii_lowercase()).is_some_and(|h| {
        matches!(h.as_str(), "xls" | "xlsx" | "ods")
            || h.contains("spreadsheetml")
            || h.contains("ms-excel")
            || h.contains("opendocument.spreadsheet")
    })
}

fn looks_binary(sample: &[u8]) -> bool {
    if sample.contains(&0) {
        return true;
    }
    let control = sample
        .iter()
        .filter(|&&b| b.is_ascii_control() && !matches!(b, b'\t' | b'\n' | b'\r' | 0x0c))
        .count();
    control as f64 / sample.len() as f64 > MAX_CONTROL_RATIO
}

/// The candidate giving the most consistent multi-column field counts
fn guess_delimiter(sample: &[u8]) -> u8 {
    // Drop a partial trailing line cut off by the sample limit
    let text = match sample.iter().rposition(|b| *b == b'\n') {
        Some(end) if end + 1 < sample.len() => &sample[..=end],
        _ => sample,
    };

    let mut best: Option<(f64, usize, u8)> = None;
    for delimiter in DELIMITER_CANDIDATES {
        let counts: Vec<usize> = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(text)
            .into_byte_records()
            .filter_map(|r| r.ok())
            .filter(|r| r.iter().any(|f| !f.is_empty()))
            .take(DELIMITER_SAMPLE_RECORDS)
            .map(|r| r.len())
            .collect();

        let Some((width, hits)) = modal_width(&counts) else {
            continue;
        };
        if width < 2 {
            continue;
        }

        let consistency = hits as f64 / counts.len() as f64;
        let better = match best {
            None => true,
            Some((score, best_width, _)) => {
                consistency > score || (consistency == score && width > best_width)
            },
        };
        if better {
            best = Some((consistency, width, delimiter));
        }
    }

    best.map(|(_, _, delimiter)| delimiter).unwrap_or(b',')
}

/// Most common value and how often it occurs; ties go to the wider width
fn modal_width(counts: &[usize]) -> Option<(usize, usize)> {
    let mut tally: Vec<(usize, usize)> = Vec::new();
    for &count in counts {
        match tally.iter_mut().find(|(width, _)| *width == count) {
            Some((_, hits)) => *hits += 1,
            None => tally.push((count, 1)),
        }
    }
    tally
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
}

fn infer_layout(kind: SourceKind, rows: Vec<RawRow>, config: &SniffConfig) -> Result<TableLayout> {
    let unreadable = rows.iter().filter(|r| r.is_err()).count();
    let readable: Vec<Vec<String>> = rows.into_iter().filter_map(|r| r.ok()).collect();

    let Some(first) = readable.first() else {
        return Err(if unreadable > 0 {
            JobError::unsupported_format("No readable rows found in source file")
        } else {
            JobError::unsupported_format("Source file contains no rows")
        });
    };

    let has_header = looks_like_header(first);
    let (names, data) = if has_header {
        (header_names(first), &readable[1..])
    } else {
        let widths: Vec<usize> = readable.iter().map(|r| r.len()).collect();
        let width = modal_width(&widths).map(|(w, _)| w).unwrap_or(first.len());
        info!(columns = width, "First row is not a header, using generated column names");
        ((1..=width).map(|i| format!("col{}", i)).collect(), &readable[..])
    };
    let data = &data[..data.len().min(config.sample_rows)];

    let width = names.len();
    let ragged = data.iter().filter(|r| r.len() != width).count();
    let sampled_malformed = unreadable + ragged;
    let sampled_rows = data.len() + unreadable;

    if sampled_rows > 0 {
        let ratio = sampled_malformed as f64 / sampled_rows as f64;
        if ratio > config.max_malformed_ratio {
            return Err(JobError::data_format(format!(
                "{} of {} sampled rows are malformed ({:.1}%), above the allowed {:.1}%",
                sampled_malformed,
                sampled_rows,
                ratio * 100.0,
                config.max_malformed_ratio * 100.0
            )));
        }
    }

    let columns = names
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let values: Vec<&str> = data
                .iter()
                .filter_map(|row| row.get(i))
                .map(|cell| cell.as_str())
                .filter(|cell| !cell.is_empty())
                .collect();
            let column_type = ColumnType::infer(&values);
            debug!(column = %name, ?column_type, sampled = values.len(), "Inferred column type");
            Column { name, column_type }
        })
        .collect();

    Ok(TableLayout {
        kind,
        has_header,
        schema: TableSchema { columns },
        sampled_rows,
        sampled_malformed,
    })
}

/// A row is a header unless it is empty or every non-empty cell parses as a
/// number, boolean or date
fn looks_like_header(row: &[String]) -> bool {
    let cells: Vec<&str> = row
        .iter()
        .map(|c| c.as_str())
        .filter(|c| !c.is_empty())
        .collect();

    !cells.is_empty() && cells.iter().any(|c| ColumnType::infer(&[*c]) == ColumnType::Text)
}

/// Header cells with blanks filled in and duplicates made unique
fn header_names(row: &[String]) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(row.len());
    for (i, cell) in row.iter().enumerate() {
        let base = if cell.is_empty() {
            format!("col{}", i + 1)
        } else {
            cell.clone()
        };

        let mut name = base.clone();
        let mut suffix = 2;
        while names.contains(&name) {
            name = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        names.push(name);
    }
    names
}
