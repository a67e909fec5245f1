//! Raw row readers
//!
//! Both the sniffer (on a prefix) and the record transformer (on the whole
//! file) read rows through [`open_rows`]. Each call starts a fresh,
//! single-pass iterator from the beginning of the stored file.

use std::fs::File;
use std::io::BufReader;

use crate::error::{JobError, Result};
use crate::fetch::SourceFile;
use crate::sniff::SourceKind;

/// One row as text cells, or a description of why it could not be read
pub type RawRow = std::result::Result<Vec<String>, String>;

pub type RowIter = Box<dyn Iterator<Item = RawRow> + Send>;

pub fn open_rows(source: &SourceFile, kind: SourceKind) -> Result<RowIter> {
    let file = source
        .reopen()
        .map_err(|e| JobError::unsupported_format(format!("Cannot read stored file: {}", e)))?;

    match kind {
        SourceKind::Delimited { delimiter } => Ok(delimited_rows(file, delimiter)),
        SourceKind::Spreadsheet => spreadsheet_rows(file),
    }
}

/// True when every cell is empty
pub fn is_blank(row: &[String]) -> bool {
    row.iter().all(|cell| cell.is_empty())
}

fn delimited_rows(file: File, delimiter: u8) -> RowIter {
    let reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(BufReader::new(file));

    let mut first = true;
    let mut failed = false;

    Box::new(
        reader
            .into_byte_records()
            // An I/O error leaves the reader in an unknown position; stop there
            .take_while(move |record| {
                let keep = !failed;
                failed = record.is_err();
                keep
            })
            .map(move |record| {
                let record = record.map_err(|e| e.to_string())?;
                let mut cells: Vec<String> = record
                    .iter()
                    .map(|field| String::from_utf8_lossy(field).trim().to_string())
                    .collect();

                if first {
                    first = false;
                    if let Some(cell) = cells.first_mut() {
                        *cell = cell.trim_start_matches('\u{feff}').to_string();
                    }
                }

                Ok(cells)
            }),
    )
}

#[cfg(feature = "excel")]
fn spreadsheet_rows(mut file: File) -> Result<RowIter> {
    use calamine::{open_workbook_auto_from_rs, Reader};
    use std::io::{Cursor, Read};

    // Workbook formats need random access over the whole container
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|e| JobError::unsupported_format(format!("Cannot read stored file: {}", e)))?;

    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|e| JobError::unsupported_format(format!("Cannot open spreadsheet: {}", e)))?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| JobError::unsupported_format("Spreadsheet contains no sheets"))?
        .map_err(|e| JobError::unsupported_format(format!("Cannot read first sheet: {}", e)))?;

    let rows: Vec<RawRow> = range
        .rows()
        .map(|row| Ok(row.iter().map(cell_text).collect()))
        .collect();

    Ok(Box::new(rows.into_iter()))
}

#[cfg(not(feature = "excel"))]
fn spreadsheet_rows(_file: File) -> Result<RowIter> {
    Err(JobError::unsupported_format(
        "Spreadsheet resources are not supported by this build",
    ))
}

#[cfg(feature = "excel")]
fn cell_text(cell: &calamine::Data) -> String {
    use calamine::Data;
    use chrono::Timelike;

    match cell {
        Data::Int(i) => i.to_string(),
        Data::Float(f) => f.to_string(),
        Data::String(s) => s.trim().to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(ts) if ts.time().num_seconds_from_midnight() == 0 => {
                ts.date().format("%Y-%m-%d").to_string()
            },
            Some(ts) => ts.format("%Y-%m-%dT%H:%M:%S").to_string(),
            None => dt.as_f64().to_string(),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        // Formula errors such as #N/A load as nulls
        Data::Error(_) | Data::Empty => String::new(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::{Seek, Write};

    fn source(bytes: &[u8]) -> SourceFile {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(bytes).unwrap();
        file.rewind().unwrap();
        SourceFile::from_file(file, None, String::new()).unwrap()
    }

    #[test]
    fn test_delimited_rows_are_trimmed_and_ragged() {
        let source = source(b"\xEF\xBB\xBFname, age\nalice,30\nbob\n");
        let rows: Vec<RawRow> =
            open_rows(&source, SourceKind::Delimited { delimiter: b',' }).unwrap().collect();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].as_ref().unwrap(), &vec!["name".to_string(), "age".to_string()]);
        assert_eq!(rows[2].as_ref().unwrap(), &vec!["bob".to_string()]);
    }

    #[test]
    fn test_quoted_delimiters_stay_in_cell() {
        let source = source(b"a;b\n\"x;y\";2\n");
        let rows: Vec<RawRow> =
            open_rows(&source, SourceKind::Delimited { delimiter: b';' }).unwrap().collect();

        assert_eq!(rows[1].as_ref().unwrap(), &vec!["x;y".to_string(), "2".to_string()]);
    }

    #[test]
    fn test_invalid_utf8_is_decoded_lossily() {
        let source = source(b"city\nK\xF6ln\n");
        let rows: Vec<RawRow> =
            open_rows(&source, SourceKind::Delimited { delimiter: b',' }).unwrap().collect();

        assert_eq!(rows[1].as_ref().unwrap()[0], "K\u{FFFD}ln");
    }

    #[test]
    fn test_each_open_restarts_from_the_top() {
        let source = source(b"a\n1\n2\n");
        let kind = SourceKind::Delimited { delimiter: b',' };
        let first: Vec<RawRow> = open_rows(&source, kind).unwrap().take(2).collect();
        let second: Vec<RawRow> = open_rows(&source, kind).unwrap().collect();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 3);
    }

    #[test]
    fn test_is_blank() {
        assert!(is_blank(&["".to_string(), "".to_string()]));
        assert!(!is_blank(&["".to_string(), "x".to_string()]));
    }
}
