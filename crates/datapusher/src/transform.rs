//! Record transformer
//!
//! Turns the rows of a stored file into datastore records, one at a time.
//! Bad rows never stop the stream: they are repaired or skipped and counted,
//! and [`RecordStream::finish`] decides whether there were too many.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::SniffConfig;
use crate::error::{JobError, Result};
use crate::fetch::SourceFile;
use crate::rows::{is_blank, open_rows, RowIter};
use crate::sniff::{TableLayout, TableSchema};

/// One datastore row, keyed by column name
pub type Record = Map<String, Value>;

/// Per-row warnings logged before switching to a summary at the end
const MAX_ROW_WARNINGS: u64 = 5;

/// Row accounting for one pass over a file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformStats {
    /// Non-blank data rows seen, including ones that were skipped
    pub rows_read: u64,
    pub records_emitted: u64,
    pub rows_padded: u64,
    pub rows_truncated: u64,
    pub rows_skipped: u64,
}

impl TransformStats {
    pub fn malformed(&self) -> u64 {
        self.rows_padded + self.rows_truncated + self.rows_skipped
    }

    pub fn malformed_ratio(&self) -> f64 {
        if self.rows_read == 0 {
            0.0
        } else {
            self.malformed() as f64 / self.rows_read as f64
        }
    }
}

/// Lazy, single-pass record iterator over a stored file
pub struct RecordStream {
    rows: RowIter,
    schema: TableSchema,
    header_pending: bool,
    max_malformed_ratio: f64,
    stats: TransformStats,
    warnings: u64,
}

impl RecordStream {
    pub fn open(source: &SourceFile, layout: &TableLayout, config: &SniffConfig) -> Result<Self> {
        Ok(Self {
            rows: open_rows(source, layout.kind)?,
            schema: layout.schema.clone(),
            header_pending: layout.has_header,
            max_malformed_ratio: config.max_malformed_ratio,
            stats: TransformStats::default(),
            warnings: 0,
        })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn stats(&self) -> TransformStats {
        self.stats
    }

    /// Final stats, or `DataFormat` when too many rows were malformed
    ///
    /// Only meaningful once the iterator is exhausted.
    pub fn finish(self) -> Result<TransformStats> {
        let stats = self.stats;
        if self.warnings > MAX_ROW_WARNINGS {
            warn!(
                suppressed = self.warnings - MAX_ROW_WARNINGS,
                padded = stats.rows_padded,
                truncated = stats.rows_truncated,
                skipped = stats.rows_skipped,
                "Further malformed rows were not logged individually"
            );
        }

        let ratio = stats.malformed_ratio();
        if ratio > self.max_malformed_ratio {
            return Err(JobError::data_format(format!(
                "{} of {} rows are malformed ({:.1}%), above the allowed {:.1}%",
                stats.malformed(),
                stats.rows_read,
                ratio * 100.0,
                self.max_malformed_ratio * 100.0
            )));
        }

        debug!(
            rows_read = stats.rows_read,
            records = stats.records_emitted,
            malformed = stats.malformed(),
            "Transform finished"
        );
        Ok(stats)
    }

    fn note(&mut self, row: u64, problem: &str) {
        self.warnings += 1;
        if self.warnings <= MAX_ROW_WARNINGS {
            warn!(row, problem, "Malformed row");
        }
    }

    /// Coerce one row, failing when a cell does not fit its column type
    fn to_record(&self, cells: Vec<String>) -> std::result::Result<Record, String> {
        let mut record = Record::new();
        let mut cells = cells.into_iter();

        for column in &self.schema.columns {
            let value = match cells.next() {
                Some(cell) if !cell.is_empty() => column.column_type.coerce(&cell).ok_or_else(|| {
                    format!(
                        "value '{}' in column '{}' is not a valid {}",
                        cell,
                        column.name,
                        column.column_type.datastore_type()
                    )
                })?,
                _ => Value::Null,
            };
            record.insert(column.name.clone(), value);
        }

        Ok(record)
    }
}

impl Iterator for RecordStream {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        let width = self.schema.len();

        loop {
            let row = self.rows.next()?;

            let mut cells = match row {
                Ok(cells) if is_blank(&cells) => continue,
                Ok(cells) if self.header_pending => {
                    self.header_pending = false;
                    debug!(header = ?cells, "Skipping header row");
                    continue;
                },
                Ok(cells) => cells,
                Err(reason) => {
                    self.stats.rows_read += 1;
                    self.stats.rows_skipped += 1;
                    let row = self.stats.rows_read;
                    self.note(row, &format!("unreadable: {}", reason));
                    continue;
                },
            };

            self.stats.rows_read += 1;
            let row = self.stats.rows_read;

            if cells.len() < width {
                self.stats.rows_padded += 1;
                self.note(row, &format!("padded {} missing fields", width - cells.len()));
            } else if cells.len() > width {
                self.stats.rows_truncated += 1;
                self.note(row, &format!("truncated {} extra fields", cells.len() - width));
                cells.truncate(width);
            }

            match self.to_record(cells) {
                Ok(record) => {
                    self.stats.records_emitted += 1;
                    return Some(record);
                },
                Err(reason) => {
                    self.stats.rows_skipped += 1;
                    self.note(row, &reason);
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::sniff::sniff;
    use serde_json::json;
    use std::io::{Seek, Write};

    fn source(bytes: &[u8]) -> SourceFile {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(bytes).unwrap();
        file.rewind().unwrap();
        SourceFile::from_file(file, None, String::new()).unwrap()
    }

    fn stream(bytes: &[u8], config: &SniffConfig) -> RecordStream {
        let source = source(bytes);
        let layout = sniff(&source, None, config).unwrap();
        RecordStream::open(&source, &layout, config).unwrap()
    }

    #[test]
    fn test_records_follow_schema() {
        let mut records = stream(
            b"date,temperature,place\n2011-01-01,1,Galway\n\n2011-01-02,-1,\n",
            &SniffConfig::default(),
        );

        let all: Vec<Record> = records.by_ref().collect();
        assert_eq!(all.len(), 2);
        assert_eq!(
            Value::Object(all[0].clone()),
            json!({"date": "2011-01-01", "temperature": 1, "place": "Galway"})
        );
        assert_eq!(all[1]["place"], Value::Null);

        let names = records.schema().names();
        for record in &all {
            let keys: Vec<&str> = record.keys().map(|k| k.as_str()).collect();
            assert_eq!(keys.len(), names.len());
            assert!(names.iter().all(|n| keys.contains(n)));
        }

        let stats = records.finish().unwrap();
        assert_eq!(stats.rows_read, 2);
        assert_eq!(stats.records_emitted, 2);
        assert_eq!(stats.malformed(), 0);
    }

    #[test]
    fn test_short_and_long_rows_are_repaired() {
        let config = SniffConfig {
            max_malformed_ratio: 0.5,
            ..Default::default()
        };
        let mut records = stream(b"a,b,c\n1,2,3\n4,5\n6,7,8,9\n10,11,12\n", &config);

        let all: Vec<Record> = records.by_ref().collect();
        assert_eq!(all.len(), 4);
        assert_eq!(all[1]["c"], Value::Null);
        assert_eq!(all[2]["c"], json!(8));

        let stats = records.finish().unwrap();
        assert_eq!(stats.rows_padded, 1);
        assert_eq!(stats.rows_truncated, 1);
    }

    #[test]
    fn test_rows_failing_coercion_after_sample_are_skipped() {
        let config = SniffConfig {
            sample_rows: 2,
            max_malformed_ratio: 0.5,
            ..Default::default()
        };
        let mut records = stream(b"id\n1\n2\n3\nfour\n5\n", &config);

        let ids: Vec<Value> = records.by_ref().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3), json!(5)]);

        let stats = records.finish().unwrap();
        assert_eq!(stats.rows_skipped, 1);
        assert_eq!(stats.rows_read, 5);
    }

    #[test]
    fn test_finish_fails_above_malformed_ratio() {
        let config = SniffConfig {
            sample_rows: 1,
            max_malformed_ratio: 0.2,
            ..Default::default()
        };
        let mut records = stream(b"id\n1\nx\ny\nz\n", &config);
        assert_eq!(records.by_ref().count(), 1);

        let err = records.finish().unwrap_err();
        assert_eq!(err.error_type(), "Data Format Error");
    }

    #[test]
    fn test_header_only_yields_nothing() {
        let mut records = stream(b"a,b\n", &SniffConfig::default());
        assert!(records.next().is_none());
        assert_eq!(records.finish().unwrap().rows_read, 0);
    }
}
