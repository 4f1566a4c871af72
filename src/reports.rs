use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::records::{missing_observations, ObservationRecord};

pub const DEFAULT_QUEUE_HEADER: [&str; 4] = ["web_id", "plz", "strasse", "ort"];
pub const RESULT_COLUMNS: [&str; 6] = ["web_id", "address", "provider", "lat", "lon", "status"];
pub const NO_GEOCODE_REASON: &str = "NO_STREET_OR_NO_NUMBER";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRow {
    pub web_id: i64,
    fields: BTreeMap<String, String>,
}

impl QueueRow {
    pub fn get(&self, column: &str) -> &str {
        self.fields.get(column).map(String::as_str).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MissingQueue {
    pub header: Vec<String>,
    pub rows: Vec<QueueRow>,
    pub unreadable: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResultRow {
    #[serde(default)]
    pub web_id: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub lat: String,
    #[serde(default)]
    pub lon: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanedRow {
    pub web_id: i64,
    pub cleaned: String,
    pub plz: String,
    pub ort: String,
    pub address: String,
    pub flags: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoGeocodeRow {
    pub web_id: i64,
    pub reason: String,
}

// `Ok(None)` when the queue file does not exist.
pub fn read_missing_queue(path: &Path) -> AppResult<Option<MissingQueue>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

    let mut queue = MissingQueue {
        header,
        ..MissingQueue::default()
    };
    for (index, record) in reader.byte_records().enumerate() {
        let line = index + 2;
        let record = match record {
            Ok(record) => record,
            Err(err) if is_row_error(&err) => {
                warn!(target: "reports", path = %path.display(), line, %err, "skipping unreadable queue row");
                queue.unreadable += 1;
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        let values = match record
            .iter()
            .map(|field| std::str::from_utf8(field).map(str::to_string))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(values) => values,
            Err(err) => {
                warn!(target: "reports", path = %path.display(), line, %err, "skipping queue row with invalid UTF-8");
                queue.unreadable += 1;
                continue;
            }
        };
        let fields: BTreeMap<String, String> =
            queue.header.iter().cloned().zip(values).collect();
        let raw_id = fields.get("web_id").map(|v| v.trim()).unwrap_or_default();
        match raw_id.parse::<i64>() {
            Ok(web_id) => queue.rows.push(QueueRow { web_id, fields }),
            Err(_) => {
                warn!(target: "reports", path = %path.display(), line, "skipping queue row without numeric web_id");
                queue.unreadable += 1;
            }
        }
    }
    Ok(Some(queue))
}

pub fn queue_header(path: &Path) -> AppResult<Vec<String>> {
    if path.exists() {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if header.iter().any(|column| column == "web_id") {
            return Ok(header);
        }
        warn!(
            target: "reports",
            path = %path.display(),
            "queue header lacks web_id; using default columns"
        );
    }
    Ok(DEFAULT_QUEUE_HEADER.iter().map(|c| c.to_string()).collect())
}

pub fn write_missing_queue(
    path: &Path,
    header: &[String],
    records: &[ObservationRecord],
) -> AppResult<()> {
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(header)?;
    for record in records {
        writer.write_record(
            header
                .iter()
                .map(|column| record.field(column).unwrap_or_default()),
        )?;
    }
    writer.flush()?;
    Ok(())
}

pub fn export_missing(conn: &Connection, path: &Path) -> AppResult<usize> {
    let header = queue_header(path)?;
    let missing = missing_observations(conn)?;
    write_missing_queue(path, &header, &missing)?;
    info!(
        target: "reports",
        path = %path.display(),
        rows = missing.len(),
        "missing-address queue written"
    );
    Ok(missing.len())
}

#[derive(Debug, Clone, Default)]
pub struct ResultRows {
    pub rows: Vec<GeocodeResultRow>,
    pub unreadable: usize,
}

pub fn read_results(path: &Path) -> AppResult<ResultRows> {
    if !path.exists() {
        return Err(AppError::MissingInput(path.display().to_string()));
    }
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.byte_headers()?.clone();

    let mut results = ResultRows::default();
    for (index, record) in reader.byte_records().enumerate() {
        let line = index + 2;
        let parsed = record.and_then(|record| record.deserialize::<GeocodeResultRow>(Some(&headers)));
        match parsed {
            Ok(row) => results.rows.push(row),
            Err(err) if is_row_error(&err) => {
                warn!(target: "reports", path = %path.display(), line, %err, "skipping unreadable result row");
                results.unreadable += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(results)
}

// I/O failures end the read; anything else is confined to its row.
fn is_row_error(err: &csv::Error) -> bool {
    !matches!(err.kind(), csv::ErrorKind::Io(_))
}

// Flushed per row; an interrupted run keeps what was written.
pub struct ResultsWriter {
    writer: csv::Writer<fs::File>,
    written: usize,
}

impl ResultsWriter {
    pub fn create(path: &Path) -> AppResult<Self> {
        ensure_parent(path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)?;
        writer.write_record(RESULT_COLUMNS)?;
        writer.flush()?;
        Ok(Self { writer, written: 0 })
    }

    pub fn append(&mut self, row: &GeocodeResultRow) -> AppResult<()> {
        self.writer.serialize(row)?;
        self.writer.flush()?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

pub fn write_cleaned(path: &Path, rows: &[CleanedRow]) -> AppResult<()> {
    write_rows(path, rows)
}

pub fn write_no_geocode(path: &Path, rows: &[NoGeocodeRow]) -> AppResult<()> {
    if rows.is_empty() {
        // serde-driven headers are only emitted with the first row
        ensure_parent(path)?;
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["web_id", "reason"])?;
        writer.flush()?;
        return Ok(());
    }
    write_rows(path, rows)
}

fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> AppResult<()> {
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn ensure_parent(path: &Path) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}
