//! CSV output. Files are written next to their final path and renamed into
//! place, so a failed run never leaves a truncated file behind.

use crate::error::WriteError;
use crate::models::{COLUMNS, CsvRow, SchoolRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub rows: usize,
    pub size_bytes: u64,
}

/// `results/edsp_schools_20261017_143000.csv`
pub fn default_output_path(dir: &Path, now: DateTime<Utc>) -> PathBuf {
    dir.join(format!("edsp_schools_{}.csv", now.format("%Y%m%d_%H%M%S")))
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

pub struct CsvWriter;

impl CsvWriter {
    /// Header plus one row per record. Any failure aborts the write.
    pub fn write(path: &Path, records: &[SchoolRecord]) -> Result<WrittenFile, WriteError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| WriteError::io(parent, e))?;
            }
        }

        let staging = staging_path(path);
        if let Err(e) = Self::write_rows(&staging, records) {
            fs::remove_file(&staging).ok();
            return Err(e);
        }
        fs::rename(&staging, path).map_err(|e| WriteError::io(path, e))?;

        let size_bytes = fs::metadata(path).map_err(|e| WriteError::io(path, e))?.len();
        info!("Wrote {} rows to {:?} ({} bytes)", records.len(), path, size_bytes);

        Ok(WrittenFile {
            path: path.to_path_buf(),
            rows: records.len(),
            size_bytes,
        })
    }

    fn write_rows(path: &Path, records: &[SchoolRecord]) -> Result<(), WriteError> {
        let io_err = |e: csv::Error| WriteError::io(path, e);

        let file = fs::File::create(path).map_err(|e| WriteError::io(path, e))?;
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(&file);

        wtr.write_record(COLUMNS).map_err(io_err)?;
        for record in records {
            wtr.serialize(CsvRow::from(record)).map_err(io_err)?;
        }
        wtr.flush().map_err(|e| WriteError::io(path, e))?;
        drop(wtr);

        file.sync_all().map_err(|e| WriteError::io(path, e))
    }
}

/// Re-read a written file and return its data row count.
pub fn verify_output(path: &Path) -> Result<usize, WriteError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| WriteError::io(path, e))?;

    let headers = reader.headers().map_err(|e| WriteError::io(path, e))?;
    if headers.iter().ne(COLUMNS.iter().copied()) {
        return Err(WriteError::io(
            path,
            io::Error::new(io::ErrorKind::InvalidData, "unexpected CSV header"),
        ));
    }

    let mut rows = 0usize;
    for record in reader.records() {
        record.map_err(|e| WriteError::io(path, e))?;
        rows += 1;
    }
    debug!("{:?}: {} rows read back", path, rows);
    Ok(rows)
}

/// Write `summary` as pretty JSON beside the CSV (`x.csv` → `x.summary.json`).
pub fn write_summary<T: Serialize>(csv_path: &Path, summary: &T) -> Result<PathBuf, WriteError> {
    let path = csv_path.with_extension("summary.json");
    let json = serde_json::to_vec_pretty(summary).map_err(|e| WriteError::io(&path, e))?;
    fs::write(&path, json).map_err(|e| WriteError::io(&path, e))?;
    Ok(path)
}
