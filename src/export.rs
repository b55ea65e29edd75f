//! CSV export of persisted readings.
//!
//! An export covers every row present when it starts, in timestamp order, and deletes exactly
//! those rows once the file is durably on disk. Rows saved while the export runs stay in the
//! store for the next one.

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;

use crate::{
    db::{helpers::format_timestamp, Database, Reading, ReadingCursor},
    platform::Clock,
};

/// Bumped whenever `CSV_HEADER` changes; part of every export file name.
pub const CSV_SCHEMA_VERSION: u32 = 1;

pub const CSV_HEADER: [&str; 12] = [
    "timestamp", "source", "x", "y", "z", "uaX", "uaY", "uaZ", "pitch", "roll", "yaw", "battery",
];

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub path: PathBuf,
    pub rows: u64,
    pub deleted: u64,
}

pub fn export_file_name(at: DateTime<Utc>) -> String {
    format!(
        "sensor_data_v{CSV_SCHEMA_VERSION}_{}.csv",
        at.timestamp_millis()
    )
}

fn optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub fn csv_record(reading: &Reading) -> [String; 12] {
    let ua = reading.user_acceleration;
    let att = reading.attitude;
    [
        format_timestamp(&reading.timestamp),
        reading.source.code().to_string(),
        reading.axes.x.to_string(),
        reading.axes.y.to_string(),
        reading.axes.z.to_string(),
        optional(ua.map(|v| v.x)),
        optional(ua.map(|v| v.y)),
        optional(ua.map(|v| v.z)),
        optional(att.map(|v| v.pitch)),
        optional(att.map(|v| v.roll)),
        optional(att.map(|v| v.yaw)),
        reading.battery.to_string(),
    ]
}

#[derive(Clone)]
pub struct CsvExporter {
    db: Database,
    export_dir: PathBuf,
    page_size: usize,
    clock: Arc<dyn Clock>,
}

impl CsvExporter {
    pub fn new(db: Database, export_dir: PathBuf, page_size: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            export_dir,
            page_size: page_size.max(1),
            clock,
        }
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    /// Writes all stored readings to a new CSV file and removes them from the store.
    ///
    /// `Ok(None)` when there is nothing to export. File work runs on the blocking pool, so an
    /// export can overlap an active collection.
    pub async fn export_csv(&self) -> Result<Option<ExportSummary>> {
        let Some(up_to_seq) = self.db.max_reading_seq().await? else {
            info!("No data to export");
            return Ok(None);
        };

        tokio::fs::create_dir_all(&self.export_dir)
            .await
            .with_context(|| {
                format!("failed to create export directory {}", self.export_dir.display())
            })?;

        let final_path = blocking("export path", {
            let dir = self.export_dir.clone();
            let name = export_file_name(self.clock.now());
            move || Ok(unique_path(&dir, &name))
        })
        .await?;
        let partial_path = final_path.with_extension("csv.partial");

        let rows = match self.write_rows(&partial_path, up_to_seq).await {
            Ok(rows) => rows,
            Err(err) => {
                if let Err(cleanup) = tokio::fs::remove_file(&partial_path).await {
                    warn!(
                        "failed to remove partial export {}: {cleanup}",
                        partial_path.display()
                    );
                }
                return Err(err);
            }
        };

        tokio::fs::rename(&partial_path, &final_path)
            .await
            .with_context(|| {
                format!("failed to move export into place at {}", final_path.display())
            })?;
        if let Ok(dir) = tokio::fs::File::open(&self.export_dir).await {
            let _ = dir.sync_all().await;
        }

        let deleted = self.db.delete_readings_through(up_to_seq).await?;
        info!(
            "CSV file saved to: {} ({rows} rows, {deleted} removed from store)",
            final_path.display()
        );

        Ok(Some(ExportSummary {
            path: final_path,
            rows,
            deleted,
        }))
    }

    /// Pages are read from the store here and written on the blocking pool.
    async fn write_rows(&self, path: &Path, up_to_seq: i64) -> Result<u64> {
        let mut writer = blocking("CSV open", {
            let path = path.to_path_buf();
            move || {
                let file = File::create(&path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
                let mut writer = csv::Writer::from_writer(file);
                writer
                    .write_record(CSV_HEADER)
                    .context("failed to write CSV header")?;
                Ok(writer)
            }
        })
        .await?;

        let mut cursor: Option<ReadingCursor> = None;
        let mut rows = 0u64;
        loop {
            let page = self
                .db
                .fetch_readings_page(cursor.take(), up_to_seq, self.page_size)
                .await?;
            let Some(last) = page.last() else { break };
            cursor = Some(ReadingCursor::after(last));
            let full_page = page.len() >= self.page_size;
            rows += page.len() as u64;

            writer = blocking("CSV page write", move || {
                for stored in &page {
                    writer
                        .write_record(csv_record(&stored.reading))
                        .with_context(|| format!("failed to write reading {}", stored.reading.id))?;
                }
                Ok(writer)
            })
            .await?;
            if !full_page {
                break;
            }
        }

        blocking("CSV sync", {
            let path = path.to_path_buf();
            move || {
                writer.flush().context("failed to flush CSV writer")?;
                let file = writer
                    .into_inner()
                    .map_err(|err| anyhow!("failed to finish CSV file: {}", err.error()))?;
                file.sync_all()
                    .with_context(|| format!("failed to sync {}", path.display()))
            }
        })
        .await?;
        Ok(rows)
    }
}

async fn blocking<T, F>(what: &'static str, work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .with_context(|| format!("{what} worker join failed"))?
}

fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let mut path = dir.join(name);
    let stem = name.trim_end_matches(".csv");
    let mut counter = 1;
    while path.exists() || path.with_extension("csv.partial").exists() {
        path = dir.join(format!("{stem}_{counter}.csv"));
        counter += 1;
    }
    path
}
