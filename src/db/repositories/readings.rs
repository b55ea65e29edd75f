use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Row};
use uuid::Uuid;

use crate::db::{
    helpers::{format_timestamp, parse_channel, parse_datetime, to_i64, to_u64},
    models::{Attitude, Axes, Reading, StoredReading},
    Database,
};

/// Keyset position in `(timestamp, seq)` order; a page starts strictly after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadingCursor {
    timestamp: String,
    seq: i64,
}

impl ReadingCursor {
    pub fn after(stored: &StoredReading) -> Self {
        Self {
            timestamp: format_timestamp(&stored.reading.timestamp),
            seq: stored.seq,
        }
    }
}

const READING_COLUMNS: &str =
    "seq, id, session_id, timestamp, source, x, y, z, ua_x, ua_y, ua_z, pitch, roll, yaw, battery";

fn row_to_reading(row: &Row) -> Result<StoredReading> {
    let id: String = row.get("id")?;
    let timestamp: String = row.get("timestamp")?;
    let source: String = row.get("source")?;
    let ua: (Option<f64>, Option<f64>, Option<f64>) =
        (row.get("ua_x")?, row.get("ua_y")?, row.get("ua_z")?);
    let attitude: (Option<f64>, Option<f64>, Option<f64>) =
        (row.get("pitch")?, row.get("roll")?, row.get("yaw")?);

    let user_acceleration = match ua {
        (Some(x), Some(y), Some(z)) => Some(Axes::new(x, y, z)),
        _ => None,
    };
    let attitude = match attitude {
        (Some(pitch), Some(roll), Some(yaw)) => Some(Attitude { pitch, roll, yaw }),
        _ => None,
    };

    Ok(StoredReading {
        seq: row.get("seq")?,
        reading: Reading {
            id: Uuid::parse_str(&id).with_context(|| format!("invalid reading id {id}"))?,
            session_id: row.get("session_id")?,
            timestamp: parse_datetime(&timestamp, "timestamp")?,
            source: parse_channel(&source)?,
            axes: Axes::new(row.get("x")?, row.get("y")?, row.get("z")?),
            user_acceleration,
            attitude,
            battery: row.get("battery")?,
        },
    })
}

impl Database {
    /// Inserts `readings` in a single transaction; either all rows land or none do.
    pub async fn insert_readings(&self, readings: Vec<Reading>) -> Result<usize> {
        if readings.is_empty() {
            return Ok(0);
        }

        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .context("failed to open reading batch transaction")?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO readings (
                        id, session_id, timestamp, source, x, y, z,
                        ua_x, ua_y, ua_z, pitch, roll, yaw, battery
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                )?;

                for record in &readings {
                    stmt.execute(params![
                        record.id.to_string(),
                        record.session_id,
                        format_timestamp(&record.timestamp),
                        record.source.code(),
                        record.axes.x,
                        record.axes.y,
                        record.axes.z,
                        record.user_acceleration.map(|ua| ua.x),
                        record.user_acceleration.map(|ua| ua.y),
                        record.user_acceleration.map(|ua| ua.z),
                        record.attitude.map(|att| att.pitch),
                        record.attitude.map(|att| att.roll),
                        record.attitude.map(|att| att.yaw),
                        record.battery,
                    ])
                    .with_context(|| format!("failed to insert reading {}", record.id))?;
                }
            }
            tx.commit().context("failed to commit reading batch")?;
            Ok(readings.len())
        })
        .await
    }

    pub async fn count_readings(&self) -> Result<u64> {
        self.execute(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))?;
            to_u64(count, "reading count")
        })
        .await
    }

    /// Highest sequence number currently stored, `None` for an empty store.
    pub async fn max_reading_seq(&self) -> Result<Option<i64>> {
        self.execute(|conn| {
            let seq: Option<i64> =
                conn.query_row("SELECT MAX(seq) FROM readings", [], |row| row.get(0))?;
            Ok(seq)
        })
        .await
    }

    /// One page of readings with `seq <= up_to_seq`, ordered by timestamp then insertion.
    pub async fn fetch_readings_page(
        &self,
        after: Option<ReadingCursor>,
        up_to_seq: i64,
        limit: usize,
    ) -> Result<Vec<StoredReading>> {
        if limit == 0 {
            return Err(anyhow!("page size must be greater than zero"));
        }
        let (after_ts, after_seq) = match after {
            Some(cursor) => (cursor.timestamp, cursor.seq),
            None => (String::new(), 0),
        };
        let limit = to_i64(limit as u64)?;

        self.execute(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {READING_COLUMNS}
                 FROM readings
                 WHERE seq <= ?1
                   AND (timestamp > ?2 OR (timestamp = ?2 AND seq > ?3))
                 ORDER BY timestamp ASC, seq ASC
                 LIMIT ?4"
            ))?;

            let mut rows = stmt.query(params![up_to_seq, after_ts, after_seq, limit])?;
            let mut page = Vec::new();
            while let Some(row) = rows.next()? {
                page.push(row_to_reading(row)?);
            }
            Ok(page)
        })
        .await
    }

    /// Deletes every reading with `seq <= up_to_seq`.
    pub async fn delete_readings_through(&self, up_to_seq: i64) -> Result<u64> {
        self.execute(move |conn| {
            let deleted = conn
                .execute("DELETE FROM readings WHERE seq <= ?1", params![up_to_seq])
                .context("failed to delete exported readings")?;
            Ok(deleted as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Channel, Session};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 15, 8, 0, 0).unwrap()
    }

    fn reading(session_id: &str, offset_ms: i64, source: Channel) -> Reading {
        let motion = source == Channel::DeviceMotion;
        Reading {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            timestamp: base_time() + Duration::milliseconds(offset_ms),
            source,
            axes: Axes::new(0.1, -0.2, 0.98),
            user_acceleration: motion.then(|| Axes::new(0.01, 0.02, 0.03)),
            attitude: motion.then_some(Attitude {
                pitch: 0.4,
                roll: -0.1,
                yaw: 1.2,
            }),
            battery: 0.75,
        }
    }

    async fn open_with_session() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("motion.sqlite3")).unwrap();
        db.insert_session(&Session::start("s1".into(), base_time()))
            .await
            .unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn test_insert_and_read_back_device_motion() {
        let (_dir, db) = open_with_session().await;
        let original = reading("s1", 0, Channel::DeviceMotion);

        assert_eq!(db.insert_readings(vec![original.clone()]).await.unwrap(), 1);

        let max = db.max_reading_seq().await.unwrap().unwrap();
        let page = db.fetch_readings_page(None, max, 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].reading, original);
    }

    #[tokio::test]
    async fn test_vector_channels_have_no_motion_fields() {
        let (_dir, db) = open_with_session().await;
        db.insert_readings(vec![reading("s1", 0, Channel::Magnetometer)])
            .await
            .unwrap();

        let page = db.fetch_readings_page(None, i64::MAX, 10).await.unwrap();
        assert!(page[0].reading.user_acceleration.is_none());
        assert!(page[0].reading.attitude.is_none());
    }

    #[tokio::test]
    async fn test_pages_follow_timestamp_order() {
        let (_dir, db) = open_with_session().await;
        // inserted out of order, with a tie at 20ms
        let batch = vec![
            reading("s1", 40, Channel::Accelerometer),
            reading("s1", 0, Channel::Accelerometer),
            reading("s1", 20, Channel::Accelerometer),
            reading("s1", 20, Channel::Gyroscope),
            reading("s1", 60, Channel::Accelerometer),
        ];
        db.insert_readings(batch).await.unwrap();

        let mut cursor = None;
        let mut seen = Vec::new();
        loop {
            let page = db.fetch_readings_page(cursor.clone(), i64::MAX, 2).await.unwrap();
            let Some(last) = page.last() else { break };
            cursor = Some(ReadingCursor::after(last));
            seen.extend(page);
        }

        assert_eq!(seen.len(), 5);
        assert!(seen
            .windows(2)
            .all(|pair| pair[0].reading.timestamp <= pair[1].reading.timestamp));
        assert_eq!(seen[1].reading.source, Channel::Accelerometer);
        assert_eq!(seen[2].reading.source, Channel::Gyroscope);
    }

    #[tokio::test]
    async fn test_delete_through_keeps_newer_rows() {
        let (_dir, db) = open_with_session().await;
        db.insert_readings(vec![
            reading("s1", 0, Channel::Accelerometer),
            reading("s1", 20, Channel::Accelerometer),
        ])
        .await
        .unwrap();
        let snapshot = db.max_reading_seq().await.unwrap().unwrap();
        db.insert_readings(vec![reading("s1", 40, Channel::Accelerometer)])
            .await
            .unwrap();

        assert_eq!(db.delete_readings_through(snapshot).await.unwrap(), 2);
        assert_eq!(db.count_readings().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_batch_inserts_nothing() {
        let (_dir, db) = open_with_session().await;
        let duplicate = reading("s1", 0, Channel::Accelerometer);

        let result = db
            .insert_readings(vec![duplicate.clone(), duplicate])
            .await;
        assert!(result.is_err());
        assert_eq!(db.count_readings().await.unwrap(), 0);
    }
}
