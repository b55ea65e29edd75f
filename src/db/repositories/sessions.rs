use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    helpers::{
        format_timestamp, parse_datetime, parse_optional_datetime, parse_status, to_i64, to_u64,
    },
    models::{Session, SessionStatus},
    Database,
};

fn row_to_session(row: &Row) -> Result<Session> {
    let started_at: String = row.get("started_at")?;
    let stopped_at: Option<String> = row.get("stopped_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let status: String = row.get("status")?;
    let sample_count: i64 = row.get("sample_count")?;

    Ok(Session {
        id: row.get("id")?,
        started_at: parse_datetime(&started_at, "started_at")?,
        stopped_at: parse_optional_datetime(stopped_at, "stopped_at")?,
        status: parse_status(&status)?,
        sample_count: to_u64(sample_count, "sample_count")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

impl Database {
    pub async fn insert_session(&self, session: &Session) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, started_at, stopped_at, status, sample_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.id,
                    format_timestamp(&record.started_at),
                    record.stopped_at.as_ref().map(format_timestamp),
                    record.status.as_str(),
                    to_i64(record.sample_count)?,
                    format_timestamp(&record.created_at),
                    format_timestamp(&record.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn finish_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        sample_count: u64,
        stopped_at: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sessions
                 SET status = ?1,
                     sample_count = ?2,
                     stopped_at = ?3,
                     updated_at = ?3
                 WHERE id = ?4",
                params![
                    status.as_str(),
                    to_i64(sample_count)?,
                    format_timestamp(&stopped_at),
                    session_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, started_at, stopped_at, status, sample_count, created_at, updated_at
                 FROM sessions
                 WHERE id = ?1",
            )?;

            let session = stmt
                .query_row(params![session_id], |row| Ok(row_to_session(row)))
                .optional()?
                .transpose()?;

            Ok(session)
        })
        .await
    }

    pub async fn list_recent_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let limit = to_i64(limit as u64)?;
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, started_at, stopped_at, status, sample_count, created_at, updated_at
                 FROM sessions
                 ORDER BY started_at DESC
                 LIMIT ?1",
            )?;

            let mut rows = stmt.query(params![limit])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
        .await
    }

    /// Marks every session still `Running` as `Interrupted` and returns their ids.
    ///
    /// Only meaningful at startup, before any collector has been started.
    pub async fn recover_incomplete_sessions(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let ids = {
                let mut stmt = tx.prepare("SELECT id FROM sessions WHERE status = 'Running'")?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                ids
            };

            for id in &ids {
                let sample_count: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM readings WHERE session_id = ?1",
                    params![id],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "UPDATE sessions
                     SET status = ?1,
                         sample_count = MAX(sample_count, ?2),
                         stopped_at = ?3,
                         updated_at = ?3
                     WHERE id = ?4",
                    params![
                        SessionStatus::Interrupted.as_str(),
                        sample_count,
                        format_timestamp(&now),
                        id,
                    ],
                )?;
            }

            tx.commit()?;
            Ok(ids)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    async fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("motion.sqlite3")).unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (_dir, db) = open().await;
        let started = Utc.with_ymd_and_hms(2025, 11, 10, 7, 0, 0).unwrap();
        db.insert_session(&Session::start("abc".into(), started))
            .await
            .unwrap();

        let running = db.get_session("abc").await.unwrap().unwrap();
        assert_eq!(running.status, SessionStatus::Running);
        assert!(running.stopped_at.is_none());

        let stopped = started + Duration::seconds(30);
        db.finish_session("abc", SessionStatus::Completed, 1500, stopped)
            .await
            .unwrap();

        let done = db.get_session("abc").await.unwrap().unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.sample_count, 1500);
        assert_eq!(done.stopped_at, Some(stopped));
    }

    #[tokio::test]
    async fn test_missing_session_is_none() {
        let (_dir, db) = open().await;
        assert!(db.get_session("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_marks_running_sessions_interrupted() {
        let (_dir, db) = open().await;
        let t0 = Utc.with_ymd_and_hms(2025, 11, 10, 7, 0, 0).unwrap();
        db.insert_session(&Session::start("crashed".into(), t0))
            .await
            .unwrap();
        db.insert_session(&Session::start("done".into(), t0 + Duration::minutes(1)))
            .await
            .unwrap();
        db.finish_session("done", SessionStatus::Completed, 3, t0 + Duration::minutes(2))
            .await
            .unwrap();

        let recovered = db
            .recover_incomplete_sessions(t0 + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(recovered, vec!["crashed".to_string()]);

        let sessions = db.list_recent_sessions(10).await.unwrap();
        assert_eq!(sessions.len(), 2);
        let crashed = sessions.iter().find(|s| s.id == "crashed").unwrap();
        assert_eq!(crashed.status, SessionStatus::Interrupted);
        assert!(db.recover_incomplete_sessions(t0).await.unwrap().is_empty());
    }
}
