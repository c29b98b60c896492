//! SQLite-backed job store implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;

use super::stage::Resolution;
use super::{
    Artifact, ArtifactKind, CreateJobRequest, FanoutTally, Job, JobFilter, JobKind, JobStatus,
    JobStore, JobStoreError, NewArtifact, NewVideo, StatusTransition, VariantOutcome, Video,
};

const JOB_COLUMNS: &str = "id, kind, input, video_id, stages, status, current_step, step_count, \
     cancel_requested, error_detail, fanout_expected, fanout_succeeded, fanout_failed, \
     fanout_skipped, created_at, updated_at";

const VIDEO_COLUMNS: &str = "id, storage_ref, duration_secs, size_bytes, width, height, created_at";

const ARTIFACT_COLUMNS: &str =
    "id, job_id, kind, step_index, resolution, storage_ref, checksum, size_bytes, created_at";

fn db_err(e: rusqlite::Error) -> JobStoreError {
    JobStoreError::Database(e.to_string())
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(JobStoreError::Database(msg)))
}

fn json_column<T: DeserializeOwned>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn status_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<JobStatus> {
    let raw: String = row.get(idx)?;
    JobStatus::parse(&raw).ok_or_else(|| conversion_err(idx, format!("unknown status: {}", raw)))
}

/// SQLite-backed job store.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Create a new SQLite job store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, JobStoreError> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite job store (useful for testing).
    pub fn in_memory() -> Result<Self, JobStoreError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), JobStoreError> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS videos (
                id TEXT PRIMARY KEY,
                storage_ref TEXT NOT NULL,
                duration_secs REAL NOT NULL,
                size_bytes INTEGER NOT NULL,
                width INTEGER,
                height INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                input TEXT NOT NULL,
                video_id TEXT NOT NULL REFERENCES videos(id),
                stages TEXT NOT NULL,
                status TEXT NOT NULL,
                current_step INTEGER NOT NULL DEFAULT 0,
                step_count INTEGER NOT NULL,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                error_detail TEXT,
                fanout_expected INTEGER,
                fanout_succeeded INTEGER NOT NULL DEFAULT 0,
                fanout_failed INTEGER NOT NULL DEFAULT 0,
                fanout_skipped INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS job_transitions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL REFERENCES jobs(id),
                from_status TEXT,
                to_status TEXT NOT NULL,
                detail TEXT,
                at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS artifacts (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id),
                kind TEXT NOT NULL,
                step_index INTEGER NOT NULL,
                resolution TEXT,
                storage_ref TEXT NOT NULL,
                checksum TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_video_id ON jobs(video_id);
            CREATE INDEX IF NOT EXISTS idx_transitions_job_id ON job_transitions(job_id);
            CREATE INDEX IF NOT EXISTS idx_artifacts_job_id ON artifacts(job_id);
            "#,
        )
        .map_err(db_err)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, JobStoreError> {
        self.conn
            .lock()
            .map_err(|_| JobStoreError::Database("connection lock poisoned".to_string()))
    }

    fn build_where_clause(filter: &JobFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push("status = ?");
            params.push(Box::new(status.as_str()));
        }

        if let Some(ref video_id) = filter.video_id {
            conditions.push("video_id = ?");
            params.push(Box::new(video_id.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn row_to_video(row: &rusqlite::Row) -> rusqlite::Result<Video> {
        let created_at: String = row.get(6)?;
        Ok(Video {
            id: row.get(0)?,
            storage_ref: row.get(1)?,
            duration_secs: row.get(2)?,
            size_bytes: row.get::<_, i64>(3)? as u64,
            width: row.get(4)?,
            height: row.get(5)?,
            created_at: parse_timestamp(&created_at),
        })
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let kind_str: String = row.get(1)?;
        let kind = JobKind::parse(&kind_str)
            .ok_or_else(|| conversion_err(1, format!("unknown job kind: {}", kind_str)))?;
        let fanout_expected: Option<u32> = row.get(10)?;
        let fanout = fanout_expected
            .map(|expected| -> rusqlite::Result<FanoutTally> {
                Ok(FanoutTally {
                    expected,
                    succeeded: row.get(11)?,
                    failed: row.get(12)?,
                    skipped: row.get(13)?,
                })
            })
            .transpose()?;
        let created_at: String = row.get(14)?;
        let updated_at: String = row.get(15)?;

        Ok(Job {
            id: row.get(0)?,
            kind,
            input: json_column(row, 2)?,
            video_id: row.get(3)?,
            stages: json_column(row, 4)?,
            status: status_column(row, 5)?,
            current_step: row.get::<_, i64>(6)? as usize,
            step_count: row.get::<_, i64>(7)? as usize,
            cancel_requested: row.get(8)?,
            error_detail: row.get(9)?,
            fanout,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        })
    }

    fn row_to_artifact(row: &rusqlite::Row) -> rusqlite::Result<Artifact> {
        let kind_str: String = row.get(2)?;
        let kind = ArtifactKind::parse(&kind_str)
            .ok_or_else(|| conversion_err(2, format!("unknown artifact kind: {}", kind_str)))?;
        let resolution = row
            .get::<_, Option<String>>(4)?
            .map(|r| {
                Resolution::parse(&r)
                    .ok_or_else(|| conversion_err(4, format!("unknown resolution: {}", r)))
            })
            .transpose()?;
        let created_at: String = row.get(8)?;

        Ok(Artifact {
            id: row.get(0)?,
            job_id: row.get(1)?,
            kind,
            step_index: row.get::<_, i64>(3)? as usize,
            resolution,
            storage_ref: row.get(5)?,
            checksum: row.get(6)?,
            size_bytes: row.get::<_, i64>(7)? as u64,
            created_at: parse_timestamp(&created_at),
        })
    }

    fn fetch_job(conn: &Connection, id: &str) -> Result<Option<Job>, JobStoreError> {
        conn.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS),
            params![id],
            Self::row_to_job,
        )
        .optional()
        .map_err(db_err)
    }

    fn job_exists(conn: &Connection, id: &str) -> Result<bool, JobStoreError> {
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM jobs WHERE id = ?", params![id], |row| {
                row.get(0)
            })
            .map_err(db_err)?;
        Ok(count > 0)
    }

    fn fetch_tally(conn: &Connection, id: &str) -> Result<Option<FanoutTally>, JobStoreError> {
        let row = conn
            .query_row(
                "SELECT fanout_expected, fanout_succeeded, fanout_failed, fanout_skipped FROM jobs WHERE id = ?",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, Option<u32>>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, u32>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        match row {
            None => Err(JobStoreError::NotFound(id.to_string())),
            Some((None, _, _, _)) => Ok(None),
            Some((Some(expected), succeeded, failed, skipped)) => Ok(Some(FanoutTally {
                expected,
                succeeded,
                failed,
                skipped,
            })),
        }
    }
}

impl JobStore for SqliteJobStore {
    fn insert_video(&self, video: NewVideo) -> Result<Video, JobStoreError> {
        let conn = self.conn()?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        conn.execute(
            &format!(
                "INSERT INTO videos ({}) VALUES (?, ?, ?, ?, ?, ?, ?)",
                VIDEO_COLUMNS
            ),
            params![
                id,
                video.storage_ref,
                video.duration_secs,
                video.size_bytes as i64,
                video.width,
                video.height,
                now.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;

        Ok(Video {
            id,
            storage_ref: video.storage_ref,
            duration_secs: video.duration_secs,
            size_bytes: video.size_bytes,
            width: video.width,
            height: video.height,
            created_at: now,
        })
    }

    fn get_video(&self, id: &str) -> Result<Option<Video>, JobStoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM videos WHERE id = ?", VIDEO_COLUMNS),
            params![id],
            Self::row_to_video,
        )
        .optional()
        .map_err(db_err)
    }

    fn list_videos(&self) -> Result<Vec<Video>, JobStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM videos ORDER BY created_at ASC, rowid ASC",
                VIDEO_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map([], Self::row_to_video).map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn create_job(&self, request: CreateJobRequest) -> Result<Job, JobStoreError> {
        let mut conn = self.conn()?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let kind = JobKind::from_stages(&request.stages);

        let input_json =
            serde_json::to_string(&request.input).map_err(|e| JobStoreError::Database(e.to_string()))?;
        let stages_json = serde_json::to_string(&request.stages)
            .map_err(|e| JobStoreError::Database(e.to_string()))?;

        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO jobs (id, kind, input, video_id, stages, status, step_count, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                id,
                kind.as_str(),
                input_json,
                request.video_id,
                stages_json,
                JobStatus::Queued.as_str(),
                request.step_count as i64,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        tx.execute(
            "INSERT INTO job_transitions (job_id, from_status, to_status, detail, at) VALUES (?, NULL, ?, NULL, ?)",
            params![id, JobStatus::Queued.as_str(), now.to_rfc3339()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        Ok(Job {
            id,
            kind,
            input: request.input,
            video_id: request.video_id,
            stages: request.stages,
            status: JobStatus::Queued,
            current_step: 0,
            step_count: request.step_count,
            cancel_requested: false,
            error_detail: None,
            fanout: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>, JobStoreError> {
        let conn = self.conn()?;
        Self::fetch_job(&conn, id)
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let conn = self.conn()?;

        let (where_clause, params) = Self::build_where_clause(filter);

        let sql = format!(
            "SELECT {} FROM jobs {} ORDER BY created_at ASC, rowid ASC LIMIT ? OFFSET ?",
            JOB_COLUMNS, where_clause
        );

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;

        let mut all_params: Vec<Box<dyn rusqlite::ToSql>> = params;
        all_params.push(Box::new(filter.limit));
        all_params.push(Box::new(filter.offset));

        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let rows = stmt
            .query_map(param_refs.as_slice(), Self::row_to_job)
            .map_err(db_err)?;

        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn count_jobs(&self, filter: &JobFilter) -> Result<i64, JobStoreError> {
        let conn = self.conn()?;

        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))
            .map_err(db_err)
    }

    fn compare_and_set_status(
        &self,
        id: &str,
        expected: JobStatus,
        next: JobStatus,
        detail: Option<&str>,
    ) -> Result<bool, JobStoreError> {
        if !expected.can_transition_to(next) {
            return Err(JobStoreError::InvalidTransition {
                job_id: id.to_string(),
                from: expected,
                to: next,
            });
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        let now = Utc::now().to_rfc3339();

        let changed = tx
            .execute(
                "UPDATE jobs SET status = ?, error_detail = COALESCE(?, error_detail), updated_at = ? WHERE id = ? AND status = ?",
                params![next.as_str(), detail, now, id, expected.as_str()],
            )
            .map_err(db_err)?;

        if changed == 0 {
            if !Self::job_exists(&tx, id)? {
                return Err(JobStoreError::NotFound(id.to_string()));
            }
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO job_transitions (job_id, from_status, to_status, detail, at) VALUES (?, ?, ?, ?, ?)",
            params![id, expected.as_str(), next.as_str(), detail, now],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        Ok(true)
    }

    fn transitions(&self, id: &str) -> Result<Vec<StatusTransition>, JobStoreError> {
        let conn = self.conn()?;
        if !Self::job_exists(&conn, id)? {
            return Err(JobStoreError::NotFound(id.to_string()));
        }

        let mut stmt = conn
            .prepare(
                "SELECT job_id, from_status, to_status, detail, at FROM job_transitions WHERE job_id = ? ORDER BY seq ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![id], |row| {
                let from = row
                    .get::<_, Option<String>>(1)?
                    .map(|s| {
                        JobStatus::parse(&s)
                            .ok_or_else(|| conversion_err(1, format!("unknown status: {}", s)))
                    })
                    .transpose()?;
                let at: String = row.get(4)?;
                Ok(StatusTransition {
                    job_id: row.get(0)?,
                    from,
                    to: status_column(row, 2)?,
                    detail: row.get(3)?,
                    at: parse_timestamp(&at),
                })
            })
            .map_err(db_err)?;

        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn request_cancel(&self, id: &str) -> Result<Job, JobStoreError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE jobs SET cancel_requested = 1, updated_at = ? WHERE id = ?",
                params![Utc::now().to_rfc3339(), id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(JobStoreError::NotFound(id.to_string()));
        }
        Self::fetch_job(&conn, id)?.ok_or_else(|| JobStoreError::NotFound(id.to_string()))
    }

    fn advance_step(&self, id: &str, from: usize, to: usize) -> Result<bool, JobStoreError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE jobs SET current_step = ?, updated_at = ? WHERE id = ? AND current_step = ? AND status = ?",
                params![
                    to as i64,
                    Utc::now().to_rfc3339(),
                    id,
                    from as i64,
                    JobStatus::Running.as_str()
                ],
            )
            .map_err(db_err)?;
        if changed == 0 && !Self::job_exists(&conn, id)? {
            return Err(JobStoreError::NotFound(id.to_string()));
        }
        Ok(changed == 1)
    }

    fn begin_fanout(&self, id: &str, expected: u32) -> Result<FanoutTally, JobStoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE jobs SET fanout_expected = ?, fanout_succeeded = 0, fanout_failed = 0, fanout_skipped = 0, updated_at = ? WHERE id = ? AND fanout_expected IS NULL",
            params![expected, Utc::now().to_rfc3339(), id],
        )
        .map_err(db_err)?;
        Self::fetch_tally(&conn, id)?
            .ok_or_else(|| JobStoreError::Database(format!("fan-out not recorded for job {}", id)))
    }

    fn record_variant_outcome(
        &self,
        id: &str,
        outcome: VariantOutcome,
    ) -> Result<FanoutTally, JobStoreError> {
        let column = match outcome {
            VariantOutcome::Succeeded => "fanout_succeeded",
            VariantOutcome::Failed => "fanout_failed",
            VariantOutcome::Skipped => "fanout_skipped",
        };

        let conn = self.conn()?;
        let changed = conn
            .execute(
                &format!(
                    "UPDATE jobs SET {col} = {col} + 1, updated_at = ? WHERE id = ? AND fanout_expected IS NOT NULL",
                    col = column
                ),
                params![Utc::now().to_rfc3339(), id],
            )
            .map_err(db_err)?;
        if changed == 0 && !Self::job_exists(&conn, id)? {
            return Err(JobStoreError::NotFound(id.to_string()));
        }
        Self::fetch_tally(&conn, id)?
            .ok_or_else(|| JobStoreError::Database(format!("job {} has no fan-out in progress", id)))
    }

    fn add_artifact(&self, artifact: NewArtifact) -> Result<Artifact, JobStoreError> {
        let conn = self.conn()?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        conn.execute(
            &format!(
                "INSERT INTO artifacts ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                ARTIFACT_COLUMNS
            ),
            params![
                id,
                artifact.job_id,
                artifact.kind.as_str(),
                artifact.step_index as i64,
                artifact.resolution.map(|r| r.as_str()),
                artifact.storage_ref,
                artifact.checksum,
                artifact.size_bytes as i64,
                now.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;

        Ok(Artifact {
            id,
            job_id: artifact.job_id,
            kind: artifact.kind,
            step_index: artifact.step_index,
            resolution: artifact.resolution,
            storage_ref: artifact.storage_ref,
            checksum: artifact.checksum,
            size_bytes: artifact.size_bytes,
            created_at: now,
        })
    }

    fn artifacts(&self, job_id: &str) -> Result<Vec<Artifact>, JobStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM artifacts WHERE job_id = ? ORDER BY rowid ASC",
                ARTIFACT_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![job_id], Self::row_to_artifact)
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn remove_intermediate_artifacts(&self, job_id: &str) -> Result<usize, JobStoreError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM artifacts WHERE job_id = ? AND kind = ?",
            params![job_id, ArtifactKind::Intermediate.as_str()],
        )
        .map_err(db_err)
    }
}
