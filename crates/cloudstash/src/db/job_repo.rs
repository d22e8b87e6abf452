//! Job repository: CRUD operations for the `jobs` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub name: String,
    pub source_path: String,
    pub bucket_id: String,
    pub destination: Option<String>,
    /// JSON-encoded recurrence policy, `NULL` when unscheduled.
    pub schedule: Option<String>,
    pub retention_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            source_path: row.get("source_path")?,
            bucket_id: row.get("bucket_id")?,
            destination: row.get("destination")?,
            schedule: row.get("schedule")?,
            retention_count: row.get("retention_count")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts a job, or overwrites every column except `created_at` if it exists.
pub fn upsert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, name, source_path, bucket_id, destination, schedule,
             retention_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET name=excluded.name,
             source_path=excluded.source_path, bucket_id=excluded.bucket_id,
             destination=excluded.destination, schedule=excluded.schedule,
             retention_count=excluded.retention_count, updated_at=excluded.updated_at",
            params![
                job.id,
                job.name,
                job.source_path,
                job.bucket_id,
                job.destination,
                job.schedule,
                job.retention_count,
                job.created_at,
                job.updated_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], JobRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Lists all jobs ordered by name.
pub fn list(db: &Database) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY name COLLATE NOCASE, id")?;
        let rows = stmt
            .query_map([], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes a job. Returns `true` if a row was removed.
pub fn delete(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let affected = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    })
}
