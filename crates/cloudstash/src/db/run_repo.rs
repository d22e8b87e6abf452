//! Run repository: CRUD operations for the `runs` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw run row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRow {
    pub id: String,
    pub job_id: Option<String>,
    pub bucket_id: Option<String>,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub files_transferred: i64,
    pub files_skipped: i64,
    pub total_bytes: i64,
    pub backup_path: Option<String>,
    pub error: Option<String>,
    pub dry_run: bool,
    pub manual: bool,
    pub owner_pid: Option<i64>,
    pub owner_instance: Option<String>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            bucket_id: row.get("bucket_id")?,
            status: row.get("status")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            files_transferred: row.get("files_transferred")?,
            files_skipped: row.get("files_skipped")?,
            total_bytes: row.get("total_bytes")?,
            backup_path: row.get("backup_path")?,
            error: row.get("error")?,
            dry_run: row.get("dry_run")?,
            manual: row.get("manual")?,
            owner_pid: row.get("owner_pid")?,
            owner_instance: row.get("owner_instance")?,
        })
    }
}

const INSERT_COLUMNS: &str = "id, job_id, bucket_id, status, started_at, completed_at,
     files_transferred, files_skipped, total_bytes, backup_path, error, dry_run, manual,
     owner_pid, owner_instance";

/// Inserts a new run row.
pub fn insert(db: &Database, run: &RunRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            &format!(
                "INSERT INTO runs ({INSERT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                run.id,
                run.job_id,
                run.bucket_id,
                run.status,
                run.started_at,
                run.completed_at,
                run.files_transferred,
                run.files_skipped,
                run.total_bytes,
                run.backup_path,
                run.error,
                run.dry_run,
                run.manual,
                run.owner_pid,
                run.owner_instance,
            ],
        )?;
        Ok(())
    })
}

/// Inserts a new run row unless some run is still `running`.
///
/// The check and the insert are one statement, so concurrent writers on
/// the same file cannot both succeed. Returns `false` when refused.
pub fn insert_exclusive(db: &Database, run: &RunRow) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let affected = conn.execute(
            &format!(
                "INSERT INTO runs ({INSERT_COLUMNS})
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15
                 WHERE NOT EXISTS (SELECT 1 FROM runs WHERE status = 'running')"
            ),
            params![
                run.id,
                run.job_id,
                run.bucket_id,
                run.status,
                run.started_at,
                run.completed_at,
                run.files_transferred,
                run.files_skipped,
                run.total_bytes,
                run.backup_path,
                run.error,
                run.dry_run,
                run.manual,
                run.owner_pid,
                run.owner_instance,
            ],
        )?;
        Ok(affected == 1)
    })
}

/// Updates an existing run row. All fields except `id`, `job_id` and `started_at` are overwritten.
pub fn update(db: &Database, run: &RunRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE runs SET bucket_id=?2, status=?3, completed_at=?4, files_transferred=?5,
             files_skipped=?6, total_bytes=?7, backup_path=?8, error=?9, dry_run=?10, manual=?11
             WHERE id=?1",
            params![
                run.id,
                run.bucket_id,
                run.status,
                run.completed_at,
                run.files_transferred,
                run.files_skipped,
                run.total_bytes,
                run.backup_path,
                run.error,
                run.dry_run,
                run.manual,
            ],
        )?;
        Ok(())
    })
}

/// Finds a run by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<RunRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM runs WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], RunRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Lists runs newest first, optionally restricted to one job.
pub fn list(
    db: &Database,
    job_id: Option<&str>,
    limit: Option<u64>,
) -> Result<Vec<RunRow>, DatabaseError> {
    db.with_conn(|conn| {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = match job_id {
            Some(job_id) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM runs WHERE job_id = ?1
                     ORDER BY started_at DESC, id DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![job_id, limit], RunRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT * FROM runs ORDER BY started_at DESC, id DESC LIMIT ?1")?;
                let rows = stmt
                    .query_map(params![limit], RunRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(rows)
    })
}

/// Deletes a run. Returns `true` if a row was removed.
pub fn delete(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let affected = conn.execute("DELETE FROM runs WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    })
}
