//! Bucket repository: CRUD operations for the `buckets` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw bucket row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketRow {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub prefix: Option<String>,
    pub created_at: String,
}

impl BucketRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            provider: row.get("provider")?,
            endpoint: row.get("endpoint")?,
            region: row.get("region")?,
            bucket: row.get("bucket")?,
            access_key_id: row.get("access_key_id")?,
            secret_access_key: row.get("secret_access_key")?,
            prefix: row.get("prefix")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Inserts a bucket or overwrites its connection settings.
pub fn upsert(db: &Database, bucket: &BucketRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO buckets (id, name, provider, endpoint, region, bucket, access_key_id,
             secret_access_key, prefix, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET name=excluded.name, provider=excluded.provider,
             endpoint=excluded.endpoint, region=excluded.region, bucket=excluded.bucket,
             access_key_id=excluded.access_key_id,
             secret_access_key=excluded.secret_access_key, prefix=excluded.prefix",
            params![
                bucket.id,
                bucket.name,
                bucket.provider,
                bucket.endpoint,
                bucket.region,
                bucket.bucket,
                bucket.access_key_id,
                bucket.secret_access_key,
                bucket.prefix,
                bucket.created_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a bucket by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<BucketRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM buckets WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], BucketRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Lists all buckets ordered by creation time.
pub fn list(db: &Database) -> Result<Vec<BucketRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM buckets ORDER BY created_at, id")?;
        let rows = stmt
            .query_map([], BucketRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes a bucket. Returns `true` if a row was removed.
pub fn delete(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let affected = conn.execute("DELETE FROM buckets WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    })
}
