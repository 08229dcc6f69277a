use super::*;

use crate::types::RecordStatus;

const RECORD_COLUMNS: &str = "id, content_hash, raw_text, title, source, author, page, published_at,
     body, tag_hint, priority_hint, status, cluster_id, error_reason, created_at, updated_at";

impl DeskDb {
    // =========================================================================
    // Raw records
    // =========================================================================

    /// Insert a record from the ingestion side.
    ///
    /// Idempotent on the content hash: returns `None` when the same raw text
    /// was already ingested.
    pub fn insert_raw_record(&self, record: &NewRawRecord) -> Result<Option<i64>, DbError> {
        let now = now();
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO raw_records
                (content_hash, raw_text, title, source, author, page, published_at,
                 status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?8)",
            params![
                crate::util::content_hash(&record.raw_text),
                record.raw_text,
                record.title,
                record.source,
                record.author,
                record.page,
                record.published_at,
                now,
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(self.conn.last_insert_rowid()))
    }

    pub fn get_record(&self, id: i64) -> Result<Option<DbRecord>, DbError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {RECORD_COLUMNS} FROM raw_records WHERE id = ?1"))?;
        let mut rows = stmt.query_map(params![id], Self::map_record_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Ids of records in `status`, oldest first.
    pub fn record_ids_by_status(
        &self,
        status: RecordStatus,
        limit: usize,
    ) -> Result<Vec<i64>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM raw_records WHERE status = ?1 ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![status.as_str(), limit as i64], |row| row.get(0))?;
        collect_rows(rows)
    }

    /// Records in `status`, oldest first.
    pub fn records_by_status(
        &self,
        status: RecordStatus,
        limit: usize,
    ) -> Result<Vec<DbRecord>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM raw_records WHERE status = ?1 ORDER BY id LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![status.as_str(), limit as i64], Self::map_record_row)?;
        collect_rows(rows)
    }

    /// Records owned by a cluster.
    pub fn records_for_cluster(&self, cluster_id: i64) -> Result<Vec<DbRecord>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM raw_records WHERE cluster_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![cluster_id], Self::map_record_row)?;
        collect_rows(rows)
    }

    /// Store the normalized fields and flip the record to `ready_to_group`.
    pub fn mark_record_ready(&self, id: i64, update: &RecordUpdate) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE raw_records
             SET title = ?1, body = ?2, source = COALESCE(?3, source),
                 author = COALESCE(?4, author), published_at = COALESCE(?5, published_at),
                 tag_hint = ?6, priority_hint = ?7, status = 'ready_to_group',
                 error_reason = NULL, updated_at = ?8
             WHERE id = ?9",
            params![
                update.title,
                update.body,
                update.source,
                update.author,
                update.published_at,
                update.tag_hint,
                update.priority_hint,
                now(),
                id,
            ],
        )?;
        Ok(())
    }

    /// Set a terminal or error status, keeping the failure reason when given.
    pub fn set_record_status(
        &self,
        id: i64,
        status: RecordStatus,
        reason: Option<&str>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE raw_records SET status = ?1, error_reason = ?2, updated_at = ?3
             WHERE id = ?4",
            params![status.as_str(), reason, now(), id],
        )?;
        Ok(())
    }

    /// Give an unowned ready record to a cluster.
    ///
    /// Returns false when the record is no longer `ready_to_group` or already
    /// owned, which makes re-running a grouping pass a no-op.
    pub fn attach_record(&self, record_id: i64, cluster_id: i64) -> Result<bool, DbError> {
        let changed = self.conn.execute(
            "UPDATE raw_records SET cluster_id = ?1, status = 'processed', updated_at = ?2
             WHERE id = ?3 AND status = 'ready_to_group' AND cluster_id IS NULL",
            params![cluster_id, now(), record_id],
        )?;
        Ok(changed > 0)
    }

    pub(crate) fn map_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbRecord> {
        let status: String = row.get(11)?;
        Ok(DbRecord {
            id: row.get(0)?,
            content_hash: row.get(1)?,
            raw_text: row.get(2)?,
            title: row.get(3)?,
            source: row.get(4)?,
            author: row.get(5)?,
            page: row.get(6)?,
            published_at: row.get(7)?,
            body: row.get(8)?,
            tag_hint: row.get(9)?,
            priority_hint: row.get(10)?,
            status: RecordStatus::from_db(&status).ok_or_else(|| invalid_enum(11, &status))?,
            cluster_id: row.get(12)?,
            error_reason: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }
}
