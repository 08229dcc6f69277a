use super::*;

impl DeskDb {
    // =========================================================================
    // Alteration log (append-only)
    // =========================================================================

    /// Append one entry to the alteration trail.
    pub fn log_alteration(&self, run_id: &str, entry: &NewAlteration<'_>) -> Result<i64, DbError> {
        self.conn.execute(
            "INSERT INTO alteration_log
                (cluster_id, record_id, field, old_value, new_value, motive, run_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.cluster_id,
                entry.record_id,
                entry.field,
                entry.old_value,
                entry.new_value,
                entry.motive,
                run_id,
                now(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Entries recorded against a cluster, in insertion order.
    pub fn alterations_for_cluster(&self, cluster_id: i64) -> Result<Vec<DbAlteration>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, cluster_id, record_id, field, old_value, new_value, motive, run_id, created_at
             FROM alteration_log WHERE cluster_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![cluster_id], Self::map_alteration_row)?;
        collect_rows(rows)
    }

    /// Number of entries a run produced.
    pub fn count_alterations_for_run(&self, run_id: &str) -> Result<i64, DbError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM alteration_log WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn map_alteration_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbAlteration> {
        Ok(DbAlteration {
            id: row.get(0)?,
            cluster_id: row.get(1)?,
            record_id: row.get(2)?,
            field: row.get(3)?,
            old_value: row.get(4)?,
            new_value: row.get(5)?,
            motive: row.get(6)?,
            run_id: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}
