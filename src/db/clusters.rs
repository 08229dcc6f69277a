use super::*;

use crate::types::{ClusterStatus, Priority};

const CLUSTER_COLUMNS: &str = "id, title, summary, tag, priority, status, record_count, day,
     needs_classification, review_reason, merged_into, created_at, updated_at";

impl DeskDb {
    // =========================================================================
    // Event clusters
    // =========================================================================

    /// Create an empty active cluster for `day`. Only groupers call this.
    pub fn create_cluster(&self, title: &str, day: &str) -> Result<i64, DbError> {
        let now = now();
        self.conn.execute(
            "INSERT INTO event_clusters (title, day, status, needs_classification, created_at, updated_at)
             VALUES (?1, ?2, 'active', 1, ?3, ?3)",
            params![title, day, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_cluster(&self, id: i64) -> Result<Option<DbCluster>, DbError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {CLUSTER_COLUMNS} FROM event_clusters WHERE id = ?1"))?;
        let mut rows = stmt.query_map(params![id], Self::map_cluster_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Active clusters of a day, oldest first.
    pub fn active_clusters_for_day(&self, day: &str) -> Result<Vec<DbCluster>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM event_clusters
             WHERE day = ?1 AND status = 'active' ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![day], Self::map_cluster_row)?;
        collect_rows(rows)
    }

    /// Active clusters of a day still waiting for the classifier.
    pub fn cluster_ids_needing_classification(
        &self,
        day: &str,
        limit: usize,
    ) -> Result<Vec<i64>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM event_clusters
             WHERE day = ?1 AND status = 'active' AND needs_classification = 1
             ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![day, limit as i64], |row| row.get(0))?;
        collect_rows(rows)
    }

    /// Up to `limit` member titles, newest first.
    pub fn sample_member_titles(&self, cluster_id: i64, limit: usize) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT title FROM raw_records
             WHERE cluster_id = ?1 AND title IS NOT NULL AND title != ''
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![cluster_id, limit as i64], |row| row.get(0))?;
        collect_rows(rows)
    }

    /// Recompute `record_count` from ownership and return it.
    pub fn refresh_record_count(&self, cluster_id: i64) -> Result<i64, DbError> {
        self.conn.execute(
            "UPDATE event_clusters
             SET record_count = (SELECT COUNT(*) FROM raw_records WHERE cluster_id = ?1),
                 updated_at = ?2
             WHERE id = ?1",
            params![cluster_id, now()],
        )?;
        let count = self.conn.query_row(
            "SELECT record_count FROM event_clusters WHERE id = ?1",
            params![cluster_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn set_needs_classification(&self, cluster_id: i64, needed: bool) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE event_clusters SET needs_classification = ?1, updated_at = ?2 WHERE id = ?3",
            params![needed, now(), cluster_id],
        )?;
        Ok(())
    }

    pub fn set_review_reason(&self, cluster_id: i64, reason: Option<&str>) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE event_clusters SET review_reason = ?1, updated_at = ?2 WHERE id = ?3",
            params![reason, now(), cluster_id],
        )?;
        Ok(())
    }

    /// Change one logged field of a cluster.
    ///
    /// No-op (returns false) when the stored value already equals `new_value`.
    /// Otherwise updates the column and appends exactly one alteration entry.
    pub fn update_cluster_field(
        &self,
        cluster_id: i64,
        field: ClusterField,
        new_value: Option<&str>,
        motive: &str,
        run_id: &str,
    ) -> Result<bool, DbError> {
        let column = field.column();
        let old_value: Option<String> = self.conn.query_row(
            &format!("SELECT {column} FROM event_clusters WHERE id = ?1"),
            params![cluster_id],
            |row| row.get(0),
        )?;
        if old_value.as_deref() == new_value {
            return Ok(false);
        }

        // `summary` is NOT NULL; clearing it stores the empty string.
        let stored = match (field, new_value) {
            (ClusterField::Summary, None) => Some(""),
            (_, v) => v,
        };
        self.conn.execute(
            &format!("UPDATE event_clusters SET {column} = ?1, updated_at = ?2 WHERE id = ?3"),
            params![stored, now(), cluster_id],
        )?;
        self.log_alteration(
            run_id,
            &NewAlteration {
                cluster_id: Some(cluster_id),
                record_id: None,
                field: column,
                old_value: old_value.as_deref(),
                new_value,
                motive,
            },
        )?;
        Ok(true)
    }

    /// Merge `sources` into `destination`.
    ///
    /// Records move to the destination, sources become `discarded` with
    /// `merged_into` set, and the destination is queued for reclassification.
    /// Re-applying a merge that already happened changes nothing.
    pub fn merge_clusters(
        &self,
        destination: i64,
        sources: &[i64],
        motive: &str,
        run_id: &str,
    ) -> Result<MergeOutcome, DbError> {
        let dest = self
            .get_cluster(destination)?
            .ok_or_else(|| DbError::Integrity(format!("unknown destination {}", destination)))?;
        if dest.status != ClusterStatus::Active {
            return Err(DbError::Integrity(format!(
                "destination {} is {}",
                destination,
                dest.status.as_str()
            )));
        }

        let mut outcome = MergeOutcome::default();
        for &source_id in sources {
            if source_id == destination {
                return Err(DbError::Integrity(format!(
                    "cluster {} cannot merge into itself",
                    source_id
                )));
            }
            let source = self
                .get_cluster(source_id)?
                .ok_or_else(|| DbError::Integrity(format!("unknown source {}", source_id)))?;
            if source.status == ClusterStatus::Discarded && source.merged_into == Some(destination)
            {
                continue;
            }
            if source.status != ClusterStatus::Active {
                return Err(DbError::Integrity(format!(
                    "source {} is {}",
                    source_id,
                    source.status.as_str()
                )));
            }

            let record_ids: Vec<i64> = {
                let mut stmt = self
                    .conn
                    .prepare("SELECT id FROM raw_records WHERE cluster_id = ?1 ORDER BY id")?;
                let rows = stmt.query_map(params![source_id], |row| row.get(0))?;
                collect_rows(rows)?
            };
            let now = now();
            self.conn.execute(
                "UPDATE raw_records SET cluster_id = ?1, updated_at = ?2 WHERE cluster_id = ?3",
                params![destination, now, source_id],
            )?;
            let (from, to) = (source_id.to_string(), destination.to_string());
            for record_id in &record_ids {
                self.log_alteration(
                    run_id,
                    &NewAlteration {
                        cluster_id: Some(destination),
                        record_id: Some(*record_id),
                        field: "cluster_id",
                        old_value: Some(from.as_str()),
                        new_value: Some(to.as_str()),
                        motive,
                    },
                )?;
            }

            self.conn.execute(
                "UPDATE event_clusters
                 SET status = 'discarded', merged_into = ?1, record_count = 0, updated_at = ?2
                 WHERE id = ?3",
                params![destination, now, source_id],
            )?;
            self.log_alteration(
                run_id,
                &NewAlteration {
                    cluster_id: Some(source_id),
                    record_id: None,
                    field: "status",
                    old_value: Some(ClusterStatus::Active.as_str()),
                    new_value: Some(ClusterStatus::Discarded.as_str()),
                    motive,
                },
            )?;

            outcome.merged_sources.push(source_id);
            outcome.reassigned_records += record_ids.len();
        }

        if !outcome.merged_sources.is_empty() {
            self.refresh_record_count(destination)?;
            self.set_needs_classification(destination, true)?;
        }
        Ok(outcome)
    }

    pub(crate) fn map_cluster_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbCluster> {
        let priority: Option<String> = row.get(4)?;
        let priority = match priority {
            Some(p) => Some(Priority::from_db(&p).ok_or_else(|| invalid_enum(4, &p))?),
            None => None,
        };
        let status: String = row.get(5)?;
        Ok(DbCluster {
            id: row.get(0)?,
            title: row.get(1)?,
            summary: row.get(2)?,
            tag: row.get(3)?,
            priority,
            status: ClusterStatus::from_db(&status).ok_or_else(|| invalid_enum(5, &status))?,
            record_count: row.get(6)?,
            day: row.get(7)?,
            needs_classification: row.get(8)?,
            review_reason: row.get(9)?,
            merged_into: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::{raw, test_db};
    use super::*;

    const DAY: &str = "2026-03-02";

    fn grouped(db: &DeskDb, title: &str, cluster: i64) -> i64 {
        let id = db
            .insert_raw_record(&raw(title, &format!("{title} text")))
            .unwrap()
            .unwrap();
        db.mark_record_ready(
            id,
            &RecordUpdate {
                title: title.into(),
                body: "body".into(),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(db.attach_record(id, cluster).unwrap());
        db.refresh_record_count(cluster).unwrap();
        id
    }

    #[test]
    fn test_new_cluster_has_null_priority() {
        let db = test_db();
        let id = db.create_cluster("Acme buys Beta", DAY).unwrap();
        let cluster = db.get_cluster(id).unwrap().unwrap();
        assert!(cluster.priority.is_none());
        assert!(cluster.needs_classification);
        assert_eq!(cluster.status, ClusterStatus::Active);
        assert_eq!(db.cluster_ids_needing_classification(DAY, 10).unwrap(), vec![id]);
    }

    #[test]
    fn test_update_field_logs_only_true_diffs() {
        let db = test_db();
        let id = db.create_cluster("Acme", DAY).unwrap();

        assert!(db
            .update_cluster_field(id, ClusterField::Priority, Some("P1"), "classified", "run-1")
            .unwrap());
        assert!(!db
            .update_cluster_field(id, ClusterField::Priority, Some("P1"), "classified", "run-1")
            .unwrap());

        let log = db.alterations_for_cluster(id).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].field, "priority");
        assert_eq!(log[0].old_value, None);
        assert_eq!(log[0].new_value.as_deref(), Some("P1"));
        assert_eq!(
            db.get_cluster(id).unwrap().unwrap().priority,
            Some(Priority::P1)
        );
    }

    #[test]
    fn test_merge_reassigns_and_archives() {
        let db = test_db();
        let dest = db.create_cluster("Acme buys Beta", DAY).unwrap();
        let src = db.create_cluster("Beta acquired by Acme", DAY).unwrap();
        grouped(&db, "Acme buys Beta", dest);
        let moved = grouped(&db, "Beta acquired", src);
        db.set_needs_classification(dest, false).unwrap();

        let outcome = db.merge_clusters(dest, &[src], "duplicate", "run-1").unwrap();
        assert_eq!(outcome.merged_sources, vec![src]);
        assert_eq!(outcome.reassigned_records, 1);

        let source = db.get_cluster(src).unwrap().unwrap();
        assert_eq!(source.status, ClusterStatus::Discarded);
        assert_eq!(source.merged_into, Some(dest));
        let destination = db.get_cluster(dest).unwrap().unwrap();
        assert_eq!(destination.record_count, 2);
        assert!(destination.needs_classification);
        assert_eq!(db.get_record(moved).unwrap().unwrap().cluster_id, Some(dest));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let db = test_db();
        let dest = db.create_cluster("A", DAY).unwrap();
        let src = db.create_cluster("B", DAY).unwrap();
        grouped(&db, "B", src);

        db.merge_clusters(dest, &[src], "duplicate", "run-1").unwrap();
        let before = db.alterations_for_cluster(src).unwrap().len();
        let again = db.merge_clusters(dest, &[src], "duplicate", "run-2").unwrap();
        assert!(again.merged_sources.is_empty());
        assert_eq!(db.alterations_for_cluster(src).unwrap().len(), before);
    }

    #[test]
    fn test_merge_rejects_self_and_inactive() {
        let db = test_db();
        let a = db.create_cluster("A", DAY).unwrap();
        let b = db.create_cluster("B", DAY).unwrap();
        let c = db.create_cluster("C", DAY).unwrap();
        assert!(db.merge_clusters(a, &[a], "x", "run").is_err());

        db.merge_clusters(b, &[c], "x", "run").unwrap();
        // c is now discarded into b, so it cannot also go to a
        assert!(db.merge_clusters(a, &[c], "x", "run").is_err());
        // and b cannot receive into a discarded destination
        assert!(db.merge_clusters(c, &[a], "x", "run").is_err());
    }

    #[test]
    fn test_sample_titles_limit() {
        let db = test_db();
        let c = db.create_cluster("Theme", DAY).unwrap();
        for i in 0..5 {
            grouped(&db, &format!("Title {i}"), c);
        }
        let titles = db.sample_member_titles(c, 3).unwrap();
        assert_eq!(titles.len(), 3);
        assert_eq!(titles[0], "Title 4");
    }
}
