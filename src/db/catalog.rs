use super::*;

impl DeskDb {
    // =========================================================================
    // Tag catalog (versioned)
    // =========================================================================

    /// Highest stored catalog version, if any.
    pub fn latest_catalog_version(&self) -> Result<Option<i64>, DbError> {
        let version = self
            .conn
            .query_row("SELECT MAX(version) FROM tag_catalog", [], |row| row.get(0))?;
        Ok(version)
    }

    /// Tags of one catalog version, in name order.
    pub fn catalog_tags(&self, version: i64) -> Result<Vec<DbCatalogTag>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT name, keywords, transactional FROM tag_catalog
             WHERE version = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![version], |row| {
            let keywords: String = row.get(1)?;
            Ok(DbCatalogTag {
                name: row.get(0)?,
                keywords: serde_json::from_str(&keywords).unwrap_or_default(),
                transactional: row.get(2)?,
            })
        })?;
        collect_rows(rows)
    }

    /// Store a new catalog version. Earlier versions are kept.
    pub fn insert_catalog_version(&self, version: i64, tags: &[DbCatalogTag]) -> Result<(), DbError> {
        for tag in tags {
            let keywords = serde_json::to_string(&tag.keywords)
                .map_err(|e| DbError::Integrity(format!("keywords for {}: {}", tag.name, e)))?;
            self.conn.execute(
                "INSERT INTO tag_catalog (version, name, keywords, transactional)
                 VALUES (?1, ?2, ?3, ?4)",
                params![version, tag.name, keywords, tag.transactional],
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_catalog_versions() {
        let db = test_db();
        assert_eq!(db.latest_catalog_version().unwrap(), None);

        let tags = vec![DbCatalogTag {
            name: "M&A".into(),
            keywords: vec!["merger".into(), "acquisition".into()],
            transactional: true,
        }];
        db.insert_catalog_version(1, &tags).unwrap();
        db.insert_catalog_version(2, &tags).unwrap();

        assert_eq!(db.latest_catalog_version().unwrap(), Some(2));
        assert_eq!(db.catalog_tags(2).unwrap(), tags);
    }
}
