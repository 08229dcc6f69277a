use super::embedded;
use super::schema::{CatalogFile, TagDefinition};
use super::{Catalog, TAG_ERROR, TAG_IRRELEVANT};
use crate::db::{DbCatalogTag, DbError, DeskDb};

/// Parse the embedded default catalog.
pub fn load_default() -> Result<CatalogFile, String> {
    let file: CatalogFile = serde_json::from_str(embedded::default_catalog_json())
        .map_err(|e| format!("Failed to parse embedded catalog: {}", e))?;
    validate_catalog(&file)?;
    Ok(file)
}

/// Validate a catalog has a usable vocabulary.
pub fn validate_catalog(file: &CatalogFile) -> Result<(), String> {
    if file.tags.is_empty() {
        return Err("Catalog has no tags".into());
    }
    if !file.tags.iter().any(|t| t.name == file.default_tag) {
        return Err(format!("Default tag '{}' is not in the catalog", file.default_tag));
    }
    for tag in &file.tags {
        if tag.name.trim().is_empty() {
            return Err("Catalog tag names must be non-empty".into());
        }
        if tag.name == TAG_IRRELEVANT || tag.name == TAG_ERROR {
            return Err(format!("'{}' is reserved", tag.name));
        }
    }
    Ok(())
}

/// Store the embedded catalog as version 1 when the store has none yet.
pub fn seed_if_empty(db: &DeskDb) -> Result<bool, DbError> {
    if db.latest_catalog_version()?.is_some() {
        return Ok(false);
    }
    let file = load_default().map_err(DbError::Integrity)?;
    let tags: Vec<DbCatalogTag> = file
        .tags
        .iter()
        .map(|t| DbCatalogTag {
            name: t.name.clone(),
            keywords: t.keywords.clone(),
            transactional: t.transactional,
        })
        .collect();
    db.insert_catalog_version(file.version, &tags)?;
    log::info!("Catalog: seeded version {} with {} tags", file.version, tags.len());
    Ok(true)
}

/// Build the run's snapshot: latest stored tag version, embedded marker lists.
///
/// Falls back to the embedded tags when the store holds no version.
pub fn load_snapshot(db: &DeskDb) -> Result<Catalog, String> {
    let mut file = load_default()?;

    let stored = db
        .latest_catalog_version()
        .map_err(|e| format!("Failed to read catalog version: {}", e))?;
    if let Some(version) = stored {
        let tags = db
            .catalog_tags(version)
            .map_err(|e| format!("Failed to read catalog v{}: {}", version, e))?;
        if tags.is_empty() {
            log::warn!("Catalog: stored v{} is empty, using embedded tags", version);
        } else {
            file.version = version;
            file.tags = tags
                .into_iter()
                .map(|t| TagDefinition {
                    name: t.name,
                    keywords: t.keywords,
                    transactional: t.transactional,
                })
                .collect();
            if !file.tags.iter().any(|t| t.name == file.default_tag) {
                file.default_tag = file.tags[0].name.clone();
            }
        }
    }

    Ok(Catalog::from_file(file))
}
