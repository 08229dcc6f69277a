const DESK_DEFAULT: &str = include_str!("../../catalogs/desk-default.json");

/// The catalog compiled into the binary. Used until a version is stored.
pub fn default_catalog_json() -> &'static str {
    DESK_DEFAULT
}
