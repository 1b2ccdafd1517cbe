//! Sizes offered by the synthetic download endpoint.

use serde::Serialize;

pub const FILE_PREFIX: &str = "/file/";
pub const FILE_SUFFIX: &str = ".test";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: &'static str,
    pub bytes: u64,
}

pub const FILE_SIZES: [CatalogEntry; 6] = [
    CatalogEntry { name: "10MB", bytes: 10_000_000 },
    CatalogEntry { name: "50MB", bytes: 50_000_000 },
    CatalogEntry { name: "100MB", bytes: 100_000_000 },
    CatalogEntry { name: "200MB", bytes: 200_000_000 },
    CatalogEntry { name: "500MB", bytes: 500_000_000 },
    CatalogEntry { name: "1000MB", bytes: 1_000_000_000 },
];

impl CatalogEntry {
    pub fn path(&self) -> String {
        format!("{FILE_PREFIX}{}{FILE_SUFFIX}", self.name)
    }
}

/// Resolves a path segment such as `100MB.test` to its catalog entry.
pub fn lookup(file_name: &str) -> Option<CatalogEntry> {
    let name = file_name.strip_suffix(FILE_SUFFIX)?;
    FILE_SIZES.iter().copied().find(|entry| entry.name == name)
}
