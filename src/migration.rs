//! Ordered schema scripts for the `settings` table.
//!
//! A [`MigrationSet`] is only the list of scripts; applying them and
//! recording the version is the job of the [`SettingsDb`](crate::SettingsDb).

use std::path::Path;

use glob::glob;
use tracing::debug;

use crate::{Error, Result};

/// Scripts shipped with the crate, one entry per file in `dbmigration/`.
const EMBEDDED: &[(u32, &str)] = &[(1, include_str!("../dbmigration/1.sql"))];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: u32,
    pub sql: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSet(Vec<Migration>);

impl MigrationSet {
    /// The crate's own migration scripts.
    pub fn embedded() -> Self {
        Self::new(
            EMBEDDED
                .iter()
                .map(|(version, sql)| Migration {
                    version: *version,
                    sql: sql.to_string(),
                })
                .collect(),
        )
    }

    /// Build a set from explicit migrations, ordering them by version.
    pub fn new(mut migrations: Vec<Migration>) -> Self {
        migrations.sort_by_key(|m| m.version);
        MigrationSet(migrations)
    }

    /// Read every `<version>.sql` file in a directory.
    pub fn from_dir<P: AsRef<Path>>(path: P) -> Result<Self> {
        let pattern = format!("{}/*.sql", path.as_ref().display());
        debug!(glob_pattern = pattern, "Searching for migration scripts");

        let files = glob(&pattern).map_err(|e| Error::Migration(e.to_string()))?;
        let mut migrations = Vec::new();
        for file in files {
            let file = file.map_err(|e| Error::Migration(e.to_string()))?;
            let version = file
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok())
                .ok_or_else(|| {
                    Error::Migration(format!(
                        "{} is not named after a version number",
                        file.display()
                    ))
                })?;
            let sql = std::fs::read_to_string(&file)?;
            migrations.push(Migration { version, sql });
        }

        let set = Self::new(migrations);
        if let Some(pair) = set.0.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(Error::Migration(format!(
                "duplicate migration version {}",
                pair[0].version
            )));
        }
        Ok(set)
    }

    /// Migrations which have not been applied yet, in the order to apply them.
    pub fn after(&self, version: u32) -> impl Iterator<Item = &Migration> {
        self.0.iter().filter(move |m| m.version > version)
    }

    pub fn latest(&self) -> u32 {
        self.0.last().map(|m| m.version).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
