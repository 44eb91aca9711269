use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::engine::SettingsDb;
use crate::migration::MigrationSet;
use crate::sync::{Dump, DumpCommand, SQL_CONTENT_TYPE};
use crate::{Error, Result, SETTINGS_TABLE, VERSION_TABLE};

/// [`SettingsDb`] backed by a SQLite database.
///
/// The connection is shared behind a mutex and every statement runs on the
/// blocking thread pool, so callers on the async runtime are never stalled
/// by disk I/O.
#[derive(Clone, Debug)]
pub struct SqliteDb {
    conn: Arc<Mutex<Connection>>,

    /// Location of the database file, [`None`] when held in memory.
    path: Option<PathBuf>,
}

impl SqliteDb {
    /// Open (or create) a database file.
    pub fn open<P>(path: P) -> Result<SqliteDb>
    where
        P: Into<PathBuf>,
    {
        let path = path.into();
        debug!(path = ?path.display(), "Opening settings database");
        let conn = Connection::open(&path)?;
        Ok(SqliteDb {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    pub fn open_in_memory() -> Result<SqliteDb> {
        Ok(SqliteDb {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
            path: None,
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::Poisoned)?;
            f(&mut *guard)
        })
        .await?
    }
}

impl SettingsDb for SqliteDb {
    async fn get(&self, name: String) -> Result<Option<String>> {
        self.with_conn(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM settings WHERE name = ?1",
                    params![name],
                    |row| row.get::<_, Option<String>>(0),
                )
                .optional()?;
            Ok(value.flatten())
        })
        .await
    }

    async fn replace(&self, name: String, value: String) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "REPLACE INTO settings (name, value) VALUES (?1, ?2)",
                params![name, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let rows: i64 = conn.query_row("SELECT COUNT(*) FROM settings", [], |row| row.get(0))?;
            Ok(rows as usize)
        })
        .await
    }

    async fn migrate(&self, table: &'static str, migrations: MigrationSet) -> Result<u32> {
        self.with_conn(move |conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    version INTEGER NOT NULL
                );
                INSERT OR IGNORE INTO {table} (id, version) VALUES (1, 0);"
            ))?;

            let mut current: u32 =
                conn.query_row(&format!("SELECT version FROM {table} WHERE id = 1"), [], |row| {
                    row.get(0)
                })?;
            debug!(table, version = current, latest = migrations.latest(), "Checking migrations");

            for migration in migrations.after(current) {
                info!(table, version = migration.version, "Applying migration");
                let tx = conn.transaction()?;
                tx.execute_batch(&migration.sql).map_err(|e| {
                    Error::Migration(format!("version {}: {e}", migration.version))
                })?;
                tx.execute(
                    &format!("UPDATE {table} SET version = ?1 WHERE id = 1"),
                    params![migration.version],
                )?;
                tx.commit()?;
                current = migration.version;
            }
            Ok(current)
        })
        .await
    }

    async fn restore(&self, dump: Dump) -> Result<()> {
        if dump.content_type != SQL_CONTENT_TYPE {
            return Err(Error::Sync(format!(
                "cannot restore a dump of type {}",
                dump.content_type
            )));
        }
        self.with_conn(move |conn| {
            let sql = std::str::from_utf8(&dump.body)?;
            info!(bytes = sql.len(), created_at = %dump.created_at, "Restoring settings dump");

            // Rolled back on drop if anything fails.
            let tx = conn.transaction()?;
            tx.execute_batch(&format!(
                "DROP TABLE IF EXISTS {SETTINGS_TABLE}; DROP TABLE IF EXISTS {VERSION_TABLE};"
            ))?;
            tx.execute_batch(&without_transaction(sql))?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    fn dump_command(&self) -> Option<DumpCommand> {
        let path = self.path.as_ref()?;
        Some(
            DumpCommand::new("sqlite3")
                .arg(path.display().to_string())
                .arg(format!(".dump {SETTINGS_TABLE} {VERSION_TABLE}")),
        )
    }
}

/// `sqlite3 .dump` wraps its output in a transaction of its own, which
/// cannot nest inside the one the restore runs in.
fn without_transaction(sql: &str) -> String {
    sql.lines()
        .filter(|line| {
            let statement = line.trim();
            !statement.eq_ignore_ascii_case("BEGIN TRANSACTION;")
                && !statement.eq_ignore_ascii_case("COMMIT;")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
