#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use amsettings::migration::MigrationSet;
use amsettings::sync::{Dump, DumpCommand};
use amsettings::{Error, Result, RetryPolicy, SettingsDb, SqliteDb};

/// Wraps a [`SqliteDb`], counting physical writes and optionally failing them.
#[derive(Clone)]
pub struct CountingDb {
    pub db: SqliteDb,
    writes: Arc<AtomicUsize>,
    fail_writes: Arc<AtomicBool>,
}

impl CountingDb {
    pub fn new(db: SqliteDb) -> Self {
        CountingDb {
            db,
            writes: Arc::new(AtomicUsize::new(0)),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl SettingsDb for CountingDb {
    async fn get(&self, name: String) -> Result<Option<String>> {
        self.db.get(name).await
    }

    async fn replace(&self, name: String, value: String) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Write("disk full".to_string()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.db.replace(name, value).await
    }

    async fn count(&self) -> Result<usize> {
        self.db.count().await
    }

    async fn migrate(&self, table: &'static str, migrations: MigrationSet) -> Result<u32> {
        self.db.migrate(table, migrations).await
    }

    async fn restore(&self, dump: Dump) -> Result<()> {
        self.db.restore(dump).await
    }

    fn dump_command(&self) -> Option<DumpCommand> {
        self.db.dump_command()
    }
}

pub fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        interval: Duration::from_millis(10),
    }
}

/// Poll `db` until `name` holds `expected`, replication is asynchronous.
pub async fn eventually<D: SettingsDb>(
    db: &D,
    name: &str,
    expected: Option<&str>,
) -> Result<()> {
    for _ in 0..200 {
        if db.get(name.to_owned()).await?.as_deref() == expected {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{name} never became {expected:?}");
}
