use std::future::Future;

use crate::migration::MigrationSet;
use crate::sync::{Dump, DumpCommand};
use crate::Result;

/// Storage behind the `settings` table.
///
/// Implementations own a single relational database holding the `settings`
/// table and its migration bookkeeping table. The coordinator only ever
/// talks to the database through this trait, so any driver that can run a
/// keyed upsert can back a node.
pub trait SettingsDb: Clone + Send + Sync + 'static {
    /// Retrieve the stored value of a setting.
    /// If the setting was never written, then [`None`] is returned.
    fn get(&self, name: String) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Insert or overwrite a setting by its name.
    fn replace(&self, name: String, value: String) -> impl Future<Output = Result<()>> + Send;

    /// Number of rows in the `settings` table.
    fn count(&self) -> impl Future<Output = Result<usize>> + Send;

    /// Apply every migration newer than the version recorded in `table`,
    /// returning the version the database is at afterwards.
    fn migrate(
        &self,
        table: &'static str,
        migrations: MigrationSet,
    ) -> impl Future<Output = Result<u32>> + Send;

    /// Load a snapshot produced by a peer's dump server.
    fn restore(&self, dump: Dump) -> impl Future<Output = Result<()>> + Send;

    /// The command which dumps the tables owned by this crate, if the
    /// database can be dumped at all.
    fn dump_command(&self) -> Option<DumpCommand>;
}
