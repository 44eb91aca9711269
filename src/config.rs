use std::sync::Arc;
use std::time::Duration;

use crate::bus::MessageBus;
use crate::migration::MigrationSet;
use crate::ready::RetryPolicy;
use crate::replication::Mode;
use crate::sync::{DataSync, DumpCommand};
use crate::{Result, DEFAULT_EXCHANGE};

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a [`Settings`](crate::Settings) coordinator is started with.
///
/// Only the database is required, every other option has a default.
pub struct SettingsConfig<D> {
    pub(crate) db: D,

    /// Identifier for the node.
    ///
    /// This is used for troubleshooting/debugging purposes.
    pub(crate) name: String,
    pub(crate) exchange_name: String,

    /// [`None`] until set, so the coordinator can warn about the default.
    pub(crate) mode: Option<Mode>,
    pub(crate) bus: Option<Arc<dyn MessageBus>>,
    pub(crate) data_sync: Option<Arc<dyn DataSync>>,
    pub(crate) write_timeout: Duration,
    pub(crate) retry: RetryPolicy,
    pub(crate) migrations: MigrationSet,
    pub(crate) dump_command: Option<DumpCommand>,
}

impl<D> SettingsConfig<D> {
    pub fn new(db: D) -> Self {
        SettingsConfig {
            db,
            name: DEFAULT_EXCHANGE.to_string(),
            exchange_name: DEFAULT_EXCHANGE.to_string(),
            mode: None,
            bus: None,
            data_sync: None,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            retry: RetryPolicy::default(),
            migrations: MigrationSet::embedded(),
            dump_command: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_exchange_name(mut self, exchange_name: impl Into<String>) -> Self {
        self.exchange_name = exchange_name.into();
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set the mode from its textual form, `"master"`, `"slave"` or `"noSync"`.
    pub fn with_mode_str(self, mode: &str) -> Result<Self> {
        Ok(self.with_mode(mode.parse()?))
    }

    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_data_sync(mut self, data_sync: Arc<dyn DataSync>) -> Self {
        self.data_sync = Some(data_sync);
        self
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_migrations(mut self, migrations: MigrationSet) -> Self {
        self.migrations = migrations;
        self
    }

    /// Serve dumps with this command instead of the one the database offers.
    pub fn with_dump_command(mut self, dump_command: DumpCommand) -> Self {
        self.dump_command = Some(dump_command);
        self
    }
}
