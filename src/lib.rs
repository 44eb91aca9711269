//! A small replicated settings store.
//!
//! Settings live in a relational `settings` table. Writes travel over a
//! message bus so that every node's table converges, new nodes bootstrap
//! from a dump of the master, and the schema is kept current by a fixed set
//! of migrations run once per node.

pub mod bus;
pub mod config;
pub mod engine;
mod error;
pub mod migration;
pub mod ready;
pub mod replication;
mod settings;
pub mod sqlite;
pub mod sync;
pub mod telemetry;

pub use bus::{LoopbackBus, MessageBus};
pub use config::SettingsConfig;
pub use engine::SettingsDb;
pub use error::{Error, Result};
pub use ready::{ReadinessState, RetryPolicy};
pub use replication::Mode;
pub use settings::Settings;
pub use sqlite::SqliteDb;

/// Exchange used when none is configured.
pub const DEFAULT_EXCHANGE: &str = "amsettings";

pub const SETTINGS_TABLE: &str = "settings";

/// Bookkeeping table of the migrations.
pub const VERSION_TABLE: &str = "setting_db_version";
