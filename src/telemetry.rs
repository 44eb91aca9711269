use std::str::FromStr;

use tracing::level_filters::LevelFilter;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;

/// Log to stderr at `level` for as long as the returned guard lives.
///
/// The subscriber is installed as the thread default rather than globally,
/// so tests and embedding applications keep control of their own logging.
pub fn setup_logging(level: &str) -> anyhow::Result<DefaultGuard> {
    let level = LevelFilter::from_str(level)?;
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let subscriber = tracing_subscriber::registry().with(level).with(layer);
    Ok(tracing::subscriber::set_default(subscriber))
}
