//! Replication is achieved through a single-writer broadcast model.
//!
//! Every write is published on the exchange. The [`Mode::Master`] node drains
//! the exchange's durable queue as its exclusive consumer, while
//! [`Mode::Slave`] and [`Mode::NoSync`] nodes subscribe to a copy of every
//! message. Each listening node applies the write to its own table.

mod message;
mod pending;

pub use message::{Action, Command, WriteParams};
pub use pending::PendingWrites;

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bus::ListenOptions;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Mode {
    /// Owns the durable queue and serves dumps to joining nodes.
    Master,

    /// Bootstraps from the master's dump, then follows the broadcast.
    Slave,

    /// Like [`Mode::Slave`] without the bootstrap. Never run this in production.
    NoSync,
}

impl Mode {
    /// Whether the node needs a snapshot from a peer before it is ready.
    pub fn pulls_dump(&self) -> bool {
        matches!(self, Mode::Slave)
    }

    /// Whether the node answers snapshot requests once it is ready.
    pub fn serves_dump(&self) -> bool {
        matches!(self, Mode::Master)
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Slave => write!(f, "slave"),
            Self::NoSync => write!(f, "noSync"),
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(Mode::Master),
            "slave" => Ok(Mode::Slave),
            "noSync" => Ok(Mode::NoSync),
            other => Err(Error::Config(format!(
                "Invalid mode \"{other}\". Must be either \"master\", \"slave\" or \"noSync\""
            ))),
        }
    }
}

/// How a node attaches to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Drain the queue. The queue persists while the node is offline.
    Consume { exclusive: bool },

    /// Receive a copy of every message, no queue ownership.
    Subscribe,
}

impl Topology {
    pub fn for_mode(mode: Mode) -> Topology {
        match mode {
            // No other client may sneak messages off the master's queue.
            Mode::Master => Topology::Consume { exclusive: true },
            Mode::Slave | Mode::NoSync => Topology::Subscribe,
        }
    }

    pub fn listen_options(&self, exchange: &str) -> ListenOptions {
        ListenOptions {
            exchange: exchange.to_string(),
            exclusive: matches!(self, Topology::Consume { exclusive: true }),
        }
    }
}

impl Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Consume { .. } => write!(f, "consume"),
            Self::Subscribe => write!(f, "subscribe"),
        }
    }
}
