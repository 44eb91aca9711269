//! Bulk synchronisation of the settings tables between nodes.
//!
//! A node joining as a slave pulls one snapshot from the master before it
//! starts applying replicated writes, so it never has to replay the whole
//! message history. The transport carrying the snapshot is external and is
//! reached through [`DataSync`]; this module only describes the snapshot
//! and produces it by shelling out to a dump utility.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::{Error, Result, SETTINGS_TABLE, VERSION_TABLE};

pub const SQL_CONTENT_TYPE: &str = "application/sql";

/// Channel suffix the dump server listens on, appended to the exchange name.
pub const DUMP_SUFFIX: &str = "_dataDump";

pub fn dump_exchange(exchange: &str) -> String {
    format!("{exchange}{DUMP_SUFFIX}")
}

/// A snapshot of the settings tables as produced by the dump utility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dump {
    pub content_type: String,
    pub body: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl Dump {
    pub fn sql(body: impl Into<Vec<u8>>) -> Self {
        Dump {
            content_type: SQL_CONTENT_TYPE.to_string(),
            body: body.into(),
            created_at: Utc::now(),
        }
    }
}

/// Connection details of a MySQL-compatible database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbConf {
    pub host: Option<String>,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
}

/// An external program whose stdout is a dump of the settings tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpCommand {
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment for the child. Credentials go here rather than in
    /// `args`, which are visible to every user on the host.
    pub envs: BTreeMap<String, String>,
}

impl DumpCommand {
    pub fn new(command: impl Into<String>) -> Self {
        DumpCommand {
            command: command.into(),
            args: Vec::new(),
            envs: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    /// `mysqldump` restricted to the two tables owned by this crate, in a
    /// single consistent transaction with blobs hex encoded.
    pub fn mysqldump(conf: &DbConf) -> Self {
        let mut cmd = DumpCommand::new("mysqldump");
        if let Some(host) = &conf.host {
            cmd = cmd.arg("-h").arg(host);
        }
        cmd = cmd.arg("-u").arg(&conf.user);
        if let Some(password) = &conf.password {
            cmd = cmd.env("MYSQL_PWD", password);
        }
        cmd.arg("--single-transaction")
            .arg("--hex-blob")
            .arg(&conf.database)
            .arg(SETTINGS_TABLE)
            .arg(VERSION_TABLE)
    }

    /// Run the command to completion and capture its stdout.
    pub async fn run(&self) -> Result<Vec<u8>> {
        debug!(command = self.command, args = ?self.args, "Running dump command");
        let output = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.envs)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(Error::Sync(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

/// Something able to produce a snapshot on request.
#[async_trait]
pub trait DumpSource: Send + Sync + 'static {
    async fn dump(&self) -> Result<Dump>;
}

/// Answers bulk sync requests by running a [`DumpCommand`].
#[derive(Debug, Clone)]
pub struct DumpServer {
    command: DumpCommand,
    content_type: String,
}

impl DumpServer {
    pub fn new(command: DumpCommand) -> Self {
        DumpServer {
            command,
            content_type: SQL_CONTENT_TYPE.to_string(),
        }
    }
}

#[async_trait]
impl DumpSource for DumpServer {
    async fn dump(&self) -> Result<Dump> {
        let body = self.command.run().await?;
        info!(bytes = body.len(), "Serving settings dump");
        Ok(Dump {
            content_type: self.content_type.clone(),
            body,
            created_at: Utc::now(),
        })
    }
}

/// Client and server halves of the external bulk sync mechanism.
#[async_trait]
pub trait DataSync: Send + Sync + 'static {
    /// Fetch one snapshot from the server advertising `exchange`.
    async fn pull(&self, exchange: &str) -> Result<Dump>;

    /// Answer snapshot requests on `exchange` until the process exits.
    async fn serve(&self, exchange: &str, source: Arc<dyn DumpSource>) -> Result<()>;
}
