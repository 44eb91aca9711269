use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error, info, warn, Instrument, Span};
use uuid::Uuid;

use crate::bus::{Delivery, Handler, Listener, LoopbackBus, MessageBus};
use crate::config::SettingsConfig;
use crate::engine::SettingsDb;
use crate::migration::MigrationSet;
use crate::ready::{retry, ReadinessGate, ReadinessState, RetryPolicy};
use crate::replication::{Command, Mode, PendingWrites, Topology, WriteParams};
use crate::sync::{dump_exchange, DataSync, DumpCommand, DumpServer};
use crate::{Error, Result, VERSION_TABLE};

/// A replicated settings table.
///
/// Reads go straight to the local table. Writes are published on the
/// exchange and applied by every node listening to it, including this one,
/// and [`Settings::set`] returns once the local apply has completed.
#[derive(Clone)]
pub struct Settings<D> {
    inner: Arc<Inner<D>>,
}

struct Inner<D> {
    db: D,
    exchange: String,
    mode: Mode,
    topology: Topology,
    bus: Arc<dyn MessageBus>,
    data_sync: Arc<dyn DataSync>,
    gate: ReadinessGate,
    pending: PendingWrites,
    write_timeout: Duration,
    retry: RetryPolicy,
    migrations: MigrationSet,
    dump_command: Option<DumpCommand>,
    span: Span,

    /// Detaches this node from the exchange once the last handle is dropped.
    listener: OnceLock<Listener>,
}

impl<D> Settings<D>
where
    D: SettingsDb,
{
    /// Attach to the exchange and bring the node to readiness.
    pub async fn start(config: SettingsConfig<D>) -> Result<Settings<D>> {
        let mode = config.mode.unwrap_or(Mode::NoSync);
        let span = tracing::info_span!("settings", node = %config.name, mode = %mode);
        span.in_scope(|| {
            if config.mode.is_none() {
                warn!("No mode configured, defaulting to noSync");
            }
            if mode == Mode::NoSync {
                warn!("Mode is noSync, never run this mode in production!");
            }
        });

        let (bus, data_sync) = match (config.bus, config.data_sync) {
            (Some(bus), Some(data_sync)) => (bus, data_sync),
            (bus, data_sync) => {
                let loopback = Arc::new(LoopbackBus::new());
                (
                    bus.unwrap_or_else(|| loopback.clone() as Arc<dyn MessageBus>),
                    data_sync.unwrap_or_else(|| loopback as Arc<dyn DataSync>),
                )
            }
        };

        let settings = Settings {
            inner: Arc::new(Inner {
                db: config.db,
                exchange: config.exchange_name,
                mode,
                topology: Topology::for_mode(mode),
                bus,
                data_sync,
                gate: ReadinessGate::new(),
                pending: PendingWrites::new(),
                write_timeout: config.write_timeout,
                retry: config.retry,
                migrations: config.migrations,
                dump_command: config.dump_command,
                span,
                listener: OnceLock::new(),
            }),
        };

        settings.listen().instrument(settings.span()).await?;
        settings.ready().await?;
        settings.serve_dump().instrument(settings.span()).await;
        Ok(settings)
    }

    fn span(&self) -> Span {
        self.inner.span.clone()
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    pub fn exchange_name(&self) -> &str {
        &self.inner.exchange
    }

    pub fn state(&self) -> ReadinessState {
        self.inner.gate.state()
    }

    /// Writes published by this node still waiting for completion.
    pub fn pending_writes(&self) -> usize {
        self.inner.pending.len()
    }

    /// Wait for the one-time initialization of this node, running it if needed.
    pub async fn ready(&self) -> Result<()> {
        let this = self.clone();
        let span = self.span();
        self.inner
            .gate
            .ensure_ready(move || async move { this.initialize().await }.instrument(span))
            .await
    }

    /// Retrieve the value of a setting.
    /// If the setting does not exist, then [`None`] is returned.
    pub async fn get(&self, name: String) -> Result<Option<String>> {
        self.inner.db.get(name).instrument(self.span()).await
    }

    /// Set the value of a setting on every node.
    pub async fn set(&self, name: String, value: String) -> Result<()> {
        self.write(name, value).instrument(self.span()).await
    }

    async fn write(&self, name: String, value: String) -> Result<()> {
        self.ready().await?;
        let inner = &self.inner;

        if inner.db.get(name.clone()).await?.as_deref() == Some(value.as_str()) {
            debug!(name, "Value unchanged, skipping write");
            return Ok(());
        }

        let uuid = Uuid::new_v4();
        let message = Command::WriteToDb(WriteParams { name, value }).into_message(uuid)?;
        let completion = inner.pending.register(uuid);
        if let Err(e) = inner.bus.send(&message, &inner.exchange).await {
            inner.pending.cancel(&uuid);
            return Err(Error::Write(format!("unable to publish: {e}")));
        }
        debug!(%uuid, "Published write, waiting for completion");

        match tokio::time::timeout(inner.write_timeout, completion).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Write(
                "completion was dropped before the write finished".to_string(),
            )),
            Err(_) => {
                inner.pending.cancel(&uuid);
                warn!(%uuid, timeout = ?inner.write_timeout, "Write never completed");
                Err(Error::Timeout(inner.write_timeout))
            }
        }
    }

    async fn listen(&self) -> Result<()> {
        let topology = self.inner.topology;
        let options = topology.listen_options(&self.inner.exchange);
        info!(listen_method = %topology, exchange = options.exchange, "Listening to queue");

        // The bus keeps the handler alive, it must not keep the coordinator alive.
        let weak: Weak<Inner<D>> = Arc::downgrade(&self.inner);
        let handler: Handler = Arc::new(move |delivery: Delivery| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => {
                        let span = inner.span.clone();
                        Settings { inner }.handle(delivery).instrument(span).await
                    }
                    // Leave the message for whoever listens next.
                    None => delivery.acker.requeue(),
                }
            }
            .boxed()
        });

        let listener = match topology {
            Topology::Consume { .. } => self.inner.bus.consume(options, handler).await?,
            Topology::Subscribe => self.inner.bus.subscribe(options, handler).await?,
        };
        if self.inner.listener.set(listener).is_err() {
            warn!("Already listening to the exchange");
        }
        Ok(())
    }

    /// Handle one delivery from the exchange.
    async fn handle(&self, delivery: Delivery) {
        let Delivery {
            body,
            delivery_tag,
            acker,
        } = delivery;

        let ready = self.ready().await;
        // Ack first, anything going wrong from here on is logged, not redelivered.
        acker.ack(ready.as_ref().err().map(|e| e.to_string()));
        if let Err(e) = ready {
            error!(delivery_tag, err = %e, "Not ready, dropping message");
            return;
        }

        let (message, command) = match Command::decode(&body) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(delivery_tag, err = %e, "Dropping message");
                return;
            }
        };

        match command {
            Command::WriteToDb(params) => self.write_to_db(params, message.uuid).await,
        }
    }

    async fn write_to_db(&self, params: WriteParams, uuid: Uuid) {
        let WriteParams { name, value } = params;
        debug!(name, %uuid, "Writing setting");
        let result = self
            .inner
            .db
            .replace(name.clone(), value)
            .await
            .map_err(|e| {
                error!(name, err = %e, "Unable to write setting");
                Error::Write(e.to_string())
            });
        self.inner.pending.complete(uuid, result);
    }

    /// The one-time startup sequence: bus, bootstrap, migrations.
    async fn initialize(&self) -> Result<()> {
        let inner = &self.inner;

        debug!("Waiting for message bus");
        retry(inner.retry, "message bus", || inner.bus.ready()).await?;

        if inner.mode.pulls_dump() {
            let exchange = dump_exchange(&inner.exchange);
            info!(exchange, "Pulling settings dump");
            let dump = retry(inner.retry, "dump server", || {
                inner.data_sync.pull(&exchange)
            })
            .await?;
            inner.db.restore(dump).await?;
        }

        debug!("Running migrations");
        let version = inner
            .db
            .migrate(VERSION_TABLE, inner.migrations.clone())
            .await
            .map_err(|e| match e {
                Error::Migration(_) => e,
                other => Error::Migration(other.to_string()),
            })?;
        info!(version, "Database migrated");
        Ok(())
    }

    /// Offer this node's table to bootstrapping slaves, once it is ready.
    async fn serve_dump(&self) {
        let inner = &self.inner;
        if !inner.mode.serves_dump() {
            debug!("Not running dump server");
            return;
        }
        let Some(command) = inner
            .dump_command
            .clone()
            .or_else(|| inner.db.dump_command())
        else {
            warn!("Database cannot be dumped, not running dump server");
            return;
        };

        let exchange = dump_exchange(&inner.exchange);
        info!(exchange, command = command.command, "Starting dump server");
        if let Err(e) = inner
            .data_sync
            .serve(&exchange, Arc::new(DumpServer::new(command)))
            .await
        {
            error!(exchange, err = %e, "Unable to start dump server");
        }
    }
}
