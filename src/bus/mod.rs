//! Message bus contract.
//!
//! The coordinator never talks to a broker directly. Everything it needs,
//! readiness, exclusive consumption, broadcast subscription and publishing,
//! goes through [`MessageBus`]. [`LoopbackBus`] is the in-process
//! implementation used when no external bus is configured.

mod loopback;

pub use loopback::LoopbackBus;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::Result;

/// Envelope of every message published on an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Name of the handler the message is meant for.
    pub action: String,

    /// Handler specific payload, encoded by the sender.
    pub params: Vec<u8>,

    /// Correlation identifier linking the message to its completion.
    pub uuid: Uuid,
}

impl BusMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(body: &[u8]) -> Result<BusMessage> {
        Ok(bincode::deserialize(body)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenOptions {
    pub exchange: String,

    /// Only meaningful for [`MessageBus::consume`]: no other consumer may
    /// drain the queue while this one is attached.
    pub exclusive: bool,
}

/// One message handed to a listener.
#[derive(Debug)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub delivery_tag: String,
    pub acker: Acker,
}

/// What became of a [`Delivery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Handled, `Some` carrying an error message.
    Acked(Option<String>),

    /// Not handled. The message goes back on the queue and the listener
    /// detaches.
    Requeued,
}

/// Acknowledges a [`Delivery`]. Consumed on use, so a delivery is acked at
/// most once.
#[derive(Debug)]
pub struct Acker(oneshot::Sender<AckOutcome>);

impl Acker {
    pub fn new() -> (Acker, oneshot::Receiver<AckOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Acker(tx), rx)
    }

    /// Report the outcome of the delivery, `Some` carrying an error message.
    pub fn ack(self, err: Option<String>) {
        // The bus may have stopped caring about the outcome.
        let _ = self.0.send(AckOutcome::Acked(err));
    }

    /// Hand the delivery back to the bus unhandled.
    pub fn requeue(self) {
        let _ = self.0.send(AckOutcome::Requeued);
    }
}

/// Keeps a listener attached to its exchange, dropping it detaches the
/// listener.
#[derive(Debug)]
pub struct Listener {
    _stop: oneshot::Sender<()>,
}

impl Listener {
    /// The receiver resolves once the listener is dropped.
    pub fn new() -> (Listener, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Listener { _stop: tx }, rx)
    }
}

pub type Handler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Resolves once the transport is connected.
    async fn ready(&self) -> Result<()>;

    /// Drain the queue of an exchange until the returned [`Listener`] is
    /// dropped. The queue outlives the consumer.
    async fn consume(&self, options: ListenOptions, handler: Handler) -> Result<Listener>;

    /// Receive a copy of every message published on an exchange from now on,
    /// until the returned [`Listener`] is dropped.
    async fn subscribe(&self, options: ListenOptions, handler: Handler) -> Result<Listener>;

    /// Publish a message, returning its correlation identifier.
    async fn send(&self, message: &BusMessage, exchange: &str) -> Result<Uuid>;
}
