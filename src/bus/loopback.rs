use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AckOutcome, Acker, BusMessage, Delivery, Handler, ListenOptions, Listener, MessageBus};
use crate::sync::{DataSync, Dump, DumpSource};
use crate::{Error, Result};

/// In-process message bus and bulk sync transport.
///
/// Every clone shares the same exchanges, so several coordinators built on
/// clones of one bus behave like nodes attached to the same broker.
#[derive(Clone)]
pub struct LoopbackBus {
    inner: Arc<Inner>,
}

struct Inner {
    connected: AtomicBool,
    exchanges: DashMap<String, Exchange>,
    dump_sources: DashMap<String, Arc<dyn DumpSource>>,
    next_tag: AtomicU64,
}

#[derive(Default)]
struct Exchange {
    consumer: Option<UnboundedSender<Vec<u8>>>,

    /// Messages published while no consumer was attached.
    backlog: VecDeque<Vec<u8>>,

    subscribers: Vec<UnboundedSender<Vec<u8>>>,
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBus {
    pub fn new() -> LoopbackBus {
        LoopbackBus {
            inner: Arc::new(Inner {
                connected: AtomicBool::new(true),
                exchanges: DashMap::new(),
                dump_sources: DashMap::new(),
                next_tag: AtomicU64::new(1),
            }),
        }
    }

    /// Simulate the transport going away or coming back.
    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::SeqCst);
    }

    fn check_connected(&self) -> Result<()> {
        if self.inner.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Transport("loopback bus is disconnected".to_string()))
        }
    }

    /// Messages waiting for a consumer on `exchange`.
    pub fn backlog(&self, exchange: &str) -> usize {
        self.inner
            .exchanges
            .get(exchange)
            .map(|e| e.backlog.len())
            .unwrap_or(0)
    }

    /// Run `handler` for every message arriving on `rx`, one at a time,
    /// until the returned [`Listener`] is dropped or a delivery is requeued.
    fn spawn_listener(
        &self,
        exchange: String,
        tx: UnboundedSender<Vec<u8>>,
        mut rx: UnboundedReceiver<Vec<u8>>,
        handler: Handler,
    ) -> Listener {
        let (listener, mut stop) = Listener::new();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut requeued = None;
            loop {
                let body = tokio::select! {
                    biased;
                    _ = &mut stop => break,
                    body = rx.recv() => match body {
                        Some(body) => body,
                        None => break,
                    },
                };

                let delivery_tag = inner.next_tag.fetch_add(1, Ordering::SeqCst).to_string();
                let (acker, acked) = Acker::new();
                handler(Delivery {
                    body: body.clone(),
                    delivery_tag: delivery_tag.clone(),
                    acker,
                })
                .await;

                match acked.await {
                    Ok(AckOutcome::Acked(None)) => debug!(exchange, delivery_tag, "Delivery acked"),
                    Ok(AckOutcome::Acked(Some(err))) => {
                        warn!(exchange, delivery_tag, err, "Delivery acked with error")
                    }
                    Ok(AckOutcome::Requeued) => {
                        debug!(exchange, delivery_tag, "Delivery requeued");
                        requeued = Some(body);
                        break;
                    }
                    Err(_) => warn!(exchange, delivery_tag, "Delivery was never acked"),
                }
            }
            inner.detach(&exchange, &tx, rx, requeued);
            debug!(exchange, "Listener stopped");
        });
        listener
    }
}

impl Inner {
    /// Remove a listener from its exchange. Whatever a consumer had not
    /// handled yet goes back to the front of the queue, in order.
    fn detach(
        &self,
        exchange: &str,
        tx: &UnboundedSender<Vec<u8>>,
        mut rx: UnboundedReceiver<Vec<u8>>,
        requeued: Option<Vec<u8>>,
    ) {
        let Some(mut state) = self.exchanges.get_mut(exchange) else {
            return;
        };
        rx.close();

        if !state.consumer.as_ref().is_some_and(|c| c.same_channel(tx)) {
            state.subscribers.retain(|s| !s.same_channel(tx));
            return;
        }

        state.consumer = None;
        let mut undelivered: VecDeque<Vec<u8>> = requeued.into_iter().collect();
        while let Ok(body) = rx.try_recv() {
            undelivered.push_back(body);
        }
        debug!(exchange, requeued = undelivered.len(), "Consumer detached");
        undelivered.append(&mut state.backlog);
        state.backlog = undelivered;
    }
}

#[async_trait]
impl MessageBus for LoopbackBus {
    async fn ready(&self) -> Result<()> {
        self.check_connected()
    }

    async fn consume(&self, options: ListenOptions, handler: Handler) -> Result<Listener> {
        self.check_connected()?;
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut exchange = self
                .inner
                .exchanges
                .entry(options.exchange.clone())
                .or_default();
            if exchange.consumer.as_ref().is_some_and(|c| !c.is_closed()) {
                return Err(Error::Transport(format!(
                    "exchange {} already has an exclusive consumer",
                    options.exchange
                )));
            }

            debug!(
                exchange = options.exchange,
                backlog = exchange.backlog.len(),
                "Attaching consumer"
            );
            while let Some(body) = exchange.backlog.pop_front() {
                // The receiver is still in scope, this cannot fail.
                let _ = tx.send(body);
            }
            exchange.consumer = Some(tx.clone());
        }
        Ok(self.spawn_listener(options.exchange, tx, rx, handler))
    }

    async fn subscribe(&self, options: ListenOptions, handler: Handler) -> Result<Listener> {
        self.check_connected()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .exchanges
            .entry(options.exchange.clone())
            .or_default()
            .subscribers
            .push(tx.clone());
        debug!(exchange = options.exchange, "Attaching subscriber");
        Ok(self.spawn_listener(options.exchange, tx, rx, handler))
    }

    async fn send(&self, message: &BusMessage, exchange: &str) -> Result<Uuid> {
        self.check_connected()?;
        let body = message.encode()?;

        let mut state = self.inner.exchanges.entry(exchange.to_string()).or_default();
        state.subscribers.retain(|s| s.send(body.clone()).is_ok());

        let undelivered = match &state.consumer {
            Some(consumer) => consumer.send(body).err().map(|e| e.0),
            None => Some(body),
        };
        if let Some(body) = undelivered {
            state.consumer = None;
            state.backlog.push_back(body);
        }

        debug!(exchange, action = message.action, uuid = %message.uuid, "Published message");
        Ok(message.uuid)
    }
}

#[async_trait]
impl DataSync for LoopbackBus {
    async fn pull(&self, exchange: &str) -> Result<Dump> {
        self.check_connected()?;
        let source = self
            .inner
            .dump_sources
            .get(exchange)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::Sync(format!("no dump server on {exchange}")))?;
        source.dump().await
    }

    async fn serve(&self, exchange: &str, source: Arc<dyn DumpSource>) -> Result<()> {
        self.check_connected()?;
        if self
            .inner
            .dump_sources
            .insert(exchange.to_string(), source)
            .is_some()
        {
            warn!(exchange, "Replaced an existing dump server");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::FutureExt;
    use std::time::Duration;

    fn message(action: &str) -> BusMessage {
        BusMessage {
            action: action.to_string(),
            params: Vec::new(),
            uuid: Uuid::new_v4(),
        }
    }

    /// Handler forwarding every decoded action and acking it.
    fn recorder() -> (Handler, UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Handler = Arc::new(move |delivery: Delivery| {
            let tx = tx.clone();
            async move {
                delivery.acker.ack(None);
                if let Ok(msg) = BusMessage::decode(&delivery.body) {
                    let _ = tx.send(msg.action);
                }
            }
            .boxed()
        });
        (handler, rx)
    }

    async fn next(rx: &mut UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("listener stopped")
    }

    fn opts(exclusive: bool) -> ListenOptions {
        ListenOptions {
            exchange: "test".to_string(),
            exclusive,
        }
    }

    #[tokio::test]
    async fn queue_persists_until_consumer_attaches() -> Result<()> {
        let bus = LoopbackBus::new();
        bus.send(&message("first"), "test").await?;
        bus.send(&message("second"), "test").await?;
        assert_eq!(bus.backlog("test"), 2);

        let (handler, mut rx) = recorder();
        let _listener = bus.consume(opts(true), handler).await?;
        assert_eq!(next(&mut rx).await, "first");
        assert_eq!(next(&mut rx).await, "second");
        assert_eq!(bus.backlog("test"), 0);
        Ok(())
    }

    #[tokio::test]
    async fn only_one_exclusive_consumer() -> Result<()> {
        let bus = LoopbackBus::new();
        let (one, _rx_one) = recorder();
        let (two, _rx_two) = recorder();
        let _one = bus.consume(opts(true), one).await?;
        assert!(matches!(
            bus.consume(opts(true), two).await,
            Err(Error::Transport(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn subscribers_all_receive() -> Result<()> {
        let bus = LoopbackBus::new();
        let (one, mut rx_one) = recorder();
        let (two, mut rx_two) = recorder();
        let (queue, mut rx_queue) = recorder();
        let _one = bus.subscribe(opts(false), one).await?;
        let _two = bus.subscribe(opts(false), two).await?;
        let _queue = bus.consume(opts(true), queue).await?;

        bus.send(&message("broadcast"), "test").await?;
        assert_eq!(next(&mut rx_one).await, "broadcast");
        assert_eq!(next(&mut rx_two).await, "broadcast");
        assert_eq!(next(&mut rx_queue).await, "broadcast");
        Ok(())
    }

    async fn backlog_of(bus: &LoopbackBus, expected: usize) {
        for _ in 0..100 {
            if bus.backlog("test") == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("backlog never reached {expected}");
    }

    #[tokio::test]
    async fn dropped_consumer_leaves_the_queue() -> Result<()> {
        let bus = LoopbackBus::new();
        let (first, _rx_first) = recorder();
        let listener = bus.consume(opts(true), first).await?;
        drop(listener);

        bus.send(&message("while away"), "test").await?;
        backlog_of(&bus, 1).await;

        let (second, mut rx_second) = recorder();
        let _listener = bus.consume(opts(true), second).await?;
        assert_eq!(next(&mut rx_second).await, "while away");
        Ok(())
    }

    #[tokio::test]
    async fn requeued_delivery_goes_back_first() -> Result<()> {
        let bus = LoopbackBus::new();
        let refuse: Handler = Arc::new(|delivery: Delivery| {
            async move { delivery.acker.requeue() }.boxed()
        });
        let _refusing = bus.consume(opts(true), refuse).await?;

        bus.send(&message("first"), "test").await?;
        backlog_of(&bus, 1).await;
        bus.send(&message("second"), "test").await?;
        assert_eq!(bus.backlog("test"), 2);

        let (handler, mut rx) = recorder();
        let _listener = bus.consume(opts(true), handler).await?;
        assert_eq!(next(&mut rx).await, "first");
        assert_eq!(next(&mut rx).await, "second");
        Ok(())
    }

    #[tokio::test]
    async fn dropped_subscriber_stops_receiving() -> Result<()> {
        let bus = LoopbackBus::new();
        let (one, mut rx_one) = recorder();
        let (two, mut rx_two) = recorder();
        let one_listener = bus.subscribe(opts(false), one).await?;
        let _two = bus.subscribe(opts(false), two).await?;
        drop(one_listener);

        // The listener task drops its handler, closing the recorder.
        let closed = tokio::time::timeout(Duration::from_secs(1), rx_one.recv()).await;
        assert!(matches!(closed, Ok(None)));

        bus.send(&message("broadcast"), "test").await?;
        assert_eq!(next(&mut rx_two).await, "broadcast");
        assert_eq!(bus.backlog("test"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn disconnected_bus_refuses_work() {
        let bus = LoopbackBus::new();
        bus.set_connected(false);
        assert!(matches!(bus.ready().await, Err(Error::Transport(_))));
        assert!(matches!(
            bus.send(&message("lost"), "test").await,
            Err(Error::Transport(_))
        ));

        bus.set_connected(true);
        assert!(bus.ready().await.is_ok());
    }

    #[tokio::test]
    async fn pull_without_server() {
        let bus = LoopbackBus::new();
        assert!(matches!(bus.pull("nobody").await, Err(Error::Sync(_))));
    }
}
