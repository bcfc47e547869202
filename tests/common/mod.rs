//! In-process broker fake implementing the transport seam, plus
//! introspection hooks the scenarios assert against.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use warren::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, Delivery, DeliveryStream, ExchangeKind,
    PublishProperties, QueueOptions,
};
use warren::packet::ResponsePacket;

/// How the fake responds to a published request.
#[derive(Clone, Default)]
pub enum Behavior {
    /// Never reply.
    #[default]
    Withhold,
    /// Wrap the published body into a 200 response and publish it to the
    /// request's `reply_to`, optionally after a delay.
    Echo {
        /// Delay before the response lands on the callback queue.
        delay: Option<Duration>,
    },
    /// Reply with raw bytes that need not decode as a response packet.
    Raw(Vec<u8>),
}

/// A recorded publish.
#[derive(Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: PublishProperties,
    pub body: Vec<u8>,
}

/// Broker-wide state shared by connections and channels.
#[derive(Default)]
struct State {
    /// Consumer feeds by queue name.
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<Delivery>>>,
    /// Every publish, in order.
    published: Mutex<Vec<PublishedMessage>>,
    /// Every acked delivery tag, in order.
    acked: Mutex<Vec<u64>>,
    /// Declared exchange names, one entry per declare call.
    declared_exchanges: Mutex<Vec<String>>,
    /// Declared queues with their options, one entry per declare call.
    declared_queues: Mutex<Vec<(String, QueueOptions)>>,
    /// Open flags of all connections ever handed out.
    connections: Mutex<Vec<Arc<AtomicBool>>>,
    /// Current response behavior.
    behavior: Mutex<Behavior>,
    /// When set, `connect` fails.
    refuse_connect: AtomicBool,
    /// Number of successful connects.
    connect_count: AtomicUsize,
    /// Delivery tag source.
    next_tag: AtomicU64,
}

/// The fake broker handed to `Client::with_parts`. Clones share state.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<State>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the response behavior for subsequent publishes.
    pub fn behave(&self, behavior: Behavior) {
        *self.state.behavior.lock().unwrap() = behavior;
    }

    /// When `refuse` is set, connection attempts fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Simulate a broker-side connection loss: every open connection is
    /// closed and every consumer stream ends.
    pub fn kill_connections(&self) {
        for open in self.state.connections.lock().unwrap().iter() {
            open.store(false, Ordering::SeqCst);
        }
        self.state.queues.lock().unwrap().clear();
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.published.lock().unwrap().clone()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.state.acked.lock().unwrap().clone()
    }

    pub fn declared_exchanges(&self) -> Vec<String> {
        self.state.declared_exchanges.lock().unwrap().clone()
    }

    pub fn declared_queues(&self) -> Vec<(String, QueueOptions)> {
        self.state.declared_queues.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.connect_count.load(Ordering::SeqCst)
    }

    /// Whether some consumer is subscribed to `queue`.
    pub fn has_consumer_on(&self, queue: &str) -> bool {
        self.state.queues.lock().unwrap().contains_key(queue)
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        if self.state.refuse_connect.load(Ordering::SeqCst) {
            return Err(BrokerError::new(anyhow::format_err!("connection refused")));
        }
        let open = Arc::new(AtomicBool::new(true));
        self.state.connections.lock().unwrap().push(Arc::clone(&open));
        self.state.connect_count.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeConnection {
            state: Arc::clone(&self.state),
            open,
        }))
    }
}

/// One fake connection; channels share its open flag.
struct FakeConnection {
    state: Arc<State>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::new(anyhow::format_err!("connection closed")));
        }
        Ok(Arc::new(FakeChannel {
            state: Arc::clone(&self.state),
            conn_open: Arc::clone(&self.open),
            open: AtomicBool::new(true),
            consuming: Mutex::new(None),
        }))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// One fake channel.
struct FakeChannel {
    state: Arc<State>,
    conn_open: Arc<AtomicBool>,
    open: AtomicBool,
    /// Queue this channel consumes, so closing the channel ends the stream.
    consuming: Mutex<Option<String>>,
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn exchange_declare(
        &self,
        name: &str,
        _kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), BrokerError> {
        self.state
            .declared_exchanges
            .lock()
            .unwrap()
            .push(name.to_string());
        Ok(())
    }

    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.state
            .declared_queues
            .lock()
            .unwrap()
            .push((name.to_string(), options));
        Ok(())
    }

    async fn queue_bind(
        &self,
        _queue: &str,
        _exchange: &str,
        _routing_key: &str,
    ) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: PublishProperties,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        if !self.is_usable() {
            return Err(BrokerError::new(anyhow::format_err!("channel closed")));
        }
        self.state.published.lock().unwrap().push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: properties.clone(),
            body: body.to_vec(),
        });

        let behavior = self.state.behavior.lock().unwrap().clone();
        let (reply_bytes, delay) = match behavior {
            Behavior::Withhold => return Ok(()),
            Behavior::Echo { delay } => {
                let bytes = ResponsePacket::new(200)
                    .with_body(body.to_vec())
                    .serialize()
                    .map_err(BrokerError::new)?;
                (bytes, delay)
            }
            Behavior::Raw(bytes) => (bytes, None),
        };

        let delivery = Delivery {
            correlation_id: Some(properties.correlation_id),
            body: reply_bytes,
            delivery_tag: self.state.next_tag.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let state = Arc::clone(&self.state);
        let reply_to = properties.reply_to;
        let respond = move || {
            let sender = state.queues.lock().unwrap().get(&reply_to).cloned();
            if let Some(sender) = sender {
                let _ = sender.send(delivery);
            }
        };
        match delay {
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    respond();
                });
            }
            None => respond(),
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        if !self.is_usable() {
            return Err(BrokerError::new(anyhow::format_err!("channel closed")));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state
            .queues
            .lock()
            .unwrap()
            .insert(queue.to_string(), sender);
        *self.consuming.lock().unwrap() = Some(queue.to_string());

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (Ok(delivery), receiver))
        });
        Ok(Box::pin(stream))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.state.acked.lock().unwrap().push(delivery_tag);
        Ok(())
    }

    fn is_usable(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.conn_open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        // Dropping the sender ends this channel's consumer stream.
        if let Some(queue) = self.consuming.lock().unwrap().take() {
            self.state.queues.lock().unwrap().remove(&queue);
        }
    }
}
