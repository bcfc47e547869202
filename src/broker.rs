//! Transport seam between the client core and the AMQP wire.
//!
//! The core only ever talks to these traits. Production uses the
//! lapin-backed [`crate::amqp::AmqpBroker`]; tests substitute an
//! in-process fake.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

/// Exchange kinds the mapper can pick from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Route on an exact routing-key match.
    Direct,
    /// Route to every bound queue.
    Fanout,
    /// Route on routing-key patterns.
    Topic,
    /// Route on header matches.
    Headers,
}

/// Declaration flags for a queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Restrict the queue to the declaring connection.
    pub exclusive: bool,
    /// Delete the queue once its last consumer goes away.
    pub auto_delete: bool,
    /// Server-side `x-expires` in milliseconds.
    pub expires_ms: Option<u32>,
}

/// Message properties attached to a request publish.
#[derive(Debug, Clone)]
pub struct PublishProperties {
    /// Correlation ID echoed back on the response.
    pub correlation_id: String,
    /// Callback queue the responder publishes to.
    pub reply_to: String,
    /// Per-message TTL in milliseconds, when the message is expirable.
    pub expiration_ms: Option<u64>,
    /// Publish timestamp, seconds since the epoch.
    pub timestamp: u64,
}

/// One message taken off the callback queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Correlation ID of the originating request, if the responder set one.
    pub correlation_id: Option<String>,
    /// Raw response bytes.
    pub body: Vec<u8>,
    /// Broker delivery tag, used to ack.
    pub delivery_tag: u64,
}

/// Stream of deliveries produced by [`BrokerChannel::consume`]. Ends when
/// the channel or connection closes.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Connection factory. One per client; `connect` is called on startup and
/// again after every detected connection loss.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open a fresh connection to the broker.
    ///
    /// # Errors
    ///
    /// When no connection can be established.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// A live broker connection, multiplexing any number of channels.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new channel on this connection.
    ///
    /// # Errors
    ///
    /// When the connection is no longer usable.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Whether the connection is still open.
    fn is_open(&self) -> bool;

    /// Close the connection. Best effort; errors are logged, not surfaced.
    async fn close(&self);
}

/// A broker channel. Channels are not safe for concurrent publishing;
/// the pool hands them out one caller at a time.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare an exchange.
    ///
    /// # Errors
    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError>;

    /// Declare a queue.
    ///
    /// # Errors
    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError>;

    /// Bind a queue to an exchange under a routing key.
    ///
    /// # Errors
    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publish `body` to `(exchange, routing_key)` with `properties`.
    ///
    /// # Errors
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: PublishProperties,
        body: &[u8],
    ) -> Result<(), BrokerError>;

    /// Begin consuming `queue` in non-auto-ack mode.
    ///
    /// # Errors
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError>;

    /// Positively acknowledge a delivery.
    ///
    /// # Errors
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Whether the channel can still carry traffic.
    fn is_usable(&self) -> bool;

    /// Close the channel. Best effort; errors are logged, not surfaced.
    async fn close(&self);
}

/// Errors raised by a broker implementation.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct BrokerError(#[from] anyhow::Error);

impl BrokerError {
    /// Wrap any error as a [`BrokerError`].
    #[must_use]
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(err.into())
    }

    /// Take the underlying cause.
    #[must_use]
    pub fn into_inner(self) -> anyhow::Error {
        self.0
    }
}
