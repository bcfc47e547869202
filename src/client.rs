//! Main [`Client`] implementation: the request engine and the public
//! configuration surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::prelude::*;
use crate::amqp::AmqpBroker;
use crate::broker::{Broker, PublishProperties};
use crate::error::{ConfigError, SendError};
use crate::mapper::{DirectMapper, MessageMapper};
use crate::options::TIMEOUT_INFINITE;
use crate::packet::{HeaderMap, Method, RequestPacket, ResponsePacket};
use crate::registry::{Outcome, PendingRequests, Waiter};
use crate::supervisor::Supervisor;
use crate::topology::{self, ExchangeDescriptor};

/// Per-request timeout used when neither the client nor the request
/// overrides it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(70);

/// Configuration that freezes at the first send.
struct Config {
    /// Base URI relative request URIs resolve against.
    base_uri: Option<Url>,
    /// Timeout applied when a request carries no override.
    default_timeout: Duration,
    /// Headers merged into every request without overwriting caller-set
    /// names.
    default_headers: HeaderMap,
}

/// RPC client tunneling HTTP-shaped exchanges over a message broker.
///
/// A request is serialized, published to the request exchange with a
/// routing key from the [`MessageMapper`], and correlated back from the
/// client's private callback queue. The call resolves with whichever
/// fires first: the response, the timeout, cancellation or disposal.
///
/// Connecting is lazy: the first send establishes the connection and the
/// callback consumer, and later sends re-establish both when either has
/// died. Cloneable and fully thread-safe; any number of sends may run
/// concurrently on one instance.
#[derive(Clone)]
pub struct Client {
    /// Connection, pool and consumer owner.
    supervisor: Arc<Supervisor>,
    /// In-flight waiters by correlation ID.
    registry: Arc<PendingRequests>,
    /// Request-to-topology mapping policy.
    mapper: Arc<dyn MessageMapper>,
    /// Topology the client publishes into.
    descriptor: ExchangeDescriptor,
    /// Pre-start configuration, frozen once `started`.
    config: Arc<Mutex<Config>>,
    /// Set on the first send that passes its preconditions.
    started: Arc<AtomicBool>,
}

impl Client {
    /// Client for `descriptor` over a real AMQP broker, with the default
    /// mapping policy.
    #[must_use]
    pub fn new(descriptor: ExchangeDescriptor) -> Self {
        let connection_name = format!("warren.{}", descriptor.service_name);
        let broker = Arc::new(AmqpBroker::new(descriptor.amqp_uri.clone(), connection_name));
        Self::with_parts(descriptor, broker, Arc::new(DirectMapper))
    }

    /// Client over an explicit broker factory and mapper. This is the
    /// seam tests use to substitute an in-process broker.
    #[must_use]
    pub fn with_parts(
        descriptor: ExchangeDescriptor,
        broker: Arc<dyn Broker>,
        mapper: Arc<dyn MessageMapper>,
    ) -> Self {
        let client_id = topology::random_id();
        let registry = Arc::new(PendingRequests::new());
        let supervisor = Arc::new(Supervisor::new(
            broker,
            descriptor.clone(),
            &client_id,
            Arc::clone(&registry),
        ));
        Self {
            supervisor,
            registry,
            mapper,
            descriptor,
            config: Arc::new(Mutex::new(Config {
                base_uri: None,
                default_timeout: DEFAULT_TIMEOUT,
                default_headers: HeaderMap::new(),
            })),
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set the base URI relative request URIs resolve against.
    ///
    /// # Errors
    ///
    /// See [`ConfigError`]: configuration is frozen after the first send.
    pub fn set_base_uri(&self, uri: impl AsRef<str>) -> Result<(), ConfigError> {
        self.config_mutable()?;
        let parsed =
            Url::parse(uri.as_ref()).map_err(|err| ConfigError::InvalidBaseUri(err.into()))?;
        self.lock_config().base_uri = Some(parsed);
        Ok(())
    }

    /// Set the default per-request timeout.
    ///
    /// # Errors
    ///
    /// See [`ConfigError`]: configuration is frozen after the first send.
    pub fn set_default_timeout(&self, timeout: Duration) -> Result<(), ConfigError> {
        self.config_mutable()?;
        self.lock_config().default_timeout = timeout;
        Ok(())
    }

    /// Add a header merged into every request that does not set it itself.
    ///
    /// # Errors
    ///
    /// See [`ConfigError`]: configuration is frozen after the first send.
    pub fn add_default_header(
        &self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ConfigError> {
        self.config_mutable()?;
        self.lock_config().default_headers.append(name, value);
        Ok(())
    }

    /// The configured base URI, if any.
    #[must_use]
    pub fn base_uri(&self) -> Option<Url> {
        self.lock_config().base_uri.clone()
    }

    /// The default per-request timeout.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.lock_config().default_timeout
    }

    /// Send `request` and await its response.
    ///
    /// # Errors
    ///
    /// See [`SendError`].
    pub async fn send(&self, request: RequestPacket) -> Result<ResponsePacket, SendError> {
        // A fresh token that nobody cancels.
        self.send_with_cancel(request, CancellationToken::new()).await
    }

    /// Send `request`; `cancel` fails the call with [`SendError::Canceled`]
    /// when triggered. The published message is not recalled.
    ///
    /// # Errors
    ///
    /// See [`SendError`].
    pub async fn send_with_cancel(
        &self,
        mut request: RequestPacket,
        cancel: CancellationToken,
    ) -> Result<ResponsePacket, SendError> {
        let timeout = self.prepare(&mut request)?;
        let body = request
            .serialize()
            .map_err(|err| SendError::InvalidArgument(err.into()))?;
        if self.supervisor.is_disposed() {
            return Err(SendError::Disposed);
        }

        self.supervisor.ensure_started().await?;

        let correlation_id = topology::random_id();
        let routing_key = self
            .mapper
            .routing_key(&request)
            .unwrap_or_else(|| self.descriptor.default_routing_key());
        let properties = self.publish_properties(&correlation_id, timeout, &request);

        // Fire-and-forget: nothing to wait for once the publish is out.
        if timeout == Duration::ZERO {
            self.publish(&routing_key, properties, &body).await?;
            debug!("fire-and-forget request {correlation_id} published");
            return Ok(ResponsePacket::ok_empty());
        }

        let mut receiver = self.register_waiter(&correlation_id, timeout, &cancel)?;

        if self.supervisor.is_disposed() {
            // Disposal raced the registration and its sweep may have
            // missed this waiter.
            self.registry.discard(&correlation_id);
            return Err(SendError::Disposed);
        }
        if let Err(err) = self.publish(&routing_key, properties, &body).await {
            self.registry.discard(&correlation_id);
            // Disposal or a timer may have beaten the failing publish to a
            // terminal outcome; that outcome wins.
            return match receiver.try_recv() {
                Ok(outcome) => outcome,
                Err(_) => Err(err),
            };
        }

        match receiver.await {
            Ok(outcome) => outcome,
            // The slot was dropped without an outcome; only disposal tears
            // waiters down like that.
            Err(_) => Err(SendError::Disposed),
        }
    }

    /// Shorthand for a bodiless GET.
    ///
    /// # Errors
    pub async fn get(&self, uri: impl Into<String>) -> Result<ResponsePacket, SendError> {
        self.send(RequestPacket::new(Method::Get, uri)).await
    }

    /// Shorthand for a bodiless HEAD.
    ///
    /// # Errors
    pub async fn head(&self, uri: impl Into<String>) -> Result<ResponsePacket, SendError> {
        self.send(RequestPacket::new(Method::Head, uri)).await
    }

    /// Shorthand for a POST with `body`.
    ///
    /// # Errors
    pub async fn post(
        &self,
        uri: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Result<ResponsePacket, SendError> {
        self.send(RequestPacket::new(Method::Post, uri).with_body(body))
            .await
    }

    /// Shorthand for a PUT with `body`.
    ///
    /// # Errors
    pub async fn put(
        &self,
        uri: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Result<ResponsePacket, SendError> {
        self.send(RequestPacket::new(Method::Put, uri).with_body(body))
            .await
    }

    /// Shorthand for a bodiless DELETE.
    ///
    /// # Errors
    pub async fn delete(&self, uri: impl Into<String>) -> Result<ResponsePacket, SendError> {
        self.send(RequestPacket::new(Method::Delete, uri)).await
    }

    /// Shorthand for a PATCH with `body`.
    ///
    /// # Errors
    pub async fn patch(
        &self,
        uri: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Result<ResponsePacket, SendError> {
        self.send(RequestPacket::new(Method::Patch, uri).with_body(body))
            .await
    }

    /// Number of requests currently awaiting a response.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    /// Fail every in-flight request with [`SendError::Canceled`] without
    /// tearing the client down.
    pub fn cancel_pending_requests(&self) {
        self.registry.cancel_all(|| SendError::Canceled);
    }

    /// Whether [`Self::dispose`] has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.supervisor.is_disposed()
    }

    /// Idempotent shutdown: every pending request fails with
    /// [`SendError::Disposed`], the consumer, pool and connection are torn
    /// down, and later sends fail with [`SendError::Disposed`].
    pub async fn dispose(&self) {
        self.supervisor.dispose().await;
    }

    /// Resolve the request URI against the configuration, merge default
    /// headers and pick the effective timeout. Marks the client started.
    fn prepare(&self, request: &mut RequestPacket) -> Result<Duration, SendError> {
        let timeout = {
            let config = self.lock_config();
            if request.uri.is_empty() {
                let Some(base) = &config.base_uri else {
                    return Err(SendError::InvalidState(
                        "request has no URI and no base URI is configured".to_string(),
                    ));
                };
                request.uri = base.to_string();
            } else {
                match Url::parse(&request.uri) {
                    Ok(_) => {}
                    Err(url::ParseError::RelativeUrlWithoutBase) => {
                        let Some(base) = &config.base_uri else {
                            return Err(SendError::InvalidState(
                                "request URI is relative and no base URI is configured"
                                    .to_string(),
                            ));
                        };
                        let resolved = base
                            .join(&request.uri)
                            .map_err(|err| SendError::InvalidArgument(err.into()))?;
                        request.uri = resolved.to_string();
                    }
                    Err(err) => return Err(SendError::InvalidArgument(err.into())),
                }
            }
            request.headers.merge_missing(&config.default_headers);
            request
                .options()
                .and_then(|options| options.timeout)
                .unwrap_or(config.default_timeout)
        };
        self.started.store(true, Ordering::SeqCst);
        Ok(timeout)
    }

    /// Broker message properties for one request.
    fn publish_properties(
        &self,
        correlation_id: &str,
        timeout: Duration,
        request: &RequestPacket,
    ) -> PublishProperties {
        let finite = timeout != Duration::ZERO && timeout != TIMEOUT_INFINITE;
        let expiration_ms = (finite && self.mapper.is_expirable(request)).then(|| {
            u64::try_from(timeout.as_millis())
                .unwrap_or(u64::MAX)
                .min(u64::try_from(i32::MAX).unwrap_or_default())
        });
        PublishProperties {
            correlation_id: correlation_id.to_string(),
            reply_to: self.supervisor.callback_queue().to_string(),
            expiration_ms,
            timestamp: u64::try_from(Utc::now().timestamp()).unwrap_or_default(),
        }
    }

    /// Install the waiter and arm its timer and cancellation hook.
    fn register_waiter(
        &self,
        correlation_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<oneshot::Receiver<Outcome>, SendError> {
        let (slot, receiver) = oneshot::channel();
        self.registry
            .register(correlation_id, Waiter::new(slot))
            .map_err(|err| SendError::InvalidState(err.to_string()))?;

        let timer =
            (timeout != TIMEOUT_INFINITE).then(|| self.spawn_timer(correlation_id, timeout));
        let canceller = self.spawn_canceller(correlation_id, cancel.clone());

        if !self
            .registry
            .arm(correlation_id, timer.clone(), Some(canceller.clone()))
        {
            // The waiter reached a terminal state before arming (an
            // already-cancelled token, for instance); the tasks are ours
            // to stop.
            if let Some(timer) = timer {
                timer.abort();
            }
            canceller.abort();
        }
        Ok(receiver)
    }

    /// Spawn the single-shot timeout task for one waiter.
    fn spawn_timer(&self, correlation_id: &str, timeout: Duration) -> AbortHandle {
        let registry = Arc::clone(&self.registry);
        let correlation_id = correlation_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if registry.complete(&correlation_id, Err(SendError::Timeout)) {
                debug!("request {correlation_id} timed out after {timeout:?}");
            }
        })
        .abort_handle()
    }

    /// Spawn the cancellation watch task for one waiter.
    fn spawn_canceller(&self, correlation_id: &str, cancel: CancellationToken) -> AbortHandle {
        let registry = Arc::clone(&self.registry);
        let correlation_id = correlation_id.to_string();
        tokio::spawn(async move {
            cancel.cancelled().await;
            registry.complete(&correlation_id, Err(SendError::Canceled));
        })
        .abort_handle()
    }

    /// Borrow a channel, re-declare stale topology, publish, release.
    async fn publish(
        &self,
        routing_key: &str,
        properties: PublishProperties,
        body: &[u8],
    ) -> Result<(), SendError> {
        let channel = self
            .supervisor
            .get_channel()
            .await
            .map_err(|err| SendError::PublishFailed(err.into_inner()))?;
        self.supervisor
            .declare_topology_if_stale(&channel)
            .await
            .map_err(|err| SendError::PublishFailed(err.into_inner()))?;
        channel
            .publish(
                &self.descriptor.exchange_name(),
                routing_key,
                properties,
                body,
            )
            .await
            .map_err(|err| SendError::PublishFailed(err.into_inner()))
            .on_err(|err| tracing::error!("publish failed: {err}"))
        // The lease drops here, returning the channel to the pool.
    }

    /// Whether configuration may still change.
    fn config_mutable(&self) -> Result<(), ConfigError> {
        if self.supervisor.is_disposed() {
            return Err(ConfigError::Disposed);
        }
        if self.started.load(Ordering::SeqCst) {
            return Err(ConfigError::AlreadyStarted);
        }
        Ok(())
    }

    /// The configuration, with lock poisoning treated as fatal.
    fn lock_config(&self) -> MutexGuard<'_, Config> {
        match self.config.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
