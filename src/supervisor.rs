//! Connection [`Supervisor`]: owns the broker connection, the publisher
//! channel pool and the callback consumer's lifetime.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::info;

use crate::broker::{Broker, BrokerChannel, BrokerConnection, BrokerError, QueueOptions};
use crate::channel_pool::{ChannelLease, ChannelPool};
use crate::consumer::delivery_loop;
use crate::error::SendError;
use crate::prelude::*;
use crate::registry::PendingRequests;
use crate::topology::ExchangeDescriptor;

/// Minimum spacing between two topology declares of one client.
const DECLARE_INTERVAL_MS: i64 = 30_000;

/// Lifecycle of the callback consumer.
enum ConsumerState {
    /// No consumer; the next send starts one.
    Idle,
    /// A start attempt is in flight under the start lock.
    Starting,
    /// The delivery loop is (or was recently) running.
    Running(ConsumerHandle),
}

/// A running callback consumer.
struct ConsumerHandle {
    /// The dedicated consumer channel; closing it unblocks the loop.
    channel: Arc<dyn BrokerChannel>,
    /// The delivery loop task.
    task: JoinHandle<()>,
    /// Startup generation this consumer belongs to.
    generation: u64,
}

/// State guarded by the shared mutex. The lock is never held across an
/// await.
struct Shared {
    /// Current broker connection, shared by the consumer and the pool.
    connection: Option<Arc<dyn BrokerConnection>>,
    /// Publisher channel pool bound to `connection`.
    pool: Option<ChannelPool>,
    /// Callback consumer lifecycle.
    consumer: ConsumerState,
    /// Monotonically increasing startup generation.
    generation: u64,
}

/// Establishes and re-establishes the broker connection; owns the channel
/// pool and the callback consumer. One per client instance, never shared
/// across clients.
pub(crate) struct Supervisor {
    /// Connection factory.
    broker: Arc<dyn Broker>,
    /// Topology the client publishes into.
    descriptor: ExchangeDescriptor,
    /// This client's private callback queue name.
    callback_queue: String,
    /// Consumer tag for the callback consumer.
    consumer_tag: String,
    /// Waiters completed by the consumer and failed on dispose.
    registry: Arc<PendingRequests>,
    /// Set once by [`Self::dispose`]; prohibits all further starts.
    disposed: AtomicBool,
    /// Serializes startup attempts (double-checked around it).
    start_lock: tokio::sync::Mutex<()>,
    /// Connection, pool and consumer handle.
    shared: Arc<Mutex<Shared>>,
    /// Lets exactly one topology declare proceed per stale window.
    declare_guard: tokio::sync::Mutex<()>,
    /// Tick of the last topology declare, in ms since `epoch`.
    last_declare_ms: AtomicI64,
    /// Monotonic base for declare ticks.
    epoch: Instant,
}

impl Supervisor {
    /// Create a supervisor; nothing connects until the first
    /// [`Self::ensure_started`].
    pub fn new(
        broker: Arc<dyn Broker>,
        descriptor: ExchangeDescriptor,
        client_id: &str,
        registry: Arc<PendingRequests>,
    ) -> Self {
        let callback_queue = descriptor.callback_queue_name(client_id);
        Self {
            broker,
            descriptor,
            callback_queue,
            consumer_tag: format!("warren.client.{client_id}"),
            registry,
            disposed: AtomicBool::new(false),
            start_lock: tokio::sync::Mutex::new(()),
            shared: Arc::new(Mutex::new(Shared {
                connection: None,
                pool: None,
                consumer: ConsumerState::Idle,
                generation: 0,
            })),
            declare_guard: tokio::sync::Mutex::new(()),
            // Start one full interval in the past so the first send declares.
            last_declare_ms: AtomicI64::new(-(DECLARE_INTERVAL_MS * 2)),
            epoch: Instant::now(),
        }
    }

    /// The callback queue responses are routed back to.
    pub fn callback_queue(&self) -> &str {
        &self.callback_queue
    }

    /// Whether [`Self::dispose`] has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Idempotent startup. On return, a publisher channel can be borrowed
    /// and deliveries for this client's correlation IDs will be routed back.
    ///
    /// # Errors
    ///
    /// [`SendError::Disposed`] after disposal, [`SendError::BrokerUnreachable`]
    /// when no connection could be established or the consumer could not be
    /// set up.
    pub async fn ensure_started(&self) -> Result<(), SendError> {
        if self.is_disposed() {
            return Err(SendError::Disposed);
        }
        if self.is_healthy() {
            return Ok(());
        }

        let _start = self.start_lock.lock().await;
        // Double-checked: another send may have started us while we waited.
        if self.is_disposed() {
            return Err(SendError::Disposed);
        }
        if self.is_healthy() {
            return Ok(());
        }

        match self.start_once().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.lock_shared().consumer = ConsumerState::Idle;
                Err(SendError::BrokerUnreachable(err.into_inner()))
                    .on_err(|err| tracing::error!("starting the client failed: {err}"))
            }
        }
    }

    /// Borrow a publisher channel from the current pool.
    ///
    /// # Errors
    ///
    /// When the pool is gone (never started, restarting) or exhausted.
    pub async fn get_channel(&self) -> Result<ChannelLease, BrokerError> {
        let pool = self.lock_shared().pool.clone();
        let Some(pool) = pool else {
            return Err(BrokerError::new(anyhow::format_err!(
                "no channel pool: client not started"
            )));
        };
        pool.get().await.map_err(BrokerError::new)
    }

    /// Re-declare the exchange and well-known queues when the last declare
    /// is older than the interval (or the tick wrapped). At most one
    /// declare proceeds per stale window; contenders skip.
    ///
    /// # Errors
    ///
    /// When a declare operation fails on the borrowed channel.
    pub async fn declare_topology_if_stale(
        &self,
        channel: &ChannelLease,
    ) -> Result<(), BrokerError> {
        let now = self.tick_ms();
        if self.is_fresh(now) {
            return Ok(());
        }
        let Ok(_guard) = self.declare_guard.try_lock() else {
            // Another send is already declaring this window.
            return Ok(());
        };
        if self.is_fresh(now) {
            return Ok(());
        }
        self.last_declare_ms.store(self.tick_ms(), Ordering::SeqCst);

        let d = &self.descriptor;
        channel
            .exchange_declare(&d.exchange_name(), d.exchange_kind, d.durable)
            .await?;
        channel
            .queue_declare(
                &d.request_queue_name(),
                QueueOptions {
                    durable: d.durable,
                    ..QueueOptions::default()
                },
            )
            .await?;
        channel
            .queue_bind(
                &d.request_queue_name(),
                &d.exchange_name(),
                &d.default_routing_key(),
            )
            .await?;
        Ok(())
    }

    /// Idempotent shutdown: fail every waiter with `Disposed`, stop the
    /// consumer, close the pool and the connection.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.cancel_all(|| SendError::Disposed);

        let (connection, pool, consumer) = {
            let mut shared = self.lock_shared();
            (
                shared.connection.take(),
                shared.pool.take(),
                std::mem::replace(&mut shared.consumer, ConsumerState::Idle),
            )
        };
        if let ConsumerState::Running(handle) = consumer {
            // Closing the channel ends the delivery stream and unblocks
            // the loop; the abort covers a loop stuck elsewhere.
            handle.channel.close().await;
            handle.task.abort();
        }
        if let Some(pool) = pool {
            pool.close();
        }
        if let Some(connection) = connection {
            connection.close().await;
        }
        info!("client disposed");
    }

    /// Whether the consumer is running on an open connection.
    fn is_healthy(&self) -> bool {
        let shared = self.lock_shared();
        let ConsumerState::Running(handle) = &shared.consumer else {
            return false;
        };
        shared.connection.as_ref().is_some_and(|c| c.is_open())
            && handle.channel.is_usable()
            && !handle.task.is_finished()
    }

    /// One startup attempt: fresh connection, fresh pool (old one retired
    /// after the swap), callback queue, consumer loop.
    async fn start_once(&self) -> Result<(), BrokerError> {
        let connection = self.broker.connect().await?;
        let pool = ChannelPool::new(Arc::clone(&connection)).map_err(BrokerError::new)?;

        let (old_connection, old_pool, old_consumer, generation) = {
            let mut shared = self.lock_shared();
            shared.generation += 1;
            (
                shared.connection.replace(Arc::clone(&connection)),
                shared.pool.replace(pool),
                std::mem::replace(&mut shared.consumer, ConsumerState::Starting),
                shared.generation,
            )
        };
        if let ConsumerState::Running(handle) = old_consumer {
            handle.task.abort();
        }
        if let Some(pool) = old_pool {
            pool.close();
        }
        if let Some(old) = old_connection {
            old.close().await;
        }

        let channel = connection.create_channel().await?;
        channel
            .queue_declare(
                &self.callback_queue,
                QueueOptions {
                    durable: false,
                    exclusive: false,
                    auto_delete: true,
                    expires_ms: Some(self.descriptor.callback_queue_ttl_ms()),
                },
            )
            .await?;
        let deliveries = channel.consume(&self.callback_queue, &self.consumer_tag).await?;

        let shared = Arc::clone(&self.shared);
        let on_exit = move || consumer_exited(&shared, generation);
        let task = tokio::spawn(delivery_loop(
            deliveries,
            Arc::clone(&channel),
            Arc::clone(&self.registry),
            on_exit,
        ));
        self.lock_shared().consumer = ConsumerState::Running(ConsumerHandle {
            channel,
            task,
            generation,
        });

        info!(
            "client started: consuming callback queue {}",
            self.callback_queue
        );
        Ok(())
    }

    /// Whether the last declare at tick `now` is still within the interval.
    /// A negative difference means the tick wrapped; treat it as stale.
    fn is_fresh(&self, now: i64) -> bool {
        let elapsed = now.saturating_sub(self.last_declare_ms.load(Ordering::SeqCst));
        (0..=DECLARE_INTERVAL_MS).contains(&elapsed)
    }

    /// Monotonic milliseconds since supervisor creation.
    fn tick_ms(&self) -> i64 {
        i64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    /// The shared state, with lock poisoning treated as fatal.
    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Delivery loop exit hook: retire this generation's resources so the next
/// send triggers a fresh startup. A newer generation's state is left alone.
fn consumer_exited(shared: &Mutex<Shared>, generation: u64) {
    let (connection, pool) = {
        let mut shared = match shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if shared.generation != generation {
            return;
        }
        shared.consumer = ConsumerState::Idle;
        (shared.connection.take(), shared.pool.take())
    };
    if let Some(pool) = pool {
        pool.close();
    }
    if let Some(connection) = connection {
        tokio::spawn(async move { connection.close().await });
    }
}
