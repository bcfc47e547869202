//! [`ChannelPool`] definition and implementation.
//!
//! Broker channels are not safe for concurrent publishing, so each `send`
//! borrows one for the duration of its publish. The pool amortizes channel
//! setup without ever sharing a channel across concurrent publishers.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool::managed;
use deadpool::Runtime;

use crate::broker::{BrokerChannel, BrokerConnection, BrokerError};

/// Upper bound on how long a borrow waits for a free channel when the
/// pool is at capacity.
const BORROW_WAIT: Duration = Duration::from_secs(5);

/// Wrap [`managed::Pool`] for publisher channels over a single broker
/// connection and add convenience functions to interface with it.
#[derive(Clone)]
pub(crate) struct ChannelPool(managed::Pool<ChannelManager>);

impl ChannelPool {
    /// Create a new pool bound to `conn`.
    ///
    /// # Errors
    /// See [`NewError`]
    pub fn new(conn: Arc<dyn BrokerConnection>) -> Result<Self, NewError> {
        let inner = managed::Pool::builder(ChannelManager(conn))
            .runtime(Runtime::Tokio1)
            .wait_timeout(Some(BORROW_WAIT))
            .build()
            .map_err(|err| NewError::Other(err.into()))?;
        Ok(Self(inner))
    }

    /// Borrow a [`ChannelLease`]. Waits a bounded time for a free channel
    /// or creates one on demand.
    ///
    /// # Errors
    /// See [`GetError`]
    pub async fn get(&self) -> Result<ChannelLease, GetError> {
        let inner = self
            .0
            .get()
            .await
            .map_err(|err| GetError::Other(anyhow::format_err!("{err}")))?;
        Ok(ChannelLease(inner))
    }

    /// Close the pool. Idle channels are dropped; outstanding leases are
    /// discarded instead of returned once released.
    pub fn close(&self) {
        self.0.close();
    }
}

/// Errors that can occur when creating a new pool.
#[derive(Debug, thiserror::Error)]
pub enum NewError {
    /// Any errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors that can occur when getting a channel.
#[derive(Debug, thiserror::Error)]
pub enum GetError {
    /// Any errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Creates and health-checks pooled channels on behalf of deadpool.
struct ChannelManager(Arc<dyn BrokerConnection>);

#[async_trait]
impl managed::Manager for ChannelManager {
    type Type = Arc<dyn BrokerChannel>;
    type Error = BrokerError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        self.0.create_channel().await
    }

    async fn recycle(
        &self,
        chan: &mut Self::Type,
    ) -> Result<(), managed::RecycleError<Self::Error>> {
        if chan.is_usable() {
            Ok(())
        } else {
            Err(managed::RecycleError::StaticMessage("channel is not usable"))
        }
    }
}

/// A borrowed publisher channel. Dropping the lease returns the channel to
/// the pool; a broken channel or a closed pool discards it instead.
pub(crate) struct ChannelLease(managed::Object<ChannelManager>);

impl Deref for ChannelLease {
    type Target = Arc<dyn BrokerChannel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
