//! Warren, tunnel HTTP-shaped request/response exchanges over `RabbitMQ`.
//!
//! Requests are serialized and published to a request exchange; responses
//! come back on a per-client callback queue and are correlated to the
//! originating caller by correlation ID. The caller just awaits an
//! ordinary HTTP-shaped response.
#![forbid(unsafe_code)]
#![deny(nonstandard_style)]
#![warn(
    missing_docs,
    clippy::missing_docs_in_private_items,
    clippy::pedantic,
    clippy::unwrap_used
)]
#![allow(clippy::unused_async)]

mod channel_pool;
mod consumer;
mod registry;
mod supervisor;
pub mod amqp;
pub mod broker;
pub mod client;
pub mod error;
pub mod mapper;
pub mod options;
pub mod packet;
pub mod topology;
pub use client::Client;
pub use error::{ConfigError, SendError};
pub use lapin;
pub use mapper::{DirectMapper, MessageMapper};
pub use options::{RequestOptions, REQUEST_OPTIONS_KEY, TIMEOUT_INFINITE};
pub use packet::{HeaderMap, Method, RequestPacket, ResponsePacket};
pub use tokio_util::sync::CancellationToken;
pub use topology::ExchangeDescriptor;

pub mod util;

/// Prelude
pub mod prelude {
    pub use crate::util::OnError as _;
}
