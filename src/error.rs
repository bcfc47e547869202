//! Caller-facing error taxonomy.

/// Everything a `send` can fail with. Precondition violations surface
/// before anything is published; the rest resolve the awaited call after
/// the request is in flight.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The request itself is malformed (unparsable URI).
    #[error("invalid request: {0}")]
    InvalidArgument(anyhow::Error),
    /// The client state does not permit the request (no resolvable URI).
    #[error("invalid client state: {0}")]
    InvalidState(String),
    /// The client has been disposed.
    #[error("client has been disposed")]
    Disposed,
    /// No connection to the broker could be established.
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(anyhow::Error),
    /// The timeout elapsed before a response arrived.
    #[error("timed out waiting for a response")]
    Timeout,
    /// The cancellation token was triggered.
    #[error("request was canceled")]
    Canceled,
    /// A response arrived but its body could not be deserialized.
    #[error("undecodable response: {0}")]
    BadResponse(anyhow::Error),
    /// The broker rejected the publish or the channel broke under it.
    #[error("publishing the request failed: {0}")]
    PublishFailed(anyhow::Error),
}

/// Errors when mutating client configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The first request has already been sent; configuration is frozen.
    #[error("configuration cannot change after the first request")]
    AlreadyStarted,
    /// The client has been disposed.
    #[error("client has been disposed")]
    Disposed,
    /// The supplied base URI does not parse.
    #[error("invalid base URI: {0}")]
    InvalidBaseUri(anyhow::Error),
}
