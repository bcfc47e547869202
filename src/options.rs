//! Per-request [`RequestOptions`] and the property key they travel under.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::packet::RequestPacket;

/// Well-known property key the options are attached under in a request's
/// property bag.
pub const REQUEST_OPTIONS_KEY: &str = "warren.request-options";

/// Timeout sentinel that disables the per-request timer entirely.
pub const TIMEOUT_INFINITE: Duration = Duration::MAX;

/// Caller-supplied per-request knobs. Only `timeout` is read by the core.
///
/// A timeout of [`Duration::ZERO`] selects fire-and-forget: the call
/// resolves with a synthetic `200 OK` right after the publish, and no
/// response is awaited. [`TIMEOUT_INFINITE`] waits indefinitely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Override of the client's default timeout.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    /// Options with a timeout override.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

impl RequestPacket {
    /// Attach `options` under [`REQUEST_OPTIONS_KEY`].
    #[must_use]
    pub fn with_options(mut self, options: &RequestOptions) -> Self {
        if let Ok(value) = serde_json::to_value(options) {
            self.properties.insert(REQUEST_OPTIONS_KEY.to_string(), value);
        }
        self
    }

    /// Options attached to this request, if any. Malformed values are
    /// treated as absent.
    #[must_use]
    pub fn options(&self) -> Option<RequestOptions> {
        let value = self.properties.get(REQUEST_OPTIONS_KEY)?;
        serde_json::from_value(value.clone()).ok()
    }
}
