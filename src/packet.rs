//! [`RequestPacket`] and [`ResponsePacket`] definitions and their
//! self-describing byte format.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Header name whose value mirrors the body length of a response.
pub const CONTENT_LENGTH: &str = "Content-Length";

/// HTTP version carried by packets when the caller does not set one.
const DEFAULT_VERSION: &str = "1.1";

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// GET.
    Get,
    /// HEAD.
    Head,
    /// POST.
    Post,
    /// PUT.
    Put,
    /// DELETE.
    Delete,
    /// OPTIONS.
    Options,
    /// PATCH.
    Patch,
}

impl Method {
    /// The canonical uppercase method token.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered multimap of header names to value lists.
///
/// Names compare case-insensitively, insertion order is preserved and
/// round-trips through serialization unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderMap(Vec<(String, Vec<String>)>);

impl HeaderMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Values recorded under `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
    }

    /// First value recorded under `name`, if any.
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|values| values.first()).map(String::as_str)
    }

    /// Whether any value is recorded under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Append `value` to the list under `name`, creating the entry if absent.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entry_mut(&name) {
            Some(values) => values.push(value),
            None => self.0.push((name, vec![value])),
        }
    }

    /// Replace every value under `name` with the single `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entry_mut(&name) {
            Some(values) => {
                values.clear();
                values.push(value);
            }
            None => self.0.push((name, vec![value])),
        }
    }

    /// Remove the entry under `name`. Returns whether one existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.0.len() != before
    }

    /// Copy every entry of `defaults` whose name is not yet present.
    /// Existing entries are never overwritten.
    pub fn merge_missing(&mut self, defaults: &HeaderMap) {
        for (name, values) in &defaults.0 {
            if !self.contains(name) {
                self.0.push((name.clone(), values.clone()));
            }
        }
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> + '_ {
        self.0
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Number of distinct header names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Mutable value list under `name`, matched case-insensitively.
    fn entry_mut(&mut self, name: &str) -> Option<&mut Vec<String>> {
        self.0
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, values)| values)
    }
}

/// Non-serialized property bag attached to a request by the caller.
pub type PropertyBag = HashMap<String, serde_json::Value>;

/// An HTTP-shaped request, serialized and published to the request exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPacket {
    /// Request method.
    pub method: Method,
    /// Request URI; may be relative until resolved against a base URI.
    pub uri: String,
    /// HTTP version token.
    pub version: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Bytes,
    /// Caller-attached properties; never serialized onto the wire.
    #[serde(skip)]
    pub properties: PropertyBag,
}

impl RequestPacket {
    /// Create a bodiless request.
    #[must_use]
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: DEFAULT_VERSION.to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            properties: PropertyBag::new(),
        }
    }

    /// Set the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Serialize to the self-describing wire format.
    ///
    /// # Errors
    ///
    /// Possible errors originate from `serde_json`.
    pub fn serialize(&self) -> Result<Vec<u8>, SerializeError> {
        serde_json::to_vec(self).map_err(|err| SerializeError(err.into()))
    }

    /// Deserialize from the self-describing wire format.
    ///
    /// # Errors
    ///
    /// Possible errors originate from `serde_json`.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, DeserializeError> {
        serde_json::from_slice(bytes).map_err(|err| DeserializeError(err.into()))
    }
}

/// An HTTP-shaped response, consumed from the callback queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePacket {
    /// Status code.
    pub status: u16,
    /// Reason phrase, if the responder set one.
    pub reason: Option<String>,
    /// HTTP version token.
    pub version: String,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
}

impl ResponsePacket {
    /// Create a bodiless response with the given status code.
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: None,
            version: DEFAULT_VERSION.to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// The synthetic `200 OK` returned by fire-and-forget sends.
    #[must_use]
    pub fn ok_empty() -> Self {
        let mut res = Self::new(200);
        res.reason = Some("OK".to_string());
        res.ensure_content_length();
        res
    }

    /// Set the response body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Whether the status code is in the 2xx range.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Overwrite `Content-Length` so it reflects the actual body length,
    /// regardless of what the responder wrote there.
    pub fn ensure_content_length(&mut self) {
        self.headers.set(CONTENT_LENGTH, self.body.len().to_string());
    }

    /// Serialize to the self-describing wire format.
    ///
    /// # Errors
    ///
    /// Possible errors originate from `serde_json`.
    pub fn serialize(&self) -> Result<Vec<u8>, SerializeError> {
        serde_json::to_vec(self).map_err(|err| SerializeError(err.into()))
    }

    /// Deserialize from the self-describing wire format.
    ///
    /// # Errors
    ///
    /// Possible errors originate from `serde_json`.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, DeserializeError> {
        serde_json::from_slice(bytes).map_err(|err| DeserializeError(err.into()))
    }
}

/// When serializing a packet fails.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct SerializeError(#[from] anyhow::Error);

/// When deserializing a packet fails.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct DeserializeError(#[from] anyhow::Error);
