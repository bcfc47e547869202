//! [`MessageMapper`] trait definition, the pluggable request-to-topology
//! mapping policy.

use crate::packet::RequestPacket;

/// Decides how a single request maps onto the broker topology. The
/// descriptor itself is fixed at client construction; the mapper only
/// contributes per-message decisions.
pub trait MessageMapper: Send + Sync + 'static {
    /// Routing key for `request`, or `None` for the default work-queue key.
    fn routing_key(&self, request: &RequestPacket) -> Option<String> {
        let _ = request;
        None
    }

    /// Whether the broker may expire `request` after the caller's timeout.
    /// Non-expirable messages sit in the work queue until consumed.
    fn is_expirable(&self, request: &RequestPacket) -> bool {
        let _ = request;
        true
    }
}

/// Routes every request to the default work queue and lets all of them
/// expire with their timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectMapper;

impl MessageMapper for DirectMapper {}
