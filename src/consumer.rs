//! Callback consumer: the dedicated task that drains the per-client
//! callback queue and completes waiters by correlation ID.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerChannel, Delivery, DeliveryStream};
use crate::error::SendError;
use crate::packet::ResponsePacket;
use crate::registry::PendingRequests;

/// Drain `deliveries` until the stream ends or errors, dispatching each
/// delivery to its registered waiter. Runs as a dedicated task; `on_exit`
/// fires on every exit path so the supervisor can mark the consumer dead
/// and let the next send start a fresh one.
///
/// Every delivery is acked before processing. Redelivering a response this
/// client could not parse would only fail again.
pub(crate) async fn delivery_loop(
    mut deliveries: DeliveryStream,
    channel: Arc<dyn BrokerChannel>,
    registry: Arc<PendingRequests>,
    on_exit: impl FnOnce() + Send,
) {
    info!("callback consumer started");

    while let Some(item) = deliveries.next().await {
        let delivery = match item {
            Ok(delivery) => delivery,
            Err(err) => {
                error!("callback consumer failed: {err}");
                break;
            }
        };
        if let Err(err) = channel.ack(delivery.delivery_tag).await {
            warn!("acking delivery {} failed: {err}", delivery.delivery_tag);
        }
        dispatch(&registry, delivery);
    }

    on_exit();
    info!("callback consumer shut down");
}

/// Route one delivery to its waiter, if any is still registered.
fn dispatch(registry: &PendingRequests, delivery: Delivery) {
    let Some(correlation_id) = delivery.correlation_id else {
        debug!("dropping delivery without a correlation id");
        return;
    };
    if !registry.contains(&correlation_id) {
        // Late response: the waiter already timed out, was canceled, or
        // the whole client was disposed.
        debug!("dropping late delivery for {correlation_id}");
        return;
    }
    match ResponsePacket::deserialize(&delivery.body) {
        Ok(mut response) => {
            response.ensure_content_length();
            registry.complete(&correlation_id, Ok(response));
        }
        Err(err) => {
            registry.complete(&correlation_id, Err(SendError::BadResponse(err.into())));
        }
    }
}
