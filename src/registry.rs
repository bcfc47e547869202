//! [`PendingRequests`] registry: correlation-ID-keyed waiters with
//! single-shot completion slots.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::SendError;
use crate::packet::ResponsePacket;

/// What a waiter resolves to.
pub(crate) type Outcome = Result<ResponsePacket, SendError>;

/// One caller awaiting a response for one correlation ID.
pub(crate) struct Waiter {
    /// Single-shot completion slot.
    slot: oneshot::Sender<Outcome>,
    /// Timeout task, aborted on any other terminal transition.
    timer: Option<AbortHandle>,
    /// Cancellation watch task, aborted on any other terminal transition.
    canceller: Option<AbortHandle>,
}

impl Waiter {
    /// A waiter with no timer or cancellation hook attached yet.
    pub fn new(slot: oneshot::Sender<Outcome>) -> Self {
        Self {
            slot,
            timer: None,
            canceller: None,
        }
    }

    /// Abort the attached tasks and fulfil the slot. A dropped receiver is
    /// fine; the caller has simply stopped waiting.
    fn finish(self, outcome: Outcome) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        if let Some(canceller) = self.canceller {
            canceller.abort();
        }
        let _ = self.slot.send(outcome);
    }
}

/// Concurrent map from correlation ID to [`Waiter`]. Mutated by the
/// request engine (insert), the callback consumer (complete on delivery),
/// timers (complete on timeout) and cancellation (complete on cancel).
///
/// Removal happens under the map lock, so every waiter has exactly one
/// completer; the lock is never held across an await.
#[derive(Default)]
pub(crate) struct PendingRequests {
    /// Waiters by correlation ID.
    inner: Mutex<HashMap<String, Waiter>>,
}

impl PendingRequests {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `waiter` under `correlation_id`.
    ///
    /// # Errors
    ///
    /// [`RegisterError::AlreadyRegistered`] when the ID is taken. IDs carry
    /// 122 bits of entropy, so a collision is a programmer error, not a
    /// runtime condition.
    pub fn register(&self, correlation_id: &str, waiter: Waiter) -> Result<(), RegisterError> {
        let mut inner = self.lock();
        if inner.contains_key(correlation_id) {
            return Err(RegisterError::AlreadyRegistered(correlation_id.to_string()));
        }
        inner.insert(correlation_id.to_string(), waiter);
        Ok(())
    }

    /// Attach the timer and cancellation abort handles to an existing
    /// waiter. Returns `false` when the waiter already reached a terminal
    /// state; the caller must then abort the handles itself.
    pub fn arm(
        &self,
        correlation_id: &str,
        timer: Option<AbortHandle>,
        canceller: Option<AbortHandle>,
    ) -> bool {
        let mut inner = self.lock();
        let Some(waiter) = inner.get_mut(correlation_id) else {
            return false;
        };
        waiter.timer = timer;
        waiter.canceller = canceller;
        true
    }

    /// Whether a waiter is currently registered for `correlation_id`.
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.lock().contains_key(correlation_id)
    }

    /// Remove the waiter and fulfil it with `outcome`. Returns whether a
    /// waiter existed; later completion attempts for the same ID are no-ops.
    pub fn complete(&self, correlation_id: &str, outcome: Outcome) -> bool {
        let waiter = self.lock().remove(correlation_id);
        match waiter {
            Some(waiter) => {
                waiter.finish(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove the waiter without fulfilling it. Used on the cleanup path
    /// between registration and publish, where the caller still owns the
    /// receiver and surfaces the error itself.
    pub fn discard(&self, correlation_id: &str) {
        if let Some(waiter) = self.lock().remove(correlation_id) {
            if let Some(timer) = waiter.timer {
                timer.abort();
            }
            if let Some(canceller) = waiter.canceller {
                canceller.abort();
            }
        }
    }

    /// Drain every waiter and fail each with a fresh error from `make_err`.
    pub fn cancel_all(&self, make_err: impl Fn() -> SendError) {
        let drained: Vec<Waiter> = {
            let mut inner = self.lock();
            inner.drain().map(|(_, waiter)| waiter).collect()
        };
        for waiter in drained {
            waiter.finish(Err(make_err()));
        }
    }

    /// Number of live waiters.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// The map, with lock poisoning treated as fatal.
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Waiter>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Errors when installing a waiter.
#[derive(Debug, thiserror::Error)]
pub(crate) enum RegisterError {
    /// The correlation ID is already registered.
    #[error("correlation id {0} is already registered")]
    AlreadyRegistered(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ResponsePacket;

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = PendingRequests::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();

        registry.register("id", Waiter::new(tx1)).unwrap();
        assert!(matches!(
            registry.register("id", Waiter::new(tx2)),
            Err(RegisterError::AlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn completion_is_single_shot() {
        let registry = PendingRequests::new();
        let (tx, rx) = oneshot::channel();
        registry.register("id", Waiter::new(tx)).unwrap();

        assert!(registry.complete("id", Ok(ResponsePacket::new(200))));
        assert!(!registry.complete("id", Err(SendError::Timeout)));
        assert_eq!(registry.len(), 0);

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.unwrap().status, 200);
    }

    #[tokio::test]
    async fn cancel_all_fails_every_waiter() {
        let registry = PendingRequests::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        registry.register("a", Waiter::new(tx1)).unwrap();
        registry.register("b", Waiter::new(tx2)).unwrap();

        registry.cancel_all(|| SendError::Disposed);

        assert_eq!(registry.len(), 0);
        assert!(matches!(rx1.await.unwrap(), Err(SendError::Disposed)));
        assert!(matches!(rx2.await.unwrap(), Err(SendError::Disposed)));
    }

    #[tokio::test]
    async fn discard_leaves_the_slot_unfulfilled() {
        let registry = PendingRequests::new();
        let (tx, rx) = oneshot::channel();
        registry.register("id", Waiter::new(tx)).unwrap();

        registry.discard("id");

        assert_eq!(registry.len(), 0);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn arm_reports_a_missing_waiter() {
        let registry = PendingRequests::new();
        assert!(!registry.arm("gone", None, None));
    }
}
