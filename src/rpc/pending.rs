use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// Calls waiting for their reply, by correlation id.
#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: Mutex<HashMap<String, oneshot::Sender<Vec<u8>>>>,
}

impl PendingCalls {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Vec<u8>>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call. It stays registered until the returned guard is dropped.
    pub(crate) fn register(
        self: &Arc<Self>,
        correlation_id: String,
    ) -> (PendingCall, oneshot::Receiver<Vec<u8>>) {
        let (sender, receiver) = oneshot::channel();
        self.lock().insert(correlation_id.clone(), sender);
        let guard = PendingCall {
            calls: Arc::clone(self),
            correlation_id,
        };
        (guard, receiver)
    }

    /// Hand `reply` to the call waiting for it. Returns `false` if nobody is waiting anymore.
    pub(crate) fn complete(&self, correlation_id: &str, reply: Vec<u8>) -> bool {
        match self.lock().remove(correlation_id) {
            Some(sender) => sender.send(reply).is_ok(),
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, correlation_id: &str) -> bool {
        self.lock().contains_key(correlation_id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Deregisters the call on drop, whether it got its reply, timed out, or was abandoned.
pub(crate) struct PendingCall {
    calls: Arc<PendingCalls>,
    correlation_id: String,
}

impl PendingCall {
    pub(crate) fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.calls.lock().remove(&self.correlation_id);
    }
}
