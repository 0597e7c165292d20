//! Subscription lists for finalizer events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// Token returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Ordered list of handlers of one event kind.
pub(crate) struct Handlers<F: ?Sized> {
    list: Mutex<Vec<(SubscriptionId, Arc<F>)>>,
}

impl<F: ?Sized> Default for Handlers<F> {
    fn default() -> Self {
        Self {
            list: Mutex::new(Vec::new()),
        }
    }
}

impl<F: ?Sized> Handlers<F> {
    pub(crate) fn subscribe(&self, handler: Arc<F>) -> SubscriptionId {
        let id = SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, handler));
        id
    }

    /// Returns true if `id` belonged to this list.
    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut list = self.lock();
        let before = list.len();
        list.retain(|(sub, _)| *sub != id);
        list.len() != before
    }

    /// Handlers in subscription order. Invoking from a snapshot lets a
    /// handler (un)subscribe without deadlocking.
    pub(crate) fn snapshot(&self) -> Vec<Arc<F>> {
        self.lock().iter().map(|(_, h)| h.clone()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, Arc<F>)>> {
        self.list.lock().expect("event handler list poisoned")
    }
}
