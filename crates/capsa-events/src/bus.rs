//! Stimulus bus: listener registry with synchronous fan-out.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::{trace, warn};

use crate::stimulus::Stimulus;

type Listener = Arc<dyn Fn(&Stimulus) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    listeners: RwLock<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

/// In-process pub/sub for stimuli.
///
/// Delivery is synchronous fan-out in registration order. A listener
/// that panics is isolated: the panic is caught and logged, and
/// delivery continues to the remaining listeners. The bus makes no
/// ordering guarantee across different listeners.
///
/// Clones share the same listener set.
#[derive(Clone, Default)]
pub struct StimulusBus {
    inner: Arc<BusInner>,
}

impl StimulusBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Returns a subscription handle that removes
    /// exactly this registration when unsubscribed.
    pub fn subscribe(&self, listener: impl Fn(&Stimulus) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver a stimulus to every currently registered listener, in
    /// registration order.
    pub fn emit(&self, stimulus: &Stimulus) {
        // Snapshot under the lock, deliver outside it, so listeners may
        // subscribe, unsubscribe or emit without deadlocking.
        let snapshot: Vec<Listener> = {
            let listeners = self
                .inner
                .listeners
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };

        trace!(sense = %stimulus.sense, listeners = snapshot.len(), "Delivering stimulus");

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(stimulus))).is_err() {
                warn!(sense = %stimulus.sense, "Stimulus listener panicked, delivery continues");
            }
        }
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for StimulusBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StimulusBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Handle for one listener registration.
///
/// Dropping the handle does NOT unsubscribe; call
/// [`Subscription::unsubscribe`] to remove the registration.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    inner: Weak<BusInner>,
}

impl Subscription {
    /// Remove this registration from the bus.
    ///
    /// A no-op if the bus is gone or the listener was already removed.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .listeners
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stimulus::Stimulus;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn fan_out_in_registration_order() {
        let bus = StimulusBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            bus.subscribe(move |_| order.lock().unwrap().push(tag));
        }

        bus.emit(&Stimulus::new("ping", json!(null)));
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn unsubscribe_removes_exactly_one() {
        let bus = StimulusBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&count);
        let sub = bus.subscribe(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = Arc::clone(&count);
        bus.subscribe(move |_| {
            c2.fetch_add(10, Ordering::SeqCst);
        });

        sub.unsubscribe();
        assert_eq!(bus.listener_count(), 1);

        bus.emit(&Stimulus::new("ping", json!(null)));
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn panicking_listener_is_isolated() {
        let bus = StimulusBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe(|_| panic!("bad listener"));
        let c = Arc::clone(&count);
        bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&Stimulus::new("ping", json!(null)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_unsubscribe_another_during_delivery() {
        let bus = StimulusBus::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));

        let slot_clone = Arc::clone(&slot);
        bus.subscribe(move |_| {
            if let Some(sub) = slot_clone.lock().unwrap().take() {
                sub.unsubscribe();
            }
        });
        let c = Arc::clone(&count);
        let sub = bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        *slot.lock().unwrap() = Some(sub);

        // First emit removes the second listener mid-delivery; the
        // snapshot means it still receives this stimulus.
        bus.emit(&Stimulus::new("ping", json!(null)));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        bus.emit(&Stimulus::new("ping", json!(null)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn per_listener_order_is_emission_order() {
        let bus = StimulusBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        bus.subscribe(move |stimulus| s.lock().unwrap().push(stimulus.sense.clone()));

        for sense in ["one", "two", "three"] {
            bus.emit(&Stimulus::new(sense, json!(null)));
        }
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two", "three"]);
    }
}
