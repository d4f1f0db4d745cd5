use std::sync::{Arc, Mutex};

use super::link::Transport;

/// Lifecycle events of a transport. Every method defaults to a no-op so
/// implementors only override what they observe.
///
/// Callbacks run on whichever task caused the event and must not block.
pub trait TransportListener: Send + Sync {
    fn notify_transport_connected(&self, _transport: &Transport) {}

    /// `forced` is set when the disconnect was decided locally, e.g. by the
    /// health checker, rather than observed on the socket.
    fn notify_transport_disconnected(&self, _transport: &Transport, _forced: bool) {}

    fn notify_transport_connect_attempt(&self, _transport: &Transport) {}

    fn notify_transport_closed(&self, _transport: &Transport) {}

    fn notify_transport_reconnection_rejected(&self, _transport: &Transport) {}
}

/// Ordered set of listeners. Notification iterates over a snapshot, so a
/// listener may add or remove listeners from inside a callback.
#[derive(Default)]
pub struct ListenerSet(Mutex<Vec<Arc<dyn TransportListener>>>);

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn TransportListener>) {
        let mut listeners = self.lock();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove(&self, listener: &Arc<dyn TransportListener>) {
        self.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn TransportListener>> {
        self.lock().clone()
    }

    pub fn for_each(&self, f: impl Fn(&dyn TransportListener)) {
        for listener in self.snapshot() {
            f(listener.as_ref());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn TransportListener>>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl TransportListener for Counter {
        fn notify_transport_closed(&self, _: &Transport) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn listeners_are_deduplicated_and_removable() {
        let set = ListenerSet::new();
        let a: Arc<dyn TransportListener> = Arc::new(Counter::default());
        let b: Arc<dyn TransportListener> = Arc::new(Counter::default());
        set.add(a.clone());
        set.add(b.clone());
        set.add(a.clone());
        assert_eq!(set.len(), 2);
        assert!(Arc::ptr_eq(&set.snapshot()[0], &a));

        set.remove(&a);
        assert_eq!(set.len(), 1);
        assert!(Arc::ptr_eq(&set.snapshot()[0], &b));
    }
}
