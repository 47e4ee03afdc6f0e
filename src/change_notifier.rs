use std::collections::HashMap;
use std::sync::Arc;

use util::sync::Mutex;

pub type OnChangedFn = Box<dyn Fn() + Send + Sync>;

/// Opaque registration handle returned by [`ChangeNotifier::add_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

/// ChangeNotifier is the cross-component notification primitive: a keyed set
/// of observer callbacks. Notification snapshots the callbacks under the
/// lock and invokes them off-lock, so an observer may re-enter the notifier.
#[derive(Default)]
pub struct ChangeNotifier {
    inner: Mutex<ChangeNotifierInner>,
}

#[derive(Default)]
struct ChangeNotifierInner {
    next_handle: u64,
    observers: HashMap<u64, Arc<OnChangedFn>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        ChangeNotifier::default()
    }

    pub fn add_observer(&self, on_changed: OnChangedFn) -> ObserverHandle {
        let mut inner = self.inner.lock();
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.observers.insert(handle, Arc::new(on_changed));
        ObserverHandle(handle)
    }

    pub fn remove_observer(&self, handle: ObserverHandle) {
        let mut inner = self.inner.lock();
        inner.observers.remove(&handle.0);
    }

    pub fn has_observers(&self) -> bool {
        let inner = self.inner.lock();
        !inner.observers.is_empty()
    }

    pub fn notify_changed(&self) {
        let observers: Vec<Arc<OnChangedFn>> = {
            let inner = self.inner.lock();
            if inner.observers.is_empty() {
                return;
            }
            inner.observers.values().cloned().collect()
        };

        for observer in observers {
            observer();
        }
    }
}
