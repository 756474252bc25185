//! Local event listeners.

use core::fmt;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use serde_json::Value;

/// Callback invoked with a message payload.
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    once: bool,
    callback: Callback,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_name: HashMap<String, Vec<Listener>>,
}

/// Named listener lists, shared by every clone.
///
/// Callbacks run outside the internal lock, so a callback may register or
/// remove listeners and emit further events.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<Mutex<Listeners>>,
}

impl EventEmitter {
    /// Create an emitter with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `callback` every time `name` is emitted.
    pub fn on<F>(&self, name: impl Into<String>, callback: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register(name.into(), false, Arc::new(callback))
    }

    /// Call `callback` the next time `name` is emitted, then forget it.
    pub fn once<F>(&self, name: impl Into<String>, callback: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register(name.into(), true, Arc::new(callback))
    }

    /// Remove a listener. Returns whether it was still registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let mut removed = false;
        listeners.by_name.retain(|_, list| {
            let before = list.len();
            list.retain(|listener| listener.id != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    /// Invoke every listener for `name` in registration order.
    ///
    /// Returns how many listeners ran.
    pub fn emit(&self, name: &str, payload: &Value) -> usize {
        let callbacks: Vec<Callback> = {
            let mut listeners = self.lock();
            let Some(list) = listeners.by_name.get_mut(name) else {
                return 0;
            };

            let callbacks = list.iter().map(|l| l.callback.clone()).collect();
            list.retain(|l| !l.once);
            if list.is_empty() {
                listeners.by_name.remove(name);
            }
            callbacks
        };

        for callback in &callbacks {
            callback(payload);
        }

        callbacks.len()
    }

    /// Number of listeners registered for `name`.
    #[must_use]
    pub fn listener_count(&self, name: &str) -> usize {
        self.lock().by_name.get(name).map_or(0, Vec::len)
    }

    fn register(&self, name: String, once: bool, callback: Callback) -> ListenerId {
        let mut listeners = self.lock();
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        listeners.by_name.entry(name).or_default().push(Listener { id, once, callback });
        id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.lock();
        f.debug_struct("EventEmitter")
            .field("names", &listeners.by_name.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
