use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tracing::{error, warn};

pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered observer list. Delivery iterates over a snapshot taken at dispatch
/// time, so listeners may subscribe or unsubscribe from inside a callback.
pub struct ListenerRegistry<T> {
    name: &'static str,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Listener<T>)>>,
}

impl<T> fmt::Debug for ListenerRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

impl<T> ListenerRegistry<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        match self.listeners.lock() {
            Ok(mut listeners) => listeners.push((id, Arc::new(listener))),
            Err(_) => error!(registry = self.name, "listener registry lock was poisoned"),
        }
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let Ok(mut listeners) = self.listeners.lock() else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(candidate, _)| *candidate != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .map(|listeners| listeners.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `value` to every listener in registration order. A panicking
    /// listener is logged and skipped; later listeners still run.
    pub fn emit(&self, value: &T) -> usize {
        let snapshot = match self.listeners.lock() {
            Ok(listeners) => listeners
                .iter()
                .map(|(id, listener)| (*id, Arc::clone(listener)))
                .collect::<Vec<_>>(),
            Err(_) => {
                error!(registry = self.name, "listener registry lock was poisoned");
                return 0;
            }
        };

        let mut delivered = 0;
        for (id, listener) in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(value))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    warn!(
                        registry = self.name,
                        listener_id = id.0,
                        reason = %panic_message(payload.as_ref()),
                        "listener panicked during dispatch"
                    );
                }
            }
        }
        delivered
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
