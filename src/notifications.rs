use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Fan-out registry for asynchronous server notifications (connection
/// blocked/unblocked, lifecycle events).
///
/// Listeners unregister themselves on drop, so a broadcast never blocks on a
/// receiver nobody is reading anymore.
#[derive(Clone)]
pub(crate) struct NotificationBroadcaster<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T: Clone> NotificationBroadcaster<T> {
    pub(crate) fn new() -> Self {
        NotificationBroadcaster {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: HashMap::new(),
            })),
        }
    }

    pub(crate) fn register_listener(&self) -> NotificationListener<T> {
        let (id, rx) = {
            let mut registry = self.inner.lock().unwrap();
            let id = registry.next_id;
            registry.next_id += 1;
            let (tx, rx) = crossbeam_channel::unbounded();
            registry.listeners.insert(id, tx);
            (id, rx)
        };
        NotificationListener {
            inner: Arc::clone(&self.inner),
            id,
            rx,
        }
    }

    pub(crate) fn broadcast(&self, note: T) {
        let registry = self.inner.lock().unwrap();
        for tx in registry.listeners.values() {
            // a listener mid-drop may have a closed receiver; skip it
            let _ = tx.send(note.clone());
        }
    }

    pub(crate) fn has_listeners(&self) -> bool {
        !self.inner.lock().unwrap().listeners.is_empty()
    }
}

struct Registry<T> {
    next_id: u64,
    listeners: HashMap<u64, Sender<T>>,
}

/// Receiving side of a [`NotificationBroadcaster`] registration.
pub struct NotificationListener<T> {
    inner: Arc<Mutex<Registry<T>>>,
    id: u64,
    rx: Receiver<T>,
}

impl<T> NotificationListener<T> {
    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }
}

impl<T> Drop for NotificationListener<T> {
    fn drop(&mut self) {
        self.inner.lock().unwrap().listeners.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_reaches_every_listener() {
        let broadcaster = NotificationBroadcaster::new();
        let a = broadcaster.register_listener();
        let b = broadcaster.register_listener();
        broadcaster.broadcast(5u32);
        assert_eq!(a.receiver().recv().unwrap(), 5);
        assert_eq!(b.receiver().recv().unwrap(), 5);
    }

    #[test]
    fn dropped_listeners_are_forgotten() {
        let broadcaster = NotificationBroadcaster::new();
        let a = broadcaster.register_listener();
        drop(a);
        assert!(!broadcaster.has_listeners());
        // broadcasting into the void is fine
        broadcaster.broadcast(1u32);
    }
}
