// Observable value shared between the code mutating an input (buffer logic, device
// hints) and the components reacting to it.

use std::sync::Arc;
use tokio::sync::watch;

/// A cloneable, observable value. Every clone points to the same value.
#[derive(Debug)]
pub struct SharedReference<T> {
    sender: Arc<watch::Sender<T>>,
}

impl<T> Clone for SharedReference<T> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
        }
    }
}

impl<T> SharedReference<T> {
    pub fn new(value: T) -> Self {
        Self {
            sender: Arc::new(watch::Sender::new(value)),
        }
    }

    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.sender.borrow().clone()
    }

    /// Replaces the value and notifies every subscriber.
    pub fn set(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Mutates the value and notifies every subscriber.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.sender.send_modify(f);
    }

    /// Mutates the value without notifying subscribers.
    pub fn update_silently(&self, f: impl FnOnce(&mut T)) {
        self.sender.send_if_modified(|value| {
            f(value);
            false
        });
    }

    /// Runs `f` on the current value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.sender.borrow())
    }

    /// A receiver whose current value is already marked as seen.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_notifies_subscribers() {
        let shared = SharedReference::new(1);
        let mut rx = shared.subscribe();
        assert!(!rx.has_changed().unwrap());

        shared.clone().set(2);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 2);
        assert_eq!(shared.get(), 2);
    }

    #[tokio::test]
    async fn silent_updates_are_not_observed() {
        let shared = SharedReference::new(vec![1, 2, 3]);
        let rx = shared.subscribe();

        shared.update_silently(|queue| {
            queue.remove(0);
        });
        assert!(!rx.has_changed().unwrap());
        assert_eq!(shared.get(), [2, 3]);

        shared.update(|queue| queue.push(4));
        assert!(rx.has_changed().unwrap());
        assert_eq!(shared.with(|queue| queue.len()), 3);
    }
}
