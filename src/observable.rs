use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// A shared value that publishes every change to its subscribers.
///
/// Clones share the same cell. Each subscriber gets its own unbounded
/// channel which first yields the value current at subscription time, then
/// every later update. Subscribers whose receiver was dropped are pruned on
/// the next update.
pub struct Observable<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    value: RwLock<T>,
    subscribers: Mutex<Vec<Sender<T>>>,
}

impl<T: Clone> Observable<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                value: RwLock::new(value),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Snapshot of the current value.
    pub fn get(&self) -> T {
        self.inner
            .value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Read the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let value = self.inner.value.read().unwrap_or_else(PoisonError::into_inner);
        f(&value)
    }

    pub fn set(&self, value: T) {
        self.update(|current| *current = value);
    }

    /// Mutate in place, then notify subscribers.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let published = {
            let mut value = self.inner.value.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut value);
            // Only pay for a clone when someone is listening.
            (!subscribers.is_empty()).then(|| value.clone())
        };

        if let Some(published) = published {
            subscribers.retain(|tx| tx.send(published.clone()).is_ok());
        }
    }

    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Holding the subscriber lock keeps this ordered with `update`.
        let _ = tx.send(self.get());
        subscribers.push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Default> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + std::fmt::Debug> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.with(|value| f.debug_tuple("Observable").field(value).finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_subscriber_sees_current_then_updates() {
        let angle = Observable::new(None::<f64>);
        let rx = angle.subscribe();
        angle.set(Some(1.5));
        angle.update(|a| *a = a.map(|v| v * 2.0));

        assert_eq!(rx.try_recv().unwrap(), None);
        assert_eq!(rx.try_recv().unwrap(), Some(1.5));
        assert_eq!(rx.try_recv().unwrap(), Some(3.0));
        assert!(rx.try_recv().is_err());
        assert_eq!(angle.get(), Some(3.0));
    }

    #[test]
    fn test_clones_share_state() {
        let history = Observable::new(Vec::<f64>::new());
        let view = history.clone();
        history.update(|h| h.push(4.0));
        assert_eq!(view.get(), vec![4.0]);
        assert_eq!(view.with(|h| h.len()), 1);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let flag = Observable::new(false);
        let rx = flag.subscribe();
        assert_eq!(flag.subscriber_count(), 1);
        drop(rx);
        flag.set(true);
        assert_eq!(flag.subscriber_count(), 0);
    }

    #[test]
    fn test_updates_from_another_thread() {
        let counter = Observable::new(0u32);
        let rx = counter.subscribe();
        let writer = counter.clone();
        let handle = std::thread::spawn(move || {
            for i in 1..=5 {
                writer.set(i);
            }
        });
        handle.join().unwrap();

        let seen: Vec<u32> = (0..6)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }
}
