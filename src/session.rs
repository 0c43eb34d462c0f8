use crate::observable::Observable;
use crate::types::Vector3;
use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// One change to the session history, as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HistoryChange {
    /// A new session started; the history is empty again.
    Cleared,
    Appended(f64),
}

/// The angle history of the session, readable from any thread.
///
/// Unlike an [`Observable`], subscribers receive each change rather than a
/// copy of the whole list, so a long session costs one message per angle.
#[derive(Debug, Clone, Default)]
pub struct History {
    inner: Arc<HistoryInner>,
}

#[derive(Debug, Default)]
struct HistoryInner {
    angles: RwLock<Vec<f64>>,
    subscribers: Mutex<Vec<Sender<HistoryChange>>>,
}

impl History {
    /// Snapshot of every angle, oldest first.
    pub fn get(&self) -> Vec<f64> {
        self.with(<[f64]>::to_vec)
    }

    /// Read the angles without copying them.
    pub fn with<R>(&self, f: impl FnOnce(&[f64]) -> R) -> R {
        let angles = self.inner.angles.read().unwrap_or_else(PoisonError::into_inner);
        f(&angles)
    }

    pub fn len(&self) -> usize {
        self.with(<[f64]>::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current contents plus a receiver for every later change.
    pub fn subscribe(&self) -> (Vec<f64>, Receiver<HistoryChange>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let current = self.get();
        subscribers.push(tx);
        (current, rx)
    }

    fn apply(&self, change: HistoryChange) {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        {
            let mut angles = self.inner.angles.write().unwrap_or_else(PoisonError::into_inner);
            match change {
                HistoryChange::Cleared => angles.clear(),
                HistoryChange::Appended(angle) => angles.push(angle),
            }
        }
        subscribers.retain(|tx| tx.send(change).is_ok());
    }
}

/// Read side of the live session, shared with observers.
#[derive(Debug, Clone, Default)]
pub struct SessionView {
    /// Most recent angle (degrees); `None` until the first estimate.
    pub current_angle: Observable<Option<f64>>,
    /// Every angle of the session, oldest first.
    pub history: History,
    /// Latest raw accelerometer reading.
    pub accelerometer: Observable<Option<Vector3>>,
    /// Latest raw gyroscope reading.
    pub gyroscope: Observable<Option<Vector3>>,
}

/// Owns the angle history of the active stream.
///
/// Only the stream worker holds one, so every mutation is serialized.
/// The finished history stays readable after a stop until the next
/// [`reset`](Self::reset).
#[derive(Debug, Default)]
pub struct SessionAccumulator {
    view: SessionView,
}

impl SessionAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for observers.
    pub fn view(&self) -> SessionView {
        self.view.clone()
    }

    /// Clear everything for a new session.
    pub fn reset(&mut self) {
        self.view.history.apply(HistoryChange::Cleared);
        self.view.current_angle.set(None);
        self.view.accelerometer.set(None);
        self.view.gyroscope.set(None);
    }

    pub fn append(&mut self, angle: f64) {
        self.view.history.apply(HistoryChange::Appended(angle));
        self.view.current_angle.set(Some(angle));
    }

    pub fn record_accelerometer(&mut self, sample: Vector3) {
        self.view.accelerometer.set(Some(sample));
    }

    pub fn record_gyroscope(&mut self, sample: Vector3) {
        self.view.gyroscope.set(Some(sample));
    }

    pub fn current_angle(&self) -> Option<f64> {
        self.view.current_angle.get()
    }

    pub fn history(&self) -> Vec<f64> {
        self.view.history.get()
    }

    pub fn len(&self) -> usize {
        self.view.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_keeps_order_and_current() {
        let mut session = SessionAccumulator::new();
        assert_eq!(session.current_angle(), None);
        assert!(session.is_empty());

        for angle in [3.0, 1.0, 2.0] {
            session.append(angle);
        }
        assert_eq!(session.history(), vec![3.0, 1.0, 2.0]);
        assert_eq!(session.current_angle(), Some(2.0));
        assert_eq!(session.len(), 3);
    }

    #[test]
    fn test_reset_clears_view() {
        let mut session = SessionAccumulator::new();
        let view = session.view();
        session.append(10.0);
        session.record_accelerometer(Vector3::new(0.0, 9.8, 0.0));
        session.record_gyroscope(Vector3::new(0.1, 0.0, 0.0));
        assert_eq!(view.history.get(), vec![10.0]);

        session.reset();
        assert!(view.history.get().is_empty());
        assert_eq!(view.current_angle.get(), None);
        assert_eq!(view.accelerometer.get(), None);
        assert_eq!(view.gyroscope.get(), None);
    }

    #[test]
    fn test_history_subscribers_get_each_change() {
        let mut session = SessionAccumulator::new();
        session.append(4.0);
        let (current, changes) = session.view().history.subscribe();
        assert_eq!(current, vec![4.0]);

        session.append(5.0);
        session.reset();
        session.append(6.0);

        let seen: Vec<HistoryChange> = changes.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                HistoryChange::Appended(5.0),
                HistoryChange::Cleared,
                HistoryChange::Appended(6.0),
            ]
        );
        assert_eq!(session.history(), vec![6.0]);
    }

    #[test]
    fn test_dropped_history_subscriber_is_pruned() {
        let mut session = SessionAccumulator::new();
        let view = session.view();
        drop(view.history.subscribe());
        session.append(1.0);
        assert_eq!(view.history.inner.subscribers.lock().unwrap().len(), 0);
    }

    #[test]
    fn test_observers_follow_appends() {
        let mut session = SessionAccumulator::new();
        let angles = session.view().current_angle.subscribe();
        session.append(1.0);
        session.append(2.0);

        let seen: Vec<Option<f64>> = angles.try_iter().collect();
        assert_eq!(seen, vec![None, Some(1.0), Some(2.0)]);
    }
}
