//! Subscription lists shared by the timer and the settings provider.

use std::sync::Arc;

/// Handle returned when registering a callback; pass it back to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

pub(crate) struct ObserverList<F: ?Sized> {
    next_id: u64,
    entries: Vec<(ObserverId, Arc<F>)>,
}

impl<F: ?Sized> ObserverList<F> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, callback: Arc<F>) -> ObserverId {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.entries.push((id, callback));
        id
    }

    pub(crate) fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    /// Callbacks in registration order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<F>> {
        self.entries.iter().map(|(_, callback)| callback)
    }
}
