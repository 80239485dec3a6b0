use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Registry of scheduled timeout events; ids are monotonic from 1 for the
/// lifetime of one run.
pub struct TimerQueue {
    next_id: u32,
    scheduled: BTreeMap<u32, Instant>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            scheduled: BTreeMap::new(),
        }
    }

    pub fn schedule(&mut self, delay_ms: u64) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        // The extra millisecond compensates for hosts whose timers fire early.
        let deadline = Instant::now() + Duration::from_millis(delay_ms + 1);
        self.scheduled.insert(id, deadline);
        id
    }

    /// Cancel `id`. Cancelling an id that already fired and was deregistered
    /// is a no-op.
    pub fn clear(&mut self, id: u32) {
        self.scheduled.remove(&id);
    }

    pub fn contains(&self, id: u32) -> bool {
        self.scheduled.contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    /// The next event due: earliest deadline, ties broken by lower id.
    pub fn earliest(&self) -> Option<(u32, Instant)> {
        self.scheduled
            .iter()
            .min_by_key(|(id, deadline)| (**deadline, **id))
            .map(|(id, deadline)| (*id, *deadline))
    }

    /// Forget every scheduled event (end of run).
    pub fn reset(&mut self) {
        self.scheduled.clear();
        self.next_id = 1;
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}
