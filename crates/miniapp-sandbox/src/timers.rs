//! Deadline queue for `setTimeout` / `setInterval`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use tokio::time::Instant;

/// Shortest period an interval is re-armed with, so a batch always terminates.
const MIN_REARM: Duration = Duration::from_millis(1);

/// Timer identifier handed to the logic.
pub(crate) type TimerId = i64;

struct TimerEntry<T> {
    callback: T,
    interval: Option<Duration>,
    deadline: Instant,
}

/// Timers keyed by id, ordered by deadline.
///
/// Cancelled or rescheduled timers leave stale heap entries behind; they
/// are discarded lazily when they reach the top.
pub(crate) struct TimerQueue<T> {
    entries: HashMap<TimerId, TimerEntry<T>>,
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    next_id: TimerId,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            heap: BinaryHeap::new(),
            next_id: 1,
        }
    }
}

impl<T: Clone> TimerQueue<T> {
    /// Schedule `callback` after `delay`. With `repeat`, it re-arms every `delay`.
    pub(crate) fn schedule(&mut self, callback: T, delay: Duration, repeat: bool) -> TimerId {
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);

        let deadline = Instant::now() + delay;
        self.entries.insert(
            id,
            TimerEntry {
                callback,
                interval: repeat.then_some(delay),
                deadline,
            },
        );
        self.heap.push(Reverse((deadline, id)));
        id
    }

    /// Cancel a timer. Unknown ids are ignored.
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Earliest live deadline.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            match self.entries.get(&id) {
                Some(entry) if entry.deadline == deadline => return Some(deadline),
                _ => {
                    self.heap.pop();
                },
            }
        }
        None
    }

    /// Remove and return every timer due at `now`.
    ///
    /// Intervals are re-armed relative to `now`. Timers scheduled while the
    /// returned callbacks run are not part of this batch.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<(TimerId, T)> {
        let mut due = Vec::new();
        while let Some(deadline) = self.next_deadline() {
            if deadline > now {
                break;
            }
            let Some(Reverse((_, id))) = self.heap.pop() else {
                break;
            };
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            due.push((id, entry.callback.clone()));

            match entry.interval {
                Some(interval) => {
                    entry.deadline = now + interval.max(MIN_REARM);
                    self.heap.push(Reverse((entry.deadline, id)));
                },
                None => {
                    self.entries.remove(&id);
                },
            }
        }
        due
    }

    /// Whether a timer is still live.
    #[cfg(test)]
    pub(crate) fn contains(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of live timers.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Cancel everything.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.heap.clear();
    }
}
