use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// A trailing-edge debouncer over arbitrary keys.
///
/// `touch` arms (or re-arms) the deadline for a key; the owning loop asks
/// for the nearest deadline to bound its blocking wait, then drains the
/// keys whose deadline has passed. There is no timer thread: firing only
/// happens when the loop calls [`KeyedDebouncer::take_due`].
#[derive(Debug)]
pub(crate) struct KeyedDebouncer<K> {
    delay: Duration,
    deadlines: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Clone> KeyedDebouncer<K> {
    pub(crate) fn new(delay: Duration) -> Self {
        KeyedDebouncer {
            delay,
            deadlines: HashMap::new(),
        }
    }

    /// Push the key's deadline out to `now + delay`.
    pub(crate) fn touch(&mut self, key: K) {
        self.deadlines.insert(key, Instant::now() + self.delay);
    }

    pub(crate) fn cancel(&mut self, key: &K) {
        self.deadlines.remove(key);
    }

    /// Drop every pending key the predicate matches.
    pub(crate) fn cancel_matching<F: Fn(&K) -> bool>(&mut self, predicate: F) {
        self.deadlines.retain(|key, _| !predicate(key));
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every key whose deadline is at or before `now`.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<K> {
        let due: Vec<K> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &due {
            self.deadlines.remove(key);
        }
        due
    }

    /// Remove and return every pending key regardless of deadline.
    pub(crate) fn take_all(&mut self) -> Vec<K> {
        self.deadlines.drain().map(|(key, _)| key).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
