use std::collections::HashMap;

use super::discard;
use super::entry::FrameEntry;

/// Entries lent to consumers and not yet returned through `process_done`
#[derive(Debug, Default)]
pub struct InFlight {
    entries: HashMap<i64, FrameEntry>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether another frame may be lent while keeping one recent slot free.
    pub fn can_admit_more(&self, recent_capacity: usize) -> bool {
        self.entries.len() < recent_capacity.saturating_sub(1)
    }

    pub fn lend(&mut self, entry: FrameEntry) {
        if let Some(previous) = self.entries.insert(entry.sensor_timestamp, entry) {
            let ts = previous.sensor_timestamp;
            discard(previous, ts, "duplicate_in_flight");
        }
    }

    /// Release a lent frame. Unknown timestamps are ignored so repeated completion
    /// signals are harmless.
    pub fn release(&mut self, sensor_timestamp: i64) -> bool {
        match self.entries.remove(&sensor_timestamp) {
            Some(entry) => {
                discard(entry, sensor_timestamp, "processed");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, sensor_timestamp: i64) -> bool {
        self.entries.contains_key(&sensor_timestamp)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn timestamps(&self) -> Vec<i64> {
        let mut ts: Vec<i64> = self.entries.keys().copied().collect();
        ts.sort_unstable();
        ts
    }

    /// Release every lent frame, returning how many there were.
    pub fn clear(&mut self, reason: &'static str) -> usize {
        let count = self.entries.len();
        for (ts, entry) in self.entries.drain() {
            discard(entry, ts, reason);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FramePool;
    use crate::pipeline::entry::test_support::entry;

    #[test]
    fn keeps_one_recent_slot_free() {
        let pool = FramePool::new(4);
        let mut in_flight = InFlight::new();

        assert!(in_flight.can_admit_more(3));
        in_flight.lend(entry(&pool, 1, 0));
        assert!(in_flight.can_admit_more(3));
        in_flight.lend(entry(&pool, 2, 0));
        assert!(!in_flight.can_admit_more(3));
    }

    #[test]
    fn release_is_idempotent() {
        let pool = FramePool::new(4);
        let mut in_flight = InFlight::new();
        in_flight.lend(entry(&pool, 1, 0));

        assert!(in_flight.release(1));
        assert!(!in_flight.release(1));
        assert!(in_flight.is_empty());
        assert_eq!(pool.stats().released, 1);
    }

    #[test]
    fn clear_releases_all_lent_frames() {
        let pool = FramePool::new(4);
        let mut in_flight = InFlight::new();
        in_flight.lend(entry(&pool, 2, 0));
        in_flight.lend(entry(&pool, 1, 0));
        assert_eq!(in_flight.timestamps(), vec![1, 2]);

        assert_eq!(in_flight.clear("teardown"), 2);
        assert_eq!(pool.stats().outstanding, 0);
    }
}
