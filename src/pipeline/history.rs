//! Two-tier frame history for zero-shutter-lag lookups
//!
//! The recent tier keeps every frame above a rate floor; frames pushed out of it are
//! demoted into a longer, downsampled history tier. Both tiers evict oldest-first and
//! release whatever they evict.

use std::collections::VecDeque;

use tracing::trace;

use super::discard;
use super::entry::FrameEntry;

/// Resolved retention limits for both tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Tier-1 slot count, shared with frames lent to consumers
    pub recent_capacity: usize,
    /// Tier-2 slot count
    pub history_capacity: usize,
    /// Frames arriving within this many microseconds of the last admission are dropped
    pub min_frame_interval_us: i64,
    /// Minimum arrival spacing between tier-2 admissions
    pub history_interval_us: i64,
    /// Subtracted from shutter targets before nearest-match lookup
    pub shutter_latency_ns: i64,
}

/// Outcome of [`HistoryQueue::admit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    RateLimited,
}

pub struct HistoryQueue {
    policy: RetentionPolicy,
    recent: VecDeque<FrameEntry>,
    history: VecDeque<FrameEntry>,
    last_recent_admit_us: Option<i64>,
    last_history_admit_us: Option<i64>,
}

impl HistoryQueue {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            recent: VecDeque::with_capacity(policy.recent_capacity + 1),
            history: VecDeque::with_capacity(policy.history_capacity + 1),
            last_recent_admit_us: None,
            last_history_admit_us: None,
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Insert a correlated frame into the recent tier.
    ///
    /// `in_flight` frames borrow from the recent tier's budget, so the tier holds at
    /// most `recent_capacity - in_flight` entries afterwards.
    pub fn admit(&mut self, entry: FrameEntry, in_flight: usize) -> Admission {
        if let Some(last) = self.last_recent_admit_us {
            if entry.arrival_us - last <= self.policy.min_frame_interval_us {
                let ts = entry.sensor_timestamp;
                discard(entry, ts, "rate_floor");
                return Admission::RateLimited;
            }
        }

        self.last_recent_admit_us = Some(entry.arrival_us);
        trace!(sensor_timestamp = entry.sensor_timestamp, "frame admitted");
        metrics::counter!("zsl_frames_admitted").increment(1);
        self.recent.push_back(entry);
        self.enforce_budget(in_flight);
        Admission::Queued
    }

    /// Demote oldest recent entries until the tier fits next to `in_flight` lent frames.
    pub fn enforce_budget(&mut self, in_flight: usize) {
        let budget = self.policy.recent_capacity.saturating_sub(in_flight);
        while self.recent.len() > budget {
            match self.recent.pop_front() {
                Some(oldest) => self.demote(oldest),
                None => break,
            }
        }
    }

    fn demote(&mut self, entry: FrameEntry) {
        let ts = entry.sensor_timestamp;
        if self.policy.history_capacity == 0 {
            discard(entry, ts, "no_history");
            return;
        }

        let due = self
            .last_history_admit_us
            .map_or(true, |last| entry.arrival_us - last > self.policy.history_interval_us);
        if !due {
            discard(entry, ts, "demoted_too_soon");
            return;
        }

        self.last_history_admit_us = Some(entry.arrival_us);
        self.history.push_back(entry);
        while self.history.len() > self.policy.history_capacity {
            if let Some(oldest) = self.history.pop_front() {
                let oldest_ts = oldest.sensor_timestamp;
                discard(oldest, oldest_ts, "tier2_overflow");
            }
        }
    }

    /// Remove and return the frame closest to (and preferably not after) `target_ns`.
    ///
    /// The target is first shifted back by the shutter latency. The history tier is
    /// searched when it already reaches the adjusted target, the recent tier otherwise.
    pub fn take_nearest(&mut self, target_ns: i64) -> Option<FrameEntry> {
        let adjusted = target_ns.saturating_sub(self.policy.shutter_latency_ns);
        let history_spans = self
            .history
            .back()
            .is_some_and(|e| e.sensor_timestamp >= adjusted);

        let tier = if history_spans || self.recent.is_empty() {
            &mut self.history
        } else {
            &mut self.recent
        };
        let index = nearest_index(tier, adjusted)?;
        tier.remove(index)
    }

    /// Look up an entry by sensor timestamp without removing it.
    pub fn find(&self, sensor_timestamp: i64) -> Option<&FrameEntry> {
        self.recent
            .iter()
            .chain(self.history.iter())
            .find(|e| e.sensor_timestamp == sensor_timestamp)
    }

    /// Remove an entry by sensor timestamp, recent tier first.
    pub fn take(&mut self, sensor_timestamp: i64) -> Option<FrameEntry> {
        for tier in [&mut self.recent, &mut self.history] {
            if let Some(pos) = tier
                .iter()
                .position(|e| e.sensor_timestamp == sensor_timestamp)
            {
                return tier.remove(pos);
            }
        }
        None
    }

    pub fn recent_timestamps(&self) -> Vec<i64> {
        self.recent.iter().map(|e| e.sensor_timestamp).collect()
    }

    pub fn history_timestamps(&self) -> Vec<i64> {
        self.history.iter().map(|e| e.sensor_timestamp).collect()
    }

    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty() && self.history.is_empty()
    }

    /// Release every entry and forget admission times.
    pub fn clear(&mut self, reason: &'static str) {
        for entry in self.recent.drain(..).chain(self.history.drain(..)) {
            let ts = entry.sensor_timestamp;
            discard(entry, ts, reason);
        }
        self.last_recent_admit_us = None;
        self.last_history_admit_us = None;
    }
}

/// Entries at or before the target win over later ones; among them the smallest
/// distance wins, and the first scanned (oldest) wins ties.
fn nearest_index(tier: &VecDeque<FrameEntry>, target: i64) -> Option<usize> {
    let mut best: Option<((bool, u64), usize)> = None;
    for (index, entry) in tier.iter().enumerate() {
        let delta = target.saturating_sub(entry.sensor_timestamp);
        let key = (delta < 0, delta.unsigned_abs());
        if best.map_or(true, |(best_key, _)| key < best_key) {
            best = Some((key, index));
        }
    }
    best.map(|(_, index)| index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FramePool;
    use crate::pipeline::entry::test_support::entry;

    const MS: i64 = 1_000;

    fn policy(recent: usize, history: usize) -> RetentionPolicy {
        RetentionPolicy {
            recent_capacity: recent,
            history_capacity: history,
            min_frame_interval_us: 5 * MS,
            history_interval_us: 25 * MS,
            shutter_latency_ns: 0,
        }
    }

    /// Admit a frame whose sensor timestamp (ns) equals its arrival time
    fn admit_at(queue: &mut HistoryQueue, pool: &FramePool, ms: i64) -> Admission {
        queue.admit(entry(pool, ms * 1_000_000, ms * MS), 0)
    }

    fn ms_list(ts: Vec<i64>) -> Vec<i64> {
        ts.into_iter().map(|t| t / 1_000_000).collect()
    }

    #[test]
    fn overflow_without_history_releases_oldest() {
        let pool = FramePool::new(8);
        let mut queue = HistoryQueue::new(policy(3, 0));

        for ms in [0, 10, 20, 30] {
            assert_eq!(admit_at(&mut queue, &pool, ms), Admission::Queued);
        }

        assert_eq!(ms_list(queue.recent_timestamps()), vec![10, 20, 30]);
        assert_eq!(queue.history_len(), 0);
        assert_eq!(pool.stats().released, 1);
    }

    #[test]
    fn frames_inside_the_rate_floor_are_released() {
        let pool = FramePool::new(8);
        let mut queue = HistoryQueue::new(policy(3, 0));

        assert_eq!(admit_at(&mut queue, &pool, 10), Admission::Queued);
        assert_eq!(admit_at(&mut queue, &pool, 13), Admission::RateLimited);

        assert_eq!(queue.recent_len(), 1);
        assert_eq!(pool.stats().released, 1);
    }

    #[test]
    fn rate_floor_boundary_is_inclusive() {
        let pool = FramePool::new(8);
        let mut queue = HistoryQueue::new(policy(3, 0));

        admit_at(&mut queue, &pool, 10);
        assert_eq!(admit_at(&mut queue, &pool, 15), Admission::RateLimited);
        assert_eq!(admit_at(&mut queue, &pool, 16), Admission::Queued);
    }

    #[test]
    fn demotion_is_downsampled_by_history_interval() {
        let pool = FramePool::new(16);
        let mut queue = HistoryQueue::new(policy(2, 4));

        // Demoted in order: 0, 10, 20, 30, 40. Only 0 and 30 are far enough apart.
        for ms in [0, 10, 20, 30, 40, 50, 60] {
            admit_at(&mut queue, &pool, ms);
        }

        assert_eq!(ms_list(queue.recent_timestamps()), vec![50, 60]);
        assert_eq!(ms_list(queue.history_timestamps()), vec![0, 30]);
        assert_eq!(pool.stats().outstanding, 4);
    }

    #[test]
    fn history_overflow_releases_its_oldest() {
        let pool = FramePool::new(16);
        let mut queue = HistoryQueue::new(RetentionPolicy {
            history_interval_us: 0,
            ..policy(1, 2)
        });

        for ms in [0, 10, 20, 30] {
            admit_at(&mut queue, &pool, ms);
        }

        assert_eq!(ms_list(queue.recent_timestamps()), vec![30]);
        assert_eq!(ms_list(queue.history_timestamps()), vec![10, 20]);
        assert_eq!(pool.stats().outstanding, 3);
    }

    #[test]
    fn in_flight_frames_shrink_the_recent_budget() {
        let pool = FramePool::new(8);
        let mut queue = HistoryQueue::new(policy(3, 0));
        for ms in [0, 10, 20] {
            admit_at(&mut queue, &pool, ms);
        }

        queue.enforce_budget(2);

        assert_eq!(ms_list(queue.recent_timestamps()), vec![20]);
        assert_eq!(pool.stats().outstanding, 1);
    }

    #[test]
    fn nearest_prefers_latest_frame_before_target() {
        let pool = FramePool::new(8);
        let mut queue = HistoryQueue::new(policy(4, 0));
        for ms in [0, 10, 20, 30] {
            admit_at(&mut queue, &pool, ms);
        }

        let hit = queue.take_nearest(24_000_000).unwrap();
        assert_eq!(hit.sensor_timestamp, 20_000_000);
        assert_eq!(ms_list(queue.recent_timestamps()), vec![0, 10, 30]);
    }

    #[test]
    fn nearest_falls_back_to_oldest_when_target_predates_everything() {
        let pool = FramePool::new(8);
        let mut queue = HistoryQueue::new(policy(4, 0));
        for ms in [10, 20] {
            admit_at(&mut queue, &pool, ms);
        }

        let hit = queue.take_nearest(1_000_000).unwrap();
        assert_eq!(hit.sensor_timestamp, 10_000_000);
    }

    #[test]
    fn nearest_searches_history_when_it_spans_the_target() {
        let pool = FramePool::new(16);
        let mut queue = HistoryQueue::new(RetentionPolicy {
            history_interval_us: 0,
            ..policy(2, 4)
        });
        for ms in [0, 10, 20, 30, 40] {
            admit_at(&mut queue, &pool, ms);
        }
        assert_eq!(ms_list(queue.history_timestamps()), vec![0, 10, 20]);

        let hit = queue.take_nearest(15_000_000).unwrap();
        assert_eq!(hit.sensor_timestamp, 10_000_000);

        let hit = queue.take_nearest(35_000_000).unwrap();
        assert_eq!(hit.sensor_timestamp, 30_000_000);
    }

    #[test]
    fn nearest_applies_shutter_latency() {
        let pool = FramePool::new(8);
        let mut queue = HistoryQueue::new(RetentionPolicy {
            shutter_latency_ns: 10_000_000,
            ..policy(4, 0)
        });
        for ms in [0, 10, 20, 30] {
            admit_at(&mut queue, &pool, ms);
        }

        let hit = queue.take_nearest(31_000_000).unwrap();
        assert_eq!(hit.sensor_timestamp, 20_000_000);
    }

    #[test]
    fn nearest_on_empty_queue_is_none() {
        let mut queue = HistoryQueue::new(policy(3, 2));
        assert!(queue.take_nearest(0).is_none());
    }

    #[test]
    fn find_does_not_remove_but_take_does() {
        let pool = FramePool::new(8);
        let mut queue = HistoryQueue::new(policy(3, 0));
        admit_at(&mut queue, &pool, 10);

        assert!(queue.find(10_000_000).is_some());
        assert_eq!(queue.recent_len(), 1);
        assert!(queue.take(10_000_000).is_some());
        assert!(queue.is_empty());
        assert!(queue.take(10_000_000).is_none());
    }

    #[test]
    fn clear_releases_everything_and_resets_rate_floor() {
        let pool = FramePool::new(16);
        let mut queue = HistoryQueue::new(RetentionPolicy {
            history_interval_us: 0,
            ..policy(2, 2)
        });
        for ms in [0, 10, 20, 30] {
            admit_at(&mut queue, &pool, ms);
        }

        queue.clear("flush");

        assert!(queue.is_empty());
        assert_eq!(pool.stats().outstanding, 0);
        // The floor no longer refers to the 30 ms admission.
        assert_eq!(admit_at(&mut queue, &pool, 31), Admission::Queued);
    }
}
