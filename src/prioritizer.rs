//! Pluggable scheduling policies over a set of intents.
//!
//! All policies share the same contract: `get` hands out each remaining
//! intent exactly once, returns `None` when exhausted, and never blocks;
//! `finish` reports a previously retrieved intent as done so the policy can
//! update its bookkeeping.

use crate::intent::Intent;
use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};

/// Which policy [`IntentManager::finalize`](crate::manager::IntentManager::finalize)
/// should construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityType {
    Legacy,
    LongestTaskFirst,
    MultiDatabaseLTF,
}

pub trait IntentPrioritizer: Send {
    /// Retrieve the next intent to work on, or `None` when no intent remains.
    fn get(&mut self) -> Option<Intent>;
    /// Mark a previously retrieved intent as done.
    fn finish(&mut self, intent: &Intent);
}

/// Strict FIFO over discovery order, for single-threaded runs that need
/// historical, deterministic ordering.
pub struct LegacyPrioritizer {
    queue: VecDeque<Intent>,
}

impl LegacyPrioritizer {
    pub fn new(intents: Vec<Intent>) -> Self {
        LegacyPrioritizer {
            queue: intents.into(),
        }
    }
}

impl IntentPrioritizer for LegacyPrioritizer {
    fn get(&mut self) -> Option<Intent> {
        self.queue.pop_front()
    }

    fn finish(&mut self, _intent: &Intent) {}
}

/// Views first (they carry no data but must exist before other restores can
/// reference them), then everything else in non-increasing size order.
pub struct LongestTaskFirstPrioritizer {
    queue: VecDeque<Intent>,
}

impl LongestTaskFirstPrioritizer {
    pub fn new(intents: Vec<Intent>) -> Self {
        let mut views = Vec::new();
        let mut rest = Vec::new();
        for intent in intents {
            if intent.is_view() {
                views.push(intent);
            } else {
                rest.push(intent);
            }
        }
        rest.sort_by_key(|intent| Reverse(intent.size));
        views.extend(rest);
        LongestTaskFirstPrioritizer {
            queue: views.into(),
        }
    }
}

impl IntentPrioritizer for LongestTaskFirstPrioritizer {
    fn get(&mut self) -> Option<Intent> {
        self.queue.pop_front()
    }

    fn finish(&mut self, _intent: &Intent) {}
}

/// Per-database scheduling state for [`MultiDatabaseLtfPrioritizer`].
///
/// `intents` is sorted ascending by size exactly once, at construction;
/// popping from the tail yields the largest remaining intent without
/// re-sorting after partial consumption.
struct DbCounter {
    db: String,
    active: usize,
    intents: Vec<Intent>,
}

impl DbCounter {
    fn largest_remaining(&self) -> u64 {
        self.intents.last().map_or(0, |intent| intent.size)
    }
}

/// Spreads parallel workers across as many distinct databases as possible
/// (fewest active workers first), while still preferring the largest
/// remaining intent within whichever database is chosen: a greedy heuristic
/// for minimizing parallel-worker makespan.
pub struct MultiDatabaseLtfPrioritizer {
    // Binary min-heap over per-database counters, keyed by
    // (active ascending, largest remaining size descending, db name).
    heap: Vec<DbCounter>,
}

impl MultiDatabaseLtfPrioritizer {
    pub fn new(intents: Vec<Intent>) -> Self {
        let mut by_db: HashMap<String, Vec<Intent>> = HashMap::new();
        for intent in intents {
            by_db.entry(intent.db.clone()).or_default().push(intent);
        }
        let heap: Vec<DbCounter> = by_db
            .into_iter()
            .map(|(db, mut intents)| {
                intents.sort_by_key(|intent| intent.size);
                DbCounter {
                    db,
                    active: 0,
                    intents,
                }
            })
            .collect();
        let mut prioritizer = MultiDatabaseLtfPrioritizer { heap };
        if prioritizer.heap.len() > 1 {
            for i in (0..prioritizer.heap.len() / 2).rev() {
                prioritizer.sift_down(i);
            }
        }
        prioritizer
    }

    fn precedes(a: &DbCounter, b: &DbCounter) -> bool {
        (a.active, Reverse(a.largest_remaining()), &a.db)
            < (b.active, Reverse(b.largest_remaining()), &b.db)
    }

    fn sift_up(&mut self, mut i: usize) -> usize {
        while i > 0 {
            let parent = (i - 1) / 2;
            if Self::precedes(&self.heap[i], &self.heap[parent]) {
                self.heap.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
        i
    }

    fn sift_down(&mut self, mut i: usize) -> usize {
        loop {
            let left = 2 * i + 1;
            let right = left + 1;
            let mut best = i;
            if left < self.heap.len() && Self::precedes(&self.heap[left], &self.heap[best]) {
                best = left;
            }
            if right < self.heap.len() && Self::precedes(&self.heap[right], &self.heap[best]) {
                best = right;
            }
            if best == i {
                return i;
            }
            self.heap.swap(i, best);
            i = best;
        }
    }

    fn fix(&mut self, i: usize) {
        let i = self.sift_up(i);
        self.sift_down(i);
    }
}

impl IntentPrioritizer for MultiDatabaseLtfPrioritizer {
    fn get(&mut self) -> Option<Intent> {
        if self.heap.is_empty() {
            return None;
        }
        // Root = database with the fewest active workers; its intents are
        // pre-sorted ascending, so the tail is the largest remaining.
        let intent = self.heap[0].intents.pop()?;
        self.heap[0].active += 1;
        if self.heap[0].intents.is_empty() {
            // Drained databases leave the heap; finish() for them is a no-op.
            self.heap.swap_remove(0);
            if !self.heap.is_empty() {
                self.sift_down(0);
            }
        } else {
            self.sift_down(0);
        }
        Some(intent)
    }

    fn finish(&mut self, intent: &Intent) {
        if let Some(i) = self.heap.iter().position(|c| c.db == intent.db) {
            self.heap[i].active = self.heap[i].active.saturating_sub(1);
            self.fix(i);
        }
    }
}
