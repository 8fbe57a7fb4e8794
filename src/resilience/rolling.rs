//! Bucketed rolling window of command outcomes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Result of one admission attempt or unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
    /// Rejected because the circuit was open.
    ShortCircuited,
    /// Rejected because the concurrency ceiling was reached.
    Rejected,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Timeout => "timeout",
            Outcome::ShortCircuited => "short_circuited",
            Outcome::Rejected => "rejected",
        }
    }
}

/// Outcome counters for a span of time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub short_circuited: u64,
    pub rejected: u64,
}

impl Counts {
    fn add(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.successes += 1,
            Outcome::Failure => self.failures += 1,
            Outcome::Timeout => self.timeouts += 1,
            Outcome::ShortCircuited => self.short_circuited += 1,
            Outcome::Rejected => self.rejected += 1,
        }
    }

    fn merge(&mut self, other: &Counts) {
        self.successes += other.successes;
        self.failures += other.failures;
        self.timeouts += other.timeouts;
        self.short_circuited += other.short_circuited;
        self.rejected += other.rejected;
    }

    /// Calls that actually ran. Rejections do not count towards health.
    pub fn requests(&self) -> u64 {
        self.successes + self.failures + self.timeouts
    }

    pub fn errors(&self) -> u64 {
        self.failures + self.timeouts
    }

    pub fn error_percentage(&self) -> f64 {
        match self.requests() {
            0 => 0.0,
            total => self.errors() as f64 * 100.0 / total as f64,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    start: Instant,
    counts: Counts,
}

/// Most buckets one window may be split into.
pub const MAX_BUCKETS: usize = 1000;

/// Fixed number of equal-width buckets covering the last `window` of time.
#[derive(Debug)]
pub struct RollingWindow {
    width: Duration,
    capacity: usize,
    buckets: VecDeque<Bucket>,
}

impl RollingWindow {
    pub fn new(window: Duration, buckets: usize) -> Self {
        let capacity = buckets.clamp(1, MAX_BUCKETS);
        let width = (window / bucket_divisor(capacity)).max(Duration::from_millis(1));
        Self {
            width,
            capacity,
            buckets: VecDeque::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, now: Instant, outcome: Outcome) {
        self.prune(now);
        let fresh = match self.buckets.back() {
            Some(bucket) => now.duration_since(bucket.start) >= self.width,
            None => true,
        };
        if fresh {
            if self.buckets.len() == self.capacity {
                self.buckets.pop_front();
            }
            self.buckets.push_back(Bucket {
                start: now,
                counts: Counts::default(),
            });
        }
        if let Some(bucket) = self.buckets.back_mut() {
            bucket.counts.add(outcome);
        }
    }

    /// Sum over every bucket still inside the window.
    pub fn totals(&mut self, now: Instant) -> Counts {
        self.prune(now);
        let mut total = Counts::default();
        for bucket in &self.buckets {
            total.merge(&bucket.counts);
        }
        total
    }

    pub fn reset(&mut self) {
        self.buckets.clear();
    }

    fn prune(&mut self, now: Instant) {
        let span = self
            .width
            .checked_mul(bucket_divisor(self.capacity))
            .unwrap_or(Duration::MAX);
        while let Some(front) = self.buckets.front() {
            if now.duration_since(front.start) >= span {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }
}

fn bucket_divisor(capacity: usize) -> u32 {
    u32::try_from(capacity).unwrap_or(u32::MAX).max(1)
}
