//! Restartable deadlines and the scheduler that folds them into one wait.
//!
//! Each event loop owns a [`TimerScheduler`] keyed by its own task enum. Every
//! iteration it runs the tasks returned by [`TimerScheduler::due`], then blocks
//! on its socket for at most [`TimerScheduler::next_wait`].

use std::time::{Duration, Instant};

/// A countdown that restarts at `now + interval` when reset.
#[derive(Debug, Clone)]
pub struct DeadlineWatch {
    interval: Duration,
    deadline: Instant,
}

impl DeadlineWatch {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            deadline: now + interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn reset(&mut self, now: Instant) {
        self.deadline = now + self.interval;
    }
}

/// Ordered set of keyed watches.
#[derive(Debug)]
pub struct TimerScheduler<K> {
    watches: Vec<(K, DeadlineWatch)>,
}

impl<K> Default for TimerScheduler<K> {
    fn default() -> Self {
        Self {
            watches: Vec::new(),
        }
    }
}

impl<K: Copy + PartialEq> TimerScheduler<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a watch, replacing any existing one under the same key.
    pub fn add(&mut self, key: K, interval: Duration, now: Instant) {
        let watch = DeadlineWatch::new(interval, now);
        match self.watches.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = watch,
            None => self.watches.push((key, watch)),
        }
    }

    /// Keys whose deadline has passed, in registration order. Each returned
    /// watch is reset to `now + interval`.
    pub fn due(&mut self, now: Instant) -> Vec<K> {
        let mut fired = Vec::new();
        for (key, watch) in &mut self.watches {
            if watch.is_due(now) {
                watch.reset(now);
                fired.push(*key);
            }
        }
        fired
    }

    pub fn reset(&mut self, key: K, now: Instant) {
        if let Some((_, watch)) = self.watches.iter_mut().find(|(k, _)| *k == key) {
            watch.reset(now);
        }
    }

    /// Smallest remaining time across all watches; `None` when there are none.
    pub fn next_wait(&self, now: Instant) -> Option<Duration> {
        self.watches
            .iter()
            .map(|(_, watch)| watch.remaining(now))
            .min()
    }

    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }
}
