//! Suppression of messages the gateway delivers more than once.
//!
//! WhatsApp Web occasionally replays `messages.upsert` for the same message
//! id after a reconnect. [`SeenSet`] remembers ids for a fixed window and
//! bounds its memory by evicting the oldest entry on overflow.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug)]
pub struct SeenSet {
    window: Duration,
    capacity: usize,
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl SeenSet {
    /// A capacity of 0 is treated as 1.
    pub fn new(window: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window,
            capacity,
            seen: HashMap::with_capacity(capacity.min(1024)),
            order: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Returns `true` only the first time `id` shows up inside the window.
    pub fn first_sighting(&mut self, id: &str) -> bool {
        self.first_sighting_at(id, Instant::now())
    }

    fn first_sighting_at(&mut self, id: &str, now: Instant) -> bool {
        self.evict_expired(now);
        if self.seen.contains_key(id) {
            return false;
        }
        if self.seen.len() >= self.capacity
            && let Some((oldest, _)) = self.order.pop_front()
        {
            self.seen.remove(&oldest);
        }
        self.seen.insert(id.to_string(), now);
        self.order.push_back((id.to_string(), now));
        true
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((id, seen_at)) = self.order.front() {
            if now.duration_since(*seen_at) < self.window {
                break;
            }
            self.seen.remove(id);
            self.order.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_inside_window_are_suppressed() {
        let mut seen = SeenSet::default();
        assert!(seen.first_sighting("3EB0A1"));
        assert!(!seen.first_sighting("3EB0A1"));
        assert!(seen.first_sighting("3EB0A2"));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn ids_expire_after_window() {
        let mut seen = SeenSet::new(Duration::from_secs(60), 16);
        let start = Instant::now();
        assert!(seen.first_sighting_at("msg", start));
        assert!(!seen.first_sighting_at("msg", start + Duration::from_secs(59)));
        assert!(seen.first_sighting_at("msg", start + Duration::from_secs(61)));
    }

    #[test]
    fn overflow_evicts_oldest() {
        let mut seen = SeenSet::new(Duration::from_secs(60), 2);
        assert!(seen.first_sighting("a"));
        assert!(seen.first_sighting("b"));
        assert!(seen.first_sighting("c"));
        assert_eq!(seen.len(), 2);
        assert!(seen.first_sighting("a"));
        assert!(!seen.first_sighting("c"));
    }

    #[test]
    fn zero_capacity_treated_as_one() {
        let mut seen = SeenSet::new(Duration::from_secs(60), 0);
        assert!(seen.first_sighting("a"));
        assert!(seen.first_sighting("b"));
        assert_eq!(seen.len(), 1);
        assert!(!seen.is_empty());
    }
}
