//! Bounded, time-limited record of handled message ids.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

/// Remembers ids for `ttl`, capped at `capacity` entries (oldest evicted).
pub struct SeenIds {
    entries: LruCache<String, Instant>,
    ttl: Duration,
}

impl SeenIds {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
            ttl,
        }
    }

    /// Record `id`. Returns `true` the first time it is seen within the TTL.
    pub fn insert(&mut self, id: &str, now: Instant) -> bool {
        if let Some(at) = self.entries.peek(id) {
            if now.saturating_duration_since(*at) < self.ttl {
                return false;
            }
        }
        self.entries.put(id.to_string(), now);
        true
    }

    pub fn contains(&self, id: &str, now: Instant) -> bool {
        self.entries
            .peek(id)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.ttl)
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) >= self.ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.entries.pop(id);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sighting_only() {
        let mut seen = SeenIds::new(10, Duration::from_secs(60));
        let now = Instant::now();
        assert!(seen.insert("a", now));
        assert!(!seen.insert("a", now + Duration::from_secs(1)));
        assert!(seen.contains("a", now));
        assert!(seen.insert("b", now));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_expired_id_is_new_again() {
        let mut seen = SeenIds::new(10, Duration::from_secs(60));
        let now = Instant::now();
        seen.insert("a", now);
        let later = now + Duration::from_secs(61);
        assert!(!seen.contains("a", later));
        assert!(seen.insert("a", later));
    }

    #[test]
    fn test_prune_removes_only_expired() {
        let mut seen = SeenIds::new(10, Duration::from_secs(60));
        let now = Instant::now();
        seen.insert("old", now);
        seen.insert("new", now + Duration::from_secs(30));
        assert_eq!(seen.prune(now + Duration::from_secs(60)), 1);
        assert_eq!(seen.len(), 1);
        assert!(seen.contains("new", now + Duration::from_secs(60)));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut seen = SeenIds::new(2, Duration::from_secs(60));
        let now = Instant::now();
        seen.insert("a", now);
        seen.insert("b", now);
        seen.insert("c", now);
        assert_eq!(seen.len(), 2);
        assert!(!seen.contains("a", now));
    }

    #[test]
    fn test_zero_capacity_still_usable() {
        let mut seen = SeenIds::new(0, Duration::from_secs(1));
        assert!(seen.insert("a", Instant::now()));
    }
}
