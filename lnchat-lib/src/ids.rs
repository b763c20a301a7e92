//! Transmission identifier dispensers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Source of fragset identifiers. `0` is reserved as invalid.
pub trait IdDispenser: Send + Sync {
    /// Next identifier, or `0` once the space is exhausted.
    fn next(&self) -> u64;

    /// Return an identifier to the dispenser.
    fn release(&self, id: u64);
}

/// Lock-free monotonic dispenser yielding 1, 2, 3, ...
///
/// On overflow it either resumes from 1 (`wrap = true`) or returns `0`
/// forever after.
#[derive(Debug)]
pub struct SequentialIds {
    last: AtomicU64,
    wrap: bool,
}

impl SequentialIds {
    pub fn new(wrap: bool) -> Self {
        Self::starting_after(0, wrap)
    }

    /// Dispenser whose first `next()` returns `last + 1`.
    pub fn starting_after(last: u64, wrap: bool) -> Self {
        Self {
            last: AtomicU64::new(last),
            wrap,
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new(true)
    }
}

impl IdDispenser for SequentialIds {
    fn next(&self) -> u64 {
        let wrap = self.wrap;
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| match cur {
                u64::MAX if wrap => Some(1),
                u64::MAX => None,
                n => Some(n + 1),
            });
        match previous {
            Ok(u64::MAX) => 1,
            Ok(n) => n + 1,
            Err(_) => 0,
        }
    }

    fn release(&self, _id: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_sequence_starts_at_one() {
        let ids = SequentialIds::new(false);
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        ids.release(2);
        assert_eq!(ids.next(), 3);
    }

    #[test]
    fn test_overflow_without_wrap_returns_zero() {
        let ids = SequentialIds::starting_after(u64::MAX - 1, false);
        assert_eq!(ids.next(), u64::MAX);
        assert_eq!(ids.next(), 0);
        assert_eq!(ids.next(), 0);
    }

    #[test]
    fn test_overflow_with_wrap_resumes_at_one() {
        let ids = SequentialIds::starting_after(u64::MAX - 1, true);
        assert_eq!(ids.next(), u64::MAX);
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
    }

    #[test]
    fn test_concurrent_ids_are_unique() {
        let ids = Arc::new(SequentialIds::new(false));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..1000).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(id != 0);
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 8000);
    }
}
