//! Fragments and transmissions.

use serde::{Deserialize, Serialize};

use crate::Address;

/// A contiguous range of a transmission's bytes.
///
/// `start + payload.len() <= total_size` holds for every fragment produced by
/// the codec.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub start: u32,
    pub payload: Vec<u8>,
    pub total_size: u32,
    pub fragset_id: u64,
    pub verified: bool,
}

impl Fragment {
    /// Offset one past the last byte.
    pub fn end(&self) -> u64 {
        self.start as u64 + self.payload.len() as u64
    }
}

/// A unit of user data carried over one or more fragments.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transmission {
    pub data: Vec<u8>,
    pub source: Option<Address>,
    pub destination: Option<Address>,
    pub fragset_id: u64,
    pub fragments: Vec<Fragment>,
}

impl Transmission {
    /// True iff there is at least one fragment and all are verified.
    pub fn verified(&self) -> bool {
        !self.fragments.is_empty() && self.fragments.iter().all(|f| f.verified)
    }

    /// True iff the fragments cover `[0, data.len())` without gaps.
    pub fn is_covered(&self) -> bool {
        let mut ranges: Vec<(u64, u64)> = self
            .fragments
            .iter()
            .map(|f| (f.start as u64, f.end()))
            .collect();
        ranges.sort_unstable();
        let mut covered = 0u64;
        for (start, end) in ranges {
            if start > covered {
                return false;
            }
            covered = covered.max(end);
        }
        covered == self.data.len() as u64
    }
}

/// Identity of one in-flight transmission at the receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransmissionId {
    pub source: Option<Address>,
    pub fragset_id: u64,
    pub total_size: u32,
}

impl TransmissionId {
    pub fn new(source: Option<Address>, fragment: &Fragment) -> Self {
        Self {
            source,
            fragset_id: fragment.fragset_id,
            total_size: fragment.total_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(start: u32, len: usize, total: u32) -> Fragment {
        Fragment {
            start,
            payload: vec![0; len],
            total_size: total,
            fragset_id: 1,
            verified: true,
        }
    }

    #[test]
    fn test_coverage_with_overlap() {
        let t = Transmission {
            data: vec![0; 10],
            fragments: vec![frag(4, 6, 10), frag(0, 5, 10)],
            ..Default::default()
        };
        assert!(t.is_covered());
        assert!(t.verified());
    }

    #[test]
    fn test_coverage_gap() {
        let t = Transmission {
            data: vec![0; 10],
            fragments: vec![frag(0, 4, 10), frag(5, 5, 10)],
            ..Default::default()
        };
        assert!(!t.is_covered());
    }

    #[test]
    fn test_verified_requires_every_fragment() {
        let mut unverified = frag(5, 5, 10);
        unverified.verified = false;
        let t = Transmission {
            data: vec![0; 10],
            fragments: vec![frag(0, 5, 10), unverified],
            ..Default::default()
        };
        assert!(!t.verified());
        assert!(!Transmission::default().verified());
    }
}
