//! Lease-based fragmentation of one payload.
//!
//! The payload's byte axis is a doubly linked list of regions keyed by start
//! offset. Regions not currently leased are also indexed in a skiplist by
//! `(length << 32) | start`, which makes "smallest region at least `size`
//! long" a single seek.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::ids::IdDispenser;
use crate::skiplist::SkipList;
use crate::transmission::{Fragment, Transmission};
use crate::wire::{self, CodecConfig, Signer, TlvRecords};
use crate::{Address, ErrorKind, LnchatError, Result};

#[derive(Clone, Copy, Debug)]
struct Region {
    start: u32,
    length: u32,
    prev: Option<u32>,
    next: Option<u32>,
    leased: bool,
}

impl Region {
    fn key(&self) -> u64 {
        region_key(self.start, self.length)
    }
}

fn region_key(start: u32, length: u32) -> u64 {
    ((length as u64) << 32) | start as u64
}

#[derive(Default)]
struct State {
    pending: SkipList<()>,
    all: HashMap<u32, Region>,
    pending_bytes: u64,
}

/// Hands out signed fragments of one payload on demand.
pub struct Sharder {
    data: Vec<u8>,
    destination: Option<Address>,
    signer: Option<Arc<dyn Signer>>,
    fragset_id: u64,
    codec: CodecConfig,
    state: RwLock<State>,
}

/// Outstanding fragment lease.
///
/// Consume it with [`Lease::commit`] once the fragment was delivered, or
/// [`Lease::cancel`] to put its bytes back up for lease.
#[must_use = "a lease must be committed or cancelled"]
pub struct Lease<'a> {
    sharder: &'a Sharder,
    start: u32,
}

impl<'a> Lease<'a> {
    /// Offset of the leased fragment.
    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn cancel(self) {
        self.sharder.cancel(self.start);
    }

    pub fn commit(self) {}
}

impl std::fmt::Debug for Lease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("start", &self.start).finish()
    }
}

impl Sharder {
    /// Create a sharder over `data`.
    ///
    /// With a signer, `destination` is mandatory and the source of the
    /// transmission is the signer's address. Without both, the transmission
    /// is anonymous.
    pub fn new(
        data: impl Into<Vec<u8>>,
        destination: Option<Address>,
        signer: Option<Arc<dyn Signer>>,
        ids: &dyn IdDispenser,
        codec: CodecConfig,
    ) -> Result<Self> {
        let data = data.into();
        if signer.is_some() && destination.is_none() {
            return Err(LnchatError::new(
                ErrorKind::DestinationRequired,
                "signed transmission needs a destination",
            ));
        }
        let length = u32::try_from(data.len())
            .ok()
            .filter(|len| *len <= codec.max_transmission_size)
            .ok_or_else(|| {
                LnchatError::invalid_argument(format!(
                    "payload of {} bytes exceeds limit {}",
                    data.len(),
                    codec.max_transmission_size
                ))
            })?;
        let fragset_id = ids.next();
        if fragset_id == 0 {
            return Err(LnchatError::internal("fragset id space exhausted"));
        }

        let mut state = State::default();
        if length > 0 {
            let region = Region {
                start: 0,
                length,
                prev: None,
                next: None,
                leased: false,
            };
            state.pending.insert(region.key(), ());
            state.all.insert(0, region);
            state.pending_bytes = length as u64;
        }

        Ok(Self {
            data,
            destination,
            signer,
            fragset_id,
            codec,
            state: RwLock::new(state),
        })
    }

    pub fn fragset_id(&self) -> u64 {
        self.fragset_id
    }

    pub fn destination(&self) -> Option<Address> {
        self.destination
    }

    pub fn source(&self) -> Option<Address> {
        self.signer.as_ref().map(|s| s.address())
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Lease up to `size` bytes as wire records.
    ///
    /// Picks the smallest pending region at least `size` long, or the largest
    /// one when none is long enough. Returns `Ok(None)` when nothing is
    /// pending. A signing failure releases the lease before returning.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self), fields(fragset_id = self.fragset_id)))]
    pub async fn get(&self, size: u32) -> Result<Option<(TlvRecords, Lease<'_>)>> {
        if size == 0 {
            return Err(LnchatError::invalid_argument("fragment size must be positive"));
        }

        let fragment = {
            let mut state = self.write();
            let Some(region) = Self::take_region(&mut state, size) else {
                return Ok(None);
            };
            let start = region.start as usize;
            let end = start + region.length as usize;
            Fragment {
                start: region.start,
                payload: self.data[start..end].to_vec(),
                total_size: self.data.len() as u32,
                fragset_id: self.fragset_id,
                verified: false,
            }
        };

        let records = wire::marshal_and_sign(
            &self.codec,
            &fragment,
            self.destination.as_ref(),
            self.signer.as_deref(),
        )
        .await;

        match records {
            Ok(records) => Ok(Some((
                records,
                Lease {
                    sharder: self,
                    start: fragment.start,
                },
            ))),
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(start = fragment.start, "releasing lease after marshal failure: {}", err);
                self.cancel(fragment.start);
                Err(err)
            }
        }
    }

    fn take_region(state: &mut State, size: u32) -> Option<Region> {
        let largest = state.pending.last().and_then(|id| state.pending.key(id))?;
        let key = if (largest >> 32) < size as u64 {
            largest
        } else {
            let mut best = None;
            state.pending.iterate((size as u64) << 32, |k, _| {
                best = Some(k);
                ControlFlow::Break(())
            });
            best?
        };
        state.pending.delete(key);

        let start = key as u32;
        let mut region = *state.all.get(&start)?;
        if region.length > size {
            let tail = Region {
                start: start + size,
                length: region.length - size,
                prev: Some(start),
                next: region.next,
                leased: false,
            };
            if let Some(next) = region.next.and_then(|n| state.all.get_mut(&n)) {
                next.prev = Some(tail.start);
            }
            state.pending.insert(tail.key(), ());
            state.all.insert(tail.start, tail);
            region.length = size;
            region.next = Some(tail.start);
        }
        region.leased = true;
        state.all.insert(start, region);
        state.pending_bytes -= region.length as u64;
        Some(region)
    }

    /// Return the lease starting at `start`, coalescing it with pending
    /// neighbours. Returns false if no lease starts there.
    pub fn cancel(&self, start: u32) -> bool {
        let mut state = self.write();
        let Some(mut region) = state.all.get(&start).copied() else {
            return false;
        };
        if !region.leased {
            return false;
        }
        region.leased = false;
        state.pending_bytes += region.length as u64;

        if let Some(next) = region.next.and_then(|n| state.all.get(&n).copied()) {
            if !next.leased {
                state.pending.delete(next.key());
                state.all.remove(&next.start);
                region.length += next.length;
                region.next = next.next;
                if let Some(after) = next.next.and_then(|n| state.all.get_mut(&n)) {
                    after.prev = Some(region.start);
                }
            }
        }

        if let Some(mut prev) = region.prev.and_then(|p| state.all.get(&p).copied()) {
            if !prev.leased {
                state.pending.delete(prev.key());
                state.all.remove(&region.start);
                prev.length += region.length;
                prev.next = region.next;
                if let Some(after) = region.next.and_then(|n| state.all.get_mut(&n)) {
                    after.prev = Some(prev.start);
                }
                region = prev;
            }
        }

        state.pending.insert(region.key(), ());
        state.all.insert(region.start, region);
        true
    }

    /// Bytes not currently leased.
    pub fn pending(&self) -> u64 {
        self.read().pending_bytes
    }

    /// Pending regions as `(start, length)`, ordered by start.
    pub fn pending_regions(&self) -> Vec<(u32, u32)> {
        let state = self.read();
        let mut regions: Vec<(u32, u32)> = state
            .pending
            .keys()
            .into_iter()
            .map(|k| (k as u32, (k >> 32) as u32))
            .collect();
        regions.sort_unstable();
        regions
    }

    /// Snapshot of the transmission built from the current leases, and
    /// whether every byte is leased.
    pub fn result(&self) -> (Transmission, bool) {
        let state = self.read();
        let mut fragments = Vec::new();
        let mut cursor = state.all.get(&0).copied();
        while let Some(region) = cursor {
            if region.leased {
                let start = region.start as usize;
                fragments.push(Fragment {
                    start: region.start,
                    payload: self.data[start..start + region.length as usize].to_vec(),
                    total_size: self.data.len() as u32,
                    fragset_id: self.fragset_id,
                    verified: false,
                });
            }
            cursor = region.next.and_then(|n| state.all.get(&n).copied());
        }

        let transmission = Transmission {
            data: self.data.clone(),
            source: self.source(),
            destination: self.destination,
            fragset_id: self.fragset_id,
            fragments,
        };
        (transmission, state.pending_bytes == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequentialIds;
    use crate::test_utils::{address, MockSigner};
    use crate::wire::unmarshal_and_verify;

    fn sharder(data: &[u8]) -> Sharder {
        Sharder::new(data.to_vec(), None, None, &SequentialIds::new(false), CodecConfig::default())
            .unwrap()
    }

    async fn start_of(records: &TlvRecords) -> (u32, usize) {
        let (frag, _) = unmarshal_and_verify(&CodecConfig::default(), records, None)
            .await
            .unwrap();
        (frag.start, frag.payload.len())
    }

    #[test]
    fn test_signer_requires_destination() {
        let signer: Arc<dyn Signer> = Arc::new(MockSigner::new(address(3)));
        let err = Sharder::new(
            b"abc".to_vec(),
            None,
            Some(signer),
            &SequentialIds::new(false),
            CodecConfig::default(),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::DestinationRequired);
    }

    #[test]
    fn test_exhausted_ids() {
        let ids = SequentialIds::starting_after(u64::MAX, false);
        assert!(Sharder::new(b"abc".to_vec(), None, None, &ids, CodecConfig::default()).is_err());
    }

    #[test]
    fn test_payload_over_limit() {
        let codec = CodecConfig {
            max_transmission_size: 4,
            ..CodecConfig::default()
        };
        let ids = SequentialIds::new(false);
        assert!(Sharder::new(b"abcd".to_vec(), None, None, &ids, codec).is_ok());
        let err = Sharder::new(b"abcde".to_vec(), None, None, &ids, codec)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_zero_size_rejected() {
        let s = sharder(b"abc");
        assert_eq!(s.get(0).await.unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_split_and_complete() {
        let s = sharder(b"hello world");
        assert_eq!(s.pending(), 11);

        let (r0, l0) = s.get(5).await.unwrap().unwrap();
        assert_eq!(start_of(&r0).await, (0, 5));
        assert_eq!(s.pending(), 6);

        let (r1, l1) = s.get(3).await.unwrap().unwrap();
        assert_eq!(start_of(&r1).await, (5, 3));
        let (r2, l2) = s.get(3).await.unwrap().unwrap();
        assert_eq!(start_of(&r2).await, (8, 3));
        assert!(s.get(3).await.unwrap().is_none());

        l0.commit();
        l1.commit();
        l2.commit();
        let (t, complete) = s.result();
        assert!(complete);
        assert_eq!(t.data, b"hello world");
        assert_eq!(
            t.fragments.iter().map(|f| f.start).collect::<Vec<_>>(),
            vec![0, 5, 8]
        );
    }

    #[tokio::test]
    async fn test_short_fragment_when_nothing_fits() {
        let s = sharder(b"abcd");
        let (r, lease) = s.get(100).await.unwrap().unwrap();
        assert_eq!(start_of(&r).await, (0, 4));
        lease.commit();
        assert_eq!(s.pending(), 0);
    }

    #[tokio::test]
    async fn test_cancel_coalesces_both_sides() {
        let s = sharder(b"0123456789");
        let (_, a) = s.get(3).await.unwrap().unwrap();
        let (_, b) = s.get(3).await.unwrap().unwrap();
        let (_, c) = s.get(3).await.unwrap().unwrap();
        assert_eq!(s.pending_regions(), vec![(9, 1)]);

        a.cancel();
        assert_eq!(s.pending_regions(), vec![(0, 3), (9, 1)]);
        c.cancel();
        assert_eq!(s.pending_regions(), vec![(0, 3), (6, 4)]);
        b.cancel();
        assert_eq!(s.pending_regions(), vec![(0, 10)]);
        assert_eq!(s.pending(), 10);
        assert!(!s.result().1);
    }

    #[tokio::test]
    async fn test_best_fit_by_length() {
        let s = sharder(b"0123456789");
        let (_, a) = s.get(2).await.unwrap().unwrap(); // [0,2)
        let (_, b) = s.get(3).await.unwrap().unwrap(); // [2,5)
        let (_, c) = s.get(1).await.unwrap().unwrap(); // [5,6)
        a.cancel();
        assert_eq!(s.pending_regions(), vec![(0, 2), (6, 4)]);

        // A request for 2 picks the exact fit, not the first region by offset.
        let (r, l) = s.get(2).await.unwrap().unwrap();
        assert_eq!(start_of(&r).await, (0, 2));
        // A request for 3 splits the only region long enough.
        let (r, m) = s.get(3).await.unwrap().unwrap();
        assert_eq!(start_of(&r).await, (6, 3));
        for lease in [l, m, b, c] {
            lease.commit();
        }
        assert_eq!(s.pending_regions(), vec![(9, 1)]);
    }

    #[tokio::test]
    async fn test_double_cancel_is_noop() {
        let s = sharder(b"abc");
        let (_, lease) = s.get(1).await.unwrap().unwrap();
        let start = lease.start();
        lease.cancel();
        assert!(!s.cancel(start));
        assert!(!s.cancel(77));
        assert_eq!(s.pending(), 3);
    }

    #[tokio::test]
    async fn test_signing_failure_releases_lease() {
        let signer: Arc<dyn Signer> = Arc::new(MockSigner::failing(address(3)));
        let s = Sharder::new(
            b"abcdef".to_vec(),
            Some(address(2)),
            Some(signer),
            &SequentialIds::new(false),
            CodecConfig::default(),
        )
        .unwrap();
        assert!(s.get(3).await.is_err());
        assert_eq!(s.pending(), 6);
        assert_eq!(s.pending_regions(), vec![(0, 6)]);
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let s = sharder(b"");
        assert!(s.get(10).await.unwrap().is_none());
        let (t, complete) = s.result();
        assert!(complete);
        assert!(t.fragments.is_empty());
    }

    #[tokio::test]
    async fn test_source_and_destination() {
        let signer: Arc<dyn Signer> = Arc::new(MockSigner::new(address(3)));
        let s = Sharder::new(
            b"ab".to_vec(),
            Some(address(2)),
            Some(signer),
            &SequentialIds::starting_after(41, false),
            CodecConfig::default(),
        )
        .unwrap();
        assert_eq!(s.fragset_id(), 42);
        let (t, _) = s.result();
        assert_eq!(t.source, Some(address(3)));
        assert_eq!(t.destination, Some(address(2)));
    }
}
