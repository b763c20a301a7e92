//! Per-source reassembly of fragments into transmissions.
//!
//! Each in-flight transmission is owned by one spawned task that selects over
//! its fragment intake and an idle timer. Fragments are drained into the
//! buffer in ascending start order from a min-heap; a fragment is applied once
//! everything before its start has been written, so arrival order, duplicates
//! and overlaps do not matter.
//!
//! Every caller that submits a fragment of the same transmission gets the same
//! [`Notifier`]. It yields the completed transmission at most once and then
//! reports closure; a transmission that stalls for the idle timeout is evicted
//! and its notifier closes without a value.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::transmission::{Fragment, Transmission, TransmissionId};
use crate::wire::{self, CodecConfig, TlvRecords, Verifier};
use crate::{Address, Result};

/// Idle time after which an incomplete transmission is dropped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

const INTAKE_CAPACITY: usize = 1;
const NOTIFY_CAPACITY: usize = 1;

/// Receiving side of a transmission's completion channel.
#[derive(Clone)]
pub struct Notifier {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Transmission>>>,
}

impl Notifier {
    fn new(rx: mpsc::Receiver<Transmission>) -> Self {
        Self {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    /// Wait for the completed transmission. `None` once the channel is
    /// closed, either after the value was taken or on eviction.
    pub async fn recv(&self) -> Option<Transmission> {
        self.rx.lock().await.recv().await
    }

    /// Whether both notifiers observe the same channel.
    pub fn same_channel(&self, other: &Notifier) -> bool {
        Arc::ptr_eq(&self.rx, &other.rx)
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

struct Entry {
    generation: u64,
    intake: mpsc::Sender<Fragment>,
    notifier: Notifier,
}

type Table = Arc<Mutex<HashMap<TransmissionId, Entry>>>;

fn lock(table: &Table) -> MutexGuard<'_, HashMap<TransmissionId, Entry>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

/// Reassembles fragments from many sources concurrently.
pub struct Aggregator {
    verifier: Option<Arc<dyn Verifier>>,
    codec: CodecConfig,
    idle_timeout: Duration,
    table: Table,
    generation: AtomicU64,
}

impl Aggregator {
    /// Without a verifier every transmission is unverified and has no
    /// destination.
    pub fn new(verifier: Option<Arc<dyn Verifier>>) -> Self {
        Self {
            verifier,
            codec: CodecConfig::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            table: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec;
        self
    }

    /// Number of transmissions currently being reassembled.
    pub fn in_flight(&self) -> usize {
        lock(&self.table).len()
    }

    /// Decode, verify and route one fragment to its transmission.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    pub async fn update(&self, records: &TlvRecords) -> Result<Notifier> {
        let (mut fragment, sender) =
            wire::unmarshal_and_verify(&self.codec, records, self.verifier.as_deref()).await?;
        let id = TransmissionId::new(sender, &fragment);

        loop {
            let (intake, notifier, generation) = {
                let mut table = lock(&self.table);
                let entry = table.entry(id).or_insert_with(|| self.spawn_state(id));
                (
                    entry.intake.clone(),
                    entry.notifier.clone(),
                    entry.generation,
                )
            };

            match intake.send(fragment).await {
                Ok(()) => return Ok(notifier),
                Err(mpsc::error::SendError(returned)) => {
                    // The state is shutting down; replace it.
                    fragment = returned;
                    let mut table = lock(&self.table);
                    if table.get(&id).map(|e| e.generation) == Some(generation) {
                        table.remove(&id);
                    }
                }
            }
        }
    }

    fn spawn_state(&self, id: TransmissionId) -> Entry {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CAPACITY);
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_CAPACITY);

        let destination = self.verifier.as_ref().map(|v| v.address());
        let reassembly = Reassembly::new(id, destination);
        let table = Arc::clone(&self.table);
        let idle_timeout = self.idle_timeout;

        tokio::spawn(async move {
            run_state(reassembly, intake_rx, notify_tx, idle_timeout).await;
            let mut table = lock(&table);
            if table.get(&id).map(|e| e.generation) == Some(generation) {
                table.remove(&id);
            }
        });

        Entry {
            generation,
            intake: intake_tx,
            notifier: Notifier::new(notify_rx),
        }
    }
}

async fn run_state(
    mut reassembly: Reassembly,
    mut intake: mpsc::Receiver<Fragment>,
    notify: mpsc::Sender<Transmission>,
    idle_timeout: Duration,
) {
    let timer = tokio::time::sleep(idle_timeout);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            fragment = intake.recv() => {
                let Some(fragment) = fragment else { break };
                if reassembly.push(fragment) {
                    break;
                }
                timer.as_mut().reset(Instant::now() + idle_timeout);
            }
            _ = &mut timer => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    fragset_id = reassembly.id.fragset_id,
                    written = reassembly.first_pending,
                    "evicting idle transmission"
                );
                break;
            }
        }
    }

    // Fragments accepted before the close still count.
    intake.close();
    while let Ok(fragment) = intake.try_recv() {
        reassembly.push(fragment);
    }
    if reassembly.is_complete() {
        let _ = notify.try_send(reassembly.into_transmission());
    }
}

/// Fragment waiting in the heap; ordered by start, then arrival.
struct Queued {
    start: u32,
    seq: u64,
    fragment: Fragment,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Reversed so the max-heap pops the smallest start first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.start, other.seq).cmp(&(self.start, self.seq))
    }
}

struct Reassembly {
    id: TransmissionId,
    destination: Option<Address>,
    buffer: Vec<u8>,
    first_pending: usize,
    heap: BinaryHeap<Queued>,
    fragments: Vec<Fragment>,
    seq: u64,
}

impl Reassembly {
    fn new(id: TransmissionId, destination: Option<Address>) -> Self {
        Self {
            id,
            destination,
            buffer: vec![0; id.total_size as usize],
            first_pending: 0,
            heap: BinaryHeap::new(),
            fragments: Vec::new(),
            seq: 0,
        }
    }

    /// Queue a fragment and drain everything now contiguous. Returns true
    /// once the buffer is fully written.
    fn push(&mut self, fragment: Fragment) -> bool {
        self.seq += 1;
        self.heap.push(Queued {
            start: fragment.start,
            seq: self.seq,
            fragment,
        });

        while self
            .heap
            .peek()
            .is_some_and(|top| top.start as usize <= self.first_pending)
        {
            let Some(Queued { fragment, .. }) = self.heap.pop() else {
                break;
            };
            let start = fragment.start as usize;
            let end = start + fragment.payload.len();
            self.buffer[start..end].copy_from_slice(&fragment.payload);
            self.first_pending = self.first_pending.max(end);
            self.fragments.push(fragment);
        }
        self.is_complete()
    }

    fn is_complete(&self) -> bool {
        !self.fragments.is_empty() && self.first_pending == self.buffer.len()
    }

    fn into_transmission(self) -> Transmission {
        Transmission {
            data: self.buffer,
            source: self.id.source,
            destination: self.destination,
            fragset_id: self.id.fragset_id,
            fragments: self.fragments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(start: u32, bytes: &[u8], total: u32) -> Fragment {
        Fragment {
            start,
            payload: bytes.to_vec(),
            total_size: total,
            fragset_id: 1,
            verified: false,
        }
    }

    fn reassembly(total: u32) -> Reassembly {
        let id = TransmissionId {
            source: None,
            fragset_id: 1,
            total_size: total,
        };
        Reassembly::new(id, None)
    }

    #[test]
    fn test_in_order_drain() {
        let mut r = reassembly(6);
        assert!(!r.push(frag(0, b"ab", 6)));
        assert!(!r.push(frag(2, b"cd", 6)));
        assert!(r.push(frag(4, b"ef", 6)));
        assert_eq!(r.into_transmission().data, b"abcdef");
    }

    #[test]
    fn test_out_of_order_waits_for_gap() {
        let mut r = reassembly(6);
        assert!(!r.push(frag(4, b"ef", 6)));
        assert!(!r.push(frag(2, b"cd", 6)));
        assert_eq!(r.first_pending, 0);
        assert!(r.push(frag(0, b"ab", 6)));
        let t = r.into_transmission();
        assert_eq!(t.data, b"abcdef");
        assert_eq!(
            t.fragments.iter().map(|f| f.start).collect::<Vec<_>>(),
            vec![0, 2, 4]
        );
    }

    #[test]
    fn test_overlap_and_duplicates() {
        let mut r = reassembly(6);
        assert!(!r.push(frag(0, b"abc", 6)));
        assert!(!r.push(frag(1, b"bcd", 6)));
        assert!(!r.push(frag(0, b"abc", 6)));
        assert!(r.push(frag(3, b"def", 6)));
        assert_eq!(r.into_transmission().data, b"abcdef");
    }

    #[test]
    fn test_empty_transmission_completes_on_first_fragment() {
        let mut r = reassembly(0);
        assert!(!r.is_complete());
        assert!(r.push(frag(0, b"", 0)));
    }

    #[test]
    fn test_heap_orders_equal_starts_by_arrival() {
        let mut heap = BinaryHeap::new();
        heap.push(Queued {
            start: 5,
            seq: 2,
            fragment: frag(5, b"y", 10),
        });
        heap.push(Queued {
            start: 5,
            seq: 1,
            fragment: frag(5, b"x", 10),
        });
        heap.push(Queued {
            start: 1,
            seq: 3,
            fragment: frag(1, b"z", 10),
        });
        let order: Vec<_> = std::iter::from_fn(|| heap.pop().map(|q| q.seq)).collect();
        assert_eq!(order, vec![3, 1, 2]);
    }
}
