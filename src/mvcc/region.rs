//! Region and request contexts. A region owns the latches that serialize
//! conflicting writers and the key-range bounds that scope lock scans; a
//! request context carries per-request state across the phases of an
//! operation.

use crate::encoding::keycode;
use crate::error::Result;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// The number of latch slots per region. Writers lock the slots their key
/// hashes map to, so two writers conflict iff their key sets collide (or
/// their hashes do, which merely serializes them needlessly).
const NUM_LATCHES: u64 = 256;

/// Hashes a key for latching.
pub fn key_hash(key: &[u8]) -> u64 {
    fxhash::hash64(key)
}

/// Hashes a set of keys for latching.
pub fn key_hashes<K: AsRef<[u8]>>(keys: &[K]) -> Vec<u64> {
    keys.iter().map(|key| key_hash(key.as_ref())).collect()
}

/// Returns true if key is at or beyond the exclusive end bound. An empty
/// bound is unbounded.
pub(crate) fn reached_end(key: &[u8], end: &[u8]) -> bool {
    !end.is_empty() && key >= end
}

/// A region context: the key range this store slice owns, the latches that
/// serialize its writers, and its approximate-size delta for split
/// accounting. Bounds are held in encoded form; empty bounds are unbounded.
pub struct RegionCtx {
    start_key: Vec<u8>,
    end_key: Vec<u8>,
    latches: Vec<Mutex<()>>,
    diff: AtomicI64,
}

impl RegionCtx {
    /// Creates a region covering [start_key, end_key) in user-key space.
    /// Empty bounds are unbounded.
    pub fn new(start_key: &[u8], end_key: &[u8]) -> Self {
        let encode = |key: &[u8]| {
            if key.is_empty() {
                Vec::new()
            } else {
                keycode::encode_key(key)
            }
        };
        Self {
            start_key: encode(start_key),
            end_key: encode(end_key),
            latches: (0..NUM_LATCHES).map(|_| Mutex::new(())).collect(),
            diff: AtomicI64::new(0),
        }
    }

    /// The encoded inclusive start bound.
    pub fn start_key(&self) -> &[u8] {
        &self.start_key
    }

    /// The encoded exclusive end bound, empty if unbounded.
    pub fn end_key(&self) -> &[u8] {
        &self.end_key
    }

    /// Acquires the latches for a set of key hashes, blocking until all are
    /// held. Slots are locked in sorted order to prevent deadlock between
    /// writers with overlapping key sets. The latches release when the
    /// returned guard drops, on every exit path.
    pub fn acquire_latches(&self, hashes: &[u64]) -> Result<LatchGuard<'_>> {
        let mut slots: Vec<usize> = hashes.iter().map(|h| (h % NUM_LATCHES) as usize).collect();
        slots.sort_unstable();
        slots.dedup();
        let mut guards = Vec::with_capacity(slots.len());
        for slot in slots {
            guards.push(self.latches[slot].lock()?);
        }
        Ok(LatchGuard { _guards: guards })
    }

    /// Adds a delta to the region's approximate size.
    pub fn add_diff(&self, delta: i64) {
        self.diff.fetch_add(delta, Ordering::Relaxed);
    }

    /// The accumulated size delta.
    pub fn diff(&self) -> i64 {
        self.diff.load(Ordering::Relaxed)
    }
}

/// Holds a set of acquired latches, releasing them on drop.
pub struct LatchGuard<'a> {
    _guards: Vec<MutexGuard<'a, ()>>,
}

/// Request phases recorded by the tracing hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    AcquireLatches,
    ReadLock,
    ReadDb,
    EndWriteLock,
}

/// Per-request context: the region the request targets and the trace of
/// phases it has passed through.
pub struct RequestCtx {
    pub(crate) region: Arc<RegionCtx>,
    events: Vec<TraceEvent>,
}

impl RequestCtx {
    pub fn new(region: Arc<RegionCtx>) -> Self {
        Self { region, events: Vec::new() }
    }

    pub fn region(&self) -> &RegionCtx {
        &self.region
    }

    /// Records a request phase.
    pub fn trace(&mut self, event: TraceEvent) {
        self.events.push(event);
    }

    /// The phases recorded so far.
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds() {
        let region = RegionCtx::new(b"a", b"z");
        assert_eq!(region.start_key(), keycode::encode_key(b"a"));
        assert_eq!(region.end_key(), keycode::encode_key(b"z"));
        assert!(!reached_end(&keycode::encode_key(b"y"), region.end_key()));
        assert!(reached_end(&keycode::encode_key(b"z"), region.end_key()));

        let region = RegionCtx::new(b"", b"");
        assert!(region.start_key().is_empty());
        assert!(!reached_end(&keycode::encode_key(b"z"), region.end_key()));
    }

    /// Duplicate and colliding hashes must not deadlock a single writer.
    #[test]
    fn latch_dedup() -> Result<()> {
        let region = RegionCtx::new(b"", b"");
        let hashes = vec![7, 7, 7 + NUM_LATCHES, 3];
        let _guard = region.acquire_latches(&hashes)?;
        Ok(())
    }

    /// Writers with overlapping key sets must serialize; latch acquisition
    /// in sorted slot order must not deadlock them.
    #[test]
    fn latch_exclusion() -> Result<()> {
        let region = Arc::new(RegionCtx::new(b"", b""));
        let counter = Arc::new(AtomicI64::new(0));
        let hashes_a = key_hashes(&[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        let mut hashes_b = hashes_a.clone();
        hashes_b.reverse();

        let mut handles = Vec::new();
        for hashes in [hashes_a, hashes_b] {
            let region = region.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = region.acquire_latches(&hashes).expect("acquire failed");
                    // Only one writer may be inside the critical section.
                    assert_eq!(counter.fetch_add(1, Ordering::SeqCst), 0);
                    counter.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("writer panicked");
        }
        Ok(())
    }

    #[test]
    fn diff() {
        let region = RegionCtx::new(b"", b"");
        region.add_diff(10);
        region.add_diff(-3);
        assert_eq!(region.diff(), 7);
    }

    #[test]
    fn trace() {
        let mut req = RequestCtx::new(Arc::new(RegionCtx::new(b"", b"")));
        req.trace(TraceEvent::AcquireLatches);
        req.trace(TraceEvent::ReadLock);
        assert_eq!(req.events(), [TraceEvent::AcquireLatches, TraceEvent::ReadLock]);
    }
}
