//! Fixed and growable call-trace multisets
//!
//! Samples flow through two containers. [`AsyncSafeTraceMultiset`] is a
//! fixed array of slots populated from the signal handler: adding is
//! lock-free, allocation-free and async-signal-safe. A harvester
//! periodically drains it into [`TraceMultiset`], a plain growable map
//! owned by the collector session.
//!
//! Slot synchronization uses a sentinel count value to reserve entries.
//! `add` reserves the first available slot, saves the frames, then
//! publishes the slot for other adders and for `extract`. `extract`
//! reserves the slot, waits until no additions are inspecting it, and
//! then releases it for reuse. The wait is what makes it safe to hand
//! the frame buffer to a subsequent `add`.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use crate::domain::{Frame, MAX_FRAMES_TO_CAPTURE};

/// Maximum number of distinct traces the fixed multiset can hold.
pub const MAX_STACK_TRACES: usize = 2048;

/// Sentinel used as a slot's count while its frames are in transition.
const TRACE_COUNT_LOCKED: i64 = -1;

/// Order-sensitive hash over a frame sequence.
///
/// One-at-a-time mix of each frame's line and code identity. Agrees with
/// [`traces_equal`]: equal traces hash equally, and a hash mismatch
/// implies inequality.
pub fn calculate_hash(frames: &[Frame]) -> u64 {
    let mut h: u64 = 0;
    for frame in frames {
        h = h.wrapping_add(frame.line as i64 as u64);
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
        h = h.wrapping_add(frame.code.0 as u64);
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
    }
    h = h.wrapping_add(h << 3);
    h ^= h >> 11;
    h
}

/// Order-sensitive equality over two frame sequences.
pub fn traces_equal(a: &[Frame], b: &[Frame]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    for (x, y) in a.iter().zip(b.iter()) {
        if x.line != y.line || x.code != y.code {
            return false;
        }
    }
    true
}

struct TraceSlot {
    /// Number of times the stored trace has been encountered. 0 means
    /// the slot is unused; [`TRACE_COUNT_LOCKED`] means the frames are
    /// in transition and must not be read.
    count: AtomicI64,
    /// Number of `add` calls currently inspecting this slot.
    active_updates: AtomicU32,
    num_frames: UnsafeCell<usize>,
    frames: UnsafeCell<[Frame; MAX_FRAMES_TO_CAPTURE]>,
}

// The frame buffer is only written while the writer holds the LOCKED
// reservation, and only read while the reader's active_updates mark (or
// the single-drainer guarantee) pins the slot. See `add` and `extract`.
unsafe impl Sync for TraceSlot {}

impl TraceSlot {
    fn new() -> Self {
        TraceSlot {
            count: AtomicI64::new(0),
            active_updates: AtomicU32::new(0),
            num_frames: UnsafeCell::new(0),
            frames: UnsafeCell::new([Frame::EMPTY; MAX_FRAMES_TO_CAPTURE]),
        }
    }
}

/// Fixed-capacity multiset of call traces with an async-signal-safe
/// `add` and a single-drainer `extract`.
pub struct AsyncSafeTraceMultiset {
    slots: Box<[TraceSlot]>,
}

impl AsyncSafeTraceMultiset {
    #[must_use]
    pub fn new() -> Self {
        let slots: Vec<TraceSlot> = (0..MAX_STACK_TRACES).map(|_| TraceSlot::new()).collect();
        AsyncSafeTraceMultiset { slots: slots.into_boxed_slice() }
    }

    /// Number of slots in the table.
    #[must_use]
    pub fn max_entries(&self) -> usize {
        self.slots.len()
    }

    /// Return every slot to the unused state.
    ///
    /// Must not run concurrently with `add` or `extract`; the session
    /// only calls it before the interval timer is armed.
    pub fn reset(&self) {
        for slot in self.slots.iter() {
            slot.count.store(0, Ordering::Relaxed);
            slot.active_updates.store(0, Ordering::Relaxed);
            unsafe { *slot.num_frames.get() = 0 };
        }
    }

    /// Add a trace to the set, incrementing its count if an equal trace
    /// is already present.
    ///
    /// Returns false when the table is full or every probed slot stayed
    /// contended. Safe to call from an asynchronous signal handler: no
    /// allocation, no locking, no syscalls.
    pub fn add(&self, frames: &[Frame]) -> bool {
        debug_assert!(frames.len() <= MAX_FRAMES_TO_CAPTURE);

        let hash = calculate_hash(frames) as usize;
        for probe in 0..self.slots.len() {
            let slot = &self.slots[(hash.wrapping_add(probe)) % self.slots.len()];

            slot.active_updates.fetch_add(1, Ordering::Acquire);
            let count = slot.count.load(Ordering::Acquire);

            if count == 0 {
                if slot
                    .count
                    .compare_exchange_weak(
                        0,
                        TRACE_COUNT_LOCKED,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // The slot is reserved; extract cannot touch it, so
                    // the update mark can be released early.
                    slot.active_updates.fetch_sub(1, Ordering::Release);

                    // Copy field by field; a bulk copy may lower to
                    // memcpy, which is not async-signal-safe everywhere.
                    unsafe {
                        let buffer = &mut *slot.frames.get();
                        for (dst, src) in buffer.iter_mut().zip(frames.iter()) {
                            dst.code = src.code;
                            dst.line = src.line;
                        }
                        *slot.num_frames.get() = frames.len();
                    }
                    slot.count.store(1, Ordering::Release);
                    return true;
                }
            } else if count != TRACE_COUNT_LOCKED {
                // Published entry. If it holds our trace, bump its count
                // with a compare-swap so a concurrent extract's LOCKED
                // reservation is never overwritten.
                let stored = unsafe {
                    let num_frames = *slot.num_frames.get();
                    let buffer = &*slot.frames.get();
                    traces_equal(&buffer[..num_frames], frames)
                };
                if stored {
                    // Reload in case the count moved while the frames
                    // were being compared.
                    let current = slot.count.load(Ordering::Relaxed);
                    if current != TRACE_COUNT_LOCKED
                        && slot
                            .count
                            .compare_exchange_weak(
                                current,
                                current + 1,
                                Ordering::Relaxed,
                                Ordering::Relaxed,
                            )
                            .is_ok()
                    {
                        slot.active_updates.fetch_sub(1, Ordering::Release);
                        return true;
                    }
                }
            }
            // Locked by another add or by the drainer, a different
            // trace, or a lost race: release the mark and keep probing.
            // Worst case the same trace lands in multiple slots, which
            // the growable multiset reconciles at harvest.
            slot.active_updates.fetch_sub(1, Ordering::Release);
        }
        false
    }

    /// Extract the entry at `location` if it holds a published trace,
    /// copying its frames into `out` and returning `(num_frames, count)`.
    ///
    /// Concurrent with `add`, but at most one thread may call `extract`
    /// at a time.
    pub fn extract(
        &self,
        location: usize,
        out: &mut [Frame; MAX_FRAMES_TO_CAPTURE],
    ) -> Option<(usize, i64)> {
        let slot = self.slots.get(location)?;

        if slot.count.load(Ordering::Acquire) <= 0 {
            // Unused or mid-install; skip for now.
            return None;
        }
        let num_frames = unsafe { *slot.num_frames.get() }.min(out.len());

        let count = slot.count.swap(TRACE_COUNT_LOCKED, Ordering::Acquire);

        unsafe {
            let buffer = &*slot.frames.get();
            for (dst, src) in out[..num_frames].iter_mut().zip(buffer.iter()) {
                dst.code = src.code;
                dst.line = src.line;
            }
        }

        // Writers that saw the slot published may still be comparing
        // against its frames; wait them out before the buffer is
        // released for reuse. Their critical section is bounded work,
        // so the spin resolves in microseconds.
        while slot.active_updates.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }

        slot.count.store(0, Ordering::Release);
        Some((num_frames, count))
    }
}

impl Default for AsyncSafeTraceMultiset {
    fn default() -> Self {
        Self::new()
    }
}

/// Growable multiset of traces: a mapping from a frame sequence to the
/// number of times it was sampled.
///
/// Not thread- or async-safe. Intended to aggregate traces drained from
/// [`AsyncSafeTraceMultiset`].
#[derive(Debug, Default)]
pub struct TraceMultiset {
    traces: HashMap<Vec<Frame>, u64>,
}

impl TraceMultiset {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a trace, merging with an existing equal trace.
    pub fn add(&mut self, frames: &[Frame], count: u64) {
        match self.traces.get_mut(frames) {
            Some(existing) => *existing += count,
            None => {
                self.traces.insert(frames.to_vec(), count);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vec<Frame>, &u64)> {
        self.traces.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.traces.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn clear(&mut self) {
        self.traces.clear();
    }
}

/// Drain every populated slot of `from` into `to`, returning the number
/// of slots moved.
///
/// Thread-safe with respect to concurrent `add`s into `from`.
pub fn harvest_samples(from: &AsyncSafeTraceMultiset, to: &mut TraceMultiset) -> usize {
    let mut harvested = 0;
    let mut buffer = [Frame::EMPTY; MAX_FRAMES_TO_CAPTURE];
    for location in 0..from.max_entries() {
        if let Some((num_frames, count)) = from.extract(location, &mut buffer) {
            if num_frames > 0 && count > 0 {
                harvested += 1;
                to.add(&buffer[..num_frames], count as u64);
            }
        }
    }
    harvested
}
