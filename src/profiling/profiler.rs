//! CPU collector session
//!
//! One session per call: arm the CPU-time interval timer, let the signal
//! handler aggregate stacks into the fixed trace table, drain the table
//! every flush interval, and finally resolve everything into a
//! [`CpuProfile`].
//!
//! The fixed table and the unknown-sample counter are process-lifetime
//! singletons: a signal handler from a previous session may still be
//! in flight while a new session starts, so the storage it writes to is
//! never deallocated, only reset.

use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicPtr, Ordering};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::domain::{
    CodeId, Frame, ProfilerError, ResolvedFrame, SentinelLine, MAX_FRAMES_TO_CAPTURE,
};
use crate::host;
use crate::profiling::multiset::{harvest_samples, AsyncSafeTraceMultiset, TraceMultiset};
use crate::profiling::signal_driver::{self, ErrnoGuard, SignalDriver};
use crate::resolution::{self, CodeDeathHook};

/// How often the harvest loop drains the fixed trace table.
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

// Fixed multiset of traces shared with the signal handler. Allocated on
// the first session and published exactly once; never deallocated, as a
// late handler could still be adding to it during teardown.
static FIXED_TRACES: AtomicPtr<AsyncSafeTraceMultiset> = AtomicPtr::new(ptr::null_mut());

// Samples the handler could not store because the fixed table was full.
static UNKNOWN_STACK_COUNT: AtomicI64 = AtomicI64::new(0);

fn fixed_traces() -> Option<&'static AsyncSafeTraceMultiset> {
    let raw = FIXED_TRACES.load(Ordering::Acquire);
    if raw.is_null() {
        None
    } else {
        Some(unsafe { &*raw })
    }
}

fn ensure_fixed_traces() -> &'static AsyncSafeTraceMultiset {
    if let Some(existing) = fixed_traces() {
        return existing;
    }
    let fresh = Box::into_raw(Box::new(AsyncSafeTraceMultiset::new()));
    match FIXED_TRACES.compare_exchange(
        ptr::null_mut(),
        fresh,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => unsafe { &*fresh },
        Err(winner) => {
            // Lost the publication race; the winner's table is the
            // singleton.
            unsafe { drop(Box::from_raw(fresh)) };
            unsafe { &*winner }
        }
    }
}

/// The profiling signal handler.
///
/// Runs asynchronously on whichever thread the OS interrupted. Every
/// call in here must be async-signal-safe: stack-local buffers, field
/// reads, and the fixed table's lock-free atomics only.
pub(crate) extern "C" fn handle_profiling_signal(
    _signum: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let _errno = ErrnoGuard::save();

    let Some(fixed) = fixed_traces() else {
        return;
    };

    let mut frames = [Frame::EMPTY; MAX_FRAMES_TO_CAPTURE];
    let state = host::current_thread_state();
    let num_frames = host::walk_frame_chain(&mut frames, state);

    if !fixed.add(&frames[..num_frames]) {
        UNKNOWN_STACK_COUNT.fetch_add(1, Ordering::Relaxed);
    }
}

/// A materialized CPU profile: every distinct resolved call trace with
/// the number of samples attributed to it.
///
/// Trace keys are ordered innermost frame first.
#[derive(Debug, Clone)]
pub struct CpuProfile {
    samples: HashMap<Vec<ResolvedFrame>, u64>,
    duration: Duration,
    period: Duration,
}

impl CpuProfile {
    /// The aggregated samples, keyed by resolved trace.
    #[must_use]
    pub fn samples(&self) -> &HashMap<Vec<ResolvedFrame>, u64> {
        &self.samples
    }

    /// Total number of samples across all traces.
    #[must_use]
    pub fn total_samples(&self) -> u64 {
        self.samples.values().sum()
    }

    /// The wall-clock window the session covered.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The CPU-time sampling period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn for_tests(samples: HashMap<Vec<ResolvedFrame>, u64>) -> Self {
        CpuProfile {
            samples,
            duration: Duration::from_millis(200),
            period: Duration::from_millis(10),
        }
    }
}

/// Collects CPU profiles by arming a CPU-time interval timer and
/// recording a stack sample on every expiration.
///
/// Only one session may be active at a time per process; callers
/// enforce this.
pub struct CpuProfiler {
    duration: Duration,
    period: Duration,
    aggregated: TraceMultiset,
    clock: Box<dyn Clock>,
}

impl CpuProfiler {
    pub fn new(duration_nanos: u64, period_micros: u64) -> Result<Self, ProfilerError> {
        Self::with_clock(duration_nanos, period_micros, Box::new(SystemClock))
    }

    /// Like [`CpuProfiler::new`] with a caller-supplied clock, so tests
    /// can pace the harvest loop without real delays.
    pub fn with_clock(
        duration_nanos: u64,
        period_micros: u64,
        clock: Box<dyn Clock>,
    ) -> Result<Self, ProfilerError> {
        if period_micros == 0 {
            // Zero is the timer's disarm sentinel, not a sampling rate.
            return Err(ProfilerError::InvalidPeriod(period_micros));
        }
        signal_driver::register_fork_handlers();
        Ok(CpuProfiler {
            duration: Duration::from_nanos(duration_nanos),
            period: Duration::from_micros(period_micros),
            aggregated: TraceMultiset::new(),
            clock,
        })
    }

    /// Run a full collection session and materialize the profile.
    pub fn collect(&mut self) -> Result<CpuProfile, ProfilerError> {
        let guard = host::lock_runtime();
        self.reset()?;

        // Records destroyed from here on are snapshot before their
        // memory goes away; the hook is removed on every exit path.
        let _death_hook = CodeDeathHook::install(&guard);

        self.start()?;
        // Let the host's threads run while we sample them.
        drop(guard);

        let finish_line = self.clock.now() + self.duration;
        while !self.almost_there(finish_line) {
            self.clock.sleep_for(FLUSH_INTERVAL);
            self.flush();
        }
        self.clock.sleep_until(finish_line);
        self.stop();
        // Give in-flight handlers a moment to finish before the final
        // drain.
        self.clock.sleep_until(finish_line + FLUSH_INTERVAL);
        self.flush();

        let guard = host::lock_runtime();
        Ok(self.materialize(&guard))
    }

    /// Resets process-global collection state for a fresh session.
    ///
    /// The fixed table is allocated on the very first session and reused
    /// ever after.
    fn reset(&mut self) -> Result<(), ProfilerError> {
        let fixed = ensure_fixed_traces();
        // No handler can be mid-add here: the timer is not armed yet and
        // the previous session left the signal ignored.
        fixed.reset();
        self.aggregated.clear();
        UNKNOWN_STACK_COUNT.store(0, Ordering::Relaxed);
        SignalDriver::set_action(handle_profiling_signal)
    }

    fn start(&self) -> Result<(), ProfilerError> {
        SignalDriver::set_interval(self.period)
    }

    fn stop(&self) {
        if let Err(err) = SignalDriver::set_interval(Duration::ZERO) {
            warn!("failed to disarm the profiling timer: {err}");
        }
        // An expiration already queued by the kernel may still be
        // delivered after disarming; drop it instead of handling it.
        SignalDriver::ignore();
    }

    /// Is there room for another full flush lap before the finish line?
    /// Keeps a margin of two laps so the loop never overshoots.
    fn almost_there(&self, finish_line: Instant) -> bool {
        finish_line < self.clock.now() + 2 * FLUSH_INTERVAL
    }

    /// Migrate samples from the fixed table into the growable multiset.
    /// Returns the number of table entries moved.
    fn flush(&mut self) -> usize {
        let Some(fixed) = fixed_traces() else {
            return 0;
        };
        let harvested = harvest_samples(fixed, &mut self.aggregated);
        if harvested > 0 {
            debug!("harvested {harvested} trace table entries");
        }
        harvested
    }

    /// Resolve every aggregated trace into its reportable form.
    ///
    /// Samples the handler could not store are surfaced as a synthetic
    /// single-frame `[Unknown]` trace so the profile still accounts for
    /// them.
    fn materialize(&mut self, guard: &host::RuntimeGuard) -> CpuProfile {
        let unknown = UNKNOWN_STACK_COUNT.load(Ordering::Relaxed);
        if unknown > 0 {
            warn!("{unknown} samples were dropped by a full trace table");
            let fake = Frame { code: CodeId::NULL, line: SentinelLine::Unknown as i32 };
            self.aggregated.add(&[fake], unknown as u64);
        }

        let mut samples: HashMap<Vec<ResolvedFrame>, u64> = HashMap::new();
        for (trace, &count) in self.aggregated.iter() {
            let resolved: Vec<ResolvedFrame> =
                trace.iter().map(|frame| resolution::resolve_frame(frame, guard)).collect();
            // Distinct raw traces can resolve to the same names; merge
            // them.
            *samples.entry(resolved).or_insert(0) += count;
        }

        CpuProfile { samples, duration: self.duration, period: self.period }
    }
}

/// Profile CPU time consumed by the process for `duration_nanos`
/// nanoseconds of wall time, sampling every `period_micros` microseconds
/// of consumed CPU.
///
/// Returns the aggregated profile as a mapping from resolved call traces
/// (innermost frame first) to sample counts.
pub fn profile_cpu(
    duration_nanos: u64,
    period_micros: u64,
) -> Result<CpuProfile, ProfilerError> {
    CpuProfiler::new(duration_nanos, period_micros)?.collect()
}
