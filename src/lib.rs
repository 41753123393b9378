//! # runtime-sampler - Sampling CPU Profiler for an Embedded Runtime Host
//!
//! runtime-sampler is a low-overhead sampling CPU profiler for a
//! managed-runtime language host embedded in the same process. It
//! periodically interrupts the running process with a CPU-time signal,
//! captures the call stack of whichever thread was executing, aggregates
//! identical stacks into counts, and returns the aggregated profile to
//! the caller.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Host Runtime Threads                        │
//! │          (interrupted by SIGPROF on consumed CPU time)          │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ signal handler (async-signal-safe)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              AsyncSafeTraceMultiset (fixed, lock-free)          │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ harvest every 100 ms
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Collector Session (driver thread)               │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐       │
//! │  │TraceMultiset │──▶│  Resolution  │──▶│  CpuProfile  │       │
//! │  │  (growable)  │   │ (death map + │   │ trace→count  │       │
//! │  └──────────────┘   │ live lookup) │   └──────────────┘       │
//! │                     └──────────────┘                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`profiling`]: the sampling pipeline
//!   - `multiset`: fixed async-signal-safe trace table, growable
//!     aggregation map, and the harvester between them
//!   - `signal_driver`: SIGPROF disposition, `ITIMER_PROF`, signal
//!     masking and fork safety
//!   - `profiler`: the collector session and the [`profile_cpu`] entry
//!     point
//!
//! - [`resolution`]: code identity resolution, including the
//!   code-record death hook that snapshots records the host destroys
//!   while samples still reference them
//!
//! - [`analysis`]: post-processing of a collected profile into ranked
//!   function hotspots
//!
//! - [`host`]: the contract the embedding host must satisfy (thread
//!   state getter, walkable frame chain, swappable code-record
//!   destructor, global runtime lock)
//!
//! - [`clock`], [`domain`]: monotonic clock and core types/errors
//!
//! ## Usage
//!
//! ```no_run
//! use runtime_sampler::profile_cpu;
//!
//! // Sample for 10 s of wall time, every 10 ms of consumed CPU time.
//! let profile = profile_cpu(10_000_000_000, 10_000)?;
//! for (trace, count) in profile.samples() {
//!     println!("{count:>6}  {}", trace[0]);
//! }
//! # Ok::<(), runtime_sampler::ProfilerError>(())
//! ```
//!
//! Only one profiling session may be active at a time per process. The
//! signal handler shares a process-lifetime trace table with the
//! session; the table is never deallocated, only reset, so a late
//! handler from a finished session can never touch freed memory.

pub mod analysis;
pub mod clock;
pub mod domain;
pub mod host;
pub mod profiling;
pub mod resolution;


// Re-export the public surface at the crate root
pub use analysis::{analyze_hotspots, FunctionHotspot};
pub use clock::{Clock, SystemClock};
pub use domain::{
    CodeId, Frame, FuncLoc, ProfilerError, ResolvedFrame, SentinelLine, MAX_FRAMES_TO_CAPTURE,
};
pub use profiling::{profile_cpu, CpuProfile, CpuProfiler};
