//! Profiling core modules
//!
//! This module contains the sampling pipeline:
//! - Fixed and growable trace multisets and the harvester between them
//! - Signal handler and CPU interval-timer driver
//! - The collector session orchestrating a profiling run

pub mod multiset;
pub mod profiler;
pub mod signal_driver;

// Re-export common types
pub use multiset::{
    calculate_hash, harvest_samples, traces_equal, AsyncSafeTraceMultiset, TraceMultiset,
    MAX_STACK_TRACES,
};
pub use profiler::{profile_cpu, CpuProfile, CpuProfiler};
pub use signal_driver::{
    block_profiling_signal, register_fork_handlers, unblock_profiling_signal, SignalDriver,
    PROFILING_SIGNAL,
};
