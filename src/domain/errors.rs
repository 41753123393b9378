//! Structured error types for runtime-sampler
//!
//! Using thiserror for automatic Display implementation and error chaining.
//!
//! Only session-fatal conditions are errors. Per-sample failures (the
//! fixed trace table overflowing, a thread with no host state) are folded
//! into the profile as synthetic traces instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProfilerError {
    #[error("failed to arm the profiling interval timer: {0}")]
    TimerArmFailed(#[source] std::io::Error),

    #[error("failed to install the profiling signal handler: {0}")]
    SignalInstallFailed(#[source] std::io::Error),

    #[error("invalid sampling period: {0} us (must be positive)")]
    InvalidPeriod(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_error_display() {
        let err = ProfilerError::TimerArmFailed(std::io::Error::from_raw_os_error(libc::EINVAL));
        assert!(err.to_string().contains("interval timer"));
    }

    #[test]
    fn test_invalid_period_display() {
        let err = ProfilerError::InvalidPeriod(0);
        assert_eq!(
            err.to_string(),
            "invalid sampling period: 0 us (must be positive)"
        );
    }
}
