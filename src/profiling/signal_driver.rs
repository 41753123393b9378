//! SIGPROF delivery: sigaction, interval timer, masking, fork safety
//!
//! The profiling signal is scheduled against consumed CPU time through
//! `ITIMER_PROF`. Signal disposition and the timer are process-wide
//! resources; the collector session owns them exclusively for its
//! lifetime.

use std::io;
use std::mem;
use std::ptr;
use std::sync::Once;
use std::time::Duration;

use log::{error, warn};

use crate::domain::ProfilerError;

/// The OS signal that delivers interval-timer expirations.
pub const PROFILING_SIGNAL: libc::c_int = libc::SIGPROF;

const MICROS_PER_SECOND: i64 = 1_000_000;

/// Signature of the installed signal action.
pub type SignalAction =
    extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Installs and arms the profiling signal machinery.
pub struct SignalDriver;

impl SignalDriver {
    /// Install `action` as the handler for the profiling signal, with
    /// restart-on-interrupt and siginfo semantics and an empty handler
    /// mask.
    pub fn set_action(action: SignalAction) -> Result<(), ProfilerError> {
        unsafe {
            let mut sa: libc::sigaction = mem::zeroed();
            sa.sa_sigaction = action as usize;
            sa.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
            libc::sigemptyset(&mut sa.sa_mask);

            if libc::sigaction(PROFILING_SIGNAL, &sa, ptr::null_mut()) != 0 {
                let cause = io::Error::last_os_error();
                error!("failed to install the profiling signal handler: {cause}");
                return Err(ProfilerError::SignalInstallFailed(cause));
            }
        }
        Ok(())
    }

    /// Arm a periodic CPU-time interval timer delivering the profiling
    /// signal every `period` of consumed CPU. A zero period disarms the
    /// timer.
    pub fn set_interval(period: Duration) -> Result<(), ProfilerError> {
        let period_usec = period.as_micros() as i64;
        let interval = libc::timeval {
            tv_sec: (period_usec / MICROS_PER_SECOND) as libc::time_t,
            tv_usec: (period_usec % MICROS_PER_SECOND) as libc::suseconds_t,
        };
        let timer = libc::itimerval { it_interval: interval, it_value: interval };

        if unsafe { libc::setitimer(libc::ITIMER_PROF, &timer, ptr::null_mut()) } == -1 {
            let cause = io::Error::last_os_error();
            error!("failed to set the CPU interval timer: {cause}");
            return Err(ProfilerError::TimerArmFailed(cause));
        }
        Ok(())
    }

    /// Ignore the profiling signal.
    ///
    /// Used after disarming the timer: an expiration already delivered
    /// to the process must not reach a handler whose session is being
    /// torn down.
    pub fn ignore() {
        unsafe {
            libc::signal(PROFILING_SIGNAL, libc::SIG_IGN);
        }
    }
}

fn set_signal_mask(how: libc::c_int) {
    unsafe {
        let mut signals: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut signals);
        libc::sigaddset(&mut signals, PROFILING_SIGNAL);
        if libc::pthread_sigmask(how, &signals, ptr::null_mut()) != 0 {
            warn!("failed to update the profiling signal mask: {}", io::Error::last_os_error());
        }
    }
}

/// Block the profiling signal for the calling thread.
pub fn block_profiling_signal() {
    set_signal_mask(libc::SIG_BLOCK);
}

/// Unblock the profiling signal for the calling thread.
pub fn unblock_profiling_signal() {
    set_signal_mask(libc::SIG_UNBLOCK);
}

extern "C" fn atfork_prepare() {
    block_profiling_signal();
}

extern "C" fn atfork_parent() {
    unblock_profiling_signal();
}

extern "C" fn atfork_child() {
    unblock_profiling_signal();
}

static FORK_HANDLERS: Once = Once::new();

/// Register fork handlers that block the profiling signal in the parent
/// before `fork` and unblock it in both parent and child afterwards.
///
/// A fork that runs longer than the sampling period would otherwise be
/// interrupted and restarted indefinitely, and can deadlock on allocator
/// locks inherited mid-operation. The cost is that forks are not
/// sampled. Handlers are registered once per process and never
/// unregistered.
pub fn register_fork_handlers() {
    FORK_HANDLERS.call_once(|| {
        let prepare: unsafe extern "C" fn() = atfork_prepare;
        let parent: unsafe extern "C" fn() = atfork_parent;
        let child: unsafe extern "C" fn() = atfork_child;
        let rc = unsafe { libc::pthread_atfork(Some(prepare), Some(parent), Some(child)) };
        if rc != 0 {
            warn!("failed to register fork handlers: {}", io::Error::from_raw_os_error(rc));
        }
    });
}

/// Saves errno on construction and restores it on drop. The signal
/// handler brackets its body with this so interrupted code never
/// observes a clobbered errno.
pub(crate) struct ErrnoGuard {
    saved: libc::c_int,
}

impl ErrnoGuard {
    pub(crate) fn save() -> Self {
        ErrnoGuard { saved: unsafe { *errno_location() } }
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        unsafe {
            *errno_location() = self.saved;
        }
    }
}

#[cfg(target_os = "linux")]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(target_os = "macos")]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__error()
}
