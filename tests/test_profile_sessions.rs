//! End-to-end profiling sessions against a stubbed host runtime.
//!
//! These tests install a thread-local fake of the host contract: each
//! sampled thread publishes a small frame chain through the pluggable
//! thread-state getter, then burns CPU so the interval timer actually
//! fires. Signal disposition and the timer are process-wide, so every
//! session test serializes on a shared lock.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::{Mutex, MutexGuard};

use runtime_sampler::analysis::analyze_hotspots;
use runtime_sampler::host::{
    self, destroy_code_record, set_thread_state_getter, CodeRecord, FrameLink, ThreadState,
};
use runtime_sampler::profiling::profile_cpu;
use runtime_sampler::CpuProfile;

static SESSION: Mutex<()> = Mutex::new(());

fn session_lock() -> MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    set_thread_state_getter(thread_state_getter);
    SESSION.lock()
}

thread_local! {
    static THREAD_STATE: Cell<*const ThreadState> = const { Cell::new(ptr::null()) };
}

fn thread_state_getter() -> *const ThreadState {
    THREAD_STATE.with(Cell::get)
}

/// Burn CPU on a dedicated thread while publishing a one-frame chain
/// executing `name` until `stop` is raised. Returns the join handle and
/// the code record's raw address for later cleanup.
fn spawn_busy_host_thread(
    name: &'static str,
    filename: &'static str,
    line: i32,
    stop: Arc<AtomicBool>,
) -> (thread::JoinHandle<()>, usize) {
    let code = CodeRecord::create(name, filename) as usize;
    let handle = thread::spawn(move || {
        let link = FrameLink { code: code as *const CodeRecord, line, back: ptr::null() };
        let state = ThreadState { current_frame: &link };
        THREAD_STATE.with(|s| s.set(&state));

        let mut x = 0u64;
        while !stop.load(Ordering::Relaxed) {
            for _ in 0..10_000 {
                x = x.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            }
            std::hint::black_box(x);
        }

        THREAD_STATE.with(|s| s.set(ptr::null()));
    });
    (handle, code)
}

/// Count of samples whose innermost frame is `name`.
fn leaf_samples(profile: &CpuProfile, name: &str) -> u64 {
    profile
        .samples()
        .iter()
        .filter(|(trace, _)| trace.first().is_some_and(|f| f.name == name))
        .map(|(_, &count)| count)
        .sum()
}

#[test]
fn test_busy_function_dominates_profile() -> Result<()> {
    let _session = session_lock();

    let stop = Arc::new(AtomicBool::new(false));
    let (busy, code) = spawn_busy_host_thread("f", "busy.py", 42, Arc::clone(&stop));

    // 400 ms of wall time, sampling every 10 ms of consumed CPU.
    let profile = profile_cpu(400_000_000, 10_000)?;

    stop.store(true, Ordering::Relaxed);
    busy.join().expect("busy thread panicked");
    let _guard = host::lock_runtime();
    unsafe { destroy_code_record(code as *mut CodeRecord) };

    let f_samples = leaf_samples(&profile, "f");
    assert!(
        f_samples >= 5,
        "busy function should dominate, got {f_samples} samples in {:?}",
        profile.samples()
    );
    assert!(f_samples <= 100, "sample count bounded by duration/period, got {f_samples}");

    let hotspots = analyze_hotspots(&profile);
    assert_eq!(hotspots[0].name, "f");
    assert_eq!(hotspots[0].filename, "busy.py");
    assert_eq!(hotspots[0].line, 42);

    assert_eq!(profile.duration(), Duration::from_millis(400));
    assert_eq!(profile.period(), Duration::from_millis(10));
    Ok(())
}

#[test]
fn test_code_destroyed_mid_session_resolves_from_death_snapshot() -> Result<()> {
    let _session = session_lock();

    let code = CodeRecord::create("g", "ephemeral.py") as usize;
    let destroyed = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));

    let destroyed_flag = Arc::clone(&destroyed);
    let stop_flag = Arc::clone(&stop);
    let busy = thread::spawn(move || {
        let link = FrameLink { code: code as *const CodeRecord, line: 9, back: ptr::null() };
        let state = ThreadState { current_frame: &link };
        THREAD_STATE.with(|s| s.set(&state));

        // Phase 1: get sampled while the record is alive.
        let phase_end = Instant::now() + Duration::from_millis(150);
        let mut x = 0u64;
        while Instant::now() < phase_end {
            for _ in 0..10_000 {
                x = x.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            }
            std::hint::black_box(x);
        }

        // Phase 2: the host frees the record while its address is still
        // referenced from pending traces.
        THREAD_STATE.with(|s| s.set(ptr::null()));
        {
            let _guard = host::lock_runtime();
            unsafe { destroy_code_record(code as *mut CodeRecord) };
        }
        destroyed_flag.store(true, Ordering::Relaxed);

        while !stop_flag.load(Ordering::Relaxed) {
            thread::yield_now();
        }
    });

    let profile = profile_cpu(400_000_000, 10_000)?;

    stop.store(true, Ordering::Relaxed);
    busy.join().expect("busy thread panicked");
    assert!(destroyed.load(Ordering::Relaxed), "record should have died mid-session");

    // The record is long gone; its name can only have come from the
    // snapshot taken at destruction time.
    let g_samples = leaf_samples(&profile, "g");
    assert!(g_samples >= 1, "expected samples for the destroyed record, got {:?}", profile.samples());

    let g_trace = profile
        .samples()
        .iter()
        .find(|(trace, _)| trace.first().is_some_and(|f| f.name == "g"))
        .map(|(trace, _)| trace.clone())
        .unwrap();
    assert_eq!(g_trace[0].filename, "ephemeral.py");
    assert_eq!(g_trace[0].line, 9);
    Ok(())
}

#[test]
fn test_back_to_back_sessions_are_independent() -> Result<()> {
    let _session = session_lock();

    let stop_first = Arc::new(AtomicBool::new(false));
    let (first_busy, first_code) =
        spawn_busy_host_thread("first_session_fn", "one.py", 1, Arc::clone(&stop_first));

    let first = profile_cpu(300_000_000, 10_000)?;
    stop_first.store(true, Ordering::Relaxed);
    first_busy.join().expect("busy thread panicked");

    let stop_second = Arc::new(AtomicBool::new(false));
    let (second_busy, second_code) =
        spawn_busy_host_thread("second_session_fn", "two.py", 2, Arc::clone(&stop_second));

    let second = profile_cpu(300_000_000, 10_000)?;
    stop_second.store(true, Ordering::Relaxed);
    second_busy.join().expect("busy thread panicked");

    {
        let _guard = host::lock_runtime();
        unsafe {
            destroy_code_record(first_code as *mut CodeRecord);
            destroy_code_record(second_code as *mut CodeRecord);
        }
    }

    assert!(leaf_samples(&first, "first_session_fn") >= 1);
    assert_eq!(
        leaf_samples(&second, "first_session_fn"),
        0,
        "second session must not carry first session samples"
    );
    assert!(leaf_samples(&second, "second_session_fn") >= 1);
    Ok(())
}

#[test]
fn test_zero_duration_returns_empty_profile() -> Result<()> {
    let _session = session_lock();

    let profile = profile_cpu(0, 10_000)?;
    assert!(profile.is_empty());

    // The timer is disarmed: no further signals arrive while we idle.
    thread::sleep(Duration::from_millis(50));
    Ok(())
}

#[test]
fn test_threads_without_host_state_surface_as_sentinel() -> Result<()> {
    let _session = session_lock();

    // Burn CPU on a thread that never publishes host state.
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let busy = thread::spawn(move || {
        let mut x = 0u64;
        while !stop_flag.load(Ordering::Relaxed) {
            for _ in 0..10_000 {
                x = x.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            }
            std::hint::black_box(x);
        }
    });

    let profile = profile_cpu(300_000_000, 10_000)?;
    stop.store(true, Ordering::Relaxed);
    busy.join().expect("busy thread panicked");

    let sentinel = leaf_samples(&profile, "[Unknown - No Host State]");
    assert!(
        sentinel >= 1,
        "samples on a stateless thread should carry the sentinel frame, got {:?}",
        profile.samples()
    );
    Ok(())
}
