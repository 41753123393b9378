//! Host runtime embedding contract
//!
//! The profiler samples a managed-runtime host embedded in the same
//! process. This module defines the small surface the host must expose:
//!
//! - a per-thread [`ThreadState`] reachable from any thread through a
//!   pluggable getter (stubbed in tests),
//! - a frame chain ([`FrameLink`]) walkable by reading fields only, so
//!   the walk stays async-signal-safe,
//! - code records ([`CodeRecord`]) destroyed through a swappable
//!   destructor slot on the process-wide record type, which the
//!   code-death hook intercepts,
//! - a global serialization lock ([`lock_runtime`]) held around every
//!   host API call, including code record destruction.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::domain::{CodeId, Frame, FuncLoc, SentinelLine, MAX_FRAMES_TO_CAPTURE};

/// Guard for the host's global serialization lock.
pub type RuntimeGuard = ReentrantMutexGuard<'static, ()>;

static RUNTIME_LOCK: ReentrantMutex<()> = ReentrantMutex::new(());

/// Acquire the host's global serialization lock.
///
/// The lock is re-entrant: a thread already inside a host API call may
/// acquire it again. Code record destruction and live record resolution
/// both happen under this lock.
pub fn lock_runtime() -> RuntimeGuard {
    RUNTIME_LOCK.lock()
}

/// Per-thread execution state exposed by the host.
///
/// The profiler only reads `current_frame`, and only from the signal
/// handler running on the interrupted thread itself, so the chain is
/// stable for the duration of the read.
#[repr(C)]
#[derive(Debug)]
pub struct ThreadState {
    /// Innermost executing frame, or null when the thread is idle.
    pub current_frame: *const FrameLink,
}

/// One link of the host's frame chain, innermost to outermost.
#[repr(C)]
#[derive(Debug)]
pub struct FrameLink {
    /// Code record executing in this frame.
    pub code: *const CodeRecord,
    /// Source line currently executing in this frame.
    pub line: i32,
    /// Next outer frame, or null at the end of the chain.
    pub back: *const FrameLink,
}

/// A host code record.
///
/// The record's address doubles as its identity ([`CodeId`]); the host
/// may destroy the record and reuse the address at any time. Records are
/// destroyed through [`CodeRecordType::dealloc`], never dropped directly,
/// so the destructor slot can be intercepted.
#[derive(Debug)]
pub struct CodeRecord {
    pub name: String,
    pub filename: String,
}

impl CodeRecord {
    /// Allocate a new code record, returning its raw handle. The caller
    /// owns the record and must release it through
    /// [`destroy_code_record`].
    pub fn create(name: &str, filename: &str) -> *mut CodeRecord {
        Box::into_raw(Box::new(CodeRecord {
            name: name.to_string(),
            filename: filename.to_string(),
        }))
    }

    /// The identity of a record handle.
    #[must_use]
    pub fn id(record: *const CodeRecord) -> CodeId {
        CodeId(record as usize)
    }
}

/// Destructor slot signature for code records.
pub type CodeDestructor = unsafe fn(*mut CodeRecord);

/// The destructor actually releasing a code record's storage. This is
/// what the slot delegates to once any installed hook has run.
///
/// # Safety
///
/// `record` must have been produced by [`CodeRecord::create`] and not
/// yet destroyed.
pub unsafe fn default_dealloc(record: *mut CodeRecord) {
    drop(Box::from_raw(record));
}

/// Process-wide type object for code records, owning the swappable
/// destructor slot.
pub struct CodeRecordType {
    // Stored as a raw pointer so the slot can live in a static; null
    // means "the default destructor".
    dealloc: AtomicPtr<()>,
}

/// The type object all code records share.
pub static CODE_RECORD_TYPE: CodeRecordType = CodeRecordType {
    dealloc: AtomicPtr::new(ptr::null_mut()),
};

impl CodeRecordType {
    /// The currently installed destructor.
    pub fn dealloc(&self) -> CodeDestructor {
        let raw = self.dealloc.load(Ordering::Acquire);
        if raw.is_null() {
            default_dealloc
        } else {
            // Only `swap_dealloc` stores here, and it only stores valid
            // `CodeDestructor` values.
            unsafe { mem::transmute::<*mut (), CodeDestructor>(raw) }
        }
    }

    /// Swap the destructor slot, returning the previous destructor so it
    /// can be delegated to and later restored.
    ///
    /// Callers must hold the runtime lock; the host reads this slot under
    /// the same lock whenever it destroys a record.
    pub fn swap_dealloc(&self, new: CodeDestructor) -> CodeDestructor {
        let old = self.dealloc.swap(new as *mut (), Ordering::AcqRel);
        if old.is_null() {
            default_dealloc
        } else {
            unsafe { mem::transmute::<*mut (), CodeDestructor>(old) }
        }
    }
}

/// Destroy a code record through the type's destructor slot.
///
/// # Safety
///
/// `record` must be a live record from [`CodeRecord::create`], and the
/// caller must hold the runtime lock.
pub unsafe fn destroy_code_record(record: *mut CodeRecord) {
    (CODE_RECORD_TYPE.dealloc())(record);
}

/// Read the identifying metadata of a live code record.
///
/// # Safety
///
/// The caller must hold the runtime lock and must have established that
/// the record is still live. During a profiling session every record
/// destruction is intercepted by the code-death hook, so an identifier
/// missing from the death map is live.
pub unsafe fn resolve_live(code: CodeId) -> FuncLoc {
    let record = &*(code.0 as *const CodeRecord);
    FuncLoc {
        name: record.name.clone(),
        filename: record.filename.clone(),
    }
}

/// Getter for the calling thread's host state; returns null if the
/// thread has no host state.
pub type ThreadStateFn = fn() -> *const ThreadState;

// Published once by the embedder (or a test); read from the signal
// handler with a plain atomic load. Null means no host is attached.
static THREAD_STATE_GETTER: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Install the current-thread state getter.
///
/// The getter is called from the signal handler and must be
/// async-signal-safe. Thread-local storage is the usual implementation;
/// POSIX does not guarantee TLS reads are async-signal-safe, but in
/// practice they are on the supported platforms.
pub fn set_thread_state_getter(getter: ThreadStateFn) {
    THREAD_STATE_GETTER.store(getter as *mut (), Ordering::Release);
}

/// The calling thread's host state, or null when no host is attached or
/// the thread has none.
pub(crate) fn current_thread_state() -> *const ThreadState {
    let raw = THREAD_STATE_GETTER.load(Ordering::Acquire);
    if raw.is_null() {
        return ptr::null();
    }
    let getter = unsafe { mem::transmute::<*mut (), ThreadStateFn>(raw) };
    getter()
}

/// Record the interrupted thread's frame chain into `frames`, returning
/// the number of frames written.
///
/// Runs inside the signal handler: it reads fields only and never
/// touches host reference counts. A thread with no host state yields a
/// single sentinel frame; a chain deeper than the buffer is truncated,
/// keeping the innermost frames.
pub(crate) fn walk_frame_chain(
    frames: &mut [Frame; MAX_FRAMES_TO_CAPTURE],
    state: *const ThreadState,
) -> usize {
    if state.is_null() {
        frames[0] = Frame {
            code: CodeId::NULL,
            line: SentinelLine::NoHostState as i32,
        };
        return 1;
    }

    // The handler runs on the thread the signal interrupted, so the
    // chain cannot be mutated under us while we walk it.
    let mut link = unsafe { (*state).current_frame };
    let mut num_frames = 0;
    while !link.is_null() && num_frames < MAX_FRAMES_TO_CAPTURE {
        unsafe {
            frames[num_frames] = Frame {
                code: CodeRecord::id((*link).code),
                line: (*link).line,
            };
            link = (*link).back;
        }
        num_frames += 1;
    }
    num_frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_null_state_yields_sentinel_frame() {
        let mut frames = [Frame::EMPTY; MAX_FRAMES_TO_CAPTURE];
        let written = walk_frame_chain(&mut frames, ptr::null());

        assert_eq!(written, 1);
        assert!(frames[0].code.is_null());
        assert_eq!(frames[0].line, SentinelLine::NoHostState as i32);
    }

    #[test]
    fn test_walk_records_chain_innermost_first() {
        let code_a = CodeRecord::create("inner", "a.py");
        let code_b = CodeRecord::create("outer", "b.py");

        let outer = FrameLink { code: code_b, line: 7, back: ptr::null() };
        let inner = FrameLink { code: code_a, line: 3, back: &outer };
        let state = ThreadState { current_frame: &inner };

        let mut frames = [Frame::EMPTY; MAX_FRAMES_TO_CAPTURE];
        let written = walk_frame_chain(&mut frames, &state);

        assert_eq!(written, 2);
        assert_eq!(frames[0], Frame { code: CodeRecord::id(code_a), line: 3 });
        assert_eq!(frames[1], Frame { code: CodeRecord::id(code_b), line: 7 });

        let _guard = lock_runtime();
        unsafe {
            destroy_code_record(code_a);
            destroy_code_record(code_b);
        }
    }

    #[test]
    fn test_walk_truncates_deep_chains() {
        let code = CodeRecord::create("deep", "deep.py");

        // Build a chain two frames deeper than the capture buffer.
        let mut links = Vec::with_capacity(MAX_FRAMES_TO_CAPTURE + 2);
        links.push(FrameLink { code, line: 0, back: ptr::null() });
        for line in 1..(MAX_FRAMES_TO_CAPTURE as i32 + 2) {
            let back: *const FrameLink = links.last().unwrap();
            links.push(FrameLink { code, line, back });
        }
        let state = ThreadState { current_frame: links.last().unwrap() };

        let mut frames = [Frame::EMPTY; MAX_FRAMES_TO_CAPTURE];
        let written = walk_frame_chain(&mut frames, &state);

        assert_eq!(written, MAX_FRAMES_TO_CAPTURE);
        // Innermost frame is first; the outermost two fell off the end.
        assert_eq!(frames[0].line, MAX_FRAMES_TO_CAPTURE as i32 + 1);

        let _guard = lock_runtime();
        unsafe { destroy_code_record(code) };
    }

    #[test]
    fn test_dealloc_slot_swap_returns_previous() {
        unsafe fn nop_dealloc(_record: *mut CodeRecord) {}

        let _process = crate::test_sync::PROCESS_STATE.lock();
        let _guard = lock_runtime();
        let original = CODE_RECORD_TYPE.swap_dealloc(nop_dealloc);
        assert_eq!(CODE_RECORD_TYPE.dealloc() as usize, nop_dealloc as usize);

        let restored = CODE_RECORD_TYPE.swap_dealloc(original);
        assert_eq!(restored as usize, nop_dealloc as usize);
    }
}
