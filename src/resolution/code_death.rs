//! Code-record death hook
//!
//! A sampled frame carries a code identifier that is, in practice, a
//! pointer into the host. The host may free the record while its address
//! still sits in pending traces; resolving it afterwards would read
//! freed memory. This hook swaps the host's code-record destructor for a
//! wrapper that snapshots the record's `(name, filename)` into a map
//! keyed by its address before delegating to the original destructor.
//!
//! The map is only mutated with the host runtime lock held (destruction
//! happens under it), and the materializing driver reads it under the
//! same lock, so the lock serializes all access; the mutex below is the
//! Rust-visible form of that discipline.
//!
//! Known imperfection: if two different records occupy the same address
//! at different times within one session, the snapshot of the first
//! shadows the live second. Fixing this would require also hooking
//! record allocation to invalidate stale entries.

use std::collections::HashMap;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::LazyLock;

use parking_lot::Mutex;

use crate::domain::{CodeId, FuncLoc};
use crate::host::{self, CodeDestructor, CodeRecord, CODE_RECORD_TYPE};

// Process-lifetime: entries may be looked up while traces sampled by a
// prior handler invocation are still being resolved.
static DEALLOCATED_CODE: LazyLock<Mutex<HashMap<CodeId, FuncLoc>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

static ORIGINAL_DEALLOC: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Destructor wrapper: snapshot the record's identity, then delegate.
///
/// # Safety
///
/// Installed in the code-record destructor slot; called by the host with
/// a live record and the runtime lock held.
unsafe fn recording_dealloc(record: *mut CodeRecord) {
    let func_loc = FuncLoc {
        name: (*record).name.clone(),
        filename: (*record).filename.clone(),
    };
    DEALLOCATED_CODE.lock().insert(CodeRecord::id(record), func_loc);

    let original = ORIGINAL_DEALLOC.load(Ordering::Acquire);
    let original: CodeDestructor = if original.is_null() {
        host::default_dealloc
    } else {
        mem::transmute::<*mut (), CodeDestructor>(original)
    };
    original(record);
}

/// Scoped installation of the recording destructor.
///
/// Installing clears the death map and swaps the destructor slot; drop
/// restores the original destructor. Both transitions happen under the
/// host runtime lock. One hook at a time per process; the collector
/// session enforces this by being the only installer.
pub struct CodeDeathHook {
    _private: (),
}

impl CodeDeathHook {
    /// Install the hook for a session. The `guard` witnesses that the
    /// caller holds the runtime lock.
    pub fn install(_guard: &host::RuntimeGuard) -> Self {
        reset();
        let original = CODE_RECORD_TYPE.swap_dealloc(recording_dealloc);
        ORIGINAL_DEALLOC.store(original as *mut (), Ordering::Release);
        CodeDeathHook { _private: () }
    }
}

impl Drop for CodeDeathHook {
    fn drop(&mut self) {
        let _guard = host::lock_runtime();
        let original = ORIGINAL_DEALLOC.swap(ptr::null_mut(), Ordering::AcqRel);
        let original: CodeDestructor = if original.is_null() {
            host::default_dealloc
        } else {
            unsafe { mem::transmute::<*mut (), CodeDestructor>(original) }
        };
        CODE_RECORD_TYPE.swap_dealloc(original);
    }
}

/// Look up the snapshot recorded for `code`, if its record died while
/// the hook was installed.
pub fn resolve(code: CodeId) -> Option<FuncLoc> {
    DEALLOCATED_CODE.lock().get(&code).cloned()
}

/// Clear the map between sessions.
pub fn reset() {
    DEALLOCATED_CODE.lock().clear();
}
