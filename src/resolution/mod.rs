//! Code identity resolution
//!
//! Converts the opaque code identifiers carried by sampled frames into
//! human-readable `(name, filename)` metadata.
//!
//! A sampled identifier is a host pointer, and the host may free the
//! record behind it at any moment. Resolution therefore runs in two
//! tiers, both under the host runtime lock:
//!
//! 1. the death map, populated by [`code_death::CodeDeathHook`] when a
//!    record is destroyed during the session,
//! 2. a live query of the record, valid precisely because a destruction
//!    the hook did not see cannot have happened.

pub mod code_death;

pub use code_death::CodeDeathHook;

use crate::domain::{Frame, ResolvedFrame, SentinelLine};
use crate::host;

/// Resolve a sampled frame into its reportable form.
///
/// The `guard` witnesses that the caller holds the runtime lock, which
/// keeps the death map consistent and the live query sound. Frames with
/// a null code identifier resolve to the synthetic name of their
/// sentinel line.
pub fn resolve_frame(frame: &Frame, _guard: &host::RuntimeGuard) -> ResolvedFrame {
    if frame.code.is_null() {
        let sentinel =
            SentinelLine::from_line(frame.line).unwrap_or(SentinelLine::Unknown);
        return ResolvedFrame {
            name: sentinel.display_name().to_string(),
            filename: String::new(),
            line: frame.line,
        };
    }

    let func_loc = match code_death::resolve(frame.code) {
        Some(recorded) => recorded,
        // Not in the death map, so the record is live.
        None => unsafe { host::resolve_live(frame.code) },
    };
    ResolvedFrame { name: func_loc.name, filename: func_loc.filename, line: frame.line }
}
