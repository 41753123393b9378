//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent common bugs like passing a raw address
//! where a resolved frame is expected, and make function signatures more
//! expressive.

use std::fmt;

/// Maximum number of frames captured from a single call stack.
///
/// Deeper chains are truncated at capture time, keeping the innermost
/// frames.
pub const MAX_FRAMES_TO_CAPTURE: usize = 128;

/// Opaque identifier of a host code record.
///
/// Pointer-sized, compared by identity. The host owns the record behind
/// the identifier and may free it at any time, after which the address
/// can be reused for a different record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeId(pub usize);

impl CodeId {
    /// The null identifier, used by frames that carry a sentinel line
    /// instead of a real code record.
    pub const NULL: CodeId = CodeId(0);

    /// Returns true if this identifier refers to no code record
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code:{:#x}", self.0)
    }
}

/// A single sampled stack frame: which code record was executing and at
/// which line.
///
/// When `code` is [`CodeId::NULL`], `line` holds a [`SentinelLine`] value
/// instead of a source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame {
    pub code: CodeId,
    pub line: i32,
}

impl Frame {
    /// An unused frame slot.
    pub const EMPTY: Frame = Frame { code: CodeId::NULL, line: 0 };
}

/// Sentinel values carried in a frame's `line` field when no real source
/// line is available.
///
/// These occupy a small closed set of non-positive values that never
/// appear as real line numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SentinelLine {
    /// The sample could not be attributed at all (e.g. the fixed trace
    /// table was full).
    Unknown = 0,
    /// The interrupted thread had no host runtime state.
    NoHostState = -1,
}

impl SentinelLine {
    /// Interpret a frame's line value as a sentinel, if it is one.
    #[must_use]
    pub fn from_line(line: i32) -> Option<Self> {
        match line {
            0 => Some(SentinelLine::Unknown),
            -1 => Some(SentinelLine::NoHostState),
            _ => None,
        }
    }

    /// The synthetic function name reported for frames carrying this
    /// sentinel.
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            SentinelLine::Unknown => "[Unknown]",
            SentinelLine::NoHostState => "[Unknown - No Host State]",
        }
    }
}

/// Identifying metadata of a code record: function name and source file.
///
/// Obtained either by querying a live record or from the snapshot taken
/// when the record was destroyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncLoc {
    pub name: String,
    pub filename: String,
}

/// A frame of a materialized profile, with its code record resolved to
/// human-readable metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedFrame {
    pub name: String,
    pub filename: String,
    pub line: i32,
}

impl fmt::Display for ResolvedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.filename.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} ({}:{})", self.name, self.filename, self.line)
        }
    }
}
