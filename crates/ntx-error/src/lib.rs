#![forbid(unsafe_code)]
//! Error types for the NtxFS extent core.
//!
//! # Error Taxonomy
//!
//! | Class | Variant(s) | errno | Side effect |
//! |-------|-----------|-------|-------------|
//! | Corruption | `Corruption` | `EIO` | volume `NeedsCheck` flag set at the detection site |
//! | Resource exhaustion | `NoSpace`, `NoMemory` | `ENOSPC`, `ENOMEM` | operation unwound to its pre-call state |
//! | Contract violation | `InvalidArgument`, `Overlap` | `EINVAL`, `ERANGE` | fail fast, no recovery attempted |
//! | Lookup miss | `NotFound` | `ENOENT` | none |
//! | OS I/O | `Io` | raw errno or `EIO` | none |
//!
//! Propagation policy: leaf routines return a specific variant; mid-level
//! routines pass corruption and exhaustion through unchanged. The cluster
//! free path is the one deliberate exception — it logs and continues past a
//! single bad extent (see `ntx-alloc`).
//!
//! The resumable mapping-pairs encode limit is *not* an error: the codec
//! returns a `MappingBuild` carrying the stop vcn instead.
//!
//! `ntx-error` deliberately depends on nothing but `thiserror` and `libc`
//! so every other crate in the workspace can use it without cycles.

use thiserror::Error;

/// Unified error type for all NtxFS extent-core operations.
#[derive(Debug, Error)]
pub enum NtxError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk format corruption: malformed mapping pairs, malformed LZNT1
    /// stream, or an out-of-range lcn. The caller that detects disk-level
    /// corruption also sets the volume `NeedsCheck` flag.
    #[error("corruption: {detail}")]
    Corruption { detail: String },

    /// No free clusters satisfy the allocation request.
    #[error("no space left on device")]
    NoSpace,

    /// In-memory buffer growth failed.
    #[error("out of memory")]
    NoMemory,

    /// Two real-lcn extents overlap at a merge boundary.
    #[error("runlist fragments overlap at vcn {vcn}")]
    Overlap { vcn: i64 },

    /// Caller passed structurally invalid input (negative count, range
    /// covering unmapped extents, out-of-order fragments).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Requested vcn precedes the attribute's mapped range, or the attribute
    /// ends before it.
    #[error("not found")]
    NotFound,
}

impl NtxError {
    /// Convert this error into a POSIX errno.
    ///
    /// The match is exhaustive — adding a variant without assigning an errno
    /// is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::NoSpace => libc::ENOSPC,
            Self::NoMemory => libc::ENOMEM,
            Self::Overlap { .. } => libc::ERANGE,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::NotFound => libc::ENOENT,
        }
    }

    /// Shorthand for a corruption error with an owned detail string.
    #[must_use]
    pub fn corruption(detail: impl Into<String>) -> Self {
        Self::Corruption {
            detail: detail.into(),
        }
    }
}

/// Result alias using `NtxError`.
pub type Result<T> = std::result::Result<T, NtxError>;
