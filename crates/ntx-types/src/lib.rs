#![forbid(unsafe_code)]
//! Cluster-addressing types shared across the NtxFS extent core.
//!
//! The two central newtypes are [`Vcn`] (virtual cluster number, an offset
//! within an attribute's logical stream) and [`Lcn`] (logical cluster number,
//! an absolute cluster on the volume). `Lcn` reserves a small negative range
//! for in-memory sentinels; [`Lcn::kind`] classifies a value so callers never
//! do arithmetic on a sentinel by accident.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Size of a page as seen by the bitmap and compression paths.
pub const PAGE_SIZE: usize = 4096;

/// Virtual cluster number: offset, in clusters, within an attribute.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Vcn(pub i64);

/// Logical cluster number: absolute cluster offset on the volume.
///
/// Negative values are reserved sentinels; see the associated constants.
/// A non-negative value is a real on-disk cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Lcn(pub i64);

impl Lcn {
    /// Sparse run: logically zero, no disk backing.
    pub const HOLE: Self = Self(-1);
    /// The vcn range exists on disk but has not been decoded into memory yet.
    pub const NOT_MAPPED: Self = Self(-2);
    /// End of attribute; valid only in a zero-length terminator extent.
    pub const END_OF_ATTR: Self = Self(-3);
    /// Transient operational signal: allocation failure. Never persisted.
    pub const SIG_NOMEM: Self = Self(-4);
    /// Transient operational signal: I/O failure. Never persisted.
    pub const SIG_IO: Self = Self(-5);

    /// Whether this is a real on-disk cluster number.
    #[must_use]
    pub fn is_real(self) -> bool {
        self.0 >= 0
    }

    /// Classify this value.
    #[must_use]
    pub fn kind(self) -> LcnKind {
        match self.0 {
            n if n >= 0 => LcnKind::Real,
            -1 => LcnKind::Hole,
            -2 => LcnKind::NotMapped,
            -3 => LcnKind::EndOfAttr,
            _ => LcnKind::Signal,
        }
    }

    /// Offset a real lcn by `delta` clusters.
    ///
    /// Returns `None` when this is a sentinel or the addition overflows.
    #[must_use]
    pub fn checked_offset(self, delta: i64) -> Option<Self> {
        if !self.is_real() {
            return None;
        }
        self.0.checked_add(delta).map(Self)
    }
}

/// Classification of an [`Lcn`] value.
///
/// Sentinels double as both domain values (hole, unmapped, end marker) and
/// transient signals; matching on this enum keeps the two apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LcnKind {
    /// `lcn >= 0`: a real on-disk cluster.
    Real,
    /// Sparse run.
    Hole,
    /// Not yet decoded from the attribute record.
    NotMapped,
    /// End-of-attribute terminator.
    EndOfAttr,
    /// Transient operational signal (`SIG_NOMEM`, `SIG_IO`, or any value
    /// below the defined sentinel range).
    Signal,
}

impl Vcn {
    /// Add a cluster count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, clusters: i64) -> Option<Self> {
        self.0.checked_add(clusters).map(Self)
    }

    /// Subtract a cluster count, returning `None` on overflow.
    #[must_use]
    pub fn checked_sub(self, clusters: i64) -> Option<Self> {
        self.0.checked_sub(clusters).map(Self)
    }
}

impl fmt::Display for Vcn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Lcn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            LcnKind::Real => write!(f, "{}", self.0),
            LcnKind::Hole => write!(f, "HOLE"),
            LcnKind::NotMapped => write!(f, "NOT_MAPPED"),
            LcnKind::EndOfAttr => write!(f, "END_OF_ATTR"),
            LcnKind::Signal => write!(f, "SIG({})", self.0),
        }
    }
}

/// Volume-wide "needs offline consistency check" flag.
///
/// Set (never cleared at this layer) when disk-format-level corruption is
/// detected. Cheap to share: callers clone the `Arc` it usually lives in.
#[derive(Debug, Default)]
pub struct NeedsCheck(AtomicBool);

impl NeedsCheck {
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Mark the volume as needing an offline check.
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Parse-layer error for the little-endian read helpers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
}

/// Borrow `len` bytes at `offset`, checking bounds.
#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let end = offset.checked_add(len).ok_or(ParseError::InsufficientData {
        needed: len,
        offset,
        actual: 0,
    })?;
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}
