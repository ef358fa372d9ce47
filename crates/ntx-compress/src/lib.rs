#![forbid(unsafe_code)]
//! Compression-block classification and LZNT1-style decompression.
//!
//! A compressed attribute is read in compression blocks of
//! `2^compression_unit` clusters (conventionally 16). Classification
//! inspects the runlist: a block whose first vcn is sparse is wholly sparse;
//! a block whose last vcn is sparse holds compressed data with a sparse
//! tail; anything else is stored uncompressed.
//!
//! Each compression block is partitioned into 4096-byte sub-blocks, each
//! independently flagged compressed or raw via its own 16-bit header. A
//! compressed sub-block is a token stream: groups of up to 8 tokens behind a
//! tag byte, a clear bit selecting a literal byte and a set bit a 16-bit
//! back-reference phrase whose length/distance split shifts as the output
//! offset grows.
//!
//! Malformed streams are corruption: the volume's `NeedsCheck` flag is set
//! and decompression halts without attempting partial recovery.

use ntx_error::{NtxError, Result};
use ntx_runlist::{Lookup, Runlist};
use ntx_types::{read_le_u16, NeedsCheck, Vcn, PAGE_SIZE};
use tracing::warn;

/// Size of one sub-block within a compression block.
pub const SUB_BLOCK_SIZE: usize = PAGE_SIZE;

const SB_SIZE_MASK: u16 = 0x0FFF;
const SB_COMPRESSED: u16 = 0x8000;

/// Number of clusters in one compression block.
pub fn block_clusters(compression_unit: u8) -> Result<i64> {
    if compression_unit >= 31 {
        return Err(NtxError::InvalidArgument("compression unit too large"));
    }
    Ok(1_i64 << compression_unit)
}

/// How a compression block is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Entirely sparse: logically zero, no disk backing.
    Sparse,
    /// Partially backed: real data up front, sparse tail. The backed part
    /// holds an LZNT1 stream.
    Compressed,
    /// Fully backed: stored raw.
    Uncompressed,
}

/// Collaborator that decodes further attribute-record extents on demand.
///
/// `classify` calls this when it hits an unmapped region; the implementation
/// merges the relevant fragment into `rl` and returns.
pub trait AttrMapper {
    fn map_extent(&mut self, rl: &mut Runlist, vcn: Vcn) -> Result<()>;
}

/// Classify the compression block starting at `cb_start` and spanning
/// `cb_clusters` clusters.
///
/// Unmapped extents trigger one on-demand mapping via `mapper` before
/// classification proceeds; a vcn still unmapped afterwards is corruption.
pub fn classify(
    rl: &mut Runlist,
    mapper: &mut dyn AttrMapper,
    cb_start: Vcn,
    cb_clusters: i64,
) -> Result<BlockKind> {
    if cb_clusters <= 0 {
        return Err(NtxError::InvalidArgument("non-positive block size"));
    }

    // A block whose first vcn is a hole (or past the attribute end) carries
    // no data at all.
    match resolve(rl, mapper, cb_start)? {
        Lookup::Hole { .. } | Lookup::EndOfAttribute => return Ok(BlockKind::Sparse),
        Lookup::Mapped { .. } | Lookup::Unmapped => {}
    }

    let last = Vcn(cb_start.0 + cb_clusters - 1);
    match resolve(rl, mapper, last)? {
        Lookup::Hole { .. } | Lookup::EndOfAttribute => Ok(BlockKind::Compressed),
        Lookup::Mapped { .. } | Lookup::Unmapped => Ok(BlockKind::Uncompressed),
    }
}

/// Look up `vcn`, mapping the containing attribute extent once if needed.
fn resolve(rl: &mut Runlist, mapper: &mut dyn AttrMapper, vcn: Vcn) -> Result<Lookup> {
    match rl.vcn_to_lcn(vcn) {
        Lookup::Unmapped => {
            mapper.map_extent(rl, vcn)?;
            match rl.vcn_to_lcn(vcn) {
                Lookup::Unmapped => {
                    warn!(vcn = vcn.0, "extent still unmapped after mapping");
                    Err(NtxError::corruption("attribute extent failed to map"))
                }
                resolved => Ok(resolved),
            }
        }
        resolved => Ok(resolved),
    }
}

/// Decompress a compression block's backing data into `dst`.
///
/// `src` is the raw backed region of the block; `dst` receives the full
/// decompressed block. Sub-blocks are processed in order; a zero header or
/// exhaustion of either buffer ends decompression and zero-fills the rest of
/// `dst`. Corruption sets `needs_check` and returns an error immediately.
pub fn decompress(src: &[u8], dst: &mut [u8], needs_check: &NeedsCheck) -> Result<()> {
    let mut s = 0_usize;
    let mut d = 0_usize;

    while d < dst.len() {
        let Ok(header) = read_le_u16(src, s) else {
            break;
        };
        if header == 0 {
            break;
        }
        s += 2;

        let stored = usize::from(header & SB_SIZE_MASK) + 3;
        let sb_src_end = s + stored;
        if sb_src_end > src.len() {
            warn!(offset = s, stored, "sub-block body runs past source");
            needs_check.set();
            return Err(NtxError::corruption("sub-block header length invalid"));
        }
        let sb_dst_end = (d + SUB_BLOCK_SIZE).min(dst.len());

        // Only the sign bit distinguishes compressed from raw; the nominal
        // tag nibble is not checked.
        if header & SB_COMPRESSED == 0 {
            let n = stored.min(sb_dst_end - d);
            dst[d..d + n].copy_from_slice(&src[s..s + n]);
            dst[d + n..sb_dst_end].fill(0);
        } else {
            decompress_sub_block(&src[s..sb_src_end], &mut dst[d..sb_dst_end], needs_check)?;
        }
        s = sb_src_end;
        d = sb_dst_end;
    }

    dst[d..].fill(0);
    Ok(())
}

/// Decode one compressed sub-block's token stream.
fn decompress_sub_block(src: &[u8], dst: &mut [u8], needs_check: &NeedsCheck) -> Result<()> {
    let mut s = 0_usize;
    let mut d = 0_usize;

    'outer: while s < src.len() && d < dst.len() {
        let tag = src[s];
        s += 1;
        for bit in 0..8 {
            if s >= src.len() || d >= dst.len() {
                break 'outer;
            }
            if tag & (1 << bit) == 0 {
                // Symbol token: one literal byte.
                dst[d] = src[s];
                d += 1;
                s += 1;
                continue;
            }

            // Phrase token: 16-bit back-reference.
            if s + 2 > src.len() {
                needs_check.set();
                return Err(NtxError::corruption("phrase token truncated"));
            }
            let phrase = u16::from_le_bytes([src[s], src[s + 1]]);
            s += 2;
            if d == 0 {
                warn!("phrase token opens sub-block");
                needs_check.set();
                return Err(NtxError::corruption("back-reference with no history"));
            }

            // The length/distance bit split depends on log2 of the current
            // output offset minus one.
            let mut i = d - 1;
            let mut lg = 0_u32;
            while i >= 0x10 {
                i >>= 1;
                lg += 1;
            }
            let length = usize::from(phrase & (SB_SIZE_MASK >> lg)) + 3;
            let back = usize::from(phrase >> (12 - lg)) + 1;

            if back > d {
                warn!(back, at = d, "back-reference reaches before sub-block");
                needs_check.set();
                return Err(NtxError::corruption("back-reference out of range"));
            }
            if d + length > dst.len() {
                warn!(length, at = d, "phrase writes past sub-block");
                needs_check.set();
                return Err(NtxError::corruption("phrase length out of range"));
            }

            let from = d - back;
            if back >= length {
                dst.copy_within(from..from + length, d);
            } else {
                // Source overlaps the bytes being written: bulk-copy the
                // non-overlapping prefix, then repeat byte-by-byte.
                dst.copy_within(from..from + back, d);
                for k in back..length {
                    dst[d + k] = dst[d + k - back];
                }
            }
            d += length;
        }
    }

    dst[d..].fill(0);
    Ok(())
}
