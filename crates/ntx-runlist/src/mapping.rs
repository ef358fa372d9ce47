//! Mapping pairs: the compact on-disk encoding of a runlist.
//!
//! A mapping-pairs stream is a sequence of records, each
//! `[header:1][length_bytes:0-15][lcn_delta_bytes:0-15]` where
//! `header = (lcn_delta_byte_count << 4) | length_byte_count`. Length and
//! delta are minimal-width signed little-endian integers; the stream ends
//! with a single `0x00` header byte. A zero delta nibble marks a sparse run
//! on format 3.0+ volumes.

use crate::{Extent, Runlist};
use ntx_error::{NtxError, Result};
use ntx_types::{Lcn, LcnKind, Vcn};
use tracing::warn;

/// Outcome of a mapping-pairs build.
///
/// When the destination buffer fills before `last_vcn` is reached,
/// `stop_vcn` is short of the requested end; the caller resumes a subsequent
/// attribute-record extent from there. This capacity limit is resumable, not
/// an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingBuild {
    /// Bytes written to the destination, including the terminating zero.
    pub written: usize,
    /// First vcn not yet encoded. Equals one past `last_vcn` when complete.
    pub stop_vcn: Vcn,
}

impl MappingBuild {
    /// Whether the build covered everything up to and including `last_vcn`.
    #[must_use]
    pub fn is_complete(&self, last_vcn: Vcn) -> bool {
        self.stop_vcn.0 > last_vcn.0
    }
}

/// Decode a mapping-pairs stream into a runlist fragment.
///
/// `lowest_vcn`/`highest_vcn` come from the attribute record holding the
/// stream; `highest_vcn` must match the decoded coverage or the record is
/// corrupt. For a base extent (`is_base`), the fragment is closed out
/// against `allocated_clusters`: a `NOT_MAPPED` filler covers any clusters
/// past the decoded runs, followed by the `END_OF_ATTR` terminator.
/// Non-base extents terminate with `NOT_MAPPED` since more record extents
/// may follow elsewhere.
///
/// `sparse_ok` is true on format 3.0+ volumes; a zero delta nibble on an
/// older volume is corruption.
pub fn decode(
    bytes: &[u8],
    lowest_vcn: Vcn,
    highest_vcn: Vcn,
    allocated_clusters: i64,
    is_base: bool,
    sparse_ok: bool,
) -> Result<Runlist> {
    let mut out: Vec<Extent> = Vec::new();
    let mut vcn = lowest_vcn.0;
    let mut lcn = 0_i64;
    let mut pos = 0_usize;

    if vcn < 0 {
        return Err(NtxError::InvalidArgument("negative lowest_vcn"));
    }

    loop {
        let Some(&header) = bytes.get(pos) else {
            warn!(pos, "mapping pairs ran off the attribute record");
            return Err(NtxError::corruption("mapping pairs missing terminator"));
        };
        pos += 1;
        if header == 0 {
            break;
        }

        let len_size = (header & 0x0F) as usize;
        let delta_size = (header >> 4) as usize;
        if len_size == 0 || len_size > 8 || delta_size > 8 {
            warn!(header, pos, "invalid mapping pair header nibble");
            return Err(NtxError::corruption("invalid mapping pair header"));
        }

        let length = read_signed_le(bytes, pos, len_size)?;
        pos += len_size;
        if length <= 0 {
            warn!(length, vcn, "non-positive run length in mapping pairs");
            return Err(NtxError::corruption("non-positive mapping pair length"));
        }

        if delta_size == 0 {
            if !sparse_ok {
                warn!(vcn, "sparse run on a pre-3.0 format volume");
                return Err(NtxError::corruption("sparse run not allowed by format"));
            }
            push_coalescing(&mut out, Extent::new(vcn, Lcn::HOLE, length));
        } else {
            let delta = read_signed_le(bytes, pos, delta_size)?;
            pos += delta_size;
            lcn = lcn
                .checked_add(delta)
                .ok_or_else(|| NtxError::corruption("lcn delta overflow"))?;
            if lcn < 0 {
                warn!(lcn, vcn, "mapping pairs point before cluster zero");
                return Err(NtxError::corruption("negative lcn in mapping pairs"));
            }
            push_coalescing(&mut out, Extent::new(vcn, Lcn(lcn), length));
        }

        vcn = vcn
            .checked_add(length)
            .ok_or_else(|| NtxError::corruption("vcn overflow in mapping pairs"))?;
    }

    if vcn - 1 != highest_vcn.0 {
        warn!(
            decoded_end = vcn,
            highest_vcn = highest_vcn.0,
            "mapping pairs coverage disagrees with attribute record"
        );
        return Err(NtxError::corruption("highest_vcn mismatch"));
    }

    if is_base {
        if vcn > allocated_clusters {
            return Err(NtxError::corruption(
                "mapping pairs exceed attribute allocated size",
            ));
        }
        if vcn < allocated_clusters {
            out.push(Extent::new(vcn, Lcn::NOT_MAPPED, allocated_clusters - vcn));
            out.push(Extent::new(allocated_clusters, Lcn::END_OF_ATTR, 0));
        } else {
            out.push(Extent::new(vcn, Lcn::END_OF_ATTR, 0));
        }
    } else {
        out.push(Extent::new(vcn, Lcn::NOT_MAPPED, 0));
    }

    Runlist::from_extents(out)
}

/// Encode `[first_vcn, last_vcn]` of a runlist as mapping pairs.
///
/// `last_vcn` of `None` encodes through the end of the runlist. The
/// destination always receives a terminating zero byte; when it cannot hold
/// the next full record the build stops early with `stop_vcn` marking the
/// resume point.
///
/// Runs must be real or (with `sparse_ok`) sparse; encoding an unmapped run
/// is a caller error.
pub fn encode(
    rl: &Runlist,
    first_vcn: Vcn,
    last_vcn: Option<Vcn>,
    dst: &mut [u8],
    sparse_ok: bool,
) -> Result<MappingBuild> {
    let runs = encode_span(rl, first_vcn, last_vcn)?;

    if dst.is_empty() {
        return Err(NtxError::InvalidArgument("empty mapping pairs buffer"));
    }
    // The final zero header is always written; budget for it up front.
    let cap = dst.len() - 1;

    let mut written = 0_usize;
    let mut stop_vcn = first_vcn;
    let mut prev_lcn = 0_i64;

    for (run_vcn, run_lcn, run_len) in runs {
        let record = match run_lcn.kind() {
            LcnKind::Real => {
                let delta = run_lcn.0 - prev_lcn;
                Some((signed_width(run_len), signed_width(delta), delta))
            }
            LcnKind::Hole => {
                if !sparse_ok {
                    return Err(NtxError::InvalidArgument(
                        "sparse run not encodable on this format",
                    ));
                }
                Some((signed_width(run_len), 0, 0))
            }
            _ => None,
        };
        let Some((len_w, delta_w, delta)) = record else {
            return Err(NtxError::InvalidArgument("cannot encode unmapped run"));
        };

        if written + 1 + len_w + delta_w > cap {
            break;
        }

        #[expect(clippy::cast_possible_truncation)] // both widths are <= 8
        let header = ((delta_w as u8) << 4) | (len_w as u8);
        dst[written] = header;
        written += 1;
        write_signed_le(&mut dst[written..], run_len, len_w);
        written += len_w;
        if delta_w > 0 {
            write_signed_le(&mut dst[written..], delta, delta_w);
            written += delta_w;
            prev_lcn = run_lcn.0;
        }
        stop_vcn = Vcn(run_vcn + run_len);
    }

    dst[written] = 0;
    written += 1;
    Ok(MappingBuild { written, stop_vcn })
}

/// Compute the encoded size of `[first_vcn, last_vcn]`, including the
/// terminating zero byte. Used to size attribute records before building.
pub fn encoded_size(rl: &Runlist, first_vcn: Vcn, last_vcn: Option<Vcn>) -> Result<usize> {
    let runs = encode_span(rl, first_vcn, last_vcn)?;
    let mut size = 1_usize; // terminating zero header
    let mut prev_lcn = 0_i64;
    for (_, run_lcn, run_len) in runs {
        size += 1 + signed_width(run_len);
        match run_lcn.kind() {
            LcnKind::Real => {
                size += signed_width(run_lcn.0 - prev_lcn);
                prev_lcn = run_lcn.0;
            }
            LcnKind::Hole => {}
            _ => return Err(NtxError::InvalidArgument("cannot encode unmapped run")),
        }
    }
    Ok(size)
}

/// Collect the (vcn, lcn, length) triples covering `[first_vcn, last_vcn]`,
/// clamping the first and last runs to the span.
fn encode_span(
    rl: &Runlist,
    first_vcn: Vcn,
    last_vcn: Option<Vcn>,
) -> Result<Vec<(i64, Lcn, i64)>> {
    if first_vcn.0 < 0 {
        return Err(NtxError::InvalidArgument("negative first_vcn"));
    }
    let extents = rl.extents();
    let Some((term, data)) = extents.split_last() else {
        return Err(NtxError::InvalidArgument("cannot encode empty runlist"));
    };
    let end = last_vcn.map_or(term.vcn.0, |v| v.0 + 1);
    if end < first_vcn.0 || end > term.vcn.0 {
        return Err(NtxError::InvalidArgument("encode span out of range"));
    }

    let mut runs = Vec::new();
    for e in data {
        if e.end() <= first_vcn.0 {
            continue;
        }
        if e.vcn.0 >= end {
            break;
        }
        let from = e.vcn.0.max(first_vcn.0);
        let to = e.end().min(end);
        let lcn = if e.is_real() {
            Lcn(e.lcn.0 + (from - e.vcn.0))
        } else {
            e.lcn
        };
        runs.push((from, lcn, to - from));
    }
    Ok(runs)
}

/// Minimal byte count whose sign-extended little-endian value equals `v`.
///
/// Covers the sign-correction case: when the natural sign extension of the
/// top kept byte disagrees with the true sign, one more byte is kept.
fn signed_width(v: i64) -> usize {
    for n in 1..8 {
        let shift = 64 - 8 * (n as u32);
        if (v << shift) >> shift == v {
            return n;
        }
    }
    8
}

fn write_signed_le(dst: &mut [u8], v: i64, width: usize) {
    let bytes = v.to_le_bytes();
    dst[..width].copy_from_slice(&bytes[..width]);
}

fn read_signed_le(bytes: &[u8], pos: usize, width: usize) -> Result<i64> {
    let Some(raw) = bytes.get(pos..pos + width) else {
        return Err(NtxError::corruption("mapping pair field truncated"));
    };
    let mut v = 0_u64;
    for (i, &b) in raw.iter().enumerate() {
        v |= u64::from(b) << (8 * i);
    }
    #[expect(clippy::cast_possible_truncation)] // width <= 8 checked by caller
    let shift = 64 - 8 * (width as u32);
    #[expect(clippy::cast_possible_wrap)]
    Ok(((v << shift) as i64) >> shift)
}

fn push_coalescing(out: &mut Vec<Extent>, e: Extent) {
    if let Some(last) = out.last_mut() {
        let contiguous_real =
            last.is_real() && e.is_real() && last.lcn.0 + last.length == e.lcn.0;
        let both_holes = last.is_hole() && e.is_hole();
        if (contiguous_real || both_holes) && last.end() == e.vcn.0 {
            last.length += e.length;
            return;
        }
    }
    out.push(e);
}
