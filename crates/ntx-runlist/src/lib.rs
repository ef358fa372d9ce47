#![forbid(unsafe_code)]
//! Runlist: the virtual-to-logical cluster mapping of a non-resident
//! attribute.
//!
//! A [`Runlist`] is an ordered sequence of [`Extent`]s, strictly increasing
//! and contiguous in vcn, terminated by a zero-length extent whose lcn is
//! `END_OF_ATTR` or `NOT_MAPPED`. It is owned exclusively by one inode and
//! protected by a per-inode `RwLock` held by the caller: shared for
//! [`Runlist::vcn_to_lcn`] / [`Runlist::find_vcn`], exclusive for
//! [`Runlist::merge`] / [`Runlist::truncate`] / [`Runlist::punch_hole`].
//!
//! Any reference into the backing storage obtained before a mutating call is
//! invalid afterwards: mutation may reallocate the storage.
//!
//! The [`mapping`] submodule holds the on-disk mapping-pairs codec.

pub mod mapping;

use ntx_error::{NtxError, Result};
use ntx_types::{Lcn, LcnKind, Vcn};
use serde::{Deserialize, Serialize};

/// One vcn-range-to-lcn-range mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub vcn: Vcn,
    pub lcn: Lcn,
    /// Run length in clusters. Zero only for the terminator.
    pub length: i64,
}

impl Extent {
    #[must_use]
    pub fn new(vcn: i64, lcn: Lcn, length: i64) -> Self {
        Self {
            vcn: Vcn(vcn),
            lcn,
            length,
        }
    }

    /// First vcn past this extent.
    #[must_use]
    pub fn end(&self) -> i64 {
        self.vcn.0 + self.length
    }

    #[must_use]
    pub fn contains(&self, vcn: Vcn) -> bool {
        vcn.0 >= self.vcn.0 && vcn.0 < self.end()
    }

    fn is_hole(&self) -> bool {
        self.lcn.kind() == LcnKind::Hole
    }

    fn is_real(&self) -> bool {
        self.lcn.is_real()
    }
}

/// Result of resolving a vcn through a runlist.
///
/// Negative lcn sentinels double as domain values and signals on disk; this
/// tagged union keeps resolved cluster numbers apart from the markers so
/// arithmetic can never operate on a sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The vcn maps to a real cluster; `run_remaining` is the number of
    /// contiguous clusters left in the run, counting this one.
    Mapped { lcn: Lcn, run_remaining: i64 },
    /// The vcn falls in a sparse run.
    Hole { run_remaining: i64 },
    /// The vcn exists on disk but its extent has not been decoded yet.
    Unmapped,
    /// The vcn is outside the attribute (before its first extent or past its
    /// end).
    EndOfAttribute,
}

/// The backing storage grows in fixed-size increments rather than doubling,
/// to bound wasted memory in a long-lived cache. One chunk is 4096 bytes of
/// extents.
const CHUNK_EXTENTS: usize = 4096 / std::mem::size_of::<Extent>();

/// Ordered, terminated extent sequence for one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Runlist {
    rl: Vec<Extent>,
}

impl Runlist {
    /// Create an empty runlist (attribute accessed but nothing decoded yet).
    #[must_use]
    pub fn new() -> Self {
        Self { rl: Vec::new() }
    }

    /// Build a runlist from extents, validating the structural invariants:
    /// contiguous strictly-increasing vcns, positive lengths, a single
    /// zero-length `END_OF_ATTR`/`NOT_MAPPED` terminator, no signal lcns.
    pub fn from_extents(extents: Vec<Extent>) -> Result<Self> {
        validate(&extents)?;
        Ok(Self { rl: extents })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rl.is_empty()
    }

    #[must_use]
    pub fn extents(&self) -> &[Extent] {
        &self.rl
    }

    /// Vcn of the terminator (one past the last covered cluster), or `None`
    /// for an empty runlist.
    #[must_use]
    pub fn end_vcn(&self) -> Option<Vcn> {
        self.rl.last().map(|e| e.vcn)
    }

    /// Scan for the extent containing `vcn`.
    ///
    /// Returns `None` when `vcn` precedes the first entry or lies at or past
    /// the terminator.
    #[must_use]
    pub fn find_vcn(&self, vcn: Vcn) -> Option<&Extent> {
        self.rl.iter().find(|e| e.contains(vcn))
    }

    /// Resolve `vcn` to a logical cluster number.
    #[must_use]
    pub fn vcn_to_lcn(&self, vcn: Vcn) -> Lookup {
        if vcn.0 < 0 {
            return Lookup::EndOfAttribute;
        }
        if self.rl.is_empty() {
            return Lookup::Unmapped;
        }
        if let Some(e) = self.find_vcn(vcn) {
            let run_remaining = e.end() - vcn.0;
            return match e.lcn.kind() {
                LcnKind::Real => Lookup::Mapped {
                    // In-range by validate(): lcn + length stays in i64.
                    lcn: Lcn(e.lcn.0 + (vcn.0 - e.vcn.0)),
                    run_remaining,
                },
                LcnKind::Hole => Lookup::Hole { run_remaining },
                _ => Lookup::Unmapped,
            };
        }
        // Not inside any run: before the first extent, or at/past the end.
        let first = self.rl[0].vcn;
        if vcn < first {
            return Lookup::EndOfAttribute;
        }
        match self.rl.last().map(|e| e.lcn.kind()) {
            Some(LcnKind::NotMapped) => Lookup::Unmapped,
            _ => Lookup::EndOfAttribute,
        }
    }

    /// Combine a freshly decoded fragment `src` into `self`.
    ///
    /// `src` must be a valid self-contained runlist that either starts after
    /// this runlist's last data extent or lies wholly within one
    /// unmapped/hole region. Overlap with a real extent is
    /// [`NtxError::Overlap`]; neither runlist is modified on error.
    ///
    /// An `END_OF_ATTR` marker in `src` that lands mid-list is absorbed into
    /// the surrounding hole/unmapped coverage rather than dropped: the
    /// remainder of the region keeps its original lcn classification.
    pub fn merge(&mut self, src: &Runlist) -> Result<()> {
        let Some((s_term, s_data)) = src.rl.split_last() else {
            return Ok(());
        };
        if s_data.is_empty() {
            // Terminator-only fragment: meaningful only for an empty dst.
            if self.rl.is_empty() {
                self.replace_contents(src.rl.clone())?;
            }
            return Ok(());
        }

        let s_start = s_data[0].vcn;
        let s_end = s_data[s_data.len() - 1].end();

        if self.rl.is_empty() {
            let mut out = Vec::new();
            if s_start.0 > 0 {
                out.push(Extent::new(0, Lcn::NOT_MAPPED, s_start.0));
            }
            out.extend_from_slice(s_data);
            out.push(*s_term);
            return self.replace_contents(out);
        }

        let d_end = self.rl[self.rl.len() - 1].vcn;
        if s_start >= d_end {
            return self.merge_beyond_end(s_data, *s_term, d_end);
        }
        self.merge_into_region(s_data, s_start, s_end)
    }

    /// Append `src` past the current terminator, inserting a `NOT_MAPPED`
    /// filler for any discontinuity.
    fn merge_beyond_end(&mut self, s_data: &[Extent], s_term: Extent, d_end: Vcn) -> Result<()> {
        let s_start = s_data[0].vcn;
        let extra = s_data.len() + 2;
        self.reserve_chunked(extra)?;

        self.rl.pop(); // old terminator
        if s_start > d_end {
            self.rl
                .push(Extent::new(d_end.0, Lcn::NOT_MAPPED, s_start.0 - d_end.0));
        }
        let junction = self.rl.len().saturating_sub(1);
        self.rl.extend_from_slice(s_data);
        self.rl.push(s_term);
        self.coalesce_at(junction);
        Ok(())
    }

    /// Merge `src` data into the single hole/unmapped region containing it.
    fn merge_into_region(&mut self, s_data: &[Extent], s_start: Vcn, s_end: i64) -> Result<()> {
        let di = self
            .rl
            .iter()
            .position(|e| e.contains(s_start))
            .ok_or(NtxError::Overlap { vcn: s_start.0 })?;
        let de = self.rl[di];
        match de.lcn.kind() {
            LcnKind::Hole | LcnKind::NotMapped => {}
            _ => return Err(NtxError::Overlap { vcn: s_start.0 }),
        }
        if s_end > de.end() {
            // src spills past the hole/unmapped region into mapped extents.
            return Err(NtxError::Overlap { vcn: de.end() });
        }

        let start = s_start == de.vcn;
        let finish = s_end == de.end();

        // The four shape operations differ only in which fragments of the
        // old region survive around the new data.
        let mut repl: Vec<Extent> = Vec::new();
        match (start, finish) {
            (true, true) => {
                // replace: src exactly fills the region.
                repl.extend_from_slice(s_data);
            }
            (true, false) => {
                // insert: the region shrinks and moves right.
                repl.extend_from_slice(s_data);
                repl.push(Extent::new(s_end, de.lcn, de.end() - s_end));
            }
            (false, true) => {
                // append: the region shrinks in place.
                repl.push(Extent::new(de.vcn.0, de.lcn, s_start.0 - de.vcn.0));
                repl.extend_from_slice(s_data);
            }
            (false, false) => {
                // split: the region divides around src.
                repl.push(Extent::new(de.vcn.0, de.lcn, s_start.0 - de.vcn.0));
                repl.extend_from_slice(s_data);
                repl.push(Extent::new(s_end, de.lcn, de.end() - s_end));
            }
        }

        let repl_len = repl.len();
        self.reserve_chunked(repl_len.saturating_sub(1))?;
        self.rl.splice(di..=di, repl);
        // Coalesce both boundaries; the right one first so `di` stays valid.
        self.coalesce_at(di + repl_len - 1);
        if di > 0 {
            self.coalesce_at(di - 1);
        }
        Ok(())
    }

    /// Shrink or grow the attribute to `new_length` clusters.
    ///
    /// Shrinking drops extents past the cut and shortens the one it lands
    /// in; growing extends a trailing hole or appends one. The terminator
    /// keeps its kind on growth and becomes `END_OF_ATTR` on shrink.
    pub fn truncate(&mut self, new_length: i64) -> Result<()> {
        if new_length < 0 {
            return Err(NtxError::InvalidArgument("negative truncate length"));
        }
        if self.rl.is_empty() {
            self.reserve_chunked(2)?;
            if new_length > 0 {
                self.rl.push(Extent::new(0, Lcn::HOLE, new_length));
            }
            self.rl.push(Extent::new(new_length, Lcn::END_OF_ATTR, 0));
            return Ok(());
        }

        let old_term = self.rl[self.rl.len() - 1];
        let old_end = old_term.vcn.0;
        if new_length == old_end {
            return Ok(());
        }

        if new_length < old_end {
            self.rl.retain(|e| e.vcn.0 < new_length);
            if let Some(last) = self.rl.last_mut() {
                if last.end() > new_length {
                    last.length = new_length - last.vcn.0;
                }
            }
            self.rl.push(Extent::new(new_length, Lcn::END_OF_ATTR, 0));
            self.shrink_if_oversized();
            return Ok(());
        }

        // Growing: extend a trailing hole, or append one.
        self.reserve_chunked(2)?;
        self.rl.pop();
        match self.rl.last_mut() {
            Some(last) if last.is_hole() => {
                last.length = new_length - last.vcn.0;
            }
            _ => {
                self.rl
                    .push(Extent::new(old_end, Lcn::HOLE, new_length - old_end));
            }
        }
        self.rl.push(Extent::new(new_length, old_term.lcn, 0));
        Ok(())
    }

    /// Convert `[start_vcn, start_vcn + length)` to an explicit hole.
    ///
    /// The range must be fully covered by real or sparse extents; a range
    /// touching unmapped or signal extents is `InvalidArgument`. The new
    /// hole merges with sparse neighbors on both sides.
    pub fn punch_hole(&mut self, start_vcn: Vcn, length: i64) -> Result<()> {
        if length < 0 || start_vcn.0 < 0 {
            return Err(NtxError::InvalidArgument("negative punch range"));
        }
        if length == 0 {
            return Ok(());
        }
        let end = start_vcn.0 + length;

        let mut i0 = self
            .rl
            .iter()
            .position(|e| e.contains(start_vcn))
            .ok_or(NtxError::InvalidArgument("punch range not mapped"))?;
        let mut i1 = i0;
        loop {
            let e = &self.rl[i1];
            match e.lcn.kind() {
                LcnKind::Real | LcnKind::Hole => {}
                _ => return Err(NtxError::InvalidArgument("punch range covers unmapped run")),
            }
            if end <= e.end() {
                break;
            }
            i1 += 1;
            if i1 >= self.rl.len() || self.rl[i1].length == 0 {
                return Err(NtxError::InvalidArgument("punch range past end of attribute"));
            }
        }

        let first = self.rl[i0];
        let last = self.rl[i1];

        let mut hole_start = start_vcn.0;
        let mut hole_end = end;
        let mut left: Option<Extent> = None;
        let mut right: Option<Extent> = None;

        if first.is_hole() {
            hole_start = first.vcn.0;
        } else if first.vcn.0 < hole_start {
            left = Some(Extent::new(first.vcn.0, first.lcn, hole_start - first.vcn.0));
        }
        if last.is_hole() {
            hole_end = last.end();
        } else if last.end() > hole_end {
            right = Some(Extent::new(
                hole_end,
                Lcn(last.lcn.0 + (hole_end - last.vcn.0)),
                last.end() - hole_end,
            ));
        }

        // Merge with already-sparse neighbors outside the punched range.
        if left.is_none() && i0 > 0 && self.rl[i0 - 1].is_hole() {
            i0 -= 1;
            hole_start = self.rl[i0].vcn.0;
        }
        if right.is_none() && i1 + 1 < self.rl.len() && self.rl[i1 + 1].is_hole() {
            i1 += 1;
            hole_end = self.rl[i1].end();
        }

        let mut repl: Vec<Extent> = Vec::new();
        if let Some(l) = left {
            repl.push(l);
        }
        repl.push(Extent::new(hole_start, Lcn::HOLE, hole_end - hole_start));
        if let Some(r) = right {
            repl.push(r);
        }

        self.reserve_chunked(repl.len().saturating_sub(i1 - i0 + 1))?;
        self.rl.splice(i0..=i1, repl);
        Ok(())
    }

    /// Merge `rl[idx]` into `rl[idx + 1]` when the pair is coalescible:
    /// both real and lcn-contiguous, or both holes, or both unmapped.
    /// Zero-length terminators never coalesce.
    fn coalesce_at(&mut self, idx: usize) {
        if idx + 1 >= self.rl.len() {
            return;
        }
        let (a, b) = (self.rl[idx], self.rl[idx + 1]);
        if a.length == 0 || b.length == 0 {
            return;
        }
        let mergeable = match (a.lcn.kind(), b.lcn.kind()) {
            (LcnKind::Real, LcnKind::Real) => a.lcn.0 + a.length == b.lcn.0,
            (LcnKind::Hole, LcnKind::Hole) | (LcnKind::NotMapped, LcnKind::NotMapped) => true,
            _ => false,
        };
        if mergeable {
            self.rl[idx].length += b.length;
            self.rl.remove(idx + 1);
        }
    }

    /// Grow capacity for `additional` extents, in fixed chunk increments.
    fn reserve_chunked(&mut self, additional: usize) -> Result<()> {
        let needed = self.rl.len() + additional;
        if needed <= self.rl.capacity() {
            return Ok(());
        }
        let target = needed.div_ceil(CHUNK_EXTENTS) * CHUNK_EXTENTS;
        self.rl
            .try_reserve_exact(target - self.rl.len())
            .map_err(|_| NtxError::NoMemory)
    }

    /// Opportunistically release surplus capacity after a shrink. Failure to
    /// shrink is not an error: the oversized buffer is kept.
    fn shrink_if_oversized(&mut self) {
        let target = self.rl.len().div_ceil(CHUNK_EXTENTS).max(1) * CHUNK_EXTENTS;
        if self.rl.capacity() > target {
            self.rl.shrink_to(target);
        }
    }

    fn replace_contents(&mut self, out: Vec<Extent>) -> Result<()> {
        let mut fresh = Vec::new();
        let target = out.len().div_ceil(CHUNK_EXTENTS).max(1) * CHUNK_EXTENTS;
        fresh.try_reserve_exact(target).map_err(|_| NtxError::NoMemory)?;
        fresh.extend(out);
        self.rl = fresh;
        // Decoded fragments may arrive uncoalesced at their seams.
        let mut i = 0;
        while i + 1 < self.rl.len() {
            let before = self.rl.len();
            self.coalesce_at(i);
            if self.rl.len() == before {
                i += 1;
            }
        }
        Ok(())
    }
}

/// Check the runlist structural invariants.
fn validate(extents: &[Extent]) -> Result<()> {
    let Some((term, data)) = extents.split_last() else {
        return Ok(());
    };
    if term.length != 0 {
        return Err(NtxError::InvalidArgument("runlist missing terminator"));
    }
    match term.lcn.kind() {
        LcnKind::EndOfAttr | LcnKind::NotMapped => {}
        _ => return Err(NtxError::InvalidArgument("invalid terminator lcn")),
    }
    let mut expected = data.first().map_or(term.vcn.0, |e| e.vcn.0);
    for e in data {
        if e.length <= 0 {
            return Err(NtxError::InvalidArgument("non-positive extent length"));
        }
        if e.vcn.0 != expected {
            return Err(NtxError::InvalidArgument("runlist vcns not contiguous"));
        }
        match e.lcn.kind() {
            LcnKind::Real | LcnKind::Hole | LcnKind::NotMapped => {}
            _ => return Err(NtxError::InvalidArgument("signal lcn in stored runlist")),
        }
        expected = e.end();
    }
    if term.vcn.0 != expected {
        return Err(NtxError::InvalidArgument("terminator vcn mismatch"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rl(extents: &[(i64, i64, i64)]) -> Runlist {
        let v = extents
            .iter()
            .map(|&(vcn, lcn, len)| Extent::new(vcn, Lcn(lcn), len))
            .collect();
        Runlist::from_extents(v).expect("valid runlist")
    }

    #[test]
    fn lookup_scenario_with_hole() {
        // {(0,100,10), (10,HOLE,5), (15,50,20)}
        let r = rl(&[(0, 100, 10), (10, -1, 5), (15, 50, 20), (35, -3, 0)]);

        assert_eq!(
            r.vcn_to_lcn(Vcn(12)),
            Lookup::Hole { run_remaining: 3 }
        );
        assert_eq!(
            r.vcn_to_lcn(Vcn(16)),
            Lookup::Mapped {
                lcn: Lcn(51),
                run_remaining: 19
            }
        );
        assert_eq!(
            r.vcn_to_lcn(Vcn(0)),
            Lookup::Mapped {
                lcn: Lcn(100),
                run_remaining: 10
            }
        );
        assert_eq!(r.vcn_to_lcn(Vcn(35)), Lookup::EndOfAttribute);
        assert_eq!(r.vcn_to_lcn(Vcn(-1)), Lookup::EndOfAttribute);
    }

    #[test]
    fn lookup_on_empty_runlist_is_unmapped() {
        let r = Runlist::new();
        assert_eq!(r.vcn_to_lcn(Vcn(0)), Lookup::Unmapped);
    }

    #[test]
    fn lookup_before_first_extent() {
        let r = rl(&[(10, 500, 5), (15, -3, 0)]);
        assert_eq!(r.vcn_to_lcn(Vcn(3)), Lookup::EndOfAttribute);
        assert!(r.find_vcn(Vcn(3)).is_none());
    }

    #[test]
    fn lookup_past_not_mapped_terminator() {
        let r = rl(&[(0, 500, 5), (5, -2, 0)]);
        assert_eq!(r.vcn_to_lcn(Vcn(9)), Lookup::Unmapped);
    }

    #[test]
    fn merge_into_empty_adopts_src() {
        let mut dst = Runlist::new();
        let src = rl(&[(0, 7, 4), (4, -3, 0)]);
        dst.merge(&src).expect("merge");
        assert_eq!(dst, src);
    }

    #[test]
    fn merge_into_empty_prefixes_unmapped_filler() {
        let mut dst = Runlist::new();
        let src = rl(&[(8, 7, 4), (12, -2, 0)]);
        dst.merge(&src).expect("merge");
        assert_eq!(
            dst.extents(),
            rl(&[(0, -2, 8), (8, 7, 4), (12, -2, 0)]).extents()
        );
    }

    #[test]
    fn merge_replace_fills_region_and_coalesces() {
        // Hole [4,8) exactly filled by a run contiguous with both neighbors.
        let mut dst = rl(&[(0, 100, 4), (4, -1, 4), (8, 108, 4), (12, -3, 0)]);
        let src = rl(&[(4, 104, 4), (8, -3, 0)]);
        dst.merge(&src).expect("merge");
        assert_eq!(dst.extents(), rl(&[(0, 100, 12), (12, -3, 0)]).extents());
    }

    #[test]
    fn merge_insert_shrinks_hole_rightward() {
        let mut dst = rl(&[(0, 100, 4), (4, -2, 8), (12, 300, 4), (16, -3, 0)]);
        let src = rl(&[(4, 200, 3), (7, -3, 0)]);
        dst.merge(&src).expect("merge");
        assert_eq!(
            dst.extents(),
            rl(&[(0, 100, 4), (4, 200, 3), (7, -2, 5), (12, 300, 4), (16, -3, 0)]).extents()
        );
    }

    #[test]
    fn merge_append_at_hole_end() {
        let mut dst = rl(&[(0, 100, 4), (4, -2, 8), (12, 300, 4), (16, -3, 0)]);
        let src = rl(&[(9, 200, 3), (12, -3, 0)]);
        dst.merge(&src).expect("merge");
        assert_eq!(
            dst.extents(),
            rl(&[(0, 100, 4), (4, -2, 5), (9, 200, 3), (12, 300, 4), (16, -3, 0)]).extents()
        );
    }

    #[test]
    fn merge_split_divides_hole() {
        let mut dst = rl(&[(0, 100, 4), (4, -2, 12), (16, 300, 4), (20, -3, 0)]);
        let src = rl(&[(8, 200, 3), (11, -3, 0)]);
        dst.merge(&src).expect("merge");
        assert_eq!(
            dst.extents(),
            rl(&[
                (0, 100, 4),
                (4, -2, 4),
                (8, 200, 3),
                (11, -2, 5),
                (16, 300, 4),
                (20, -3, 0)
            ])
            .extents()
        );
    }

    #[test]
    fn merge_beyond_end_with_gap_inserts_filler() {
        let mut dst = rl(&[(0, 100, 4), (4, -3, 0)]);
        let src = rl(&[(10, 200, 2), (12, -3, 0)]);
        dst.merge(&src).expect("merge");
        assert_eq!(
            dst.extents(),
            rl(&[(0, 100, 4), (4, -2, 6), (10, 200, 2), (12, -3, 0)]).extents()
        );
    }

    #[test]
    fn merge_beyond_end_contiguous_coalesces() {
        let mut dst = rl(&[(0, 100, 4), (4, -3, 0)]);
        let src = rl(&[(4, 104, 2), (6, -3, 0)]);
        dst.merge(&src).expect("merge");
        assert_eq!(dst.extents(), rl(&[(0, 100, 6), (6, -3, 0)]).extents());
    }

    #[test]
    fn merge_overlap_is_error_and_leaves_dst_unchanged() {
        let dst_orig = rl(&[(0, 100, 10), (10, -3, 0)]);
        let mut dst = dst_orig.clone();
        // Exact duplicate of an already-mapped region.
        let src = rl(&[(0, 100, 10), (10, -3, 0)]);
        let err = dst.merge(&src).expect_err("overlap");
        assert!(matches!(err, NtxError::Overlap { vcn: 0 }));
        assert_eq!(dst, dst_orig);
        // src also remains usable.
        assert_eq!(src.vcn_to_lcn(Vcn(0)), Lookup::Mapped { lcn: Lcn(100), run_remaining: 10 });
    }

    #[test]
    fn merge_spilling_past_region_is_error() {
        let dst_orig = rl(&[(0, 100, 4), (4, -2, 2), (6, 300, 4), (10, -3, 0)]);
        let mut dst = dst_orig.clone();
        let src = rl(&[(4, 200, 4), (8, -3, 0)]);
        let err = dst.merge(&src).expect_err("spill");
        assert!(matches!(err, NtxError::Overlap { .. }));
        assert_eq!(dst, dst_orig);
    }

    #[test]
    fn truncate_shrink_cuts_extent() {
        let mut r = rl(&[(0, 100, 10), (10, 300, 10), (20, -3, 0)]);
        r.truncate(15).expect("truncate");
        assert_eq!(
            r.extents(),
            rl(&[(0, 100, 10), (10, 300, 5), (15, -3, 0)]).extents()
        );
    }

    #[test]
    fn truncate_shrink_to_zero() {
        let mut r = rl(&[(0, 100, 10), (10, -3, 0)]);
        r.truncate(0).expect("truncate");
        assert_eq!(r.extents(), &[Extent::new(0, Lcn::END_OF_ATTR, 0)]);
    }

    #[test]
    fn truncate_grow_appends_hole() {
        let mut r = rl(&[(0, 100, 10), (10, -3, 0)]);
        r.truncate(16).expect("truncate");
        assert_eq!(
            r.extents(),
            rl(&[(0, 100, 10), (10, -1, 6), (16, -3, 0)]).extents()
        );
    }

    #[test]
    fn truncate_grow_extends_trailing_hole() {
        let mut r = rl(&[(0, 100, 10), (10, -1, 2), (12, -3, 0)]);
        r.truncate(20).expect("truncate");
        assert_eq!(
            r.extents(),
            rl(&[(0, 100, 10), (10, -1, 10), (20, -3, 0)]).extents()
        );
    }

    #[test]
    fn truncate_empty_runlist_grows_to_hole() {
        let mut r = Runlist::new();
        r.truncate(8).expect("truncate");
        assert_eq!(r.extents(), rl(&[(0, -1, 8), (8, -3, 0)]).extents());
    }

    #[test]
    fn punch_hole_interior_splits_run() {
        let mut r = rl(&[(0, 100, 10), (10, -3, 0)]);
        r.punch_hole(Vcn(3), 4).expect("punch");
        assert_eq!(
            r.extents(),
            rl(&[(0, 100, 3), (3, -1, 4), (7, 107, 3), (10, -3, 0)]).extents()
        );
    }

    #[test]
    fn punch_hole_run_start_aligned() {
        let mut r = rl(&[(0, 100, 10), (10, -3, 0)]);
        r.punch_hole(Vcn(0), 4).expect("punch");
        assert_eq!(
            r.extents(),
            rl(&[(0, -1, 4), (4, 104, 6), (10, -3, 0)]).extents()
        );
    }

    #[test]
    fn punch_hole_run_end_aligned_merges_right_neighbor() {
        let mut r = rl(&[(0, 100, 6), (6, -1, 4), (10, 200, 5), (15, -3, 0)]);
        r.punch_hole(Vcn(3), 3).expect("punch");
        assert_eq!(
            r.extents(),
            rl(&[(0, 100, 3), (3, -1, 7), (10, 200, 5), (15, -3, 0)]).extents()
        );
    }

    #[test]
    fn punch_hole_extends_existing_hole() {
        let mut r = rl(&[(0, -1, 4), (4, 100, 6), (10, -3, 0)]);
        r.punch_hole(Vcn(2), 5).expect("punch");
        assert_eq!(
            r.extents(),
            rl(&[(0, -1, 7), (7, 103, 3), (10, -3, 0)]).extents()
        );
    }

    #[test]
    fn punch_hole_spanning_multiple_runs() {
        let mut r = rl(&[(0, 100, 4), (4, 200, 4), (8, 300, 4), (12, -3, 0)]);
        r.punch_hole(Vcn(2), 8).expect("punch");
        assert_eq!(
            r.extents(),
            rl(&[(0, 100, 2), (2, -1, 8), (10, 302, 2), (12, -3, 0)]).extents()
        );
    }

    #[test]
    fn punch_hole_rejects_unmapped_range() {
        let orig = rl(&[(0, 100, 4), (4, -2, 4), (8, 300, 4), (12, -3, 0)]);
        let mut r = orig.clone();
        let err = r.punch_hole(Vcn(2), 8).expect_err("unmapped");
        assert!(matches!(err, NtxError::InvalidArgument(_)));
        assert_eq!(r, orig);
    }

    #[test]
    fn punch_hole_rejects_range_past_end() {
        let mut r = rl(&[(0, 100, 4), (4, -3, 0)]);
        assert!(r.punch_hole(Vcn(2), 10).is_err());
        assert!(r.punch_hole(Vcn(6), 1).is_err());
    }

    #[test]
    fn from_extents_rejects_broken_invariants() {
        // Gap between extents.
        assert!(Runlist::from_extents(vec![
            Extent::new(0, Lcn(5), 2),
            Extent::new(4, Lcn(9), 2),
            Extent::new(6, Lcn::END_OF_ATTR, 0),
        ])
        .is_err());
        // HOLE terminator.
        assert!(Runlist::from_extents(vec![
            Extent::new(0, Lcn(5), 2),
            Extent::new(2, Lcn::HOLE, 0),
        ])
        .is_err());
        // Signal lcn stored in the list.
        assert!(Runlist::from_extents(vec![
            Extent::new(0, Lcn::SIG_IO, 2),
            Extent::new(2, Lcn::END_OF_ATTR, 0),
        ])
        .is_err());
        // Missing terminator.
        assert!(Runlist::from_extents(vec![Extent::new(0, Lcn(5), 2)]).is_err());
    }
}
