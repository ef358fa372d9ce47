#![forbid(unsafe_code)]
//! Zone-aware cluster allocation over the volume bitmap.
//!
//! The volume's clusters are split into three disjoint zones: the MFT zone
//! `[mft_zone_start, mft_zone_end)` reserved for Master File Table growth,
//! Data-zone-1 `[mft_zone_end, nr_clusters)` and Data-zone-2
//! `[0, mft_zone_start)`. Each zone keeps a persistent cursor so successive
//! allocations favor forward locality. A `DATA_ZONE` request searches
//! Data-zone-1 then Data-zone-2; only when both are exhausted is the MFT
//! zone halved to release clusters for data.
//!
//! Every bitmap touch mutates state, so the volume lock is always taken
//! exclusive. When a caller needs an inode's runlist lock as well, it must
//! take the runlist lock first; [`lock_runlist_then_volume`] acquires both
//! in that fixed order.

pub mod bitmap;

use crate::bitmap::{bitmap_get, bitmap_put, count_free_bits, set_bits_checked, BITS_PER_PAGE};
use ntx_error::{NtxError, Result};
use ntx_page::PageStore;
use ntx_runlist::{Extent, Runlist};
use ntx_types::{Lcn, LcnKind, NeedsCheck, Vcn};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Which zones an allocation request may draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocZone {
    /// Search only the reserved MFT zone.
    MftZone,
    /// Search Data-zone-1 then Data-zone-2, skipping the MFT zone.
    DataZone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ZoneId {
    Mft,
    Data1,
    Data2,
}

/// Mutable volume-wide allocation state. Guarded by the volume bitmap lock.
#[derive(Debug)]
pub struct VolumeState {
    free_clusters: i64,
    mft_zone_start: i64,
    mft_zone_end: i64,
    mft_zone_pos: i64,
    data1_zone_pos: i64,
    data2_zone_pos: i64,
}

impl VolumeState {
    #[must_use]
    pub fn free_clusters(&self) -> i64 {
        self.free_clusters
    }

    /// Current MFT zone bounds `[start, end)`. The end moves down when the
    /// zone is halved under data-zone pressure.
    #[must_use]
    pub fn mft_zone(&self) -> (i64, i64) {
        (self.mft_zone_start, self.mft_zone_end)
    }
}

/// One mounted volume's allocation view: the cluster bitmap pages, the zone
/// state, and the persistent needs-check flag.
pub struct Volume {
    store: Arc<dyn PageStore>,
    nr_clusters: i64,
    needs_check: NeedsCheck,
    state: RwLock<VolumeState>,
}

impl Volume {
    /// Open a volume over `store`, whose pages back the cluster bitmap.
    ///
    /// The free-cluster counter is computed by scanning the first
    /// `nr_clusters` bits. Bits past `nr_clusters` in the final page are
    /// never touched or counted.
    pub fn new(
        store: Arc<dyn PageStore>,
        nr_clusters: i64,
        mft_zone_start: i64,
        mft_zone_end: i64,
    ) -> Result<Self> {
        if nr_clusters <= 0 {
            return Err(NtxError::InvalidArgument("volume has no clusters"));
        }
        if mft_zone_start < 0 || mft_zone_start > mft_zone_end || mft_zone_end > nr_clusters {
            return Err(NtxError::InvalidArgument("mft zone outside volume"));
        }
        let nr_bits =
            u64::try_from(nr_clusters).map_err(|_| NtxError::InvalidArgument("cluster count"))?;
        if store.page_count() * BITS_PER_PAGE < nr_bits {
            return Err(NtxError::InvalidArgument("bitmap smaller than volume"));
        }
        let free = count_free_bits(store.as_ref(), nr_bits)?;
        let free_clusters =
            i64::try_from(free).map_err(|_| NtxError::InvalidArgument("free count"))?;
        Ok(Self {
            store,
            nr_clusters,
            needs_check: NeedsCheck::new(),
            state: RwLock::new(VolumeState {
                free_clusters,
                mft_zone_start,
                mft_zone_end,
                mft_zone_pos: mft_zone_start,
                data1_zone_pos: mft_zone_end,
                data2_zone_pos: 0,
            }),
        })
    }

    #[must_use]
    pub fn nr_clusters(&self) -> i64 {
        self.nr_clusters
    }

    #[must_use]
    pub fn free_clusters(&self) -> i64 {
        self.state.read().free_clusters
    }

    /// Current MFT zone bounds `[start, end)`.
    #[must_use]
    pub fn mft_zone(&self) -> (i64, i64) {
        self.state.read().mft_zone()
    }

    /// Persistent consistency flag, set on corruption or failed rollback.
    #[must_use]
    pub fn needs_check(&self) -> &NeedsCheck {
        &self.needs_check
    }

    /// Allocate `count` clusters, taking the volume lock internally.
    ///
    /// See [`Volume::allocate_locked`].
    pub fn allocate(
        &self,
        start_vcn: Vcn,
        count: i64,
        start_lcn_hint: Option<Lcn>,
        zone: AllocZone,
        is_extension: bool,
    ) -> Result<Runlist> {
        let mut st = self.state.write();
        self.allocate_locked(&mut st, start_vcn, count, start_lcn_hint, zone, is_extension)
    }

    /// Allocate `count` clusters from `zone`, returning a runlist fragment
    /// whose first extent starts at `start_vcn` and whose terminator is
    /// `NOT_MAPPED` (ready to merge into the attribute's runlist).
    ///
    /// The scan prefers contiguity with `start_lcn_hint` when the hint lies
    /// inside the searched zone, falling back to the zone's cursor. Each
    /// zone is swept in two passes, cursor to end then start to cursor.
    /// Found bits are marked allocated page by page as the scan goes, so a
    /// crash mid-request cannot hand the same cluster out twice; on any
    /// failure the clusters this call already marked are freed again before
    /// the error is returned.
    ///
    /// A fresh allocation (`is_extension == false`) must start at vcn 0; an
    /// extension continues at the attribute's current end.
    pub fn allocate_locked(
        &self,
        st: &mut VolumeState,
        start_vcn: Vcn,
        count: i64,
        start_lcn_hint: Option<Lcn>,
        zone: AllocZone,
        is_extension: bool,
    ) -> Result<Runlist> {
        if count <= 0 {
            return Err(NtxError::InvalidArgument("allocation count must be positive"));
        }
        if start_vcn.0 < 0 {
            return Err(NtxError::InvalidArgument("negative start vcn"));
        }
        if !is_extension && start_vcn.0 != 0 {
            return Err(NtxError::InvalidArgument("fresh allocation must start at vcn 0"));
        }

        let order: &[ZoneId] = match zone {
            AllocZone::MftZone => &[ZoneId::Mft],
            AllocZone::DataZone => &[ZoneId::Data1, ZoneId::Data2],
        };

        let mut acc: Vec<Extent> = Vec::new();
        let mut next_vcn = start_vcn.0;
        let mut allocated = 0_i64;

        let outcome = self.search_zones(
            st,
            order,
            start_lcn_hint,
            zone,
            count,
            &mut allocated,
            &mut next_vcn,
            &mut acc,
        );

        if let Err(err) = outcome {
            self.rollback_allocation(&acc);
            return Err(err);
        }

        st.free_clusters -= count;
        debug!(
            start_vcn = start_vcn.0,
            count,
            extents = acc.len(),
            free = st.free_clusters,
            "allocated cluster run"
        );

        acc.push(Extent::new(next_vcn, Lcn::NOT_MAPPED, 0));
        Runlist::from_extents(acc)
    }

    #[expect(clippy::too_many_arguments)]
    fn search_zones(
        &self,
        st: &mut VolumeState,
        order: &[ZoneId],
        hint: Option<Lcn>,
        zone: AllocZone,
        count: i64,
        allocated: &mut i64,
        next_vcn: &mut i64,
        acc: &mut Vec<Extent>,
    ) -> Result<()> {
        loop {
            for &z in order {
                if *allocated >= count {
                    break;
                }
                let (zs, ze) = self.zone_bounds(st, z);
                if zs >= ze {
                    continue;
                }
                let cursor = Self::zone_cursor(st, z);
                let mut begin = if (zs..ze).contains(&cursor) { cursor } else { zs };
                if let Some(h) = hint {
                    if (zs..ze).contains(&h.0) {
                        begin = h.0;
                    }
                }

                let before = *allocated;
                *allocated += self.scan_range(begin, ze, count - *allocated, next_vcn, acc)?;
                if *allocated < count && begin > zs {
                    *allocated += self.scan_range(zs, begin, count - *allocated, next_vcn, acc)?;
                }
                if *allocated > before {
                    // Resume the next scan after the last cluster handed out.
                    if let Some(last) = acc.last() {
                        let mut pos = last.lcn.0 + last.length;
                        if pos >= ze {
                            pos = zs;
                        }
                        Self::set_zone_cursor(st, z, pos);
                    }
                }
            }

            if *allocated >= count {
                return Ok(());
            }

            match zone {
                AllocZone::MftZone => return Err(NtxError::NoSpace),
                AllocZone::DataZone => {
                    let span = st.mft_zone_end - st.mft_zone_start;
                    if span <= 0 {
                        return Err(NtxError::NoSpace);
                    }
                    let new_end = st.mft_zone_start + span / 2;
                    debug!(
                        old_end = st.mft_zone_end,
                        new_end, "data zones exhausted, halving mft zone"
                    );
                    st.mft_zone_end = new_end;
                    // Scan the released range first on the retry.
                    st.data1_zone_pos = new_end;
                    if st.mft_zone_pos >= new_end {
                        st.mft_zone_pos = st.mft_zone_start;
                    }
                }
            }
        }
    }

    /// Scan bitmap bits in `[from, to)`, marking up to `need` free clusters
    /// allocated and appending them to `acc` as coalesced extents.
    ///
    /// Pages are written back one at a time; a page whose write fails
    /// contributes nothing to `acc`, so the caller's rollback covers exactly
    /// the bits that reached the store.
    fn scan_range(
        &self,
        from: i64,
        to: i64,
        need: i64,
        next_vcn: &mut i64,
        acc: &mut Vec<Extent>,
    ) -> Result<i64> {
        let from_u = u64::try_from(from).map_err(|_| NtxError::InvalidArgument("scan start"))?;
        let to_u = u64::try_from(to).map_err(|_| NtxError::InvalidArgument("scan end"))?;

        let mut found = 0_i64;
        let mut bit = from_u;
        while bit < to_u && found < need {
            let page = bit / BITS_PER_PAGE;
            let page_base = page * BITS_PER_PAGE;
            let upto = to_u.min(page_base + BITS_PER_PAGE);

            let mut buf = self.store.read_page(page)?;
            let bytes = buf.as_mut_slice();
            let mut pending: Vec<(u64, i64)> = Vec::new();
            let mut pend_total = 0_i64;

            let mut local = page_offset(bit - page_base);
            let local_end = page_offset(upto - page_base);
            while local < local_end && found + pend_total < need {
                if local % 8 == 0 && local + 8 <= local_end && bytes[local / 8] == 0xFF {
                    // Fully allocated byte, skip in bulk.
                    local += 8;
                    continue;
                }
                if !bitmap_get(bytes, local) {
                    bitmap_put(bytes, local, true);
                    let lcn = page_base + local as u64;
                    match pending.last_mut() {
                        Some((start, len)) if *start + len_u64(*len) == lcn => *len += 1,
                        _ => pending.push((lcn, 1)),
                    }
                    pend_total += 1;
                }
                local += 1;
            }

            if !pending.is_empty() {
                self.store.write_page(page, buf.as_slice())?;
                for (lcn, len) in pending {
                    let lcn = i64::try_from(lcn)
                        .map_err(|_| NtxError::InvalidArgument("lcn out of range"))?;
                    push_run(acc, next_vcn, lcn, len);
                    found += len;
                }
            }
            bit = upto;
        }
        Ok(found)
    }

    /// Clear every cluster `acc` marked during a failed allocation. Failure
    /// here is never escalated: it is logged, the volume is flagged for a
    /// check, and the walk continues.
    fn rollback_allocation(&self, acc: &[Extent]) {
        if acc.is_empty() {
            return;
        }
        for e in acc {
            let Ok(start) = u64::try_from(e.lcn.0) else {
                continue;
            };
            if let Err((err, _)) = set_bits_checked(self.store.as_ref(), start, len_u64(e.length), false)
            {
                error!(lcn = e.lcn.0, length = e.length, %err, "allocation rollback failed");
                self.needs_check.set();
            }
        }
        warn!(extents = acc.len(), "allocation unwound");
    }

    /// Free up to `count` clusters of `rl` starting at `start_vcn`, taking
    /// the volume lock internally. See [`Volume::free_locked`].
    pub fn free(&self, rl: &Runlist, start_vcn: Vcn, count: i64) -> Result<i64> {
        let mut st = self.state.write();
        self.free_locked(&mut st, rl, start_vcn, count)
    }

    /// Walk `rl` from `start_vcn`, clearing bitmap bits for every real run
    /// and returning the number of clusters actually freed.
    ///
    /// Hole and unmapped runs are skipped. A run with an invalid lcn is
    /// logged and flags the volume for a check, but the walk continues so
    /// the remaining valid runs are still reclaimed. The free-cluster
    /// counter is capped at the volume size as a consistency guard.
    pub fn free_locked(
        &self,
        st: &mut VolumeState,
        rl: &Runlist,
        start_vcn: Vcn,
        count: i64,
    ) -> Result<i64> {
        if count < 0 {
            return Err(NtxError::InvalidArgument("negative free count"));
        }
        if count == 0 {
            return Ok(0);
        }
        let exts = rl.extents();
        let Some(first) = exts.iter().position(|e| e.contains(start_vcn)) else {
            return Err(NtxError::NotFound);
        };

        let mut remaining = count;
        let mut nr_freed = 0_i64;
        for (i, e) in exts[first..].iter().enumerate() {
            if remaining <= 0 || e.length == 0 {
                break;
            }
            let off = if i == 0 { start_vcn.0 - e.vcn.0 } else { 0 };
            let take = (e.length - off).min(remaining);
            match e.lcn.kind() {
                LcnKind::Real => {
                    let start = u64::try_from(e.lcn.0 + off)
                        .map_err(|_| NtxError::InvalidArgument("lcn out of range"))?;
                    bitmap::set_bits_in_run(self.store.as_ref(), start, len_u64(take), false)?;
                    nr_freed += take;
                    st.free_clusters = (st.free_clusters + take).min(self.nr_clusters);
                }
                LcnKind::Hole | LcnKind::NotMapped => {}
                _ => {
                    warn!(
                        vcn = e.vcn.0,
                        lcn = e.lcn.0,
                        "invalid lcn in free walk, continuing"
                    );
                    self.needs_check.set();
                }
            }
            remaining -= take;
        }
        debug!(
            start_vcn = start_vcn.0,
            count, nr_freed, "freed cluster run"
        );
        Ok(nr_freed)
    }

    fn zone_bounds(&self, st: &VolumeState, z: ZoneId) -> (i64, i64) {
        match z {
            ZoneId::Mft => (st.mft_zone_start, st.mft_zone_end),
            ZoneId::Data1 => (st.mft_zone_end, self.nr_clusters),
            ZoneId::Data2 => (0, st.mft_zone_start),
        }
    }

    fn zone_cursor(st: &VolumeState, z: ZoneId) -> i64 {
        match z {
            ZoneId::Mft => st.mft_zone_pos,
            ZoneId::Data1 => st.data1_zone_pos,
            ZoneId::Data2 => st.data2_zone_pos,
        }
    }

    fn set_zone_cursor(st: &mut VolumeState, z: ZoneId, pos: i64) {
        match z {
            ZoneId::Mft => st.mft_zone_pos = pos,
            ZoneId::Data1 => st.data1_zone_pos = pos,
            ZoneId::Data2 => st.data2_zone_pos = pos,
        }
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("nr_clusters", &self.nr_clusters)
            .field("needs_check", &self.needs_check.is_set())
            .finish_non_exhaustive()
    }
}

/// Acquire an inode's runlist lock and the volume bitmap lock in the fixed
/// order the rest of the system relies on: runlist first. Callers needing
/// both locks must go through this helper rather than taking them at the
/// call site.
pub fn lock_runlist_then_volume<'a>(
    runlist: &'a RwLock<Runlist>,
    volume: &'a Volume,
) -> (RwLockWriteGuard<'a, Runlist>, RwLockWriteGuard<'a, VolumeState>) {
    let rl = runlist.write();
    let st = volume.state.write();
    (rl, st)
}

/// In-page bit offsets are below `BITS_PER_PAGE` and always fit usize.
fn page_offset(bits: u64) -> usize {
    usize::try_from(bits).unwrap_or(usize::MAX)
}

/// Extent lengths are positive by construction.
fn len_u64(len: i64) -> u64 {
    u64::try_from(len).unwrap_or(0)
}

/// Append a found cluster run, extending the previous extent when the lcns
/// are contiguous.
fn push_run(acc: &mut Vec<Extent>, next_vcn: &mut i64, lcn: i64, len: i64) {
    if let Some(last) = acc.last_mut() {
        if last.lcn.0 + last.length == lcn {
            last.length += len;
            *next_vcn += len;
            return;
        }
    }
    acc.push(Extent::new(*next_vcn, Lcn(lcn), len));
    *next_vcn += len;
}
