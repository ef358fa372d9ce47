//! End-to-end allocation flows: extend an attribute's runlist with freshly
//! allocated clusters under the fixed lock order, then reclaim them.

use ntx_alloc::bitmap::{set_bits_in_run, BITS_PER_PAGE};
use ntx_alloc::{lock_runlist_then_volume, AllocZone, Volume};
use ntx_error::NtxError;
use ntx_page::{MemPageStore, PageStore};
use ntx_runlist::{Lookup, Runlist};
use ntx_types::{Lcn, Vcn};
use parking_lot::RwLock;
use std::sync::Arc;

fn small_volume() -> (Arc<MemPageStore>, Volume) {
    let store = Arc::new(MemPageStore::new(1));
    let vol = Volume::new(store.clone(), 8192, 1024, 2048).expect("volume");
    (store, vol)
}

#[test]
fn extend_attribute_under_lock_order() {
    let (_store, vol) = small_volume();
    let runlist = RwLock::new(Runlist::new());

    // First write to the attribute: allocate and merge while holding both
    // locks in runlist-then-volume order.
    {
        let (mut rl, mut st) = lock_runlist_then_volume(&runlist, &vol);
        let frag = vol
            .allocate_locked(&mut st, Vcn(0), 16, None, AllocZone::DataZone, false)
            .expect("allocate");
        rl.merge(&frag).expect("merge");
    }

    // Extend by another 8 clusters, hinting at the current tail for
    // contiguity.
    {
        let (mut rl, mut st) = lock_runlist_then_volume(&runlist, &vol);
        let end = rl.end_vcn().expect("non-empty").0;
        let hint = match rl.vcn_to_lcn(Vcn(end - 1)) {
            Lookup::Mapped { lcn, .. } => Some(Lcn(lcn.0 + 1)),
            _ => None,
        };
        let frag = vol
            .allocate_locked(&mut st, Vcn(end), 8, hint, AllocZone::DataZone, true)
            .expect("extend");
        rl.merge(&frag).expect("merge");
    }

    let rl = runlist.read();
    // Contiguous allocations coalesce into a single 24-cluster run.
    match rl.vcn_to_lcn(Vcn(0)) {
        Lookup::Mapped { run_remaining, .. } => assert_eq!(run_remaining, 24),
        other => panic!("expected mapped run, got {other:?}"),
    }
    assert_eq!(vol.free_clusters(), 8192 - 24);
}

#[test]
fn allocate_then_free_restores_volume_state() {
    let (store, vol) = small_volume();
    let before_bits = store.snapshot();
    let before_free = vol.free_clusters();

    let frag = vol
        .allocate(Vcn(0), 100, None, AllocZone::DataZone, false)
        .expect("allocate");
    assert_eq!(vol.free_clusters(), before_free - 100);

    let freed = vol.free(&frag, Vcn(0), 100).expect("free");
    assert_eq!(freed, 100);
    assert_eq!(vol.free_clusters(), before_free);
    assert_eq!(store.snapshot(), before_bits);
}

#[test]
fn mft_zone_exhaustion_does_not_spill_into_data() {
    let (store, vol) = small_volume();
    set_bits_in_run(store.as_ref(), 1024, 1024, true).expect("fill mft zone");

    let err = vol
        .allocate(Vcn(0), 1, None, AllocZone::MftZone, false)
        .expect_err("mft zone full");
    assert!(matches!(err, NtxError::NoSpace));

    // The same request against the data zones succeeds immediately.
    assert!(vol
        .allocate(Vcn(0), 1, None, AllocZone::DataZone, false)
        .is_ok());
}

#[test]
fn partial_free_leaves_remaining_clusters_allocated() {
    let (store, vol) = small_volume();
    let frag = vol
        .allocate(Vcn(0), 32, None, AllocZone::DataZone, false)
        .expect("allocate");
    let first_lcn = match frag.extents()[0].lcn {
        lcn if lcn.is_real() => u64::try_from(lcn.0).expect("real lcn"),
        other => panic!("unexpected lcn {other:?}"),
    };

    // Free the front half only.
    let freed = vol.free(&frag, Vcn(0), 16).expect("free");
    assert_eq!(freed, 16);

    let page = store.read_page(first_lcn / BITS_PER_PAGE).expect("page");
    let bytes = page.as_slice();
    for i in 0..32 {
        let bit = usize::try_from(first_lcn + i).expect("fits");
        let set = (bytes[bit / 8] >> (bit % 8)) & 1 == 1;
        assert_eq!(set, i >= 16, "cluster {i}");
    }
}
