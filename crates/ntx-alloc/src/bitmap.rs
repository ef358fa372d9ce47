//! Bit-run editing over the paged cluster bitmap.
//!
//! `set_bits_in_run` is the write primitive shared by allocation rollback
//! and cluster free: it sets or clears a contiguous run of bits, one
//! backing page at a time. Partial lead and tail bytes are edited
//! bit-by-bit; whole bytes are bulk-filled. When a page fails mid-run, the
//! bits already written by this call are restored with a recursive call of
//! the opposite value, and the original error is returned.

use ntx_error::Result;
use ntx_page::PageStore;
use ntx_types::PAGE_SIZE;
use tracing::{error, warn};

/// Bits held by one bitmap page.
pub const BITS_PER_PAGE: u64 = (PAGE_SIZE * 8) as u64;

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: usize) -> bool {
    (bitmap[idx / 8] >> (idx % 8)) & 1 == 1
}

/// Set or clear bit `idx` in a bitmap byte slice.
pub fn bitmap_put(bitmap: &mut [u8], idx: usize, value: bool) {
    if value {
        bitmap[idx / 8] |= 1 << (idx % 8);
    } else {
        bitmap[idx / 8] &= !(1 << (idx % 8));
    }
}

/// Count free (zero) bits in the first `count` bits of the store.
pub fn count_free_bits(store: &dyn PageStore, count: u64) -> Result<u64> {
    let mut free = 0_u64;
    let mut bit = 0_u64;
    while bit < count {
        let page = bit / BITS_PER_PAGE;
        let buf = store.read_page(page)?;
        let bytes = buf.as_slice();
        let upto = count.min((page + 1) * BITS_PER_PAGE);

        let mut local = usize::try_from(bit % BITS_PER_PAGE).unwrap_or(0);
        let local_end = usize::try_from(upto - page * BITS_PER_PAGE).unwrap_or(0);
        while local < local_end && local % 8 != 0 {
            free += u64::from(!bitmap_get(bytes, local));
            local += 1;
        }
        let whole_end = local_end - local_end % 8;
        while local < whole_end {
            free += u64::from(bytes[local / 8].count_zeros());
            local += 8;
        }
        while local < local_end {
            free += u64::from(!bitmap_get(bytes, local));
            local += 1;
        }
        bit = upto;
    }
    Ok(free)
}

/// Set (`value == true`) or clear a run of `count` bits starting at
/// `start_bit`.
///
/// Pages are read, modified, and written back one at a time. A failure on a
/// later page rolls back every bit this call already committed before
/// returning the original error; a failed rollback is logged distinctly and
/// reported through `rolled_back == false` so the caller can flag the
/// volume.
pub fn set_bits_in_run(store: &dyn PageStore, start_bit: u64, count: u64, value: bool) -> Result<()> {
    set_bits_inner(store, start_bit, count, value, true).map_err(|(err, _)| err)
}

/// As `set_bits_in_run`, but reports whether an error was fully rolled
/// back. The allocator uses this to decide when to set the volume's
/// needs-check flag.
pub(crate) fn set_bits_checked(
    store: &dyn PageStore,
    start_bit: u64,
    count: u64,
    value: bool,
) -> std::result::Result<(), (ntx_error::NtxError, bool)> {
    set_bits_inner(store, start_bit, count, value, true)
}

fn set_bits_inner(
    store: &dyn PageStore,
    start_bit: u64,
    count: u64,
    value: bool,
    allow_rollback: bool,
) -> std::result::Result<(), (ntx_error::NtxError, bool)> {
    if count == 0 {
        return Ok(());
    }

    let end = start_bit + count;
    let fill = if value { 0xFF_u8 } else { 0x00_u8 };
    let mut done = 0_u64;

    let mut bit = start_bit;
    while bit < end {
        let page = bit / BITS_PER_PAGE;
        let page_base = page * BITS_PER_PAGE;
        let upto = end.min(page_base + BITS_PER_PAGE);

        let outcome = store.read_page(page).and_then(|mut buf| {
            let bytes = buf.as_mut_slice();
            let mut local = usize::try_from(bit - page_base).unwrap_or(0);
            let local_end = usize::try_from(upto - page_base).unwrap_or(0);

            // Partial leading byte.
            while local < local_end && local % 8 != 0 {
                bitmap_put(bytes, local, value);
                local += 1;
            }
            // Whole bytes in bulk.
            let whole_end = local_end - local_end % 8;
            if local < whole_end {
                bytes[local / 8..whole_end / 8].fill(fill);
                local = whole_end;
            }
            // Partial trailing byte.
            while local < local_end {
                bitmap_put(bytes, local, value);
                local += 1;
            }
            store.write_page(page, buf.as_slice())
        });

        if let Err(err) = outcome {
            if done == 0 || !allow_rollback {
                return Err((err, true));
            }
            warn!(
                start_bit,
                count,
                done,
                value,
                %err,
                "bit run failed mid-way, rolling back"
            );
            // Restore already-committed bits with the inverse value. A
            // second-level failure is not rolled back again.
            if let Err((rb_err, _)) = set_bits_inner(store, start_bit, done, !value, false) {
                error!(start_bit, done, %rb_err, "bit run rollback failed");
                return Err((err, false));
            }
            return Err((err, true));
        }

        done += upto - bit;
        bit = upto;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntx_page::{FaultPageStore, MemPageStore};

    #[test]
    fn set_then_clear_restores_exact_contents() {
        let store = MemPageStore::new(2);
        // Pre-existing pattern around the run.
        set_bits_in_run(&store, 0, 3, true).expect("seed");
        set_bits_in_run(&store, 100, 1, true).expect("seed");
        let before = store.snapshot();

        // Straddles byte boundaries on both ends.
        set_bits_in_run(&store, 5, 70, true).expect("set");
        set_bits_in_run(&store, 5, 70, false).expect("clear");
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn run_straddling_page_boundary() {
        let store = MemPageStore::new(2);
        let start = BITS_PER_PAGE - 13;
        set_bits_in_run(&store, start, 30, true).expect("set");

        for idx in 0..(2 * BITS_PER_PAGE) {
            let page = store.read_page(idx / BITS_PER_PAGE).expect("page");
            let got = bitmap_get(
                page.as_slice(),
                usize::try_from(idx % BITS_PER_PAGE).expect("fits"),
            );
            let want = idx >= start && idx < start + 30;
            assert_eq!(got, want, "bit {idx}");
        }

        set_bits_in_run(&store, start, 30, false).expect("clear");
        assert!(store.snapshot().iter().all(|&b| b == 0));
    }

    #[test]
    fn whole_byte_bulk_fill() {
        let store = MemPageStore::new(1);
        set_bits_in_run(&store, 8, 32, true).expect("set");
        let snap = store.snapshot();
        assert_eq!(&snap[..6], &[0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]);
    }

    #[test]
    fn failed_second_page_rolls_back_first() {
        let store = FaultPageStore::new(MemPageStore::new(2)).fail_write(1);
        let start = BITS_PER_PAGE - 16;
        let err = set_bits_in_run(&store, start, 64, true).expect_err("page 1 faulted");
        assert!(matches!(err, ntx_error::NtxError::Io(_)));
        // Page 0's bits were committed, then restored.
        assert!(store.inner().snapshot().iter().all(|&b| b == 0));
    }

    #[test]
    fn count_free_bits_partial_tail() {
        let store = MemPageStore::new(1);
        set_bits_in_run(&store, 2, 5, true).expect("set");
        assert_eq!(count_free_bits(&store, 10).expect("count"), 5);
        assert_eq!(count_free_bits(&store, 7).expect("count"), 2);
    }
}
