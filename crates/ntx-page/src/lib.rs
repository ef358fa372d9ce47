#![forbid(unsafe_code)]
//! Page-granular I/O primitive.
//!
//! The bitmap attribute and compressed data are accessed one page at a time
//! through [`PageStore`]. A read may block while the underlying page is
//! paged in; a call either completes or returns a definite error — there is
//! no cancellation at this layer.
//!
//! [`MemPageStore`] is the in-memory implementation used by unit and
//! integration tests; [`FaultPageStore`] wraps another store and fails
//! selected pages, for exercising mid-run rollback paths.

use ntx_error::{NtxError, Result};
use ntx_types::PAGE_SIZE;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Owned page buffer.
///
/// Invariant: length == `PAGE_SIZE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBuf {
    bytes: Vec<u8>,
}

impl PageBuf {
    /// Wrap a page-sized buffer.
    ///
    /// Returns `InvalidArgument` when `bytes` is not exactly one page.
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != PAGE_SIZE {
            return Err(NtxError::InvalidArgument("page buffer must be PAGE_SIZE"));
        }
        Ok(Self { bytes })
    }

    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            bytes: vec![0_u8; PAGE_SIZE],
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Page-addressed I/O interface.
///
/// Mapping a page yields an owned copy; modifications are made visible by
/// writing the page back. Implementations must be safe for concurrent use —
/// callers serialize logically-related accesses with their own locks (the
/// bitmap path holds the volume lock across every read-modify-write).
pub trait PageStore: Send + Sync {
    /// Read page `index`. Blocks until the page is available.
    fn read_page(&self, index: u64) -> Result<PageBuf>;

    /// Write page `index`. `data.len()` MUST equal `PAGE_SIZE`.
    fn write_page(&self, index: u64, data: &[u8]) -> Result<()>;

    /// Total number of pages backing this store.
    fn page_count(&self) -> u64;
}

/// In-memory page store over a contiguous byte buffer.
#[derive(Debug)]
pub struct MemPageStore {
    bytes: Mutex<Vec<u8>>,
    page_count: u64,
}

impl MemPageStore {
    /// Create a zero-filled store with `page_count` pages.
    #[must_use]
    pub fn new(page_count: u64) -> Self {
        let len = usize::try_from(page_count).unwrap_or(usize::MAX) * PAGE_SIZE;
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
            page_count,
        }
    }

    /// Create a store from existing contents, padding the last page with
    /// zeroes when `bytes` is not page-aligned.
    #[must_use]
    pub fn from_bytes(mut bytes: Vec<u8>) -> Self {
        let padded = bytes.len().div_ceil(PAGE_SIZE) * PAGE_SIZE;
        bytes.resize(padded, 0);
        let page_count = (bytes.len() / PAGE_SIZE) as u64;
        Self {
            bytes: Mutex::new(bytes),
            page_count,
        }
    }

    /// Snapshot the full contents (test helper).
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl PageStore for MemPageStore {
    fn read_page(&self, index: u64) -> Result<PageBuf> {
        if index >= self.page_count {
            return Err(NtxError::InvalidArgument("page index out of range"));
        }
        let bytes = self.bytes.lock();
        let start = usize::try_from(index).map_err(|_| NtxError::NoMemory)? * PAGE_SIZE;
        PageBuf::new(bytes[start..start + PAGE_SIZE].to_vec())
    }

    fn write_page(&self, index: u64, data: &[u8]) -> Result<()> {
        if index >= self.page_count {
            return Err(NtxError::InvalidArgument("page index out of range"));
        }
        if data.len() != PAGE_SIZE {
            return Err(NtxError::InvalidArgument("write_page data must be PAGE_SIZE"));
        }
        let mut bytes = self.bytes.lock();
        let start = usize::try_from(index).map_err(|_| NtxError::NoMemory)? * PAGE_SIZE;
        bytes[start..start + PAGE_SIZE].copy_from_slice(data);
        Ok(())
    }

    fn page_count(&self) -> u64 {
        self.page_count
    }
}

/// Wrapper that fails configured pages, or all writes after a countdown.
///
/// Test-support type for exercising partial-failure rollback: a run editor
/// that has already modified earlier pages must restore them when a later
/// page fails to map.
#[derive(Debug)]
pub struct FaultPageStore<S> {
    inner: S,
    fail_reads: HashSet<u64>,
    fail_writes: HashSet<u64>,
    writes_until_failure: Option<AtomicU64>,
}

impl<S: PageStore> FaultPageStore<S> {
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_reads: HashSet::new(),
            fail_writes: HashSet::new(),
            writes_until_failure: None,
        }
    }

    /// Fail every read of page `index`.
    #[must_use]
    pub fn fail_read(mut self, index: u64) -> Self {
        self.fail_reads.insert(index);
        self
    }

    /// Fail every write of page `index`.
    #[must_use]
    pub fn fail_write(mut self, index: u64) -> Self {
        self.fail_writes.insert(index);
        self
    }

    /// Allow `n` successful writes, then fail every subsequent one.
    #[must_use]
    pub fn fail_after_writes(mut self, n: u64) -> Self {
        self.writes_until_failure = Some(AtomicU64::new(n));
        self
    }

    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: PageStore> PageStore for FaultPageStore<S> {
    fn read_page(&self, index: u64) -> Result<PageBuf> {
        if self.fail_reads.contains(&index) {
            return Err(NtxError::Io(std::io::Error::other("injected read fault")));
        }
        self.inner.read_page(index)
    }

    fn write_page(&self, index: u64, data: &[u8]) -> Result<()> {
        if self.fail_writes.contains(&index) {
            return Err(NtxError::Io(std::io::Error::other("injected write fault")));
        }
        if let Some(countdown) = &self.writes_until_failure {
            // fetch_update returns Err once the budget is exhausted.
            let spent = countdown
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_err();
            if spent {
                return Err(NtxError::Io(std::io::Error::other("injected write fault")));
            }
        }
        self.inner.write_page(index, data)
    }

    fn page_count(&self) -> u64 {
        self.inner.page_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_store_round_trip() {
        let store = MemPageStore::new(4);
        assert_eq!(store.page_count(), 4);

        let mut page = store.read_page(2).expect("read");
        assert!(page.as_slice().iter().all(|&b| b == 0));

        page.as_mut_slice()[0] = 0xAB;
        page.as_mut_slice()[PAGE_SIZE - 1] = 0xCD;
        store.write_page(2, page.as_slice()).expect("write");

        let back = store.read_page(2).expect("reread");
        assert_eq!(back.as_slice()[0], 0xAB);
        assert_eq!(back.as_slice()[PAGE_SIZE - 1], 0xCD);
    }

    #[test]
    fn mem_store_bounds() {
        let store = MemPageStore::new(1);
        assert!(store.read_page(1).is_err());
        assert!(store.write_page(1, &[0_u8; PAGE_SIZE]).is_err());
        assert!(store.write_page(0, &[0_u8; 3]).is_err());
    }

    #[test]
    fn from_bytes_pads_to_page() {
        let store = MemPageStore::from_bytes(vec![0xFF; PAGE_SIZE + 10]);
        assert_eq!(store.page_count(), 2);
        let tail = store.read_page(1).expect("page 1");
        assert_eq!(tail.as_slice()[9], 0xFF);
        assert_eq!(tail.as_slice()[10], 0x00);
    }

    #[test]
    fn fault_store_fails_selected_pages() {
        let store = FaultPageStore::new(MemPageStore::new(4))
            .fail_read(1)
            .fail_write(2);
        assert!(store.read_page(0).is_ok());
        assert!(store.read_page(1).is_err());
        assert!(store.write_page(2, &[0_u8; PAGE_SIZE]).is_err());
        assert!(store.write_page(3, &[0_u8; PAGE_SIZE]).is_ok());
    }

    #[test]
    fn fault_store_write_countdown() {
        let store = FaultPageStore::new(MemPageStore::new(4)).fail_after_writes(2);
        let page = [0_u8; PAGE_SIZE];
        assert!(store.write_page(0, &page).is_ok());
        assert!(store.write_page(1, &page).is_ok());
        assert!(store.write_page(2, &page).is_err());
        assert!(store.write_page(3, &page).is_err());
    }
}
