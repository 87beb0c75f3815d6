//! # FastArray
//!
//! Variable-length record store over three parallel page streams, living in
//! sibling directories under one array directory:
//!
//! ```text
//! <array_dir>/
//! ├── index/   page-0.dat            # 8 bytes: head_index (u64 LE)
//! ├── meta/    page-0.dat, ...       # 32 KiB pages of 32-byte record slots
//! └── data/    page-0.dat, ...       # payload pages (default 128 MiB)
//! ```
//!
//! Record ids are u64s assigned in append order, modulo 2^64. Each id maps
//! to a fixed metadata slot (`id / 1024` names the meta page, `id % 1024`
//! the slot) recording where the payload landed; payloads are
//! bump-allocated within the current data page and never straddle pages — a
//! record that does not fit in the remainder starts at offset 0 of the next
//! page.
//!
//! ## Metadata slot layout (32 bytes, little-endian)
//!
//! ```text
//! 0..8    data_page_index   u64
//! 8..12   data_offset       u32
//! 12..16  data_length       u32
//! 16..24  timestamp_ms      u64   (enqueue wall clock, unix millis)
//! 24..32  reserved
//! ```
//!
//! ## Crash recovery
//!
//! `head_index` is persisted on every append and read back verbatim on open.
//! The append cursor is rebuilt from the slot of `head - 1`; the tail is
//! rebuilt by binary-searching the surviving slots (monotone in data page
//! index) for the first id whose data page file still exists. An append that
//! crashed before the head bump is simply invisible.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use eyre::{ensure, Result};
use parking_lot::Mutex;
use thiserror::Error;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::bits;
use crate::cache::unix_millis;
use crate::factory::MappedPageFactory;

/// Default data page size: 128 MiB.
pub const DEFAULT_DATA_PAGE_SIZE: usize = 1 << 27;
/// Smallest allowed data page size: 32 MiB.
pub const MINIMUM_DATA_PAGE_SIZE: usize = 1 << 25;

pub(crate) const META_PAGE_BITS: u32 = 15;
/// Metadata page size: 32 KiB.
pub(crate) const META_PAGE_SIZE: usize = 1 << META_PAGE_BITS;
pub(crate) const META_SLOT_BITS: u32 = 5;
/// Metadata slot size: 32 bytes, so slots-per-page is a power of two.
pub(crate) const META_SLOT_SIZE: usize = 1 << META_SLOT_BITS;
pub(crate) const SLOTS_PER_META_PAGE_BITS: u32 = META_PAGE_BITS - META_SLOT_BITS;

/// Index-stream pages hold a single u64 slot.
pub(crate) const INDEX_PAGE_SIZE: usize = 8;
pub(crate) const HEAD_PAGE_INDEX: u64 = 0;

const INDEX_DIR: &str = "index";
const META_DIR: &str = "meta";
const DATA_DIR: &str = "data";

/// A `get` or truncation aimed outside `[tail, head)`.
#[derive(Debug, Error)]
#[error("index {index} out of range [{tail}, {head})")]
pub struct IndexOutOfRange {
    pub index: u64,
    pub tail: u64,
    pub head: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct MetaSlot {
    data_page_index: U64,
    data_offset: U32,
    data_length: U32,
    timestamp_ms: U64,
    reserved: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<MetaSlot>() == META_SLOT_SIZE);

impl MetaSlot {
    fn new(data_page_index: u64, data_offset: u32, data_length: u32, timestamp_ms: u64) -> Self {
        Self {
            data_page_index: U64::new(data_page_index),
            data_offset: U32::new(data_offset),
            data_length: U32::new(data_length),
            timestamp_ms: U64::new(timestamp_ms),
            reserved: [0u8; 8],
        }
    }
}

struct AppendCursor {
    data_page_index: u64,
    data_offset: u32,
}

pub struct FastArray {
    array_dir: PathBuf,
    data_page_size: usize,
    index_factory: MappedPageFactory,
    meta_factory: MappedPageFactory,
    data_factory: MappedPageFactory,
    head_index: AtomicU64,
    tail_index: AtomicU64,
    // appends are serialized; the cursor tracks the bump-allocation point
    append: Mutex<AppendCursor>,
}

impl FastArray {
    /// Opens (creating if necessary) the array under `array_dir`, recovering
    /// head, tail, and the append cursor from what is on disk.
    pub fn open<P: AsRef<Path>>(
        array_dir: P,
        data_page_size: usize,
        cache_ttl: Duration,
    ) -> Result<Self> {
        let array_dir = array_dir.as_ref().to_path_buf();

        ensure!(
            data_page_size.is_power_of_two(),
            "data page size {} is not a power of two",
            data_page_size
        );
        ensure!(
            data_page_size >= MINIMUM_DATA_PAGE_SIZE,
            "data page size {} below minimum {}",
            data_page_size,
            MINIMUM_DATA_PAGE_SIZE
        );
        // metadata slots address offsets and lengths as u32
        ensure!(
            data_page_size <= 1 << 31,
            "data page size {} exceeds the 2 GiB slot-addressable maximum",
            data_page_size
        );

        let index_factory =
            MappedPageFactory::new(array_dir.join(INDEX_DIR), INDEX_PAGE_SIZE, cache_ttl)?;
        let meta_factory =
            MappedPageFactory::new(array_dir.join(META_DIR), META_PAGE_SIZE, cache_ttl)?;
        let data_factory =
            MappedPageFactory::new(array_dir.join(DATA_DIR), data_page_size, cache_ttl)?;

        let head = {
            let page = index_factory.acquire_page(HEAD_PAGE_INDEX)?;
            page.local_view(0)?.get_u64()?
        };

        let array = Self {
            array_dir,
            data_page_size,
            index_factory,
            meta_factory,
            data_factory,
            head_index: AtomicU64::new(head),
            tail_index: AtomicU64::new(head),
            append: Mutex::new(AppendCursor {
                data_page_index: 0,
                data_offset: 0,
            }),
        };
        array.recover(head)?;
        Ok(array)
    }

    fn recover(&self, head: u64) -> Result<()> {
        let meta_pages = self.meta_factory.existing_back_file_index_set()?;
        let lowest_meta = match meta_pages.iter().next() {
            Some(&lowest) if head != 0 => lowest,
            _ => {
                // fresh directory, or one that lost its metadata entirely
                self.tail_index.store(head, Ordering::Release);
                return Ok(());
            }
        };

        let last_slot = self.read_meta_slot(head.wrapping_sub(1))?;
        {
            let mut cursor = self.append.lock();
            cursor.data_page_index = last_slot.data_page_index.get();
            cursor.data_offset = last_slot.data_offset.get() + last_slot.data_length.get();
        }

        let data_pages = self.data_factory.existing_back_file_index_set()?;
        let tail = match data_pages.iter().next() {
            None => head,
            Some(&lowest_data) => {
                // Slots are monotone in data_page_index, so binary-search
                // (in wrap-safe distance space) for the first surviving id.
                let base = bits::mul(lowest_meta, SLOTS_PER_META_PAGE_BITS);
                let mut lo = 0u64;
                let mut hi = head.wrapping_sub(base);
                while lo < hi {
                    let mid = lo + (hi - lo) / 2;
                    let slot = self.read_meta_slot(base.wrapping_add(mid))?;
                    if slot.data_page_index.get() < lowest_data {
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                base.wrapping_add(lo)
            }
        };
        self.tail_index.store(tail, Ordering::Release);
        Ok(())
    }

    /// Appends one record and returns its id.
    ///
    /// The payload must be non-empty and no longer than one data page.
    /// Appends are serialized by the append mutex; the record becomes
    /// visible to readers only once the head bump is stored.
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        ensure!(!data.is_empty(), "cannot append an empty payload");
        ensure!(
            data.len() <= self.data_page_size,
            "payload of {} bytes exceeds the data page size of {}",
            data.len(),
            self.data_page_size
        );

        let mut cursor = self.append.lock();
        let id = self.head_index.load(Ordering::Acquire);

        if cursor.data_offset as usize + data.len() > self.data_page_size {
            // record does not fit in the remainder; start the next page
            cursor.data_page_index = cursor.data_page_index.wrapping_add(1);
            cursor.data_offset = 0;
        }
        let data_page_index = cursor.data_page_index;
        let data_offset = cursor.data_offset;

        {
            let page = self.data_factory.acquire_page(data_page_index)?;
            let mut view = page.local_view(data_offset as usize)?;
            view.put_bytes(data)?;
            page.set_dirty(true);
        }

        let slot = MetaSlot::new(data_page_index, data_offset, data.len() as u32, unix_millis());
        self.write_meta_slot(id, &slot)?;

        let new_head = id.wrapping_add(1);
        self.persist_head(new_head)?;
        self.head_index.store(new_head, Ordering::Release);
        cursor.data_offset = data_offset + data.len() as u32;

        Ok(id)
    }

    /// Copies out the payload of record `id`.
    ///
    /// Any number of gets may run concurrently; there is no locking beyond
    /// the per-page cache refcount.
    pub fn get(&self, id: u64) -> Result<Vec<u8>> {
        self.validate_index(id)?;
        let slot = self.read_meta_slot(id)?;

        let page = self.data_factory.acquire_page(slot.data_page_index.get())?;
        let mut view = page.local_view(slot.data_offset.get() as usize)?;
        view.get_bytes(slot.data_length.get() as usize)
    }

    /// Enqueue timestamp of record `id`, in unix millis.
    pub fn get_timestamp(&self, id: u64) -> Result<u64> {
        self.validate_index(id)?;
        Ok(self.read_meta_slot(id)?.timestamp_ms.get())
    }

    fn validate_index(&self, id: u64) -> Result<()> {
        let tail = self.tail_index.load(Ordering::Acquire);
        let head = self.head_index.load(Ordering::Acquire);
        if id.wrapping_sub(tail) >= head.wrapping_sub(tail) {
            return Err(IndexOutOfRange {
                index: id,
                tail,
                head,
            }
            .into());
        }
        Ok(())
    }

    fn meta_location(id: u64) -> (u64, usize) {
        let page = bits::div(id, SLOTS_PER_META_PAGE_BITS);
        let offset = bits::mul(bits::rem(id, SLOTS_PER_META_PAGE_BITS), META_SLOT_BITS);
        (page, offset as usize)
    }

    fn read_meta_slot(&self, id: u64) -> Result<MetaSlot> {
        let (page_index, offset) = Self::meta_location(id);
        let page = self.meta_factory.acquire_page(page_index)?;
        let bytes = page.local_view(offset)?.get_bytes(META_SLOT_SIZE)?;
        MetaSlot::read_from_bytes(&bytes)
            .map_err(|e| eyre::eyre!("failed to parse metadata slot for record {}: {:?}", id, e))
    }

    fn write_meta_slot(&self, id: u64, slot: &MetaSlot) -> Result<()> {
        let (page_index, offset) = Self::meta_location(id);
        let page = self.meta_factory.acquire_page(page_index)?;
        page.local_view(offset)?.put_bytes(slot.as_bytes())?;
        page.set_dirty(true);
        Ok(())
    }

    fn persist_head(&self, head: u64) -> Result<()> {
        let page = self.index_factory.acquire_page(HEAD_PAGE_INDEX)?;
        page.local_view(0)?.put_u64(head)?;
        page.set_dirty(true);
        Ok(())
    }

    /// Number of retrievable records, wrap-aware.
    pub fn size(&self) -> u64 {
        let tail = self.tail_index.load(Ordering::Acquire);
        self.head_index.load(Ordering::Acquire).wrapping_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Next id to assign (exclusive upper bound of live ids).
    pub fn head_index(&self) -> u64 {
        self.head_index.load(Ordering::Acquire)
    }

    /// Smallest id still retrievable.
    pub fn tail_index(&self) -> u64 {
        self.tail_index.load(Ordering::Acquire)
    }

    /// Truncation: reclaims every data page strictly before the data page
    /// holding `id` and every meta page strictly before `id`'s meta page,
    /// then advances the tail to `id`. The pages holding `id` stay intact.
    /// Out-of-range requests are ignored silently.
    pub fn remove_before_index(&self, id: u64) -> Result<()> {
        let _cursor = self.append.lock();

        let tail = self.tail_index.load(Ordering::Acquire);
        let head = self.head_index.load(Ordering::Acquire);
        if id.wrapping_sub(tail) >= head.wrapping_sub(tail) {
            return Ok(());
        }

        let slot = self.read_meta_slot(id)?;
        let (meta_page_index, _) = Self::meta_location(id);

        self.data_factory
            .delete_pages_before_index(slot.data_page_index.get())?;
        self.meta_factory.delete_pages_before_index(meta_page_index)?;

        self.tail_index.store(id, Ordering::Release);
        Ok(())
    }

    /// Deletes every page in all three streams and resets the array to
    /// empty. No page file is left behind; a recreated index page reads as
    /// zero, which is exactly the reset head.
    pub fn remove_all(&self) -> Result<()> {
        let mut cursor = self.append.lock();

        self.data_factory.delete_all_pages()?;
        self.meta_factory.delete_all_pages()?;
        self.index_factory.delete_all_pages()?;

        self.head_index.store(0, Ordering::Release);
        self.tail_index.store(0, Ordering::Release);
        cursor.data_page_index = 0;
        cursor.data_offset = 0;

        Ok(())
    }

    /// Flushes all three streams: payloads first, then metadata, then the
    /// head, so a persisted head never points at unflushed slots.
    pub fn flush(&self) -> Result<()> {
        self.data_factory.flush()?;
        self.meta_factory.flush()?;
        self.index_factory.flush()
    }

    /// Releases every cached page in all three streams.
    pub fn close(&self) -> Result<()> {
        self.index_factory.release_cached_pages()?;
        self.meta_factory.release_cached_pages()?;
        self.data_factory.release_cached_pages()
    }

    pub fn array_directory(&self) -> &Path {
        &self.array_dir
    }

    pub fn data_page_size(&self) -> usize {
        self.data_page_size
    }

    pub(crate) fn data_factory(&self) -> &MappedPageFactory {
        &self.data_factory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DEFAULT_TTL;
    use tempfile::tempdir;

    fn open(dir: &Path) -> FastArray {
        FastArray::open(dir, MINIMUM_DATA_PAGE_SIZE, DEFAULT_TTL).unwrap()
    }

    #[test]
    fn append_get_roundtrip() {
        let dir = tempdir().unwrap();
        let array = open(dir.path());

        let a = array.append(b"alpha").unwrap();
        let b = array.append(b"beta").unwrap();

        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(array.size(), 2);
        assert_eq!(array.get(a).unwrap(), b"alpha");
        assert_eq!(array.get(b).unwrap(), b"beta");
    }

    #[test]
    fn rejects_empty_and_oversized_payloads() {
        let dir = tempdir().unwrap();
        let array = open(dir.path());

        assert!(array.append(b"").is_err());
        let oversized = vec![0u8; MINIMUM_DATA_PAGE_SIZE + 1];
        assert!(array.append(&oversized).is_err());
        assert!(array.is_empty());
    }

    #[test]
    fn rejects_bad_page_sizes() {
        let dir = tempdir().unwrap();
        assert!(FastArray::open(dir.path(), MINIMUM_DATA_PAGE_SIZE / 2, DEFAULT_TTL).is_err());
        assert!(FastArray::open(dir.path(), MINIMUM_DATA_PAGE_SIZE + 1, DEFAULT_TTL).is_err());
    }

    #[test]
    fn out_of_range_get_is_typed() {
        let dir = tempdir().unwrap();
        let array = open(dir.path());
        array.append(b"x").unwrap();

        let err = array.get(5).unwrap_err();
        let oob = err.downcast_ref::<IndexOutOfRange>().unwrap();
        assert_eq!(oob.index, 5);
        assert_eq!(oob.head, 1);
    }

    #[test]
    fn records_never_straddle_data_pages() {
        let dir = tempdir().unwrap();
        let array = open(dir.path());

        // ~3/5 of a page each: the second and third must start new pages
        let payload = vec![7u8; MINIMUM_DATA_PAGE_SIZE * 3 / 5];
        for _ in 0..3 {
            array.append(&payload).unwrap();
        }

        let pages = array.data_factory().existing_back_file_index_set().unwrap();
        assert_eq!(pages.len(), 3);
        for id in 0..3 {
            assert_eq!(array.get(id).unwrap(), payload);
        }
    }

    #[test]
    fn timestamps_are_recorded() {
        let dir = tempdir().unwrap();
        let array = open(dir.path());

        let before = unix_millis();
        let id = array.append(b"stamped").unwrap();
        let after = unix_millis();

        let ts = array.get_timestamp(id).unwrap();
        assert!(ts >= before && ts <= after);
        assert!(array.get_timestamp(id + 1).is_err());
    }

    #[test]
    fn head_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let array = open(dir.path());
            array.append(b"one").unwrap();
            array.append(b"two").unwrap();
            array.flush().unwrap();
            array.close().unwrap();
        }

        let array = open(dir.path());
        assert_eq!(array.head_index(), 2);
        assert_eq!(array.size(), 2);
        assert_eq!(array.get(0).unwrap(), b"one");
        assert_eq!(array.get(1).unwrap(), b"two");

        // the append cursor recovered past record 1
        let id = array.append(b"three").unwrap();
        assert_eq!(id, 2);
        assert_eq!(array.get(2).unwrap(), b"three");
    }

    #[test]
    fn remove_before_index_reclaims_early_pages() {
        let dir = tempdir().unwrap();
        let array = open(dir.path());

        let payload = vec![1u8; MINIMUM_DATA_PAGE_SIZE * 3 / 5];
        for _ in 0..4 {
            array.append(&payload).unwrap();
        }
        assert_eq!(
            array.data_factory().existing_back_file_index_set().unwrap().len(),
            4
        );

        array.remove_before_index(2).unwrap();

        assert_eq!(array.tail_index(), 2);
        assert_eq!(array.size(), 2);
        let remaining = array.data_factory().existing_back_file_index_set().unwrap();
        assert!(!remaining.contains(&0));
        assert!(!remaining.contains(&1));
        assert_eq!(array.get(2).unwrap(), payload);
        assert!(array.get(1).is_err());

        // out-of-range truncation is silent
        array.remove_before_index(99).unwrap();
        assert_eq!(array.tail_index(), 2);
    }

    #[test]
    fn tail_recovery_skips_reclaimed_pages() {
        let dir = tempdir().unwrap();
        let payload = vec![2u8; MINIMUM_DATA_PAGE_SIZE * 3 / 5];
        {
            let array = open(dir.path());
            for _ in 0..4 {
                array.append(&payload).unwrap();
            }
            array.remove_before_index(3).unwrap();
            array.flush().unwrap();
            array.close().unwrap();
        }

        let array = open(dir.path());
        assert_eq!(array.head_index(), 4);
        assert_eq!(array.tail_index(), 3);
        assert_eq!(array.get(3).unwrap(), payload);
        assert!(array.get(2).is_err());
    }

    #[test]
    fn remove_all_resets_and_clears_disk() {
        let dir = tempdir().unwrap();
        let array = open(dir.path());
        array.append(b"gone").unwrap();

        array.remove_all().unwrap();

        assert_eq!(array.size(), 0);
        assert_eq!(array.head_index(), 0);
        assert!(array.get(0).is_err());
        assert!(array
            .data_factory()
            .existing_back_file_index_set()
            .unwrap()
            .is_empty());

        // the array is immediately usable again
        assert_eq!(array.append(b"back").unwrap(), 0);
        assert_eq!(array.get(0).unwrap(), b"back");
    }
}
