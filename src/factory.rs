//! # Mapped Page Factory
//!
//! One factory instance owns one directory of page files — one *stream* —
//! plus a fixed page size and cache TTL for that stream. Page files are
//! named `page-<index>.dat` with a non-negative decimal index; the index is
//! parsed back out of the name between the last `-` and the `.dat` suffix.
//!
//! ## Acquire path
//!
//! `acquire_page` is the hot entry point. A cache hit costs one read lock
//! and two atomic bumps. On a miss, the factory guarantees **at most one
//! concurrent map operation per index** with a two-level lock: a coarse
//! mutex guards a map of per-index creation mutexes, so creating page 7
//! never serializes against creating page 8, while two racing acquirers of
//! page 7 agree on a single mapping. The per-index entry is dropped again
//! once creation finishes.
//!
//! Handles are RAII: dropping a [`PageHandle`] releases the cache reference,
//! the same discipline the refcount eviction policy depends on.
//!
//! ## Deletion
//!
//! Deleting a page file can race with an unmap still in flight (on platforms
//! where an open mapping pins the file). `delete_page` retries busy errors
//! up to 10 rounds with a 200 ms pause, then logs a warning and gives up;
//! any other I/O error propagates immediately.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::RefTtlCache;
use crate::page::MappedPage;

pub const PAGE_FILE_NAME: &str = "page";
pub const PAGE_FILE_SUFFIX: &str = ".dat";

const MAX_DELETE_ROUNDS: u32 = 10;
const DELETE_RETRY_PAUSE: Duration = Duration::from_millis(200);

pub struct MappedPageFactory {
    page_size: usize,
    page_dir: PathBuf,
    ttl: Duration,
    cache: RefTtlCache<u64, MappedPage>,
    creation_locks: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl MappedPageFactory {
    /// Creates the page directory if missing and returns a factory for it.
    pub fn new<P: AsRef<Path>>(page_dir: P, page_size: usize, ttl: Duration) -> Result<Self> {
        let page_dir = page_dir.as_ref().to_path_buf();

        fs::create_dir_all(&page_dir)
            .wrap_err_with(|| format!("failed to create page directory '{}'", page_dir.display()))?;

        Ok(Self {
            page_size,
            page_dir,
            ttl,
            cache: RefTtlCache::new(),
            creation_locks: Mutex::new(HashMap::new()),
        })
    }

    fn file_name(&self, index: u64) -> PathBuf {
        self.page_dir
            .join(format!("{PAGE_FILE_NAME}-{index}{PAGE_FILE_SUFFIX}"))
    }

    /// Returns the mapped page for `index`, mapping it on first acquire.
    ///
    /// Concurrent callers for the same index observe the same page object;
    /// the underlying map runs at most once.
    pub fn acquire_page(&self, index: u64) -> Result<PageHandle<'_>> {
        if let Some(page) = self.cache.get(&index) {
            debug!(page = %page.page_file().display(), "mapped page cache hit");
            return Ok(PageHandle {
                factory: self,
                index,
                page,
            });
        }

        let lock = {
            let mut locks = self.creation_locks.lock();
            Arc::clone(locks.entry(index).or_default())
        };

        let created = {
            let _creating = lock.lock();
            // double check under the per-index lock
            match self.cache.get(&index) {
                Some(page) => Ok(page),
                None => self.map_page(index),
            }
        };

        self.creation_locks.lock().remove(&index);

        created.map(|page| PageHandle {
            factory: self,
            index,
            page,
        })
    }

    fn map_page(&self, index: u64) -> Result<Arc<MappedPage>> {
        let path = self.file_name(index);
        let page = Arc::new(MappedPage::open(&path, index, self.page_size)?);
        self.cache.put(index, Arc::clone(&page), self.ttl);
        debug!(page = %path.display(), "mapped page created and cached");
        Ok(page)
    }

    /// Drops one cache reference for `index`. Prefer letting the
    /// [`PageHandle`] drop do this.
    pub fn release_page(&self, index: u64) {
        self.cache.release(&index);
    }

    /// Closes every cached page. Not thread-safe on its own; callers
    /// synchronize externally.
    pub fn release_cached_pages(&self) -> Result<()> {
        self.cache.remove_all()
    }

    /// Removes `index` from the cache and deletes its backing file,
    /// retrying busy errors before giving up with a warning.
    pub fn delete_page(&self, index: u64) -> Result<()> {
        self.cache.remove(&index)?;
        let path = self.file_name(index);

        let mut round = 0;
        loop {
            match fs::remove_file(&path) {
                Ok(()) => {
                    info!(page = %path.display(), "page file deleted");
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) if is_busy(&e) => {
                    round += 1;
                    if round >= MAX_DELETE_ROUNDS {
                        warn!(
                            page = %path.display(),
                            rounds = MAX_DELETE_ROUNDS,
                            "failed to delete busy page file, delete it manually"
                        );
                        return Ok(());
                    }
                    debug!(page = %path.display(), round, "page file busy, retrying delete");
                    std::thread::sleep(DELETE_RETRY_PAUSE);
                }
                Err(e) => {
                    return Err(e).wrap_err_with(|| {
                        format!("failed to delete page file '{}'", path.display())
                    });
                }
            }
        }
    }

    pub fn delete_pages(&self, indexes: &BTreeSet<u64>) -> Result<()> {
        for &index in indexes {
            self.delete_page(index)?;
        }
        Ok(())
    }

    pub fn delete_all_pages(&self) -> Result<()> {
        self.cache.remove_all()?;
        let indexes = self.existing_back_file_index_set()?;
        self.delete_pages(&indexes)?;
        debug!(dir = %self.page_dir.display(), "all page files deleted");
        Ok(())
    }

    /// Deletes every page whose file modtime is strictly before
    /// `timestamp_ms` (unix millis).
    pub fn delete_pages_before(&self, timestamp_ms: u64) -> Result<()> {
        let indexes = self.page_index_set_before(timestamp_ms)?;
        self.delete_pages(&indexes)
    }

    /// Deletes every page with index strictly less than `page_index`.
    pub fn delete_pages_before_index(&self, page_index: u64) -> Result<()> {
        for index in self.existing_back_file_index_set()? {
            if index < page_index {
                self.delete_page(index)?;
            }
        }
        Ok(())
    }

    /// Indices of all page files currently present in the directory.
    pub fn existing_back_file_index_set(&self) -> Result<BTreeSet<u64>> {
        let mut indexes = BTreeSet::new();
        self.scan_dir(|name, _| {
            if let Some(index) = parse_page_index(name) {
                indexes.insert(index);
            }
            Ok(())
        })?;
        Ok(indexes)
    }

    /// Indices of page files last modified strictly before `timestamp_ms`.
    pub fn page_index_set_before(&self, timestamp_ms: u64) -> Result<BTreeSet<u64>> {
        let mut indexes = BTreeSet::new();
        self.scan_dir(|name, entry| {
            if let Some(index) = parse_page_index(name) {
                if modified_millis(&entry.metadata()?) < timestamp_ms {
                    indexes.insert(index);
                }
            }
            Ok(())
        })?;
        Ok(indexes)
    }

    /// The **largest** page index whose file modtime is strictly before
    /// `timestamp_ms`, or `None`. The name is historical: the semantics are
    /// "the newest page that is still older than the timestamp".
    pub fn first_page_index_before(&self, timestamp_ms: u64) -> Result<Option<u64>> {
        Ok(self.page_index_set_before(timestamp_ms)?.last().copied())
    }

    pub fn page_file_last_modified_time(&self, index: u64) -> Result<Option<u64>> {
        let path = self.file_name(index);
        match fs::metadata(&path) {
            Ok(meta) => Ok(Some(modified_millis(&meta))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).wrap_err_with(|| {
                format!("failed to stat page file '{}'", path.display())
            }),
        }
    }

    /// Flushes every currently cached page.
    pub fn flush(&self) -> Result<()> {
        for page in self.cache.values() {
            page.flush()?;
        }
        Ok(())
    }

    /// Names of all page files in the directory.
    pub fn back_page_file_set(&self) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        self.scan_dir(|name, _| {
            if parse_page_index(name).is_some() {
                names.insert(name.to_string());
            }
            Ok(())
        })?;
        Ok(names)
    }

    /// Total on-disk size of all page files in the directory.
    pub fn back_page_file_size(&self) -> Result<u64> {
        let mut total = 0;
        self.scan_dir(|name, entry| {
            if parse_page_index(name).is_some() {
                total += entry.metadata()?.len();
            }
            Ok(())
        })?;
        Ok(total)
    }

    fn scan_dir<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&str, &fs::DirEntry) -> io::Result<()>,
    {
        let entries = fs::read_dir(&self.page_dir).wrap_err_with(|| {
            format!("failed to list page directory '{}'", self.page_dir.display())
        })?;

        for entry in entries {
            let entry = entry.wrap_err_with(|| {
                format!("failed to read entry in '{}'", self.page_dir.display())
            })?;
            let name = entry.file_name();
            if let Some(name) = name.to_str() {
                visit(name, &entry).wrap_err_with(|| {
                    format!("failed to stat '{}'", entry.path().display())
                })?;
            }
        }
        Ok(())
    }

    pub fn cache_size(&self) -> usize {
        self.cache.size()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_dir(&self) -> &Path {
        &self.page_dir
    }

    #[cfg(test)]
    fn creation_lock_count(&self) -> usize {
        self.creation_locks.lock().len()
    }
}

/// RAII cache reference to a mapped page; releases on drop.
pub struct PageHandle<'a> {
    factory: &'a MappedPageFactory,
    index: u64,
    page: Arc<MappedPage>,
}

impl PageHandle<'_> {
    pub fn page(&self) -> &Arc<MappedPage> {
        &self.page
    }
}

impl Deref for PageHandle<'_> {
    type Target = MappedPage;

    fn deref(&self) -> &MappedPage {
        &self.page
    }
}

impl Drop for PageHandle<'_> {
    fn drop(&mut self) {
        self.factory.release_page(self.index);
    }
}

/// Parses `page-<n>.dat` into `n`; the index is delimited by the last `-`
/// and the suffix.
fn parse_page_index(file_name: &str) -> Option<u64> {
    let stem = file_name.strip_suffix(PAGE_FILE_SUFFIX)?;
    let (_, index) = stem.rsplit_once('-')?;
    index.parse().ok()
}

fn modified_millis(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn is_busy(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::ResourceBusy {
        return true;
    }

    #[cfg(unix)]
    {
        e.raw_os_error() == Some(libc::EBUSY)
    }
    #[cfg(windows)]
    {
        // ERROR_SHARING_VIOLATION
        e.raw_os_error() == Some(32)
    }
    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DEFAULT_TTL;
    use std::thread;
    use tempfile::tempdir;

    fn factory(dir: &Path) -> MappedPageFactory {
        MappedPageFactory::new(dir, 4096, DEFAULT_TTL).unwrap()
    }

    #[test]
    fn parse_page_file_names() {
        assert_eq!(parse_page_index("page-0.dat"), Some(0));
        assert_eq!(parse_page_index("page-137.dat"), Some(137));
        assert_eq!(parse_page_index("page-137.tmp"), None);
        assert_eq!(parse_page_index("journal.dat"), None);
        assert_eq!(parse_page_index("page-x.dat"), None);
    }

    #[test]
    fn acquire_creates_file_of_page_size() {
        let dir = tempdir().unwrap();
        let f = factory(dir.path());

        let page = f.acquire_page(3).unwrap();
        assert_eq!(page.page_index(), 3);
        assert_eq!(
            fs::metadata(dir.path().join("page-3.dat")).unwrap().len(),
            4096
        );
        assert_eq!(f.cache_size(), 1);
        assert_eq!(f.creation_lock_count(), 0);
    }

    #[test]
    fn concurrent_acquire_maps_once() {
        let dir = tempdir().unwrap();
        let f = factory(dir.path());

        let pages: Vec<Arc<MappedPage>> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| Arc::clone(f.acquire_page(0).unwrap().page())))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for page in &pages[1..] {
            assert!(Arc::ptr_eq(&pages[0], page));
        }
        assert_eq!(f.cache_size(), 1);
        assert_eq!(f.creation_lock_count(), 0);
    }

    #[test]
    fn writes_survive_cache_release_and_reacquire() {
        let dir = tempdir().unwrap();
        let f = factory(dir.path());

        {
            let page = f.acquire_page(0).unwrap();
            page.local_view(0).unwrap().put_u64(99).unwrap();
            page.set_dirty(true);
        }
        f.release_cached_pages().unwrap();

        let page = f.acquire_page(0).unwrap();
        assert_eq!(page.local_view(0).unwrap().get_u64().unwrap(), 99);
    }

    #[test]
    fn delete_page_removes_file_and_tolerates_missing() {
        let dir = tempdir().unwrap();
        let f = factory(dir.path());

        drop(f.acquire_page(5).unwrap());
        assert!(dir.path().join("page-5.dat").exists());

        f.delete_page(5).unwrap();
        assert!(!dir.path().join("page-5.dat").exists());
        assert_eq!(f.cache_size(), 0);

        f.delete_page(5).unwrap(); // already gone
    }

    #[test]
    fn enumeration_and_sizes() {
        let dir = tempdir().unwrap();
        let f = factory(dir.path());

        for i in [0u64, 2, 7] {
            drop(f.acquire_page(i).unwrap());
        }
        fs::write(dir.path().join("stray.txt"), b"x").unwrap();

        let set = f.existing_back_file_index_set().unwrap();
        assert_eq!(set, BTreeSet::from([0, 2, 7]));

        let names = f.back_page_file_set().unwrap();
        assert!(names.contains("page-2.dat"));
        assert_eq!(names.len(), 3);

        assert_eq!(f.back_page_file_size().unwrap(), 3 * 4096);
    }

    #[test]
    fn delete_pages_before_index_keeps_boundary() {
        let dir = tempdir().unwrap();
        let f = factory(dir.path());
        for i in 0..5u64 {
            drop(f.acquire_page(i).unwrap());
        }
        f.release_cached_pages().unwrap();

        f.delete_pages_before_index(3).unwrap();

        assert_eq!(
            f.existing_back_file_index_set().unwrap(),
            BTreeSet::from([3, 4])
        );
    }

    #[test]
    fn timestamp_filters_respect_modtime() {
        let dir = tempdir().unwrap();
        let f = factory(dir.path());

        drop(f.acquire_page(0).unwrap());
        drop(f.acquire_page(1).unwrap());
        f.release_cached_pages().unwrap();
        thread::sleep(Duration::from_millis(30));
        let cutoff = crate::cache::unix_millis();
        thread::sleep(Duration::from_millis(30));
        drop(f.acquire_page(2).unwrap());
        f.release_cached_pages().unwrap();

        let before = f.page_index_set_before(cutoff).unwrap();
        assert_eq!(before, BTreeSet::from([0, 1]));

        // "first" is historical: this is the largest index before the cutoff
        assert_eq!(f.first_page_index_before(cutoff).unwrap(), Some(1));
        assert_eq!(f.first_page_index_before(0).unwrap(), None);

        f.delete_pages_before(cutoff).unwrap();
        assert_eq!(
            f.existing_back_file_index_set().unwrap(),
            BTreeSet::from([2])
        );

        assert!(f.page_file_last_modified_time(2).unwrap().unwrap() >= cutoff);
        assert_eq!(f.page_file_last_modified_time(9).unwrap(), None);
    }
}
