//! # Mapped Page
//!
//! A `MappedPage` is one fixed-size page file mapped read-write into the
//! process address space. It is the unit of memory mapping and of on-disk
//! allocation: the backing file `page-<index>.dat` always has exactly the
//! declared page size once created.
//!
//! ## Views
//!
//! Callers never touch the mapping directly; they take [`PageView`]s via
//! [`MappedPage::local_view`]. A view is an independent byte cursor over the
//! shared region — concurrent views never share cursor state, while the
//! underlying bytes are shared, so a write through one view is visible to
//! every other view and reaches disk on the next flush.
//!
//! ## Lifecycle and safety
//!
//! Pages are owned by the factory cache and handed out under refcount
//! protection: a page is only closed (unmapped) once its refcount has
//! dropped to zero and its TTL has expired. Views hold a raw pointer into
//! the mapping, so the refcount discipline is load-bearing — a caller must
//! hold its cache reference for as long as it uses a view. After `close()`
//! the page is unusable even if the final flush failed.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use parking_lot::RwLock;

use crate::cache::Closeable;

#[derive(Debug)]
pub struct MappedPage {
    index: u64,
    path: PathBuf,
    page_size: usize,
    dirty: AtomicBool,
    // None once closed; the RwLock orders views/flushes against close.
    mmap: RwLock<Option<MmapMut>>,
}

impl MappedPage {
    /// Opens (creating if necessary) the page file and maps `[0, page_size)`.
    pub fn open<P: AsRef<Path>>(path: P, index: u64, page_size: usize) -> Result<Self> {
        let path = path.as_ref();

        ensure!(page_size > 0, "page size must be positive");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open page file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        ensure!(
            len == 0 || len == page_size as u64,
            "page file '{}' has size {} but this stream uses {}-byte pages",
            path.display(),
            len,
            page_size
        );

        if len == 0 {
            file.set_len(page_size as u64).wrap_err_with(|| {
                format!(
                    "failed to extend page file '{}' to {} bytes",
                    path.display(),
                    page_size
                )
            })?;
        }

        // SAFETY: MmapMut::map_mut is unsafe because externally-modified
        // files lead to undefined behavior. This is safe because:
        // 1. Queue directories are single-process by contract; no
        //    multi-process sharing of a queue directory
        // 2. The file was just sized to exactly page_size bytes
        // 3. The mapping's lifetime is tied to this MappedPage, and the
        //    factory cache keeps the page alive while any view is held
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        // The fd is dropped here; the mapping survives it.
        Ok(Self {
            index,
            path: path.to_path_buf(),
            page_size,
            dirty: AtomicBool::new(false),
            mmap: RwLock::new(Some(mmap)),
        })
    }

    /// Returns an independent cursor over the mapping starting at `position`.
    ///
    /// Fails if the page has been closed or `position` lies past the end.
    pub fn local_view(&self, position: usize) -> Result<PageView<'_>> {
        ensure!(
            position <= self.page_size,
            "view position {} out of page bounds (page_size={})",
            position,
            self.page_size
        );

        let guard = self.mmap.read();
        let mmap = guard.as_ref().ok_or_else(|| {
            eyre::eyre!("mapped page '{}' is closed", self.path.display())
        })?;

        // SAFETY: the pointer outlives the read guard, but the mapping is
        // only dropped by close(), and the factory cache refcount guarantees
        // close() is never reached while a caller still holds this page.
        // Writes through concurrent views target disjoint regions (append
        // reserves each record's range under the append mutex).
        let base = mmap.as_ptr() as *mut u8;

        Ok(PageView {
            base,
            len: self.page_size,
            pos: position,
            page: self,
        })
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Forces dirty bytes to stable storage (msync) and clears the dirty
    /// flag. No-op when clean or already closed.
    pub fn flush(&self) -> Result<()> {
        let guard = self.mmap.read();
        let Some(mmap) = guard.as_ref() else {
            return Ok(());
        };

        if self.dirty.swap(false, Ordering::AcqRel) {
            if let Err(e) = mmap.flush() {
                self.dirty.store(true, Ordering::Release);
                return Err(e)
                    .wrap_err_with(|| format!("failed to flush page '{}'", self.path.display()));
            }
        }

        Ok(())
    }

    /// Unmaps the page. Flushes first when dirty; the page is unusable
    /// afterwards even if that flush failed. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.mmap.write();
        let Some(mmap) = guard.take() else {
            return Ok(());
        };

        let mut flush_result = Ok(());
        if self.dirty.swap(false, Ordering::AcqRel) {
            flush_result = mmap
                .flush()
                .wrap_err_with(|| format!("failed to flush page '{}' on close", self.path.display()));
        }
        drop(mmap);

        flush_result
    }

    pub fn is_closed(&self) -> bool {
        self.mmap.read().is_none()
    }

    pub fn page_file(&self) -> &Path {
        &self.path
    }

    pub fn page_index(&self) -> u64 {
        self.index
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

impl Closeable for MappedPage {
    fn close(&self) -> Result<()> {
        MappedPage::close(self)
    }
}

/// An independent byte cursor over one mapped page.
///
/// Multi-byte integers use little-endian encoding, matching every on-disk
/// integer in this crate.
pub struct PageView<'a> {
    base: *mut u8,
    len: usize,
    pos: usize,
    page: &'a MappedPage,
}

impl PageView<'_> {
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.len - self.pos
    }

    fn check(&self, n: usize) -> Result<()> {
        ensure!(
            n <= self.remaining(),
            "view access of {} bytes at {} overruns page '{}' ({} bytes)",
            n,
            self.pos,
            self.page.page_file().display(),
            self.len
        );
        Ok(())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.check(bytes.len())?;
        // SAFETY: bounds checked above; base is valid for len bytes while
        // the page is open, which the cache refcount guarantees (see
        // local_view). Source and destination cannot overlap: bytes is a
        // caller-owned slice, not a view into this mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(self.pos), bytes.len());
        }
        self.pos += bytes.len();
        Ok(())
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        self.check(n)?;
        let mut out = vec![0u8; n];
        // SAFETY: bounds checked above; see put_bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(self.pos), out.as_mut_ptr(), n);
        }
        self.pos += n;
        Ok(out)
    }

    pub fn put_u64(&mut self, value: u64) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.copy_out(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn put_u32(&mut self, value: u32) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.copy_out(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn copy_out(&mut self, buf: &mut [u8]) -> Result<()> {
        self.check(buf.len())?;
        // SAFETY: bounds checked above; see put_bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(self.pos), buf.as_mut_ptr(), buf.len());
        }
        self.pos += buf.len();
        Ok(())
    }
}
