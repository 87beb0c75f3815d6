//! # FastQueue
//!
//! FIFO overlay on a [`FastArray`]: a persistent front cursor names the next
//! record to dequeue, and the array's head index is the enqueue end. The
//! cursor lives in its own single-slot page stream so the queue position
//! survives restarts independently of the record store:
//!
//! ```text
//! <queue_dir>/<queue_name>/
//! ├── index/        array head
//! ├── meta/         record slots
//! ├── data/         payloads
//! └── front_index/  page-0.dat — front cursor (u64 LE)
//! ```
//!
//! `dequeue`, `remove_all`, `apply_for_each`, and `flush` serialize on one
//! front mutex; `enqueue` relies on the array's append mutex and then wakes
//! any waiting completion futures. `peek` takes no lock at all — it reads
//! the front cursor and fetches, which is safe because records are immutable
//! once visible.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use parking_lot::Mutex;

use crate::array::{
    FastArray, IndexOutOfRange, DEFAULT_DATA_PAGE_SIZE, INDEX_PAGE_SIZE,
};
use crate::cache::DEFAULT_TTL;
use crate::factory::MappedPageFactory;
use crate::future::SettableFuture;

const FRONT_INDEX_DIR: &str = "front_index";
const FRONT_PAGE_INDEX: u64 = 0;

/// Per-queue tunables. The defaults match the on-disk format defaults:
/// 128 MiB data pages and a 10 s page cache TTL.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub data_page_size: usize,
    pub cache_ttl: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            data_page_size: DEFAULT_DATA_PAGE_SIZE,
            cache_ttl: DEFAULT_TTL,
        }
    }
}

type CompletionFuture = Arc<SettableFuture<Option<Vec<u8>>>>;

#[derive(Default)]
struct PendingFutures {
    dequeue: Option<CompletionFuture>,
    peek: Option<CompletionFuture>,
}

pub struct FastQueue {
    inner: FastArray,
    front_factory: MappedPageFactory,
    front_index: AtomicU64,
    front_lock: Mutex<()>,
    futures: Mutex<PendingFutures>,
}

impl FastQueue {
    /// Opens (creating if necessary) the queue `<queue_dir>/<queue_name>`
    /// with default options.
    pub fn open<P: AsRef<Path>>(queue_dir: P, queue_name: &str) -> Result<Self> {
        Self::open_with_options(queue_dir, queue_name, QueueOptions::default())
    }

    pub fn open_with_options<P: AsRef<Path>>(
        queue_dir: P,
        queue_name: &str,
        options: QueueOptions,
    ) -> Result<Self> {
        let array_dir = queue_dir.as_ref().join(queue_name);
        let inner = FastArray::open(&array_dir, options.data_page_size, options.cache_ttl)?;

        // the front page is held hot by every dequeue, so the TTL rarely
        // matters; it still follows the queue-wide setting
        let front_factory = MappedPageFactory::new(
            array_dir.join(FRONT_INDEX_DIR),
            INDEX_PAGE_SIZE,
            options.cache_ttl,
        )?;

        let front = {
            let page = front_factory.acquire_page(FRONT_PAGE_INDEX)?;
            page.local_view(0)?.get_u64()?
        };

        Ok(Self {
            inner,
            front_factory,
            front_index: AtomicU64::new(front),
            front_lock: Mutex::new(()),
            futures: Mutex::new(PendingFutures::default()),
        })
    }

    /// Appends one message, then completes any pending async consumers.
    pub fn enqueue(&self, data: &[u8]) -> Result<()> {
        self.inner.append(data)?;
        self.complete_futures();
        Ok(())
    }

    /// Removes and returns the front message, or `None` when empty.
    pub fn dequeue(&self) -> Result<Option<Vec<u8>>> {
        let _front = self.front_lock.lock();
        self.dequeue_locked()
    }

    fn dequeue_locked(&self) -> Result<Option<Vec<u8>>> {
        if self.is_empty() {
            return Ok(None);
        }

        let front = self.front_index.load(Ordering::Acquire);
        let data = self.inner.get(front)?;

        let next = front.wrapping_add(1);
        self.persist_front(next)?;
        self.front_index.store(next, Ordering::Release);

        Ok(Some(data))
    }

    /// Returns the front message without advancing, or `None` when empty.
    pub fn peek(&self) -> Result<Option<Vec<u8>>> {
        if self.is_empty() {
            return Ok(None);
        }
        let front = self.front_index.load(Ordering::Acquire);
        self.inner.get(front).map(Some)
    }

    /// One-shot future for the next dequeue. Completed immediately when the
    /// queue is non-empty, otherwise by the next successful enqueue. A new
    /// call after completion starts a fresh future.
    pub fn dequeue_async(&self) -> CompletionFuture {
        let mut futures = self.futures.lock();
        let fut = Self::fresh_future(&mut futures.dequeue);
        if !self.is_empty() {
            Self::complete_with(&fut, self.dequeue());
        }
        fut
    }

    /// One-shot future for the next peek; same lifecycle as
    /// [`dequeue_async`](Self::dequeue_async).
    pub fn peek_async(&self) -> CompletionFuture {
        let mut futures = self.futures.lock();
        let fut = Self::fresh_future(&mut futures.peek);
        if !self.is_empty() {
            Self::complete_with(&fut, self.peek());
        }
        fut
    }

    fn fresh_future(slot: &mut Option<CompletionFuture>) -> CompletionFuture {
        match slot {
            Some(fut) if !fut.is_done() => Arc::clone(fut),
            _ => {
                let fut = Arc::new(SettableFuture::new());
                *slot = Some(Arc::clone(&fut));
                fut
            }
        }
    }

    fn complete_with(fut: &CompletionFuture, result: Result<Option<Vec<u8>>>) {
        match result {
            Ok(value) => {
                fut.set(value);
            }
            Err(e) => {
                fut.set_error(e);
            }
        }
    }

    fn complete_futures(&self) {
        let futures = self.futures.lock();
        if let Some(fut) = &futures.peek {
            if !fut.is_done() {
                Self::complete_with(fut, self.peek());
            }
        }
        if let Some(fut) = &futures.dequeue {
            if !fut.is_done() {
                Self::complete_with(fut, self.dequeue());
            }
        }
    }

    /// Calls `visitor` with every queued message in order, front to head,
    /// without advancing the front cursor.
    pub fn apply_for_each<F>(&self, mut visitor: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let _front = self.front_lock.lock();

        let head = self.inner.head_index();
        let mut index = self.front_index.load(Ordering::Acquire);
        while index != head {
            let data = self.inner.get(index)?;
            visitor(&data)?;
            index = index.wrapping_add(1);
        }
        Ok(())
    }

    /// Queued message count, wrap-aware.
    pub fn size(&self) -> u64 {
        let front = self.front_index.load(Ordering::Acquire);
        self.inner.head_index().wrapping_sub(front)
    }

    pub fn is_empty(&self) -> bool {
        self.front_index.load(Ordering::Acquire) == self.inner.head_index()
    }

    /// Empties the queue: deletes every page in every stream (the front
    /// page included — a recreated front page reads as zero) and resets the
    /// front cursor.
    pub fn remove_all(&self) -> Result<()> {
        let _front = self.front_lock.lock();

        self.inner.remove_all()?;
        self.front_factory.delete_all_pages()?;
        self.front_index.store(0, Ordering::Release);
        Ok(())
    }

    /// Reclaims pages that hold only already-dequeued records. Safe to call
    /// at any time; an empty or freshly-reset queue makes this a no-op.
    pub fn gc(&self) -> Result<()> {
        let before = self.front_index.load(Ordering::Acquire).wrapping_sub(1);
        match self.inner.remove_before_index(before) {
            Err(e) if e.downcast_ref::<IndexOutOfRange>().is_some() => Ok(()),
            result => result,
        }
    }

    /// Flushes the front cursor and all three array streams.
    pub fn flush(&self) -> Result<()> {
        let _front = self.front_lock.lock();
        self.front_factory.flush()?;
        self.inner.flush()
    }

    /// Releases cached pages and cancels pending futures without
    /// interrupting producers. Only idempotent cancel/close are defined
    /// afterwards.
    pub fn close(&self) -> Result<()> {
        self.front_factory.release_cached_pages()?;

        {
            let futures = self.futures.lock();
            if let Some(fut) = &futures.peek {
                fut.cancel();
            }
            if let Some(fut) = &futures.dequeue {
                fut.cancel();
            }
        }

        self.inner.close()
    }

    fn persist_front(&self, front: u64) -> Result<()> {
        let page = self.front_factory.acquire_page(FRONT_PAGE_INDEX)?;
        page.local_view(0)?.put_u64(front)?;
        page.set_dirty(true);
        Ok(())
    }

    /// The record store underneath this queue.
    pub fn inner_array(&self) -> &FastArray {
        &self.inner
    }

    /// Id of the next record to dequeue.
    pub fn front_index(&self) -> u64 {
        self.front_index.load(Ordering::Acquire)
    }
}
