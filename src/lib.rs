//! # fastqueue — persistent mmap-backed FIFO message queue
//!
//! A big, fast, persistent queue of opaque byte messages. Producers append
//! blobs, consumers dequeue them in insertion order; capacity is bounded
//! only by disk, and the hot path resolves a record to a memory address
//! inside a mapped page, so throughput approaches direct memory access.
//!
//! ## Quick Start
//!
//! ```ignore
//! use fastqueue::FastQueue;
//!
//! let queue = FastQueue::open("./queues", "events")?;
//! queue.enqueue(b"hello")?;
//! assert_eq!(queue.dequeue()?.as_deref(), Some(b"hello".as_slice()));
//! queue.flush()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │ FastQueue     front cursor, futures, gc   │
//! ├───────────────────────────────────────────┤
//! │ FastArray     append/get by record id     │
//! │               index + meta + data streams │
//! ├───────────────────────────────────────────┤
//! │ MappedPageFactory   per-stream directory, │
//! │                     per-index map locking │
//! ├───────────────────────────────────────────┤
//! │ RefTtlCache   refcount + TTL eviction     │
//! ├───────────────────────────────────────────┤
//! │ MappedPage    one mmap'd page-<n>.dat     │
//! └───────────────────────────────────────────┘
//! ```
//!
//! Every stored integer is little-endian; every page size is a power of two
//! ([`bits`] turns the hot-path arithmetic into shifts).
//!
//! ## Durability
//!
//! Appends land in mapped memory and reach disk on OS writeback or an
//! explicit [`FastQueue::flush`]. A crash loses at most the in-flight
//! append; reopening a queue directory recovers the head, front cursor, and
//! append position from the page files.
//!
//! ## Concurrency
//!
//! Threads with blocking I/O throughout. Appends are serialized, gets are
//! lock-free beyond the per-page refcount, and evicted pages are closed on
//! the shared [`sweeper`] pool — call [`sweeper::shutdown`] for
//! deterministic teardown in test suites.

pub mod bits;
pub mod sweeper;

mod array;
mod cache;
mod factory;
mod future;
mod page;
mod queue;

pub use array::{
    FastArray, IndexOutOfRange, DEFAULT_DATA_PAGE_SIZE, MINIMUM_DATA_PAGE_SIZE,
};
pub use cache::{Closeable, RefTtlCache, DEFAULT_TTL};
pub use factory::{MappedPageFactory, PageHandle, PAGE_FILE_NAME, PAGE_FILE_SUFFIX};
pub use future::SettableFuture;
pub use page::{MappedPage, PageView};
pub use queue::{FastQueue, QueueOptions};
