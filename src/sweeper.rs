//! Shared background closer for cache eviction.
//!
//! Sweeping must not close resources while holding the cache lock (closing a
//! mapped page flushes it, which can block on disk), so swept batches are
//! handed to short-lived worker threads. The pool is process-wide and
//! unbounded: one named worker per batch, with finished handles pruned as new
//! batches arrive.
//!
//! [`shutdown`] joins every outstanding worker — call it at the end of a test
//! suite or before process exit when deterministic teardown matters. New
//! batches may still be submitted afterwards; shutdown is a drain, not a
//! latch.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::Closeable;

static WORKERS: Mutex<Vec<JoinHandle<()>>> = Mutex::new(Vec::new());

fn close_all(values: &[Arc<dyn Closeable + Send + Sync>]) {
    for value in values {
        if let Err(e) = value.close() {
            // The cache has already forgotten the entry; nothing to do.
            warn!(error = %e, "failed to close swept resource");
        }
    }
    debug!(count = values.len(), "sweeper closed resources");
}

/// Closes `values` on a background worker.
pub(crate) fn close_async(values: Vec<Arc<dyn Closeable + Send + Sync>>) {
    if values.is_empty() {
        return;
    }

    let batch = values.clone();
    let spawned = std::thread::Builder::new()
        .name("fastqueue-sweeper".into())
        .spawn(move || close_all(&batch));

    match spawned {
        Ok(handle) => {
            let mut workers = WORKERS.lock();
            workers.retain(|h| !h.is_finished());
            workers.push(handle);
        }
        Err(e) => {
            // No thread available; close inline rather than leak mappings.
            warn!(error = %e, "failed to spawn sweeper worker, closing inline");
            close_all(&values);
        }
    }
}

/// Joins all outstanding sweeper workers.
pub fn shutdown() {
    let handles: Vec<JoinHandle<()>> = {
        let mut workers = WORKERS.lock();
        workers.drain(..).collect()
    };

    for handle in handles {
        let _ = handle.join();
    }
}
