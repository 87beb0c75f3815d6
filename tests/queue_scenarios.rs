//! # End-to-End Queue Scenarios
//!
//! Black-box tests of the full stack — queue over array over factories over
//! mapped pages — covering the round-trip, page-boundary, concurrency,
//! async hand-off, and reclamation behaviours a consumer of this crate
//! depends on. Page-boundary scenarios run at the minimum data page size
//! (32 MiB) to keep file counts observable without giant fixtures.

use std::collections::HashMap;
use std::path::Path;
use std::thread;
use std::time::Duration;

use fastqueue::{FastQueue, QueueOptions, MINIMUM_DATA_PAGE_SIZE};
use tempfile::tempdir;

fn small_queue(dir: &Path, name: &str) -> FastQueue {
    FastQueue::open_with_options(
        dir,
        name,
        QueueOptions {
            data_page_size: MINIMUM_DATA_PAGE_SIZE,
            ..QueueOptions::default()
        },
    )
    .unwrap()
}

fn data_page_files(dir: &Path, name: &str) -> Vec<String> {
    let mut files: Vec<String> = std::fs::read_dir(dir.join(name).join("data"))
        .unwrap()
        .filter_map(|e| e.unwrap().file_name().into_string().ok())
        .filter(|n| n.ends_with(".dat"))
        .collect();
    files.sort();
    files
}

mod round_trip {
    use super::*;

    #[test]
    fn enqueue_peek_dequeue_empty() {
        let dir = tempdir().unwrap();
        let queue = small_queue(dir.path(), "rt");

        queue.enqueue(b"hello").unwrap();
        assert_eq!(queue.peek().unwrap().unwrap(), b"hello");
        assert_eq!(queue.dequeue().unwrap().unwrap(), b"hello");
        assert_eq!(queue.dequeue().unwrap(), None);
        assert_eq!(queue.size(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn size_tracks_enqueues_from_empty() {
        let dir = tempdir().unwrap();
        let queue = small_queue(dir.path(), "sz");
        assert!(queue.is_empty());

        for n in 1..=50u64 {
            queue.enqueue(format!("msg-{n}").as_bytes()).unwrap();
            assert_eq!(queue.size(), n);
            assert!(!queue.is_empty());
        }
    }
}

mod page_boundaries {
    use super::*;

    #[test]
    fn large_records_land_on_distinct_pages() {
        let dir = tempdir().unwrap();
        let queue = small_queue(dir.path(), "pb");

        // Three payloads of ~3/5 page: after the first, <3/5 page remains,
        // so the second and third are each forced onto a fresh page.
        let payloads: Vec<Vec<u8>> = (0u8..3)
            .map(|i| vec![i + 1; MINIMUM_DATA_PAGE_SIZE * 3 / 5])
            .collect();
        for p in &payloads {
            queue.enqueue(p).unwrap();
        }

        assert_eq!(
            data_page_files(dir.path(), "pb"),
            vec!["page-0.dat", "page-1.dat", "page-2.dat"]
        );

        for p in &payloads {
            assert_eq!(&queue.dequeue().unwrap().unwrap(), p);
        }
        assert_eq!(queue.dequeue().unwrap(), None);
    }
}

mod concurrent_producers {
    use super::*;

    const PRODUCERS: u32 = 4;
    const PER_PRODUCER: u32 = 10_000;

    fn payload(producer: u32, seq: u32) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&producer.to_le_bytes());
        bytes[4..8].copy_from_slice(&seq.to_le_bytes());
        bytes
    }

    #[test]
    fn per_producer_order_survives_interleaving() {
        let dir = tempdir().unwrap();
        let queue = small_queue(dir.path(), "mp");

        thread::scope(|s| {
            for producer in 0..PRODUCERS {
                let queue = &queue;
                s.spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        queue.enqueue(&payload(producer, seq)).unwrap();
                    }
                });
            }
        });

        assert_eq!(queue.size(), (PRODUCERS * PER_PRODUCER) as u64);

        // every payload arrives exactly once, and each producer's
        // sub-sequence comes out in its original order
        let mut next_seq: HashMap<u32, u32> = HashMap::new();
        while let Some(bytes) = queue.dequeue().unwrap() {
            let producer = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
            let seq = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
            let expected = next_seq.entry(producer).or_insert(0);
            assert_eq!(seq, *expected, "producer {producer} out of order");
            *expected += 1;
        }

        assert_eq!(next_seq.len(), PRODUCERS as usize);
        for (_, count) in next_seq {
            assert_eq!(count, PER_PRODUCER);
        }
    }
}

mod async_handoff {
    use super::*;

    #[test]
    fn pending_dequeue_future_wakes_on_enqueue() {
        let dir = tempdir().unwrap();
        let queue = small_queue(dir.path(), "async");

        let fut = queue.dequeue_async();
        assert!(!fut.is_done());

        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(50));
                queue.enqueue(b"x").unwrap();
            });

            let value = fut
                .wait_timeout(Duration::from_secs(5))
                .expect("future did not complete in time")
                .unwrap();
            assert_eq!(value.unwrap(), b"x");
        });

        assert!(queue.is_empty());
    }

    #[test]
    fn pending_peek_future_wakes_without_consuming() {
        let dir = tempdir().unwrap();
        let queue = small_queue(dir.path(), "peek");

        let fut = queue.peek_async();
        queue.enqueue(b"y").unwrap();

        let value = fut
            .wait_timeout(Duration::from_secs(5))
            .expect("future did not complete in time")
            .unwrap();
        assert_eq!(value.unwrap(), b"y");
        assert_eq!(queue.size(), 1);
    }
}

mod reclamation {
    use super::*;

    #[test]
    fn gc_deletes_pages_behind_the_front_cursor() {
        let dir = tempdir().unwrap();
        let queue = small_queue(dir.path(), "gc");

        // one record per page: five pages on disk
        let payload = vec![9u8; MINIMUM_DATA_PAGE_SIZE * 3 / 5];
        for _ in 0..5 {
            queue.enqueue(&payload).unwrap();
        }
        assert_eq!(data_page_files(dir.path(), "gc").len(), 5);

        // dequeue across three page boundaries
        for _ in 0..3 {
            assert!(queue.dequeue().unwrap().is_some());
        }

        queue.gc().unwrap();

        let remaining = data_page_files(dir.path(), "gc");
        assert!(
            remaining.len() <= 3,
            "expected at least 2 reclaimed pages, still have {remaining:?}"
        );

        // everything still queued remains dequeueable
        assert_eq!(&queue.dequeue().unwrap().unwrap(), &payload);
        assert_eq!(&queue.dequeue().unwrap().unwrap(), &payload);
        assert_eq!(queue.dequeue().unwrap(), None);
    }

    #[test]
    fn remove_all_leaves_no_page_files() {
        let dir = tempdir().unwrap();
        let queue = small_queue(dir.path(), "wipe");

        queue.enqueue(b"a").unwrap();
        queue.enqueue(b"b").unwrap();
        queue.dequeue().unwrap();

        queue.remove_all().unwrap();

        assert_eq!(queue.size(), 0);
        assert!(queue.is_empty());
        for stream in ["index", "meta", "data", "front_index"] {
            let dir_path = dir.path().join("wipe").join(stream);
            let pages: Vec<_> = std::fs::read_dir(&dir_path)
                .unwrap()
                .filter_map(|e| e.unwrap().file_name().into_string().ok())
                .filter(|n| n.ends_with(".dat"))
                .collect();
            assert!(pages.is_empty(), "{stream} still holds {pages:?}");
        }

        // and the queue keeps working from scratch
        queue.enqueue(b"again").unwrap();
        assert_eq!(queue.dequeue().unwrap().unwrap(), b"again");
    }
}
