//! Sequential access detection and read-ahead prefetching (spec §4.3, C3).
//!
//! Grounded on the teacher's `storage/health.rs` per-key state-map shape,
//! with capacity eviction delegated to `lru::LruCache` (already a teacher
//! dependency) instead of a hand-rolled LRU list.

use crate::external::BlockRetriever;
use crate::types::Cid;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

const MAX_PATTERNS: usize = 100;
const SEQUENTIAL_WINDOW: Duration = Duration::from_secs(5);
const PREFETCH_DEPTH: usize = 3;

/// A descriptor identifying the ordered block sequence belonging to one
/// logical file, as registered by the caller before any reads occur.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub file_id: String,
    pub blocks: Vec<Cid>,
}

struct AccessPattern {
    blocks: Vec<Cid>,
    last_index: usize,
    last_access: Instant,
    is_sequential: bool,
}

/// Tracks per-file access order and flags sequential read patterns so the
/// prefetch worker can read ahead.
pub struct SequentialAccessTracker {
    descriptors: Mutex<HashSet<String>>,
    patterns: Mutex<LruCache<String, AccessPattern>>,
    in_flight: Mutex<HashSet<Cid>>,
    prefetch_tx: mpsc::Sender<Cid>,
    prefetch_rx: Mutex<Option<mpsc::Receiver<Cid>>>,
    cancel: CancellationToken,
}

impl SequentialAccessTracker {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(256);
        Arc::new(Self {
            descriptors: Mutex::new(HashSet::new()),
            patterns: Mutex::new(LruCache::new(NonZeroUsize::new(MAX_PATTERNS).unwrap())),
            in_flight: Mutex::new(HashSet::new()),
            prefetch_tx: tx,
            prefetch_rx: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
        })
    }

    /// Register the block order for a file so later accesses can be
    /// recognized as sequential against it.
    pub fn register_descriptor(&self, descriptor: FileDescriptor) {
        self.descriptors.lock().insert(descriptor.file_id.clone());
        self.patterns.lock().put(
            descriptor.file_id,
            AccessPattern {
                blocks: descriptor.blocks,
                last_index: 0,
                last_access: Instant::now(),
                is_sequential: false,
            },
        );
    }

    /// Record an access to `cid` within `file_id`'s registered sequence.
    /// Returns the blocks that should be prefetched, if any, without
    /// fetching them itself.
    #[instrument(skip(self))]
    pub fn track_access(&self, file_id: &str, cid: &Cid) -> Vec<Cid> {
        let mut patterns = self.patterns.lock();
        let Some(pattern) = patterns.get_mut(file_id) else {
            return Vec::new();
        };

        let Some(index) = pattern.blocks.iter().position(|b| b == cid) else {
            return Vec::new();
        };

        let now = Instant::now();
        let within_window = now.duration_since(pattern.last_access) <= SEQUENTIAL_WINDOW;
        let advanced_by_one = index == pattern.last_index + 1;
        pattern.is_sequential = within_window && advanced_by_one;
        pattern.last_index = index;
        pattern.last_access = now;

        if !pattern.is_sequential {
            return Vec::new();
        }

        pattern
            .blocks
            .iter()
            .skip(index + 1)
            .take(PREFETCH_DEPTH)
            .cloned()
            .collect()
    }

    /// Enqueue blocks for background prefetch, deduplicating against any
    /// already in flight.
    pub fn enqueue_prefetch(&self, cids: Vec<Cid>) {
        let mut in_flight = self.in_flight.lock();
        for cid in cids {
            if in_flight.insert(cid.clone()) {
                if self.prefetch_tx.try_send(cid.clone()).is_err() {
                    in_flight.remove(&cid);
                }
            }
        }
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.lock().len()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Background worker that drains the prefetch queue, fetching each block
/// best-effort via the injected `BlockRetriever` and handing it to `store`.
pub async fn run_prefetch_worker<F, Fut>(
    tracker: Arc<SequentialAccessTracker>,
    retriever: Arc<dyn BlockRetriever>,
    store: F,
) where
    F: Fn(Cid, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let mut rx = tracker
        .prefetch_rx
        .lock()
        .take()
        .expect("run_prefetch_worker called more than once");

    loop {
        tokio::select! {
            _ = tracker.cancel.cancelled() => {
                debug!("prefetch worker shutting down");
                return;
            }
            maybe_cid = rx.recv() => {
                let Some(cid) = maybe_cid else { return };
                match retriever.retrieve(&cid).await {
                    Ok(bytes) => store(cid.clone(), bytes).await,
                    Err(err) => warn!(%cid, error = %err, "prefetch fetch failed"),
                }
                tracker.in_flight.lock().remove(&cid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(file_id: &str, n: usize) -> FileDescriptor {
        FileDescriptor {
            file_id: file_id.to_string(),
            blocks: (0..n).map(|i| Cid::new(format!("{file_id}-{i}"))).collect(),
        }
    }

    #[test]
    fn unregistered_file_yields_no_prefetch() {
        let tracker = SequentialAccessTracker::new();
        let hits = tracker.track_access("unknown", &Cid::new("x"));
        assert!(hits.is_empty());
    }

    #[test]
    fn sequential_access_triggers_prefetch() {
        let tracker = SequentialAccessTracker::new();
        tracker.register_descriptor(descriptor("f1", 10));
        tracker.track_access("f1", &Cid::new("f1-0"));
        let hits = tracker.track_access("f1", &Cid::new("f1-1"));
        assert_eq!(hits.len(), PREFETCH_DEPTH);
        assert_eq!(hits[0], Cid::new("f1-2"));
    }

    #[test]
    fn random_access_does_not_trigger_prefetch() {
        let tracker = SequentialAccessTracker::new();
        tracker.register_descriptor(descriptor("f2", 10));
        tracker.track_access("f2", &Cid::new("f2-0"));
        let hits = tracker.track_access("f2", &Cid::new("f2-7"));
        assert!(hits.is_empty());
    }

    #[test]
    fn capacity_eviction_drops_oldest_pattern() {
        let tracker = SequentialAccessTracker::new();
        for i in 0..(MAX_PATTERNS + 10) {
            tracker.register_descriptor(descriptor(&format!("file-{i}"), 3));
        }
        assert!(tracker.pattern_count() <= MAX_PATTERNS);
    }

    #[test]
    fn enqueue_dedups_in_flight_blocks() {
        let tracker = SequentialAccessTracker::new();
        let cid = Cid::new("dup");
        tracker.enqueue_prefetch(vec![cid.clone(), cid.clone()]);
        assert_eq!(tracker.in_flight.lock().len(), 1);
    }
}
