//! Pending-release queue for foreign references.
//!
//! This module provides thread-safe deferral of foreign reference releases
//! for wrappers that are dropped without holding the interpreter lock.
//!
//! ## Problem
//!
//! A foreign reference may only be decremented while holding the interpreter
//! lock. A `ForeignObject` can be dropped on any thread, at any time,
//! including while another thread is running foreign code or while the
//! dropping thread itself is inside a drain. Taking the lock from `Drop`
//! risks deadlocks and reentrancy into the interpreter.
//!
//! ## Solution
//!
//! `Drop` only pushes the wrapper's record onto this queue. The finalizer
//! later takes a snapshot of the queue under the lock and performs the
//! decrements. Pushes that arrive during a drain land in the next generation.
//!
//! ## Usage
//!
//! ```ignore
//! use refbridge::gc::PendingQueue;
//!
//! let queue = PendingQueue::new();
//!
//! // From any thread, defer a release
//! queue.push(PendingRelease::new(record, None));
//!
//! // Under the interpreter lock, take the current generation
//! let (generation, batch) = queue.take_snapshot();
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::tracker::{DisposeHook, WrapperRecord};

/// A record waiting for its foreign reference to be released.
pub struct PendingRelease {
    pub(crate) record: Arc<WrapperRecord>,
    pub(crate) hook: Option<DisposeHook>,
}

impl PendingRelease {
    pub fn new(record: Arc<WrapperRecord>, hook: Option<DisposeHook>) -> Self {
        Self { record, hook }
    }

    pub fn record(&self) -> &Arc<WrapperRecord> {
        &self.record
    }
}

impl std::fmt::Debug for PendingRelease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRelease")
            .field("record", &self.record)
            .field("has_hook", &self.hook.is_some())
            .finish()
    }
}

/// Per-runtime queue of pending releases.
///
/// This queue is thread-safe and can receive records from any thread.
/// It is drained by `Finalizer::collect()` under the interpreter lock.
pub struct PendingQueue {
    /// Records pending release
    queue: Mutex<VecDeque<PendingRelease>>,

    /// Fast check for pending items (avoids lock acquisition on hot path)
    pending_count: AtomicU64,

    /// Generation that new pushes belong to
    generation: AtomicU64,
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingQueue {
    /// Create a new empty queue.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(8)),
            pending_count: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// Queue a record for release.
    ///
    /// This is thread-safe, never touches the interpreter and never waits
    /// for the interpreter lock.
    pub fn push(&self, item: PendingRelease) {
        let record_id = item.record.id();
        {
            let mut queue = self.queue.lock().expect("pending release queue poisoned");
            queue.push_back(item);
            self.pending_count.fetch_add(1, Ordering::Release);
        }

        tracing::trace!(
            "Deferred release of record {} (pending: {})",
            record_id,
            self.len()
        );
    }

    /// Check if there are pending releases.
    ///
    /// This is a fast lock-free check.
    #[inline]
    pub fn has_pending(&self) -> bool {
        self.pending_count.load(Ordering::Acquire) > 0
    }

    /// Get the number of pending releases.
    #[inline]
    pub fn len(&self) -> u64 {
        self.pending_count.load(Ordering::Acquire)
    }

    /// Check if the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.has_pending()
    }

    /// Generation that records pushed now will be drained in.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Take every pending release and open the next generation.
    ///
    /// Returns the generation of the taken batch. Pushes racing with this
    /// call either make it into the batch or into the next generation,
    /// never both.
    pub fn take_snapshot(&self) -> (u64, VecDeque<PendingRelease>) {
        let mut queue = self.queue.lock().expect("pending release queue poisoned");
        let generation = self.generation.fetch_add(1, Ordering::AcqRel);
        let batch = std::mem::take(&mut *queue);

        // Count changes happen under the queue mutex so `len` never underflows
        if !batch.is_empty() {
            self.pending_count
                .fetch_sub(batch.len() as u64, Ordering::Release);
        }

        (generation, batch)
    }

    /// Put unprocessed items back at the front, keeping their order.
    pub fn requeue_front(&self, items: VecDeque<PendingRelease>) {
        if items.is_empty() {
            return;
        }

        let count = items.len();
        let mut queue = self.queue.lock().expect("pending release queue poisoned");
        for item in items.into_iter().rev() {
            queue.push_front(item);
        }
        self.pending_count.fetch_add(count as u64, Ordering::Release);

        tracing::debug!("Re-queued {} unprocessed releases", count);
    }
}

impl std::fmt::Debug for PendingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingQueue")
            .field("pending_count", &self.len())
            .field("generation", &self.generation())
            .finish()
    }
}
