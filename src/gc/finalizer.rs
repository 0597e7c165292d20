//! Finalizer service: drains deferred releases under the interpreter lock.
//!
//! A drain takes a snapshot of the pending queue and, for each record:
//!
//! 1. runs its dispose hook (failures are reported, the batch continues)
//! 2. validates the observed refcount against the registered owners
//! 3. releases the reference and logs the record as collected
//!
//! Deferrals that arrive while a drain is running land in the next
//! generation. An unsuppressed refcount mismatch stops the drain: the
//! offending record is quarantined and the unprocessed rest is re-queued.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::events::{Handlers, SubscriptionId};
use super::pending_queue::PendingRelease;
use super::tracker::{RecordState, ReferenceTracker, WrapperRecord, run_dispose_hook};
use crate::error::BridgeError;
use crate::interp::{Interpreter, ObjId};

/// Payload of the `CollectOnce` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectArgs {
    /// Records released by the drain
    pub object_count: usize,
    /// Queue generation that was drained
    pub generation: u64,
}

/// Payload of the `ErrorHandler` event.
#[derive(Debug)]
pub struct FinalizerErrorArgs {
    /// Record being processed, if the error belongs to one
    pub record: Option<Arc<WrapperRecord>>,
    pub error: BridgeError,
}

/// Diagnostic entry for a released record. The handle is stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedObject {
    pub record_id: u64,
    pub handle: ObjId,
    pub type_name: String,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerState {
    Idle,
    Accumulating,
    Draining,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizerStats {
    pub drains: u64,
    pub released: u64,
    pub errors: u64,
}

/// A handle's refcount is lower than the number of records owning it.
#[derive(Debug, thiserror::Error)]
#[error(
    "incorrect refcount for {handle}: observed {observed}, expected at least {expected} ({} records impacted)",
    .impacted.len()
)]
pub struct IncorrectRefCountException {
    pub handle: ObjId,
    pub observed: isize,
    pub expected: usize,
    /// Every record registered for the handle, including the one being drained
    pub impacted: Vec<Arc<WrapperRecord>>,
}

pub type CollectOnceHandler = dyn Fn(&CollectArgs) + Send + Sync;
pub type ErrorHandler = dyn Fn(&FinalizerErrorArgs) + Send + Sync;

/// Offered every refcount mismatch before it is raised. May repair the
/// count through the interpreter; returns true to suppress the error.
pub type IncorrectRefCntResolver = dyn Fn(&mut Interpreter, &IncorrectRefCountException) -> bool + Send + Sync;

/// Resets the draining flag when a drain ends, including by panic.
struct DrainFlag<'a>(&'a AtomicBool);

impl Drop for DrainFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The part of a drain snapshot not processed yet.
///
/// Whatever is left when it drops goes back to the front of the queue, so a
/// panicking resolver or error handler cannot strand the rest of the batch.
/// The record being processed during the panic is quarantined.
struct Unprocessed<'a> {
    tracker: &'a ReferenceTracker,
    batch: VecDeque<PendingRelease>,
    current: Option<Arc<WrapperRecord>>,
}

impl Drop for Unprocessed<'_> {
    fn drop(&mut self) {
        if let Some(record) = self.current.take()
            && std::thread::panicking()
            && record.state() == RecordState::Deferred
        {
            self.tracker.quarantine(&record);
        }

        self.tracker
            .pending()
            .requeue_front(std::mem::take(&mut self.batch));
    }
}

pub struct Finalizer {
    threshold: AtomicUsize,
    validate: AtomicBool,
    draining: AtomicBool,
    collect_once: Handlers<CollectOnceHandler>,
    errors: Handlers<ErrorHandler>,
    resolvers: Handlers<IncorrectRefCntResolver>,
    collected: Mutex<Arc<[CollectedObject]>>,
    drains: AtomicU64,
    released: AtomicU64,
    error_count: AtomicU64,
}

impl Finalizer {
    pub fn new(threshold: usize, validate: bool) -> Self {
        Self {
            threshold: AtomicUsize::new(threshold.max(1)),
            validate: AtomicBool::new(validate),
            draining: AtomicBool::new(false),
            collect_once: Handlers::default(),
            errors: Handlers::default(),
            resolvers: Handlers::default(),
            collected: Mutex::new(Arc::from(Vec::new())),
            drains: AtomicU64::new(0),
            released: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::Acquire)
    }

    /// Set the queue length that triggers a drain on registration (min 1).
    pub fn set_threshold(&self, threshold: usize) {
        self.threshold.store(threshold.max(1), Ordering::Release);
    }

    pub fn validates_refcounts(&self) -> bool {
        self.validate.load(Ordering::Acquire)
    }

    pub fn set_refcount_validation(&self, enabled: bool) {
        self.validate.store(enabled, Ordering::Release);
    }

    pub fn on_collect_once<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&CollectArgs) + Send + Sync + 'static,
    {
        self.collect_once.subscribe(Arc::new(handler))
    }

    pub fn on_error<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&FinalizerErrorArgs) + Send + Sync + 'static,
    {
        self.errors.subscribe(Arc::new(handler))
    }

    pub fn add_resolver<F>(&self, resolver: F) -> SubscriptionId
    where
        F: Fn(&mut Interpreter, &IncorrectRefCountException) -> bool + Send + Sync + 'static,
    {
        self.resolvers.subscribe(Arc::new(resolver))
    }

    /// Remove a handler or resolver. Returns false for unknown ids.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.collect_once.unsubscribe(id) || self.errors.unsubscribe(id) || self.resolvers.unsubscribe(id)
    }

    pub fn state(&self, tracker: &ReferenceTracker) -> FinalizerState {
        if self.draining.load(Ordering::Acquire) {
            FinalizerState::Draining
        } else if tracker.pending().has_pending() {
            FinalizerState::Accumulating
        } else {
            FinalizerState::Idle
        }
    }

    pub fn should_collect(&self, tracker: &ReferenceTracker) -> bool {
        tracker.pending().len() >= self.threshold() as u64
    }

    /// Records released by the most recent drain.
    pub fn collected_objects(&self) -> Arc<[CollectedObject]> {
        self.collected
            .lock()
            .expect("collected object log poisoned")
            .clone()
    }

    pub fn stats(&self) -> FinalizerStats {
        FinalizerStats {
            drains: self.drains.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            errors: self.error_count.load(Ordering::Relaxed),
        }
    }

    /// Drain the current generation of the pending queue.
    ///
    /// The caller holds the interpreter lock (proved by `interp`). Returns
    /// the number of records released. A drain started while another one is
    /// running returns `Ok(0)`.
    pub fn collect(&self, interp: &mut Interpreter, tracker: &ReferenceTracker) -> Result<usize, BridgeError> {
        if self.draining.swap(true, Ordering::AcqRel) {
            tracing::trace!("Drain already in progress, skipping nested collect");
            return Ok(0);
        }
        let _flag = DrainFlag(&self.draining);

        let (generation, batch) = tracker.pending().take_snapshot();
        let validate = self.validates_refcounts();
        let mut log = Vec::with_capacity(batch.len());

        tracing::debug!(
            "Draining generation {} ({} pending releases)",
            generation,
            batch.len()
        );

        let mut rest = Unprocessed {
            tracker,
            batch,
            current: None,
        };

        while let Some(item) = rest.batch.pop_front() {
            let record = item.record;
            rest.current = Some(record.clone());

            if let Some(hook) = item.hook
                && let Err(e) = run_dispose_hook(hook, &record)
            {
                self.report_error(Some(record.clone()), e);
            }

            if record.state() != RecordState::Deferred {
                tracing::trace!("Record {} no longer deferred, skipping", record.id());
                continue;
            }

            if validate && let Err(exc) = self.validate(interp, tracker, &record) {
                tracker.quarantine(&record);
                rest.current = None;
                drop(rest);
                self.finish(generation, log);
                self.error_count.fetch_add(1, Ordering::Relaxed);
                return Err(exc.into());
            }

            match interp.decref(record.handle()) {
                Ok(remaining) => {
                    if validate {
                        self.check_remaining(tracker, &record, remaining);
                    }
                }
                Err(e) => {
                    // Nothing was released, so the record is not logged
                    tracker.quarantine(&record);
                    rest.current = None;
                    self.report_error(Some(record.clone()), e.into());
                    continue;
                }
            }

            tracker.complete_release(&record);
            rest.current = None;
            log.push(CollectedObject {
                record_id: record.id(),
                handle: record.handle(),
                type_name: record.type_name().to_string(),
                generation,
            });
        }

        drop(rest);
        let count = log.len();
        self.finish(generation, log);

        if count > 0 {
            tracing::debug!("Drained {} records from generation {}", count, generation);

            let args = CollectArgs {
                object_count: count,
                generation,
            };
            for handler in self.collect_once.snapshot() {
                handler(&args);
            }
        }

        Ok(count)
    }

    /// Drain only if the queue reached the threshold. Errors are reported,
    /// never returned.
    pub fn collect_throttled(&self, interp: &mut Interpreter, tracker: &ReferenceTracker) -> usize {
        if !self.should_collect(tracker) {
            return 0;
        }

        match self.collect(interp, tracker) {
            Ok(count) => count,
            Err(e) => {
                self.report_error(None, e);
                0
            }
        }
    }

    /// Deliver an error to the `ErrorHandler` subscribers, or log it.
    pub fn report_error(&self, record: Option<Arc<WrapperRecord>>, error: BridgeError) {
        self.error_count.fetch_add(1, Ordering::Relaxed);

        let handlers = self.errors.snapshot();
        if handlers.is_empty() {
            match &record {
                Some(r) => tracing::error!(
                    "Finalizer error on record {} ({}): {}",
                    r.id(),
                    r.type_name(),
                    error
                ),
                None => tracing::error!("Finalizer error: {}", error),
            }
            return;
        }

        let args = FinalizerErrorArgs { record, error };
        for handler in handlers {
            handler(&args);
        }
    }

    fn validate(
        &self,
        interp: &mut Interpreter,
        tracker: &ReferenceTracker,
        record: &Arc<WrapperRecord>,
    ) -> Result<(), IncorrectRefCountException> {
        let handle = record.handle();
        let observed = interp.refcount(handle).unwrap_or(0);
        let impacted = tracker.owners_of(handle);
        let others = impacted.iter().filter(|r| r.id() != record.id()).count();
        let expected = others + 1;

        if observed >= expected as isize {
            return Ok(());
        }

        let exc = IncorrectRefCountException {
            handle,
            observed,
            expected,
            impacted,
        };
        tracing::warn!("{}", exc);

        for resolver in self.resolvers.snapshot() {
            if resolver(interp, &exc) {
                tracing::debug!("Refcount mismatch on {} suppressed by resolver", handle);
                return Ok(());
            }
        }

        Err(exc)
    }

    fn check_remaining(&self, tracker: &ReferenceTracker, record: &Arc<WrapperRecord>, remaining: isize) {
        let impacted = tracker.owners_of(record.handle());
        let others = impacted.iter().filter(|r| r.id() != record.id()).count();

        if remaining >= others as isize {
            return;
        }

        let exc = IncorrectRefCountException {
            handle: record.handle(),
            observed: remaining,
            expected: others,
            impacted,
        };
        self.report_error(Some(record.clone()), exc.into());
    }

    fn finish(&self, generation: u64, log: Vec<CollectedObject>) {
        self.drains.fetch_add(1, Ordering::Relaxed);
        self.released.fetch_add(log.len() as u64, Ordering::Relaxed);

        *self.collected.lock().expect("collected object log poisoned") = Arc::from(log);
        tracing::trace!("Published collected log for generation {}", generation);
    }
}

impl std::fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Finalizer")
            .field("threshold", &self.threshold())
            .field("validate", &self.validates_refcounts())
            .field("draining", &self.draining.load(Ordering::Relaxed))
            .field("stats", &self.stats())
            .finish()
    }
}
