//! Reference tracker: one foreign reference per wrapper.
//!
//! Every `ForeignObject` owns exactly one reference to its foreign handle,
//! represented by a `WrapperRecord`. The record is the wrapper's
//! back-reference: its state says whether the wrapper still owns the
//! reference, dropped it, or handed it back.
//!
//! ```text
//!            register
//!               │
//!               ▼
//!   ┌──────── Live ────────┬──────────────┐
//!   │ release_now          │ drop         │ into_handle
//!   ▼                      ▼              ▼
//! Released ◀── drain ── Deferred       Detached
//! ```

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::pending_queue::{PendingQueue, PendingRelease};
use crate::error::{BridgeError, HookError};
use crate::interp::{Interpreter, ObjId};

/// Callback run once when a wrapper's reference is released.
///
/// Runs under the interpreter lock but receives no access to it: it must not
/// try to acquire the lock.
pub type DisposeHook = Box<dyn FnOnce(&WrapperRecord) -> Result<(), HookError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordState {
    /// Owned by a live wrapper.
    Live = 0,
    /// Wrapper dropped; waiting in the pending queue.
    Deferred = 1,
    /// Reference released.
    Released = 2,
    /// Ownership moved out of the bridge without releasing.
    Detached = 3,
}

impl RecordState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RecordState::Live,
            1 => RecordState::Deferred,
            2 => RecordState::Released,
            _ => RecordState::Detached,
        }
    }
}

/// Bookkeeping for one owned foreign reference.
pub struct WrapperRecord {
    id: u64,
    handle: ObjId,
    type_name: String,
    generation: u64,
    state: AtomicU8,
    collected: AtomicBool,
}

impl WrapperRecord {
    pub(crate) fn new(id: u64, handle: ObjId, type_name: String, generation: u64) -> Self {
        Self {
            id,
            handle,
            type_name,
            generation,
            state: AtomicU8::new(RecordState::Live as u8),
            collected: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The foreign handle. Must not be touched once the record is released.
    pub fn handle(&self) -> ObjId {
        self.handle
    }

    /// Foreign type name captured at registration (debug only).
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Pending-queue generation that was open when the record was registered.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> RecordState {
        RecordState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True once a drain released this record.
    pub fn is_collected(&self) -> bool {
        self.collected.load(Ordering::Acquire)
    }

    fn transition(&self, from: RecordState, to: RecordState) -> Result<(), RecordState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(RecordState::from_u8)
    }

    /// Move to `Released` from `Live` or `Deferred`. Returns false if the
    /// record no longer owned its reference.
    fn take_ownership(&self) -> bool {
        self.transition(RecordState::Live, RecordState::Released).is_ok()
            || self
                .transition(RecordState::Deferred, RecordState::Released)
                .is_ok()
    }
}

impl std::fmt::Debug for WrapperRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrapperRecord")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("type_name", &self.type_name)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish()
    }
}

/// Run a dispose hook, turning both `Err` and panics into a `BridgeError`.
pub(crate) fn run_dispose_hook(hook: DisposeHook, record: &WrapperRecord) -> Result<(), BridgeError> {
    match catch_unwind(AssertUnwindSafe(|| hook(record))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(BridgeError::DisposeHook(e)),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "dispose hook panicked".to_string());

            Err(BridgeError::DisposeHook(message.into()))
        }
    }
}

/// Registry of owned foreign references for one runtime.
pub struct ReferenceTracker {
    queue: PendingQueue,
    owners: Mutex<HashMap<ObjId, Vec<Arc<WrapperRecord>>>>,
    next_id: AtomicU64,
    open: AtomicBool,
    deferral_enabled: AtomicBool,
}

impl ReferenceTracker {
    pub fn new(deferral_enabled: bool) -> Self {
        Self {
            queue: PendingQueue::new(),
            owners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            open: AtomicBool::new(true),
            deferral_enabled: AtomicBool::new(deferral_enabled),
        }
    }

    /// Take ownership of one reference to `handle`.
    ///
    /// The caller must hold the interpreter lock (proved by `interp`).
    pub fn register(&self, interp: &Interpreter, handle: ObjId) -> Result<Arc<WrapperRecord>, BridgeError> {
        if handle.is_null() {
            return Err(BridgeError::NullHandle);
        }

        if !self.is_open() {
            return Err(BridgeError::misuse(
                "register",
                format!("runtime is shut down, cannot wrap {}", handle),
            ));
        }

        let type_name = interp.type_name(handle).map_err(|e| {
            BridgeError::misuse("register", format!("cannot wrap {}: {}", handle, e))
        })?;

        let record = Arc::new(WrapperRecord::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            handle,
            type_name,
            self.queue.generation(),
        ));

        self.owners_lock()
            .entry(handle)
            .or_default()
            .push(record.clone());

        tracing::trace!("Registered record {} for {}", record.id, handle);
        Ok(record)
    }

    /// Release the record's reference immediately.
    pub fn release_now(&self, interp: &mut Interpreter, record: &WrapperRecord) -> Result<(), BridgeError> {
        if let Err(state) = record.transition(RecordState::Live, RecordState::Released) {
            return Err(BridgeError::misuse(
                "release_now",
                format!("record {} for {} is {:?}", record.id, record.handle, state),
            ));
        }

        self.unregister(record);
        interp.decref(record.handle)?;

        tracing::trace!("Released record {} for {}", record.id, record.handle);
        Ok(())
    }

    /// Queue the record for release by the next drain.
    ///
    /// Never touches the interpreter and never waits for its lock.
    pub fn defer_release(&self, record: Arc<WrapperRecord>, hook: Option<DisposeHook>) {
        if record
            .transition(RecordState::Live, RecordState::Deferred)
            .is_err()
        {
            return;
        }

        if !self.is_open() {
            tracing::trace!("Dropped record {} after shutdown", record.id);
            return;
        }

        if !self.deferral_enabled.load(Ordering::Acquire) {
            tracing::warn!(
                "Finalizer disabled, {} ({}) stays alive until shutdown",
                record.handle,
                record.type_name
            );
            return;
        }

        self.queue.push(PendingRelease::new(record, hook));
    }

    /// Give up ownership without releasing. Returns the handle.
    pub fn detach(&self, record: &WrapperRecord) -> Result<ObjId, BridgeError> {
        if let Err(state) = record.transition(RecordState::Live, RecordState::Detached) {
            return Err(BridgeError::misuse(
                "detach",
                format!("record {} for {} is {:?}", record.id, record.handle, state),
            ));
        }

        self.unregister(record);
        Ok(record.handle)
    }

    /// Records currently owning a reference to `handle`.
    pub fn owners_of(&self, handle: ObjId) -> Vec<Arc<WrapperRecord>> {
        self.owners_lock().get(&handle).cloned().unwrap_or_default()
    }

    /// Number of records currently owning a reference.
    pub fn registered(&self) -> usize {
        self.owners_lock().values().map(Vec::len).sum()
    }

    pub fn pending(&self) -> &PendingQueue {
        &self.queue
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn set_deferral_enabled(&self, enabled: bool) {
        self.deferral_enabled.store(enabled, Ordering::Release);
    }

    /// Mark a drained record released. The caller already decremented.
    pub(crate) fn complete_release(&self, record: &WrapperRecord) {
        let _ = record.transition(RecordState::Deferred, RecordState::Released);
        record.collected.store(true, Ordering::Release);
        self.unregister(record);
    }

    /// Drop a record that failed validation without touching its handle.
    pub(crate) fn quarantine(&self, record: &WrapperRecord) {
        let _ = record.transition(RecordState::Deferred, RecordState::Detached);
        self.unregister(record);

        tracing::warn!(
            "Quarantined record {} for {} ({}), reference not released",
            record.id,
            record.handle,
            record.type_name
        );
    }

    /// Stop accepting registrations and deferrals.
    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Shutdown path: release every record that still owns a reference.
    ///
    /// Pending items are discarded; their records are released here instead.
    pub(crate) fn release_all(&self, interp: &mut Interpreter) -> usize {
        self.close();

        let (_, discarded) = self.queue.take_snapshot();
        if !discarded.is_empty() {
            tracing::debug!("Discarding {} pending releases at shutdown", discarded.len());
        }

        let owners = std::mem::take(&mut *self.owners_lock());
        let mut released = 0;

        for record in owners.into_values().flatten() {
            if !record.take_ownership() {
                continue;
            }

            match interp.decref(record.handle) {
                Ok(_) => released += 1,
                Err(e) => tracing::warn!(
                    "Failed to release record {} ({}) at shutdown: {}",
                    record.id,
                    record.type_name,
                    e
                ),
            }
        }

        released
    }

    fn unregister(&self, record: &WrapperRecord) {
        let mut owners = self.owners_lock();

        if let Some(list) = owners.get_mut(&record.handle) {
            list.retain(|r| r.id != record.id);

            if list.is_empty() {
                owners.remove(&record.handle);
            }
        }
    }

    fn owners_lock(&self) -> std::sync::MutexGuard<'_, HashMap<ObjId, Vec<Arc<WrapperRecord>>>> {
        self.owners.lock().expect("reference tracker registry poisoned")
    }
}

impl std::fmt::Debug for ReferenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceTracker")
            .field("registered", &self.registered())
            .field("pending", &self.queue.len())
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_rejects_null() {
        let interp = Interpreter::new();
        let tracker = ReferenceTracker::new(true);

        assert!(matches!(
            tracker.register(&interp, ObjId::NULL),
            Err(BridgeError::NullHandle)
        ));
    }

    #[test]
    fn test_release_now_twice_is_misuse() {
        let mut interp = Interpreter::new();
        let tracker = ReferenceTracker::new(true);
        let handle = interp.new_int(7);

        let record = tracker.register(&interp, handle).unwrap();
        assert_eq!(record.type_name(), "int");
        tracker.release_now(&mut interp, &record).unwrap();
        assert!(!interp.is_live(handle));

        let err = tracker.release_now(&mut interp, &record).unwrap_err();
        assert!(err.is_misuse());
    }

    #[test]
    fn test_defer_release_queues_once() {
        let mut interp = Interpreter::new();
        let tracker = ReferenceTracker::new(true);
        let handle = interp.new_int(7);
        let record = tracker.register(&interp, handle).unwrap();

        tracker.defer_release(record.clone(), None);
        tracker.defer_release(record.clone(), None);

        assert_eq!(record.state(), RecordState::Deferred);
        assert_eq!(tracker.pending().len(), 1);
        // Still owns its reference until drained
        assert_eq!(tracker.owners_of(handle).len(), 1);
    }

    #[test]
    fn test_deferral_disabled_keeps_record() {
        let mut interp = Interpreter::new();
        let tracker = ReferenceTracker::new(false);
        let handle = interp.new_int(7);
        let record = tracker.register(&interp, handle).unwrap();

        tracker.defer_release(record, None);
        assert!(tracker.pending().is_empty());

        assert_eq!(tracker.release_all(&mut interp), 1);
        assert!(!interp.is_live(handle));
    }

    #[test]
    fn test_detach_returns_handle() {
        let mut interp = Interpreter::new();
        let tracker = ReferenceTracker::new(true);
        let handle = interp.new_int(7);
        let record = tracker.register(&interp, handle).unwrap();

        assert_eq!(tracker.detach(&record).unwrap(), handle);
        assert_eq!(record.state(), RecordState::Detached);
        assert_eq!(tracker.registered(), 0);
        assert_eq!(interp.refcount(handle), Some(1));
    }

    #[test]
    fn test_register_after_close_fails() {
        let mut interp = Interpreter::new();
        let tracker = ReferenceTracker::new(true);
        tracker.release_all(&mut interp);

        let handle = interp.new_int(1);
        assert!(tracker.register(&interp, handle).unwrap_err().is_misuse());
    }

    #[test]
    fn test_hook_panic_is_reported() {
        let record = WrapperRecord::new(1, ObjId::NULL, "int".to_string(), 0);
        let hook: DisposeHook = Box::new(|_| panic!("boom"));

        let err = run_dispose_hook(hook, &record).unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
