//! Runtime context: one interpreter with its tracker, finalizer and
//! predefined exception table.
//!
//! Nothing here is global. Each `BridgeRuntime` is an independent lifecycle
//! (`initialize` → `shutdown`), so tests can create and tear down as many as
//! they like.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::exceptions::PredefinedExceptions;
use crate::gc::{CollectorGuard, Finalizer, InterpLock, ReferenceTracker};
use crate::interp::Interpreter;

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

/// Drains attempted by `shutdown` before the remaining records are released directly.
const SHUTDOWN_DRAIN_PASSES: usize = 16;

/// State guarded by the interpreter lock.
pub(crate) struct LockedState {
    pub(crate) interp: Interpreter,
    pub(crate) exceptions: PredefinedExceptions,
}

/// Outcome of `BridgeRuntime::shutdown`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Records released by the final drains
    pub drained: usize,
    /// Records still owned by live wrappers, released directly
    pub released: usize,
}

pub struct BridgeRuntime {
    id: u64,
    config: BridgeConfig,
    state: Mutex<LockedState>,
    tracker: Arc<ReferenceTracker>,
    finalizer: Finalizer,
    shut_down: AtomicBool,
}

impl BridgeRuntime {
    /// Start a new interpreter and resolve the predefined exception table.
    pub fn initialize(config: BridgeConfig) -> Arc<Self> {
        let id = NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed);
        let mut interp = Interpreter::new();
        let exceptions = PredefinedExceptions::resolve(&mut interp);

        let tracker = Arc::new(ReferenceTracker::new(config.finalizer_enabled));
        let finalizer = Finalizer::new(config.collect_threshold, config.validate_refcounts);

        tracing::debug!(
            "Initialized runtime {} (threshold: {}, validation: {})",
            id,
            finalizer.threshold(),
            finalizer.validates_refcounts()
        );

        Arc::new(Self {
            id,
            config,
            state: Mutex::new(LockedState { interp, exceptions }),
            tracker,
            finalizer,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Acquire the interpreter lock.
    ///
    /// # Panics
    ///
    /// If the current thread already holds it.
    pub fn lock(&self) -> InterpLock<'_> {
        InterpLock::acquire(self)
    }

    pub fn try_lock(&self) -> Option<InterpLock<'_>> {
        InterpLock::try_acquire(self)
    }

    pub fn is_locked_by_current_thread(&self) -> bool {
        InterpLock::is_held(self.id)
    }

    /// Acquire the lock and drain pending releases.
    pub fn collect(&self) -> Result<usize, BridgeError> {
        self.lock().collect()
    }

    pub fn pending_count(&self) -> u64 {
        self.tracker.pending().len()
    }

    pub fn finalizer(&self) -> &Finalizer {
        &self.finalizer
    }

    pub fn tracker(&self) -> &Arc<ReferenceTracker> {
        &self.tracker
    }

    /// Enable or disable queueing of dropped wrappers.
    pub fn set_finalizer_enabled(&self, enabled: bool) {
        self.tracker.set_deferral_enabled(enabled);
    }

    /// Start a background collector draining every `interval`.
    pub fn start_collector(self: &Arc<Self>, interval: Duration) -> CollectorGuard {
        CollectorGuard::new(Arc::downgrade(self), interval)
    }

    /// Start a background collector if `collect_interval_ms` is set.
    pub fn start_collector_from_config(self: &Arc<Self>) -> Option<CollectorGuard> {
        match self.config.collect_interval_ms {
            0 => None,
            ms => Some(self.start_collector(Duration::from_millis(ms))),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> &Mutex<LockedState> {
        &self.state
    }

    /// Drain the queue, release every handle still owned by a wrapper, and
    /// release the predefined exception table.
    ///
    /// Wrappers outliving the runtime become inert: dropping them is a no-op.
    pub fn shutdown(&self) -> Result<ShutdownReport, BridgeError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::misuse(
                "shutdown",
                format!("runtime {} is already shut down", self.id),
            ));
        }

        let mut gil = self.lock();
        let mut report = ShutdownReport::default();

        for _ in 0..SHUTDOWN_DRAIN_PASSES {
            if self.tracker.pending().is_empty() {
                break;
            }

            match gil.collect() {
                Ok(count) => report.drained += count,
                Err(e) => self.finalizer.report_error(None, e),
            }
        }

        let state = &mut *gil.state_mut();
        report.released = self.tracker.release_all(&mut state.interp);
        state.exceptions.release(&mut state.interp);
        state.interp.err_clear();
        state.interp.reset_warning_filters();

        tracing::debug!(
            "Runtime {} shut down (drained: {}, released: {})",
            self.id,
            report.drained,
            report.released
        );

        Ok(report)
    }
}

impl Drop for BridgeRuntime {
    fn drop(&mut self) {
        if !self.is_shut_down() {
            tracing::warn!(
                "Runtime {} dropped without shutdown, {} references not released",
                self.id,
                self.tracker.registered()
            );
            self.tracker.close();
        }
    }
}

impl std::fmt::Debug for BridgeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeRuntime")
            .field("id", &self.id)
            .field("tracker", &self.tracker)
            .field("finalizer", &self.finalizer)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
