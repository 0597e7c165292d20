//! InterpLock - RAII guard over a runtime's interpreter lock.
//!
//! Every operation that touches the foreign interpreter takes
//! `&mut Interpreter`, and the only way to get one is through this guard, so
//! "lock held" is checked by the compiler.
//!
//! The lock is not reentrant. Acquiring it twice on the same thread would
//! deadlock, so the guard records which runtimes the current thread holds
//! and panics on the second acquisition instead.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, MutexGuard, PoisonError, TryLockError};

use super::tracker::{ReferenceTracker, WrapperRecord};
use crate::error::BridgeError;
use crate::exceptions::PredefinedExceptions;
use crate::interp::{Interpreter, ObjId};
use crate::runtime::{BridgeRuntime, LockedState};

thread_local! {
    /// Ids of the runtimes whose lock this thread currently holds.
    static HELD_RUNTIMES: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Proof that the current thread holds a runtime's interpreter lock.
///
/// # Example
///
/// ```ignore
/// let runtime = BridgeRuntime::initialize(BridgeConfig::default());
///
/// let mut gil = runtime.lock();
/// let value = ForeignObject::int(&mut gil, 42)?;
/// value.dispose(&mut gil)?;
/// ```
pub struct InterpLock<'a> {
    runtime: &'a BridgeRuntime,
    state: MutexGuard<'a, LockedState>,
}

impl<'a> InterpLock<'a> {
    /// Block until the runtime's lock is available.
    ///
    /// # Panics
    ///
    /// If the current thread already holds this runtime's lock.
    pub fn acquire(runtime: &'a BridgeRuntime) -> Self {
        if Self::is_held(runtime.id()) {
            panic!(
                "interpreter lock of runtime {} is already held by this thread",
                runtime.id()
            );
        }

        let state = runtime.state().lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Interpreter lock of runtime {} was poisoned", runtime.id());
            poisoned.into_inner()
        });

        Self::enter(runtime, state)
    }

    /// Acquire only if nobody holds the lock right now.
    pub fn try_acquire(runtime: &'a BridgeRuntime) -> Option<Self> {
        if Self::is_held(runtime.id()) {
            return None;
        }

        let state = match runtime.state().try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(poisoned)) => PoisonError::into_inner(poisoned),
            Err(TryLockError::WouldBlock) => return None,
        };

        Some(Self::enter(runtime, state))
    }

    fn enter(runtime: &'a BridgeRuntime, state: MutexGuard<'a, LockedState>) -> Self {
        HELD_RUNTIMES.with(|held| held.borrow_mut().push(runtime.id()));
        log::trace!("Acquired interpreter lock of runtime {}", runtime.id());

        Self { runtime, state }
    }

    /// True if the current thread holds the lock of runtime `runtime_id`.
    pub fn is_held(runtime_id: u64) -> bool {
        HELD_RUNTIMES.with(|held| held.borrow().contains(&runtime_id))
    }

    pub fn runtime(&self) -> &'a BridgeRuntime {
        self.runtime
    }

    pub fn interpreter(&mut self) -> &mut Interpreter {
        &mut self.state.interp
    }

    pub fn exceptions(&self) -> &PredefinedExceptions {
        &self.state.exceptions
    }

    pub(crate) fn state_mut(&mut self) -> &mut LockedState {
        &mut self.state
    }

    pub fn tracker(&self) -> &Arc<ReferenceTracker> {
        self.runtime.tracker()
    }

    /// Drain pending releases now.
    pub fn collect(&mut self) -> Result<usize, BridgeError> {
        self.runtime
            .finalizer()
            .collect(&mut self.state.interp, self.runtime.tracker())
    }

    /// Register ownership of one reference to `handle`, then drain if the
    /// queue reached the threshold.
    pub fn register(&mut self, handle: ObjId) -> Result<Arc<WrapperRecord>, BridgeError> {
        let tracker = self.runtime.tracker();
        let record = tracker.register(&self.state.interp, handle)?;

        self.runtime
            .finalizer()
            .collect_throttled(&mut self.state.interp, tracker);

        Ok(record)
    }

    pub fn release_now(&mut self, record: &WrapperRecord) -> Result<(), BridgeError> {
        self.runtime
            .tracker()
            .release_now(&mut self.state.interp, record)
    }
}

impl Deref for InterpLock<'_> {
    type Target = Interpreter;

    fn deref(&self) -> &Interpreter {
        &self.state.interp
    }
}

impl DerefMut for InterpLock<'_> {
    fn deref_mut(&mut self) -> &mut Interpreter {
        &mut self.state.interp
    }
}

impl Drop for InterpLock<'_> {
    fn drop(&mut self) {
        let id = self.runtime.id();

        HELD_RUNTIMES.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&r| r == id) {
                held.remove(pos);
            }
        });

        log::trace!("Released interpreter lock of runtime {}", id);
    }
}

impl std::fmt::Debug for InterpLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpLock")
            .field("runtime", &self.runtime.id())
            .finish()
    }
}
