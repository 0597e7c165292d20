//! `ForeignObject` - an owned reference to a foreign object.
//!
//! The wrapper owns exactly one foreign reference. It can be released two
//! ways:
//!
//! - `dispose(&mut gil)` releases it immediately (the lock is held)
//! - dropping the wrapper queues it for the next drain
//!
//! Dropping never takes the interpreter lock, so wrappers may be dropped on
//! any thread, including while the lock is held elsewhere.

use std::sync::Arc;

use crate::error::BridgeError;
use crate::exceptions::bridge::fetch_raised;
use crate::gc::{DisposeHook, InterpLock, RecordState, ReferenceTracker, WrapperRecord};
use crate::interp::ObjId;

pub struct ForeignObject {
    record: Arc<WrapperRecord>,
    tracker: Arc<ReferenceTracker>,
    hook: Option<DisposeHook>,
}

impl ForeignObject {
    /// Wrap a new reference. The wrapper takes ownership of it.
    pub fn from_owned(gil: &mut InterpLock<'_>, handle: ObjId) -> Result<Self, BridgeError> {
        let record = gil.register(handle)?;

        Ok(Self {
            record,
            tracker: gil.tracker().clone(),
            hook: None,
        })
    }

    /// Wrap a borrowed reference, taking a new reference for the wrapper.
    pub fn from_borrowed(gil: &mut InterpLock<'_>, handle: ObjId) -> Result<Self, BridgeError> {
        if handle.is_null() {
            return Err(BridgeError::NullHandle);
        }

        gil.incref(handle)?;

        match Self::from_owned(gil, handle) {
            Ok(obj) => Ok(obj),
            Err(e) => {
                let _ = gil.decref(handle);
                Err(e)
            }
        }
    }

    pub fn none(gil: &mut InterpLock<'_>) -> Result<Self, BridgeError> {
        let handle = gil.none();
        Self::from_owned(gil, handle)
    }

    pub fn int(gil: &mut InterpLock<'_>, value: i64) -> Result<Self, BridgeError> {
        let handle = gil.new_int(value);
        Self::from_owned(gil, handle)
    }

    pub fn str(gil: &mut InterpLock<'_>, value: &str) -> Result<Self, BridgeError> {
        let handle = gil.new_str(value);
        Self::from_owned(gil, handle)
    }

    /// Build a foreign list holding new references to `items`.
    pub fn list(gil: &mut InterpLock<'_>, items: &[&ForeignObject]) -> Result<Self, BridgeError> {
        let mut handles = Vec::with_capacity(items.len());

        for item in items {
            item.check_runtime(gil, "list")?;
            gil.incref(item.handle())?;
            handles.push(item.handle());
        }

        let handle = gil.new_list(handles);
        Self::from_owned(gil, handle)
    }

    /// Run `hook` when the reference is released, by `dispose` or by a drain.
    pub fn with_dispose_hook<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&WrapperRecord) -> Result<(), crate::error::HookError> + Send + Sync + 'static,
    {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Borrowed handle. Valid while the wrapper is alive.
    pub fn handle(&self) -> ObjId {
        self.record.handle()
    }

    pub fn record(&self) -> &Arc<WrapperRecord> {
        &self.record
    }

    /// Foreign type name captured when the object was wrapped.
    pub fn type_name(&self) -> &str {
        self.record.type_name()
    }

    pub fn refcount(&self, gil: &InterpLock<'_>) -> Option<isize> {
        gil.refcount(self.handle())
    }

    /// `str()` of the foreign object.
    pub fn str_value(&self, gil: &InterpLock<'_>) -> String {
        gil.str_of(self.handle())
    }

    pub fn repr(&self, gil: &InterpLock<'_>) -> String {
        gil.repr_of(self.handle())
    }

    pub fn is_instance(&self, gil: &InterpLock<'_>, class: ObjId) -> bool {
        gil.is_instance(self.handle(), class)
    }

    /// Second independent wrapper for the same object.
    pub fn clone_ref(&self, gil: &mut InterpLock<'_>) -> Result<Self, BridgeError> {
        self.check_runtime(gil, "clone_ref")?;
        Self::from_borrowed(gil, self.handle())
    }

    /// `self[index]`, with a raised foreign error returned as `Foreign`.
    #[track_caller]
    pub fn get_item(&self, gil: &mut InterpLock<'_>, index: i64) -> Result<Self, BridgeError> {
        self.check_runtime(gil, "get_item")?;

        match gil.get_item(self.handle(), index) {
            Ok(item) => Self::from_owned(gil, item),
            Err(_) => Err(fetch_raised(gil)),
        }
    }

    /// Release the reference now.
    ///
    /// The dispose hook runs first. A failing hook does not prevent the
    /// release; its error is returned afterwards.
    pub fn dispose(mut self, gil: &mut InterpLock<'_>) -> Result<(), BridgeError> {
        self.check_runtime(gil, "dispose")?;

        let hook_result = match self.hook.take() {
            Some(hook) => crate::gc::run_dispose_hook(hook, &self.record),
            None => Ok(()),
        };

        gil.release_now(&self.record)?;
        hook_result
    }

    /// Give up ownership without releasing. The caller now owns the reference.
    pub fn into_handle(mut self) -> Result<ObjId, BridgeError> {
        self.hook = None;
        self.tracker.detach(&self.record)
    }

    pub(crate) fn check_runtime(&self, gil: &InterpLock<'_>, operation: &'static str) -> Result<(), BridgeError> {
        if Arc::ptr_eq(&self.tracker, gil.tracker()) {
            Ok(())
        } else {
            Err(BridgeError::misuse(
                operation,
                format!("{} belongs to another runtime", self.handle()),
            ))
        }
    }
}

impl Drop for ForeignObject {
    fn drop(&mut self) {
        if self.record.state() != RecordState::Live {
            return;
        }

        self.tracker
            .defer_release(self.record.clone(), self.hook.take());
    }
}

impl std::fmt::Debug for ForeignObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignObject")
            .field("handle", &self.handle())
            .field("type_name", &self.type_name())
            .field("state", &self.record.state())
            .finish()
    }
}
