//! Error kinds surfaced by the bridge.
//!
//! Ordinary foreign failures (`Foreign`) are kept apart from bridge bugs
//! (`IncorrectRefCount`, `Misuse`, `NullHandle`) so callers can tell a
//! raised exception from a broken invariant.

use crate::exceptions::ForeignException;
use crate::gc::IncorrectRefCountException;
use crate::interp::HeapError;

/// Error returned by a wrapper's dispose hook.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// An exception raised inside the foreign interpreter.
    #[error(transparent)]
    Foreign(#[from] ForeignException),

    /// Refcount validation found fewer references than registered wrappers.
    #[error(transparent)]
    IncorrectRefCount(#[from] IncorrectRefCountException),

    /// A dispose hook failed while its wrapper was released.
    #[error("{0}")]
    DisposeHook(HookError),

    /// The bridge API was used in a way that can never succeed.
    #[error("{operation}: {detail}")]
    Misuse {
        operation: &'static str,
        detail: String,
    },

    #[error("cannot wrap a null foreign handle")]
    NullHandle,

    #[error(transparent)]
    Heap(#[from] HeapError),
}

impl BridgeError {
    pub(crate) fn misuse(operation: &'static str, detail: impl Into<String>) -> Self {
        BridgeError::Misuse {
            operation,
            detail: detail.into(),
        }
    }

    /// True for programming errors rather than foreign failures.
    pub fn is_misuse(&self) -> bool {
        matches!(self, BridgeError::Misuse { .. } | BridgeError::NullHandle)
    }

    pub fn as_foreign(&self) -> Option<&ForeignException> {
        match self {
            BridgeError::Foreign(exc) => Some(exc),
            _ => None,
        }
    }
}
