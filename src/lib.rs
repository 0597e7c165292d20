pub mod config;
pub mod error;
pub mod exceptions;
pub mod gc;
pub mod interp;
pub mod object;
pub mod runtime;

// Core API
pub use config::BridgeConfig;
pub use error::{BridgeError, HookError};
pub use object::ForeignObject;
pub use runtime::{BridgeRuntime, ShutdownReport};

// Lifetime and exception bridge
pub use exceptions::{ExceptionTriple, ForeignException, PredefinedExceptions};
pub use gc::{
    CollectArgs, CollectedObject, Finalizer, FinalizerErrorArgs, FinalizerState,
    IncorrectRefCountException, InterpLock, RecordState, ReferenceTracker, SubscriptionId,
    WrapperRecord,
};
