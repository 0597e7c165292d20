//! Lifetime bridging between Rust ownership and foreign refcounts.
//!
//! This module decides when the foreign reference owned by a wrapper is
//! released, and makes sure it happens exactly once and only while the
//! interpreter lock is held.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  InterpLock (RAII)                                          │
//! │  ├── MutexGuard over the runtime's interpreter              │
//! │  ├── Thread-local record of held runtimes (no reentry)      │
//! │  └── Only source of &mut Interpreter                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ReferenceTracker                                           │
//! │  ├── One WrapperRecord per owned reference                  │
//! │  ├── dispose()  → release_now (lock held)                   │
//! │  └── Drop       → defer_release (never locks)               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  PendingQueue                                               │
//! │  ├── Thread-safe, any producer                              │
//! │  └── Snapshot per drain, new pushes → next generation       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Finalizer                                                  │
//! │  ├── Dispose hooks, continue on error                       │
//! │  ├── Refcount validation + resolver chain                   │
//! │  └── CollectOnce / ErrorHandler events                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use refbridge::{BridgeConfig, BridgeRuntime, ForeignObject};
//!
//! let runtime = BridgeRuntime::initialize(BridgeConfig::default().with_threshold(1));
//! runtime.finalizer().on_collect_once(|args| {
//!     println!("released {} objects", args.object_count);
//! });
//!
//! let mut gil = runtime.lock();
//! drop(ForeignObject::int(&mut gil, 1)?);
//! gil.collect()?;
//! ```

mod collector_guard;
mod events;
mod finalizer;
mod interp_lock;
mod pending_queue;
mod tracker;

pub use collector_guard::CollectorGuard;
pub use events::SubscriptionId;
pub use finalizer::{
    CollectArgs, CollectOnceHandler, CollectedObject, ErrorHandler, Finalizer, FinalizerErrorArgs,
    FinalizerState, FinalizerStats, IncorrectRefCntResolver, IncorrectRefCountException,
};
pub use interp_lock::InterpLock;
pub use pending_queue::{PendingQueue, PendingRelease};
pub use tracker::{DisposeHook, RecordState, ReferenceTracker, WrapperRecord};
pub(crate) use tracker::run_dispose_hook;
