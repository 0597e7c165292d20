//! Background drains via a collector thread.
//!
//! Drains normally run when the application asks for them (`collect`) or
//! when a registration finds the queue above the threshold. A long-running
//! host that rarely registers new wrappers can instead start a collector
//! thread that drains the queue periodically.
//!
//! ## How it works
//!
//! 1. Guard spawns a thread holding a weak reference to the runtime
//! 2. Thread sleeps for the interval or until cancellation
//! 3. On wake-up: if releases are pending and the lock is free, drains
//! 4. On drop: sends cancellation signal, joins thread
//!
//! The thread only ever `try`-locks the interpreter, so dropping the guard
//! while holding the lock cannot deadlock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use super::interp_lock::InterpLock;
use crate::runtime::BridgeRuntime;

/// RAII guard owning the background collector thread.
///
/// # Example
///
/// ```rust,ignore
/// let runtime = BridgeRuntime::initialize(BridgeConfig::default());
/// {
///     let _collector = runtime.start_collector(Duration::from_millis(50));
///     // Wrappers dropped here are released in the background
/// } // Guard dropped here, thread stopped
/// ```
pub struct CollectorGuard {
    /// Channel to send cancellation signal to the collector
    cancel_tx: Option<mpsc::Sender<()>>,
    /// Handle to join the collector thread
    thread_handle: Option<thread::JoinHandle<()>>,
    /// Drains performed
    passes: Arc<AtomicU64>,
    /// Records released by those drains
    released: Arc<AtomicU64>,
}

impl CollectorGuard {
    /// Start a collector for `runtime`, draining every `interval`.
    ///
    /// A zero interval creates a disabled guard (no thread).
    pub fn new(runtime: Weak<BridgeRuntime>, interval: Duration) -> Self {
        let passes = Arc::new(AtomicU64::new(0));
        let released = Arc::new(AtomicU64::new(0));

        if interval.is_zero() {
            return Self {
                cancel_tx: None,
                thread_handle: None,
                passes,
                released,
            };
        }

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        let passes_clone = passes.clone();
        let released_clone = released.clone();

        let spawned = thread::Builder::new()
            .name("refbridge-collector".into())
            .spawn(move || {
                loop {
                    match cancel_rx.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        // Cancelled, or guard dropped
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }

                    let Some(runtime) = runtime.upgrade() else {
                        break;
                    };

                    if !runtime.tracker().pending().has_pending() {
                        continue;
                    }

                    let Some(mut gil) = InterpLock::try_acquire(&runtime) else {
                        tracing::trace!("Interpreter busy, collector skipping pass");
                        continue;
                    };

                    passes_clone.fetch_add(1, Ordering::Relaxed);

                    match gil.collect() {
                        Ok(count) => {
                            released_clone.fetch_add(count as u64, Ordering::Relaxed);
                        }
                        Err(e) => runtime.finalizer().report_error(None, e),
                    }
                }

                tracing::debug!("Collector thread stopped");
            });

        match spawned {
            Ok(thread_handle) => Self {
                cancel_tx: Some(cancel_tx),
                thread_handle: Some(thread_handle),
                passes,
                released,
            },
            Err(e) => {
                tracing::error!("Failed to spawn collector thread: {}", e);
                Self {
                    cancel_tx: None,
                    thread_handle: None,
                    passes,
                    released,
                }
            }
        }
    }

    /// True if a collector thread is running.
    pub fn is_active(&self) -> bool {
        self.thread_handle.is_some()
    }

    /// Number of drains the collector performed.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Number of records the collector released.
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }
}

impl Drop for CollectorGuard {
    fn drop(&mut self) {
        // Ignore error if thread already exited
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }

        if let Some(handle) = self.thread_handle.take()
            && let Err(e) = handle.join()
        {
            tracing::error!("Collector thread panicked: {:?}", e);
        }
    }
}
