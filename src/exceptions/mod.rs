//! Exception bridge between host errors and the foreign error indicator.
//!
//! ## Foreign → host
//!
//! A raising interpreter call leaves an exception triple (type, value,
//! traceback) pending. `ForeignException::fetch` takes it, normalizes it so
//! the value is an instance of the type, and wraps each component in a
//! `ForeignObject`. The result is returned as `BridgeError::Foreign`.
//!
//! ## Host → foreign
//!
//! `set_error_from` raises a host error inside the interpreter. A host error
//! that carries a captured `ForeignException` restores that exact triple, so
//! an exception passing through host code comes out unchanged on the other
//! side. Any other error is raised as an instance of a class named after
//! the host error type.
//!
//! ## Formatting
//!
//! `ForeignException::format` produces the interpreter's standard report:
//!
//! ```text
//! Traceback (most recent call last):
//!   File "<string>", line 1, in <module>
//!     [][0]
//! IndexError: list index out of range
//! ```
//!
//! Exceptions without a traceback format as the host location where they
//! were captured (`  at src/lib.rs:10:5`).

pub mod bridge;
mod foreign_exception;
mod table;

pub use bridge::{
    ExceptionTriple, check_pending, clear, deprecation, error_occurred, exception_matches, format,
    normalize, raise_type_error, set_cause, set_error, set_error_from, set_error_object, warn,
};
pub use foreign_exception::ForeignException;
pub use table::PredefinedExceptions;
