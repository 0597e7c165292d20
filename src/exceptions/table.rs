//! Predefined exception table.
//!
//! Well-known exception and warning classes, looked up by name when a
//! runtime is initialized. Each entry holds its own reference to the class.
//! Names the interpreter does not define resolve to `None`.

use crate::interp::{Interpreter, ObjId};

/// Declare the table struct, its name list and lookups.
///
/// # Example
/// ```ignore
/// predefined_exceptions! {
///     index_error => "IndexError",
/// }
/// ```
macro_rules! predefined_exceptions {
    ($($field:ident => $name:literal),* $(,)?) => {
        /// Borrowable handles to well-known exception classes.
        #[derive(Debug, Clone, Default)]
        pub struct PredefinedExceptions {
            $(pub $field: Option<ObjId>,)*
        }

        impl PredefinedExceptions {
            /// Every name the table tries to resolve.
            pub const NAMES: &'static [&'static str] = &[$($name),*];

            /// Look up every entry by name, taking a reference to each class found.
            pub fn resolve(interp: &mut Interpreter) -> Self {
                let mut missing = Vec::new();

                let table = Self {
                    $($field: lookup(interp, $name, &mut missing),)*
                };

                if !missing.is_empty() {
                    tracing::debug!(
                        "Predefined exceptions not defined by the interpreter: {}",
                        missing.join(", ")
                    );
                }

                table
            }

            /// Borrowed handle of the class named `name`, if resolved.
            pub fn get(&self, name: &str) -> Option<ObjId> {
                match name {
                    $($name => self.$field,)*
                    _ => None,
                }
            }

            /// Number of resolved entries.
            pub fn resolved(&self) -> usize {
                [$(self.$field.is_some()),*].iter().filter(|r| **r).count()
            }

            /// Release every reference held by the table and empty it.
            pub fn release(&mut self, interp: &mut Interpreter) {
                $(
                    if let Some(class) = self.$field.take() {
                        let _ = interp.decref(class);
                    }
                )*
            }
        }
    };
}

fn lookup(interp: &mut Interpreter, name: &'static str, missing: &mut Vec<&'static str>) -> Option<ObjId> {
    match interp.lookup_builtin(name) {
        Some(class) if interp.is_exception_class(class) && interp.incref(class).is_ok() => Some(class),
        _ => {
            missing.push(name);
            None
        }
    }
}

predefined_exceptions! {
    base_exception => "BaseException",
    exception => "Exception",
    arithmetic_error => "ArithmeticError",
    assertion_error => "AssertionError",
    attribute_error => "AttributeError",
    buffer_error => "BufferError",
    eof_error => "EOFError",
    environment_error => "EnvironmentError",
    floating_point_error => "FloatingPointError",
    io_error => "IOError",
    import_error => "ImportError",
    indentation_error => "IndentationError",
    index_error => "IndexError",
    key_error => "KeyError",
    keyboard_interrupt => "KeyboardInterrupt",
    lookup_error => "LookupError",
    memory_error => "MemoryError",
    name_error => "NameError",
    not_implemented_error => "NotImplementedError",
    os_error => "OSError",
    overflow_error => "OverflowError",
    recursion_error => "RecursionError",
    reference_error => "ReferenceError",
    runtime_error => "RuntimeError",
    stop_iteration => "StopIteration",
    syntax_error => "SyntaxError",
    system_error => "SystemError",
    system_exit => "SystemExit",
    tab_error => "TabError",
    timeout_error => "TimeoutError",
    type_error => "TypeError",
    unbound_local_error => "UnboundLocalError",
    unicode_decode_error => "UnicodeDecodeError",
    unicode_encode_error => "UnicodeEncodeError",
    unicode_error => "UnicodeError",
    unicode_translate_error => "UnicodeTranslateError",
    value_error => "ValueError",
    windows_error => "WindowsError",
    zero_division_error => "ZeroDivisionError",
    warning => "Warning",
    bytes_warning => "BytesWarning",
    deprecation_warning => "DeprecationWarning",
    future_warning => "FutureWarning",
    import_warning => "ImportWarning",
    pending_deprecation_warning => "PendingDeprecationWarning",
    resource_warning => "ResourceWarning",
    runtime_warning => "RuntimeWarning",
    syntax_warning => "SyntaxWarning",
    unicode_warning => "UnicodeWarning",
    user_warning => "UserWarning",
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_entries_are_tolerated() {
        let mut interp = Interpreter::new();
        let table = PredefinedExceptions::resolve(&mut interp);

        assert!(table.index_error.is_some());
        assert!(table.warning.is_some());
        assert!(table.windows_error.is_none());
        assert!(table.tab_error.is_none());
        assert!(table.resolved() < PredefinedExceptions::NAMES.len());
    }

    #[test]
    fn test_aliases_resolve_to_same_class() {
        let mut interp = Interpreter::new();
        let table = PredefinedExceptions::resolve(&mut interp);

        assert_eq!(table.io_error, table.os_error);
        assert_eq!(table.get("EnvironmentError"), table.os_error);
        assert_eq!(table.get("NoSuchError"), None);
    }

    #[test]
    fn test_release_drops_references() {
        let mut interp = Interpreter::new();
        let index_error = interp.lookup_builtin("IndexError").unwrap();
        let before = interp.refcount(index_error).unwrap();

        let mut table = PredefinedExceptions::resolve(&mut interp);
        assert_eq!(interp.refcount(index_error), Some(before + 1));

        table.release(&mut interp);
        assert_eq!(interp.refcount(index_error), Some(before));
        assert_eq!(table.resolved(), 0);
    }
}
