//! Builtin types and the builtin exception hierarchy.

use std::collections::BTreeMap;

use super::heap::{Heap, ObjId};
use super::object::{ObjectData, TypeObject};

/// Non-exception builtin types, all deriving from `object`.
const BUILTIN_TYPES: &[&str] = &["type", "NoneType", "bool", "int", "str", "list", "traceback"];

/// Exception and warning classes as (name, base). Parents come first.
const EXCEPTION_HIERARCHY: &[(&str, &str)] = &[
    ("BaseException", "object"),
    ("SystemExit", "BaseException"),
    ("KeyboardInterrupt", "BaseException"),
    ("GeneratorExit", "BaseException"),
    ("Exception", "BaseException"),
    ("StopIteration", "Exception"),
    ("ArithmeticError", "Exception"),
    ("FloatingPointError", "ArithmeticError"),
    ("OverflowError", "ArithmeticError"),
    ("ZeroDivisionError", "ArithmeticError"),
    ("AssertionError", "Exception"),
    ("AttributeError", "Exception"),
    ("BufferError", "Exception"),
    ("EOFError", "Exception"),
    ("ImportError", "Exception"),
    ("ModuleNotFoundError", "ImportError"),
    ("LookupError", "Exception"),
    ("IndexError", "LookupError"),
    ("KeyError", "LookupError"),
    ("MemoryError", "Exception"),
    ("NameError", "Exception"),
    ("UnboundLocalError", "NameError"),
    ("OSError", "Exception"),
    ("TimeoutError", "OSError"),
    ("ReferenceError", "Exception"),
    ("RuntimeError", "Exception"),
    ("NotImplementedError", "RuntimeError"),
    ("RecursionError", "RuntimeError"),
    ("SyntaxError", "Exception"),
    ("SystemError", "Exception"),
    ("TypeError", "Exception"),
    ("ValueError", "Exception"),
    ("UnicodeError", "ValueError"),
    ("Warning", "Exception"),
    ("UserWarning", "Warning"),
    ("DeprecationWarning", "Warning"),
    ("PendingDeprecationWarning", "Warning"),
    ("SyntaxWarning", "Warning"),
    ("RuntimeWarning", "Warning"),
    ("FutureWarning", "Warning"),
    ("ImportWarning", "Warning"),
    ("UnicodeWarning", "Warning"),
    ("BytesWarning", "Warning"),
    ("ResourceWarning", "Warning"),
];

/// Legacy names bound to an existing class.
const ALIASES: &[(&str, &str)] = &[("EnvironmentError", "OSError"), ("IOError", "OSError")];

/// Allocate the builtin namespace. Every entry holds one reference.
pub(super) fn bootstrap(heap: &mut Heap) -> BTreeMap<String, ObjId> {
    let mut names = BTreeMap::new();

    let object = heap.allocate(ObjectData::Type(TypeObject {
        name: "object".to_string(),
        module: None,
        base: None,
    }));
    names.insert("object".to_string(), object);

    for name in BUILTIN_TYPES {
        define(heap, &mut names, name, "object");
    }

    for (name, base) in EXCEPTION_HIERARCHY {
        define(heap, &mut names, name, base);
    }

    for (alias, target) in ALIASES {
        if let Some(&id) = names.get(*target)
            && heap.incref(id).is_ok()
        {
            names.insert(alias.to_string(), id);
        }
    }

    tracing::debug!("Bootstrapped {} builtin names", names.len());
    names
}

fn define(heap: &mut Heap, names: &mut BTreeMap<String, ObjId>, name: &str, base: &str) {
    let base = names.get(base).copied();

    if let Some(base) = base {
        // The subclass owns a reference to its base.
        let _ = heap.incref(base);
    }

    let id = heap.allocate(ObjectData::Type(TypeObject {
        name: name.to_string(),
        module: None,
        base,
    }));
    names.insert(name.to_string(), id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchy_parents_defined_first() {
        let mut seen = vec!["object"];
        seen.extend(BUILTIN_TYPES);

        for (name, base) in EXCEPTION_HIERARCHY {
            assert!(seen.contains(base), "{name} defined before its base {base}");
            seen.push(*name);
        }
    }

    #[test]
    fn test_aliases_share_class() {
        let mut heap = Heap::new();
        let names = bootstrap(&mut heap);

        assert_eq!(names["IOError"], names["OSError"]);
        assert!(!names.contains_key("WindowsError"));
    }
}
