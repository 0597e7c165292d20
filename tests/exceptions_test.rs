mod common;

use refbridge::exceptions::{self, ExceptionTriple};
use refbridge::interp::{FrameInfo, WarningAction};
use refbridge::{BridgeError, ForeignException, ForeignObject};

#[derive(Debug, thiserror::Error)]
#[error("bad token at {0}")]
struct ParseFailure(usize);

#[test]
fn test_index_error_round_trip() {
    let runtime = common::default_runtime();
    let mut gil = runtime.lock();
    let list = gil.new_list(Vec::new());

    let result = gil.with_frame(
        FrameInfo::new("<module>", "<string>", 1).with_source("[][0]"),
        |interp| interp.get_item(list, 0),
    );
    assert!(result.is_err());

    let exc = ForeignException::fetch(&mut gil).unwrap().unwrap();
    assert_eq!(exc.message(), "IndexError : list index out of range");

    let index_error = gil.exceptions().index_error.unwrap();
    assert!(exc.matches(&gil, index_error));
    gil.decref(list).unwrap();
}

#[test]
fn test_index_error_through_wrapper() {
    let runtime = common::default_runtime();
    let mut gil = runtime.lock();

    let empty = ForeignObject::list(&mut gil, &[]).unwrap();
    let err = empty.get_item(&mut gil, 0).unwrap_err();

    assert_eq!(err.to_string(), "IndexError : list index out of range");
    assert!(!err.is_misuse());
}

#[test]
fn test_format_with_traceback() {
    let runtime = common::default_runtime();
    let mut gil = runtime.lock();
    let list = gil.new_list(Vec::new());

    let _ = gil.with_frame(
        FrameInfo::new("<module>", "<string>", 1).with_source("[][0]"),
        |interp| interp.get_item(list, 0),
    );
    let exc = ForeignException::fetch(&mut gil).unwrap().unwrap();
    let text = exc.format(&gil);

    assert!(text.contains("Traceback"));
    assert!(text.contains("(most recent call last):"));
    assert!(text.contains("IndexError"));
    assert!(text.contains("list index out of range"));
    assert!(!text.starts_with('['));
    assert!(!text.contains("\\n"));
    assert_eq!(
        text,
        "Traceback (most recent call last):\n  File \"<string>\", line 1, in <module>\n    [][0]\nIndexError: list index out of range\n"
    );
}

#[test]
fn test_format_without_traceback_is_stack_trace() {
    let runtime = common::default_runtime();
    let mut gil = runtime.lock();
    let value_error = gil.exceptions().value_error.unwrap();

    exceptions::set_error(&mut gil, value_error, "no frames here").unwrap();
    let exc = ForeignException::fetch(&mut gil).unwrap().unwrap();
    let text = exceptions::format(&gil, &exc);

    assert!(!exc.has_traceback());
    assert_eq!(text, exc.stack_trace());
    assert!(text.starts_with("  at "));
    assert!(text.contains("exceptions_test.rs"));
    assert!(!text.starts_with('['));
    assert!(!text.contains("\\n"));
}

#[test]
fn test_normalize_with_pending_error_fails() {
    let runtime = common::default_runtime();
    let mut gil = runtime.lock();
    let key_error = gil.exceptions().key_error.unwrap();
    let type_error = gil.exceptions().type_error.unwrap();

    exceptions::set_error(&mut gil, key_error, "already pending").unwrap();

    let message = gil.new_str("other");
    gil.incref(type_error).unwrap();
    let mut triple = ExceptionTriple {
        ptype: type_error,
        pvalue: Some(message),
        ptraceback: None,
    };

    let err = exceptions::normalize(&mut gil, &mut triple).unwrap_err();
    assert!(matches!(err, BridgeError::Misuse { operation: "normalize", .. }));

    // The pending error is still the original one, the triple unchanged
    assert!(exceptions::exception_matches(&gil, key_error));
    assert_eq!(triple.pvalue, Some(message));

    exceptions::clear(&mut gil);
    assert!(exceptions::error_occurred(&gil).is_none());
    triple.release(&mut gil);
}

#[test]
fn test_host_error_round_trip() {
    let runtime = common::default_runtime();
    let mut gil = runtime.lock();

    exceptions::set_error_from(&mut gil, &ParseFailure(17)).unwrap();
    let err = exceptions::check_pending(&mut gil).unwrap_err();
    assert_eq!(err.to_string(), "ParseFailure : bad token at 17");

    let value = err.as_foreign().unwrap().value().handle();

    // Passing the captured error back restores the same exception object
    exceptions::set_error_from(&mut gil, &err).unwrap();
    let (ptype, pvalue, ptraceback) = gil.err_fetch().unwrap();
    assert_eq!(pvalue, Some(value));
    assert_eq!(gil.class_name(ptype), "ParseFailure");

    gil.err_restore(ptype, pvalue, ptraceback);
    exceptions::clear(&mut gil);
}

#[test]
fn test_set_error_object() {
    let runtime = common::default_runtime();
    let mut gil = runtime.lock();
    let value_error = gil.exceptions().value_error.unwrap();

    let payload = ForeignObject::str(&mut gil, "wrapped payload").unwrap();
    exceptions::set_error_object(&mut gil, value_error, &payload).unwrap();

    let err = exceptions::check_pending(&mut gil).unwrap_err();
    assert_eq!(err.to_string(), "ValueError : wrapped payload");
}

#[test]
fn test_set_cause_shows_in_format() {
    let runtime = common::default_runtime();
    let mut gil = runtime.lock();
    let os_error = gil.exceptions().os_error.unwrap();
    let runtime_error = gil.exceptions().runtime_error.unwrap();

    exceptions::set_error(&mut gil, os_error, "disk full").unwrap();
    let cause = ForeignException::fetch(&mut gil).unwrap().unwrap();

    gil.with_frame(FrameInfo::new("save", "store.py", 12), |interp| {
        interp.err_set_string(runtime_error, "save failed").unwrap();
    });
    exceptions::set_cause(&mut gil, &cause).unwrap();

    let exc = ForeignException::fetch(&mut gil).unwrap().unwrap();
    let attached = exc.cause(&mut gil).unwrap().unwrap();
    assert_eq!(attached.message(), "OSError : disk full");

    // No traceback on either exception: the report is the capture location
    assert_eq!(exc.format(&gil), exc.stack_trace());
}

#[test]
fn test_warn_requires_warning_category() {
    let runtime = common::default_runtime();
    let mut gil = runtime.lock();
    let int_type = gil.lookup_builtin("int").unwrap();

    let err = exceptions::warn(&mut gil, "careful", int_type, 1).unwrap_err();
    assert_eq!(
        err.to_string(),
        "TypeError : category must be a Warning subclass, not 'int'"
    );
    assert!(exceptions::error_occurred(&gil).is_none());
}

#[test]
fn test_warning_filters() {
    let runtime = common::default_runtime();
    let mut gil = runtime.lock();
    let user_warning = gil.exceptions().user_warning.unwrap();
    let runtime_warning = gil.exceptions().runtime_warning.unwrap();

    gil.with_frame(FrameInfo::new("main", "app.py", 40), |interp| {
        interp.warn(user_warning, "noted", 1).unwrap();
    });
    let log = gil.take_warnings();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].filename, "app.py");
    assert_eq!(log[0].lineno, 40);

    gil.add_warning_filter(user_warning, WarningAction::Ignore)
        .unwrap();
    exceptions::warn(&mut gil, "quiet", user_warning, 1).unwrap();
    assert!(gil.take_warnings().is_empty());

    gil.add_warning_filter(runtime_warning, WarningAction::Error)
        .unwrap();
    let err = exceptions::warn(&mut gil, "loud", runtime_warning, 1).unwrap_err();
    assert_eq!(err.to_string(), "RuntimeWarning : loud");
}
