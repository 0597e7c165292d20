//! Pending-error vocabulary used across the binding layer.
//!
//! Every function takes the interpreter lock guard, since reading or writing
//! the pending-error indicator touches the foreign runtime.

use super::foreign_exception::ForeignException;
use crate::error::BridgeError;
use crate::gc::InterpLock;
use crate::interp::ObjId;
use crate::object::ForeignObject;

/// A raw exception triple. Every present component is an owned reference.
#[must_use = "an exception triple owns references; restore or release it"]
#[derive(Debug, PartialEq, Eq)]
pub struct ExceptionTriple {
    pub ptype: ObjId,
    pub pvalue: Option<ObjId>,
    pub ptraceback: Option<ObjId>,
}

impl ExceptionTriple {
    /// Take the pending error, clearing the indicator.
    pub fn fetch(gil: &mut InterpLock<'_>) -> Option<Self> {
        gil.err_fetch().map(|(ptype, pvalue, ptraceback)| Self {
            ptype,
            pvalue,
            ptraceback,
        })
    }

    /// Make the triple the pending error, handing over its references.
    pub fn restore(self, gil: &mut InterpLock<'_>) {
        gil.err_restore(self.ptype, self.pvalue, self.ptraceback);
    }

    /// Release every reference in the triple.
    pub fn release(self, gil: &mut InterpLock<'_>) {
        let _ = gil.decref(self.ptype);

        for id in [self.pvalue, self.ptraceback].into_iter().flatten() {
            let _ = gil.decref(id);
        }
    }
}

/// Set the pending error to `ptype(message)`, replacing any pending error.
pub fn set_error(gil: &mut InterpLock<'_>, ptype: ObjId, message: &str) -> Result<(), BridgeError> {
    gil.err_set_string(ptype, message)?;
    Ok(())
}

/// Set the pending error to (`ptype`, `value`). Both stay owned by the caller.
pub fn set_error_object(gil: &mut InterpLock<'_>, ptype: ObjId, value: &ForeignObject) -> Result<(), BridgeError> {
    value.check_runtime(gil, "set_error_object")?;
    gil.err_set_object(ptype, Some(value.handle()))?;
    Ok(())
}

/// Raise a host error inside the interpreter.
///
/// If the error is, or was caused by, a captured `ForeignException`, that
/// exact triple becomes pending again. Otherwise an instance of a class
/// named after the host error type is raised with the error's message.
pub fn set_error_from<E>(gil: &mut InterpLock<'_>, error: &E) -> Result<(), BridgeError>
where
    E: std::error::Error + 'static,
{
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);

    while let Some(err) = current {
        if let Some(exc) = err.downcast_ref::<ForeignException>() {
            return exc.restore_clone(gil);
        }

        if let Some(BridgeError::Foreign(exc)) = err.downcast_ref::<BridgeError>() {
            return exc.restore_clone(gil);
        }

        current = err.source();
    }

    let class = gil.host_exception_class(std::any::type_name::<E>());
    let value = gil.new_exception(class, Some(&error.to_string()))?;

    let result = gil.err_set_object(class, Some(value));
    let _ = gil.decref(value);
    result?;

    Ok(())
}

/// Chain `cause` to the pending error, as `raise pending from cause`.
pub fn set_cause(gil: &mut InterpLock<'_>, cause: &ForeignException) -> Result<(), BridgeError> {
    cause.value().check_runtime(gil, "set_cause")?;

    if gil.err_occurred().is_none() {
        return Err(BridgeError::misuse("set_cause", "no error is pending"));
    }

    let cause_value = cause.value().handle();
    gil.incref(cause_value)?;

    let Some(mut current) = ExceptionTriple::fetch(gil) else {
        let _ = gil.decref(cause_value);
        return Err(BridgeError::misuse("set_cause", "no error is pending"));
    };

    if gil
        .normalize_exception(&mut current.ptype, &mut current.pvalue, &mut current.ptraceback)
        .is_err()
    {
        let _ = gil.decref(cause_value);
        current.release(gil);
        return Err(fetch_raised(gil));
    }

    if let Some(value) = current.pvalue {
        gil.set_exception_cause(value, Some(cause_value))?;
    }

    current.restore(gil);
    Ok(())
}

/// Normalize `triple` in place so its value is an instance of its type.
///
/// Fails with `Misuse` if an error is already pending: both that error and
/// the triple are left untouched. If building the value raises, the new
/// error is returned as `Foreign` and the triple stays with the caller.
pub fn normalize(gil: &mut InterpLock<'_>, triple: &mut ExceptionTriple) -> Result<(), BridgeError> {
    if let Some(pending) = gil.err_occurred() {
        return Err(BridgeError::misuse(
            "normalize",
            format!("{} is already pending", gil.class_name(pending)),
        ));
    }

    match gil.normalize_exception(&mut triple.ptype, &mut triple.pvalue, &mut triple.ptraceback) {
        Ok(()) => Ok(()),
        Err(_) => Err(fetch_raised(gil)),
    }
}

/// Foreign-standard report of `exc`.
pub fn format(gil: &InterpLock<'_>, exc: &ForeignException) -> String {
    exc.format(gil)
}

/// Borrowed type of the pending error, if any.
pub fn error_occurred(gil: &InterpLock<'_>) -> Option<ObjId> {
    gil.err_occurred()
}

pub fn clear(gil: &mut InterpLock<'_>) {
    gil.err_clear();
}

/// True if the pending error matches `class` (or any class in a list).
pub fn exception_matches(gil: &InterpLock<'_>, class: ObjId) -> bool {
    gil.err_matches(class)
}

/// Turn a pending error into `Err(Foreign)`.
#[track_caller]
pub fn check_pending(gil: &mut InterpLock<'_>) -> Result<(), BridgeError> {
    match ForeignException::fetch(gil)? {
        Some(exc) => Err(exc.into()),
        None => Ok(()),
    }
}

/// Fetch the error a raising call just set.
#[track_caller]
pub fn fetch_raised(gil: &mut InterpLock<'_>) -> BridgeError {
    match ForeignException::fetch(gil) {
        Ok(Some(exc)) => exc.into(),
        Ok(None) => BridgeError::misuse("fetch", "call raised without setting an error"),
        Err(e) => e,
    }
}

/// Set a `TypeError` as the pending error, chaining any error that was
/// already pending as its `__cause__`.
pub fn raise_type_error(gil: &mut InterpLock<'_>, message: &str) -> Result<(), BridgeError> {
    let type_error = gil
        .exceptions()
        .type_error
        .or_else(|| gil.lookup_builtin("TypeError"))
        .ok_or_else(|| BridgeError::misuse("raise_type_error", "TypeError is not defined"))?;

    let value = gil.new_exception(type_error, Some(message))?;

    if let Some(mut prior) = ExceptionTriple::fetch(gil) {
        if gil
            .normalize_exception(&mut prior.ptype, &mut prior.pvalue, &mut prior.ptraceback)
            .is_ok()
        {
            if let Some(prior_value) = prior.pvalue.take() {
                let _ = gil.set_exception_cause(value, Some(prior_value));
            }
        } else {
            gil.err_clear();
        }

        prior.release(gil);
    }

    let result = gil.err_set_object(type_error, Some(value));
    let _ = gil.decref(value);
    result?;

    Ok(())
}

/// Emit a warning of `category` through the interpreter's warning filters.
///
/// `category` must be a subclass of `Warning`; otherwise a `TypeError` is
/// raised and returned. A warning turned into an error by a filter is
/// returned as `Foreign` too.
#[track_caller]
pub fn warn(gil: &mut InterpLock<'_>, message: &str, category: ObjId, stacklevel: u32) -> Result<(), BridgeError> {
    let warning = gil.exceptions().warning.or_else(|| gil.lookup_builtin("Warning"));
    let valid = warning.is_some_and(|w| gil.is_type(category) && gil.is_subclass(category, w));

    if !valid {
        let name = if gil.is_type(category) {
            gil.class_name(category)
        } else {
            gil.type_name(category)
                .unwrap_or_else(|_| "<freed>".to_string())
        };

        raise_type_error(
            gil,
            &format!("category must be a Warning subclass, not '{}'", name),
        )?;
        return Err(fetch_raised(gil));
    }

    match gil.warn(category, message, stacklevel) {
        Ok(()) => Ok(()),
        Err(_) => Err(fetch_raised(gil)),
    }
}

/// `warn` with `DeprecationWarning`.
#[track_caller]
pub fn deprecation(gil: &mut InterpLock<'_>, message: &str, stacklevel: u32) -> Result<(), BridgeError> {
    let category = gil
        .exceptions()
        .deprecation_warning
        .or_else(|| gil.lookup_builtin("DeprecationWarning"))
        .ok_or_else(|| BridgeError::misuse("deprecation", "DeprecationWarning is not defined"))?;

    warn(gil, message, category, stacklevel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::interp::{FrameInfo, WarningAction};
    use crate::runtime::BridgeRuntime;

    #[derive(Debug, thiserror::Error)]
    #[error("config file missing")]
    struct ConfigMissing;

    #[derive(Debug, thiserror::Error)]
    #[error("startup failed")]
    struct StartupFailed(#[source] BridgeError);

    #[test]
    fn test_set_error_from_host_error() {
        let runtime = BridgeRuntime::initialize(BridgeConfig::default());
        let mut gil = runtime.lock();

        set_error_from(&mut gil, &ConfigMissing).unwrap();
        let exc = ForeignException::fetch(&mut gil).unwrap().unwrap();

        assert_eq!(exc.message(), "ConfigMissing : config file missing");
        let exception = gil.exceptions().exception.unwrap();
        assert!(exc.matches(&gil, exception));
    }

    #[test]
    fn test_set_error_from_restores_wrapped_foreign() {
        let runtime = BridgeRuntime::initialize(BridgeConfig::default());
        let mut gil = runtime.lock();
        let key_error = gil.exceptions().key_error.unwrap();

        set_error(&mut gil, key_error, "k").unwrap();
        let captured = ForeignException::fetch(&mut gil).unwrap().unwrap();
        let value = captured.value().handle();

        let wrapped = StartupFailed(BridgeError::Foreign(captured));
        set_error_from(&mut gil, &wrapped).unwrap();

        assert!(exception_matches(&gil, key_error));
        let (_, pending_value, _) = gil.err_fetch().unwrap();
        assert_eq!(pending_value, Some(value));
    }

    #[test]
    fn test_normalize_while_pending_is_misuse() {
        let runtime = BridgeRuntime::initialize(BridgeConfig::default());
        let mut gil = runtime.lock();
        let value_error = gil.exceptions().value_error.unwrap();
        let key_error = gil.exceptions().key_error.unwrap();

        gil.incref(key_error).unwrap();
        let mut triple = ExceptionTriple {
            ptype: key_error,
            pvalue: None,
            ptraceback: None,
        };

        set_error(&mut gil, value_error, "pending").unwrap();
        let err = normalize(&mut gil, &mut triple).unwrap_err();
        assert!(err.is_misuse());

        // Neither error was touched
        assert!(exception_matches(&gil, value_error));
        assert_eq!(triple.pvalue, None);

        clear(&mut gil);
        normalize(&mut gil, &mut triple).unwrap();
        assert!(gil.is_instance(triple.pvalue.unwrap(), key_error));
        triple.release(&mut gil);
    }

    #[test]
    fn test_normalize_raising_returns_foreign() {
        let runtime = BridgeRuntime::initialize(BridgeConfig::default());
        let mut gil = runtime.lock();
        let int_type = gil.lookup_builtin("int").unwrap();

        gil.incref(int_type).unwrap();
        let mut triple = ExceptionTriple {
            ptype: int_type,
            pvalue: None,
            ptraceback: None,
        };

        let err = normalize(&mut gil, &mut triple).unwrap_err();
        assert_eq!(err.as_foreign().unwrap().type_name(), "TypeError");
        assert!(error_occurred(&gil).is_none());
        triple.release(&mut gil);
    }

    #[test]
    fn test_set_cause_chains_format() {
        let runtime = BridgeRuntime::initialize(BridgeConfig::default());
        let mut gil = runtime.lock();
        let key_error = gil.exceptions().key_error.unwrap();

        set_error(&mut gil, key_error, "inner").unwrap();
        let cause = ForeignException::fetch(&mut gil).unwrap().unwrap();

        let list = gil.new_list(Vec::new());
        let raised = gil.with_frame(FrameInfo::new("load", "app.py", 7), |i| i.get_item(list, 0));
        assert!(raised.is_err());
        set_cause(&mut gil, &cause).unwrap();

        let exc = ForeignException::fetch(&mut gil).unwrap().unwrap();
        let attached = exc.cause(&mut gil).unwrap().unwrap();
        assert_eq!(attached.message(), "KeyError : inner");

        let text = exc.format(&gil);
        assert!(text.starts_with("KeyError: inner\n"));
        assert!(text.contains("The above exception was the direct cause of the following exception:"));
        assert!(text.contains("  File \"app.py\", line 7, in load\n"));
        assert!(text.ends_with("IndexError: list index out of range\n"));
    }

    #[test]
    fn test_set_cause_without_pending_is_misuse() {
        let runtime = BridgeRuntime::initialize(BridgeConfig::default());
        let mut gil = runtime.lock();
        let key_error = gil.exceptions().key_error.unwrap();

        set_error(&mut gil, key_error, "x").unwrap();
        let cause = ForeignException::fetch(&mut gil).unwrap().unwrap();

        assert!(set_cause(&mut gil, &cause).unwrap_err().is_misuse());
    }

    #[test]
    fn test_warn_rejects_non_warning_category() {
        let runtime = BridgeRuntime::initialize(BridgeConfig::default());
        let mut gil = runtime.lock();
        let value_error = gil.exceptions().value_error.unwrap();

        set_error(&mut gil, value_error, "earlier").unwrap();
        let err = warn(&mut gil, "hello", value_error, 1).unwrap_err();
        let exc = err.as_foreign().unwrap();

        assert_eq!(
            exc.message(),
            "TypeError : category must be a Warning subclass, not 'ValueError'"
        );
        let cause = exc.cause(&mut gil).unwrap().unwrap();
        assert_eq!(cause.message(), "ValueError : earlier");
        assert!(error_occurred(&gil).is_none());
    }

    #[test]
    fn test_deprecation_respects_filters() {
        let runtime = BridgeRuntime::initialize(BridgeConfig::default());
        let mut gil = runtime.lock();

        deprecation(&mut gil, "old api", 1).unwrap();
        let log = gil.take_warnings();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].category, "DeprecationWarning");

        let deprecation_warning = gil.exceptions().deprecation_warning.unwrap();
        gil.add_warning_filter(deprecation_warning, WarningAction::Error)
            .unwrap();

        let err = deprecation(&mut gil, "old api", 1).unwrap_err();
        assert_eq!(
            err.as_foreign().unwrap().message(),
            "DeprecationWarning : old api"
        );
    }

    #[test]
    fn test_check_pending() {
        let runtime = BridgeRuntime::initialize(BridgeConfig::default());
        let mut gil = runtime.lock();
        assert!(check_pending(&mut gil).is_ok());

        raise_type_error(&mut gil, "nope").unwrap();
        let err = check_pending(&mut gil).unwrap_err();
        assert_eq!(err.to_string(), "TypeError : nope");
    }
}
