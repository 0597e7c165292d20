//! `ForeignException` - a captured foreign error as a host error.

use std::panic::Location;

use super::bridge::ExceptionTriple;
use crate::error::BridgeError;
use crate::gc::InterpLock;
use crate::interp::ObjId;
use crate::object::ForeignObject;

/// Normalization attempts before giving up on an error that keeps raising.
const MAX_NORMALIZE_ATTEMPTS: usize = 8;

/// A normalized foreign exception triple owned by the host.
///
/// The type name and message are captured when the exception is fetched, so
/// `Display` works without the interpreter lock.
#[derive(thiserror::Error)]
#[error("{type_name} : {value_text}")]
pub struct ForeignException {
    ptype: ForeignObject,
    pvalue: ForeignObject,
    ptraceback: Option<ForeignObject>,
    type_name: String,
    value_text: String,
    stack_trace: String,
}

impl ForeignException {
    /// Take and normalize the pending error, if any.
    ///
    /// If normalization itself raises, the new error replaces the old one.
    #[track_caller]
    pub fn fetch(gil: &mut InterpLock<'_>) -> Result<Option<Self>, BridgeError> {
        let location = Location::caller();
        let stack_trace = format!(
            "  at {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );

        let Some(mut triple) = ExceptionTriple::fetch(gil) else {
            return Ok(None);
        };

        for _ in 0..MAX_NORMALIZE_ATTEMPTS {
            if gil
                .normalize_exception(&mut triple.ptype, &mut triple.pvalue, &mut triple.ptraceback)
                .is_ok()
            {
                return Self::from_normalized(gil, triple, stack_trace).map(Some);
            }

            triple.release(gil);
            triple = match ExceptionTriple::fetch(gil) {
                Some(next) => next,
                None => {
                    return Err(BridgeError::misuse(
                        "fetch",
                        "normalization failed without setting an error",
                    ));
                }
            };
        }

        triple.release(gil);
        Err(BridgeError::misuse("fetch", "exception normalization kept raising"))
    }

    /// Wrap a normalized triple, taking ownership of its references.
    fn from_normalized(
        gil: &mut InterpLock<'_>,
        triple: ExceptionTriple,
        stack_trace: String,
    ) -> Result<Self, BridgeError> {
        let ExceptionTriple {
            ptype,
            pvalue,
            ptraceback,
        } = triple;

        let Some(pvalue) = pvalue else {
            let _ = gil.decref(ptype);
            return Err(BridgeError::misuse("fetch", "normalized exception has no value"));
        };

        let ptraceback = ptraceback.or_else(|| {
            let tb = gil.exception_traceback(pvalue)?;
            gil.incref(tb).ok()?;
            Some(tb)
        });

        let type_name = gil.class_name(ptype);
        let value_text = gil.str_of(pvalue);

        let ptype = ForeignObject::from_owned(gil, ptype)?;
        let pvalue = ForeignObject::from_owned(gil, pvalue)?;
        let ptraceback = match ptraceback {
            Some(tb) => Some(ForeignObject::from_owned(gil, tb)?),
            None => None,
        };

        Ok(Self {
            ptype,
            pvalue,
            ptraceback,
            type_name,
            value_text,
            stack_trace,
        })
    }

    /// `"<TypeName> : <message>"`.
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// `__name__` of the exception class.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// `str()` of the exception value.
    pub fn value_text(&self) -> &str {
        &self.value_text
    }

    pub fn ptype(&self) -> &ForeignObject {
        &self.ptype
    }

    pub fn value(&self) -> &ForeignObject {
        &self.pvalue
    }

    pub fn traceback(&self) -> Option<&ForeignObject> {
        self.ptraceback.as_ref()
    }

    pub fn has_traceback(&self) -> bool {
        self.ptraceback.is_some()
    }

    /// Host location where the exception was captured, as `  at file:line:col`.
    pub fn stack_trace(&self) -> &str {
        &self.stack_trace
    }

    /// Foreign-standard traceback report, or the capture location when the
    /// exception carries no traceback.
    pub fn format(&self, gil: &InterpLock<'_>) -> String {
        match &self.ptraceback {
            Some(tb) => gil.format_exception(self.ptype.handle(), Some(self.pvalue.handle()), Some(tb.handle())),
            None => self.stack_trace.clone(),
        }
    }

    /// True if the exception is an instance of `class` (or of any class in
    /// a list of classes).
    pub fn matches(&self, gil: &InterpLock<'_>, class: ObjId) -> bool {
        gil.err_given_matches(self.ptype.handle(), class)
    }

    /// The exception's `__cause__`, if one is attached.
    pub fn cause(&self, gil: &mut InterpLock<'_>) -> Result<Option<Self>, BridgeError> {
        self.pvalue.check_runtime(gil, "cause")?;

        let Some(cause) = gil.exception_cause(self.pvalue.handle()) else {
            return Ok(None);
        };

        let ptype = gil.type_of(cause)?;
        let ptraceback = gil.exception_traceback(cause);

        gil.incref(ptype)?;
        gil.incref(cause)?;
        if let Some(tb) = ptraceback {
            gil.incref(tb)?;
        }

        let triple = ExceptionTriple {
            ptype,
            pvalue: Some(cause),
            ptraceback,
        };
        Self::from_normalized(gil, triple, self.stack_trace.clone()).map(Some)
    }

    /// Make this exception the pending error again, keeping the triple.
    pub fn restore_clone(&self, gil: &mut InterpLock<'_>) -> Result<(), BridgeError> {
        self.pvalue.check_runtime(gil, "restore")?;

        let ptype = self.ptype.handle();
        let pvalue = self.pvalue.handle();
        let ptraceback = self.ptraceback.as_ref().map(ForeignObject::handle);

        gil.incref(ptype)?;
        gil.incref(pvalue)?;
        if let Some(tb) = ptraceback {
            gil.incref(tb)?;
        }

        gil.err_restore(ptype, Some(pvalue), ptraceback);
        Ok(())
    }

    /// Make this exception the pending error, handing over its references.
    pub fn restore(self, gil: &mut InterpLock<'_>) -> Result<(), BridgeError> {
        self.pvalue.check_runtime(gil, "restore")?;

        let ptype = self.ptype.into_handle()?;
        let pvalue = self.pvalue.into_handle()?;
        let ptraceback = self.ptraceback.map(ForeignObject::into_handle).transpose()?;

        gil.err_restore(ptype, Some(pvalue), ptraceback);
        Ok(())
    }
}

impl std::fmt::Debug for ForeignException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignException")
            .field("type_name", &self.type_name)
            .field("value", &self.value_text)
            .field("has_traceback", &self.has_traceback())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::interp::FrameInfo;
    use crate::runtime::BridgeRuntime;

    #[test]
    fn test_fetch_without_error() {
        let runtime = BridgeRuntime::initialize(BridgeConfig::default());
        let mut gil = runtime.lock();

        assert!(ForeignException::fetch(&mut gil).unwrap().is_none());
    }

    #[test]
    fn test_fetch_normalizes() {
        let runtime = BridgeRuntime::initialize(BridgeConfig::default());
        let mut gil = runtime.lock();
        let key_error = gil.exceptions().key_error.unwrap();

        gil.err_set_string(key_error, "missing").unwrap();
        let exc = ForeignException::fetch(&mut gil).unwrap().unwrap();

        assert_eq!(exc.message(), "KeyError : missing");
        assert!(exc.value().is_instance(&gil, key_error));
        assert!(gil.err_occurred().is_none());
        assert!(!exc.has_traceback());
    }

    #[test]
    fn test_fetch_replaces_failed_normalization() {
        let runtime = BridgeRuntime::initialize(BridgeConfig::default());
        let mut gil = runtime.lock();
        let int_type = gil.lookup_builtin("int").unwrap();

        gil.err_set_object(int_type, None).unwrap();
        let exc = ForeignException::fetch(&mut gil).unwrap().unwrap();

        assert_eq!(exc.type_name(), "TypeError");
        assert_eq!(
            exc.value_text(),
            "exceptions must derive from BaseException, not 'int'"
        );
    }

    #[test]
    fn test_restore_round_trip() {
        let runtime = BridgeRuntime::initialize(BridgeConfig::default());
        let mut gil = runtime.lock();
        let value_error = gil.exceptions().value_error.unwrap();

        gil.err_set_string(value_error, "bad").unwrap();
        let exc = ForeignException::fetch(&mut gil).unwrap().unwrap();
        let value = exc.value().handle();

        exc.restore(&mut gil).unwrap();
        assert!(gil.err_matches(value_error));

        let again = ForeignException::fetch(&mut gil).unwrap().unwrap();
        assert_eq!(again.value().handle(), value);
    }

    #[test]
    fn test_traceback_is_captured() {
        let runtime = BridgeRuntime::initialize(BridgeConfig::default());
        let mut gil = runtime.lock();
        let list = gil.new_list(Vec::new());

        let result = gil.with_frame(FrameInfo::new("f", "mod.py", 3), |i| i.get_item(list, 0));
        assert!(result.is_err());

        let exc = ForeignException::fetch(&mut gil).unwrap().unwrap();
        assert!(exc.has_traceback());
        assert!(exc.format(&gil).contains("File \"mod.py\", line 3, in f"));
    }
}
