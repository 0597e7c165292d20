//! The embedded reference-counted interpreter.
//!
//! This is the foreign runtime the bridge talks to. Its surface is shaped like
//! a C extension API: handles are plain `ObjId`s, ownership is manual
//! (`incref`/`decref`), and raising calls return `Err(Raised)` after setting
//! the pending-error indicator.
//!
//! ## Reference conventions
//!
//! - Functions documented as returning a *new reference* hand one count to
//!   the caller, who must release it exactly once.
//! - *Borrowed* results must not be released.
//! - Functions documented as *stealing* take over the caller's reference.
//!
//! The interpreter is not thread-safe by itself. It is only reachable through
//! `InterpLock`, which serializes every foreign-touching operation.

mod builtins;
mod heap;
mod object;
mod traceback;
mod warnings;

use std::collections::{BTreeMap, HashMap};

pub use heap::{HeapError, HeapStats, ObjId};
pub use object::{ExceptionObject, FrameInfo, ObjectData, TracebackEntry, TypeObject};
pub use warnings::{WarningAction, WarningMessage};

use heap::Heap;
use warnings::WarningRegistry;

/// Marker returned by raising calls: the pending-error indicator is now set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Raised;

pub type InterpResult<T> = Result<T, Raised>;

/// Module name given to classes created for host errors.
pub const HOST_MODULE: &str = "host";

struct PendingError {
    ptype: ObjId,
    pvalue: Option<ObjId>,
    ptraceback: Option<ObjId>,
}

pub struct Interpreter {
    heap: Heap,
    builtins: BTreeMap<String, ObjId>,
    host_classes: HashMap<String, ObjId>,
    none: ObjId,
    error: Option<PendingError>,
    frames: Vec<FrameInfo>,
    warnings: WarningRegistry,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let builtins = builtins::bootstrap(&mut heap);
        let none = heap.allocate(ObjectData::None);

        Self {
            heap,
            builtins,
            host_classes: HashMap::new(),
            none,
            error: None,
            frames: Vec::new(),
            warnings: WarningRegistry::default(),
        }
    }

    // ---- heap -----------------------------------------------------------

    #[inline]
    pub fn is_live(&self, id: ObjId) -> bool {
        self.heap.is_live(id)
    }

    pub fn get(&self, id: ObjId) -> Result<&ObjectData, HeapError> {
        self.heap.get(id)
    }

    pub fn incref(&mut self, id: ObjId) -> Result<(), HeapError> {
        self.heap.incref(id)
    }

    /// Release one reference. Returns the remaining count.
    pub fn decref(&mut self, id: ObjId) -> Result<isize, HeapError> {
        self.heap.decref(id)
    }

    /// Release an optional reference, ignoring stale handles.
    fn xdecref(&mut self, id: Option<ObjId>) {
        if let Some(id) = id {
            let _ = self.heap.decref(id);
        }
    }

    pub fn refcount(&self, id: ObjId) -> Option<isize> {
        self.heap.refcount(id)
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    // ---- constructors (new references) ----------------------------------

    pub fn none(&mut self) -> ObjId {
        let none = self.none;
        let _ = self.heap.incref(none);
        none
    }

    pub fn new_int(&mut self, value: i64) -> ObjId {
        self.heap.allocate(ObjectData::Int(value))
    }

    pub fn new_bool(&mut self, value: bool) -> ObjId {
        self.heap.allocate(ObjectData::Bool(value))
    }

    pub fn new_str(&mut self, value: impl Into<String>) -> ObjId {
        self.heap.allocate(ObjectData::Str(value.into()))
    }

    /// Build a list, stealing one reference to each item.
    pub fn new_list(&mut self, items: Vec<ObjId>) -> ObjId {
        self.heap.allocate(ObjectData::List(items))
    }

    // ---- types ----------------------------------------------------------

    /// Borrowed reference to a builtin by name.
    pub fn lookup_builtin(&self, name: &str) -> Option<ObjId> {
        self.builtins.get(name).copied()
    }

    /// Borrowed reference to the type of `id`.
    pub fn type_of(&self, id: ObjId) -> Result<ObjId, HeapError> {
        let data = self.heap.get(id)?;

        if let ObjectData::Exception(exc) = data {
            return Ok(exc.class);
        }

        let name = data.builtin_type_name().unwrap_or("object");
        Ok(self.builtins.get(name).copied().unwrap_or(self.builtins["object"]))
    }

    /// `__name__` of the type of `id`.
    pub fn type_name(&self, id: ObjId) -> Result<String, HeapError> {
        let ty = self.type_of(id)?;
        Ok(self.class_name(ty))
    }

    /// `__name__` of a class, or a placeholder for non-types.
    pub fn class_name(&self, ty: ObjId) -> String {
        match self.heap.get(ty) {
            Ok(ObjectData::Type(t)) => t.name.clone(),
            _ => "<unknown>".to_string(),
        }
    }

    pub fn is_type(&self, id: ObjId) -> bool {
        matches!(self.heap.get(id), Ok(ObjectData::Type(_)))
    }

    /// True if `sub` is `sup` or derives from it.
    pub fn is_subclass(&self, sub: ObjId, sup: ObjId) -> bool {
        let mut current = Some(sub);

        while let Some(id) = current {
            if id == sup {
                return true;
            }

            current = match self.heap.get(id) {
                Ok(ObjectData::Type(t)) => t.base,
                _ => None,
            };
        }

        false
    }

    pub fn is_instance(&self, obj: ObjId, class: ObjId) -> bool {
        self.type_of(obj)
            .map(|ty| self.is_subclass(ty, class))
            .unwrap_or(false)
    }

    pub fn is_exception_class(&self, id: ObjId) -> bool {
        match self.builtins.get("BaseException") {
            Some(&base) => self.is_type(id) && self.is_subclass(id, base),
            None => false,
        }
    }

    /// Create a new exception class. Returns a new reference.
    pub fn new_exception_class(
        &mut self,
        name: &str,
        module: Option<&str>,
        base: ObjId,
    ) -> Result<ObjId, HeapError> {
        self.heap.incref(base)?;

        Ok(self.heap.allocate(ObjectData::Type(TypeObject {
            name: name.to_string(),
            module: module.map(str::to_string),
            base: Some(base),
        })))
    }

    /// Class standing in for a host error type, created on first use.
    ///
    /// `key` is the host type's full path; the class is named after its last
    /// segment. Returns a borrowed reference.
    pub fn host_exception_class(&mut self, key: &str) -> ObjId {
        if let Some(&class) = self.host_classes.get(key)
            && self.heap.is_live(class)
        {
            return class;
        }

        let short = key.split('<').next().unwrap_or(key);
        let short = short.rsplit("::").next().unwrap_or(short);
        let base = self.builtins["Exception"];

        let _ = self.heap.incref(base);
        let class = self.heap.allocate(ObjectData::Type(TypeObject {
            name: short.to_string(),
            module: Some(HOST_MODULE.to_string()),
            base: Some(base),
        }));

        tracing::debug!("Created host exception class {} for {}", short, key);
        self.host_classes.insert(key.to_string(), class);
        class
    }

    // ---- exception instances ---------------------------------------------

    /// Instantiate `class` with an optional message. Returns a new reference.
    pub fn new_exception(&mut self, class: ObjId, message: Option<&str>) -> Result<ObjId, HeapError> {
        self.heap.incref(class)?;

        let args = match message {
            Some(m) => vec![self.new_str(m)],
            None => Vec::new(),
        };

        Ok(self.heap.allocate(ObjectData::Exception(ExceptionObject {
            class,
            args,
            cause: None,
            traceback: None,
        })))
    }

    /// Borrowed `__cause__` of an exception instance.
    pub fn exception_cause(&self, value: ObjId) -> Option<ObjId> {
        match self.heap.get(value) {
            Ok(ObjectData::Exception(exc)) => exc.cause,
            _ => None,
        }
    }

    /// Set `__cause__`, stealing the reference to `cause`.
    pub fn set_exception_cause(&mut self, value: ObjId, cause: Option<ObjId>) -> Result<(), HeapError> {
        let replaced = match self.heap.get_mut(value)? {
            ObjectData::Exception(exc) => Some(std::mem::replace(&mut exc.cause, cause)),
            _ => None,
        };

        match replaced {
            Some(old) => self.xdecref(old),
            None => self.xdecref(cause),
        }
        Ok(())
    }

    /// Borrowed `__traceback__` of an exception instance.
    pub fn exception_traceback(&self, value: ObjId) -> Option<ObjId> {
        match self.heap.get(value) {
            Ok(ObjectData::Exception(exc)) => exc.traceback,
            _ => None,
        }
    }

    /// Set `__traceback__`, stealing the reference to `tb`.
    pub fn set_exception_traceback(&mut self, value: ObjId, tb: Option<ObjId>) -> Result<(), HeapError> {
        let replaced = match self.heap.get_mut(value)? {
            ObjectData::Exception(exc) => Some(std::mem::replace(&mut exc.traceback, tb)),
            _ => None,
        };

        match replaced {
            Some(old) => self.xdecref(old),
            None => self.xdecref(tb),
        }
        Ok(())
    }

    // ---- string conversion ----------------------------------------------

    pub fn str_of(&self, id: ObjId) -> String {
        match self.heap.get(id) {
            Ok(ObjectData::Str(s)) => s.clone(),
            Ok(ObjectData::Exception(exc)) => match exc.args.as_slice() {
                [] => String::new(),
                [single] => self.str_of(*single),
                many => {
                    let parts: Vec<String> = many.iter().map(|a| self.repr_of(*a)).collect();
                    format!("({})", parts.join(", "))
                }
            },
            Ok(_) => self.repr_of(id),
            Err(_) => "<freed>".to_string(),
        }
    }

    pub fn repr_of(&self, id: ObjId) -> String {
        match self.heap.get(id) {
            Ok(ObjectData::None) => "None".to_string(),
            Ok(ObjectData::Bool(true)) => "True".to_string(),
            Ok(ObjectData::Bool(false)) => "False".to_string(),
            Ok(ObjectData::Int(v)) => v.to_string(),
            Ok(ObjectData::Str(s)) => format!(
                "'{}'",
                s.replace('\\', "\\\\").replace('\'', "\\'").replace('\n', "\\n")
            ),
            Ok(ObjectData::List(items)) => {
                let parts: Vec<String> = items.iter().map(|i| self.repr_of(*i)).collect();
                format!("[{}]", parts.join(", "))
            }
            Ok(ObjectData::Type(t)) => format!("<class '{}'>", t.qualified_name()),
            Ok(ObjectData::Exception(exc)) => {
                let parts: Vec<String> = exc.args.iter().map(|a| self.repr_of(*a)).collect();
                format!("{}({})", self.class_name(exc.class), parts.join(", "))
            }
            Ok(ObjectData::Traceback(_)) => "<traceback object>".to_string(),
            Err(_) => "<freed>".to_string(),
        }
    }

    // ---- pending-error indicator ----------------------------------------

    /// Borrowed type of the pending error, if any.
    pub fn err_occurred(&self) -> Option<ObjId> {
        self.error.as_ref().map(|e| e.ptype)
    }

    /// Set the pending error to `ty(message)`. Replaces any pending error.
    pub fn err_set_string(&mut self, ty: ObjId, message: &str) -> Result<(), HeapError> {
        self.heap.incref(ty)?;
        let value = self.new_str(message);
        self.replace_error(Some(PendingError {
            ptype: ty,
            pvalue: Some(value),
            ptraceback: None,
        }));
        Ok(())
    }

    /// Set the pending error to (`ty`, `value`). Both are borrowed.
    pub fn err_set_object(&mut self, ty: ObjId, value: Option<ObjId>) -> Result<(), HeapError> {
        self.heap.incref(ty)?;

        if let Some(v) = value
            && let Err(e) = self.heap.incref(v)
        {
            let _ = self.heap.decref(ty);
            return Err(e);
        }

        self.replace_error(Some(PendingError {
            ptype: ty,
            pvalue: value,
            ptraceback: None,
        }));
        Ok(())
    }

    /// Take the pending error. The caller owns all returned references.
    pub fn err_fetch(&mut self) -> Option<(ObjId, Option<ObjId>, Option<ObjId>)> {
        self.error
            .take()
            .map(|e| (e.ptype, e.pvalue, e.ptraceback))
    }

    /// Make (`ty`, `value`, `tb`) the pending error, stealing all three.
    pub fn err_restore(&mut self, ty: ObjId, value: Option<ObjId>, tb: Option<ObjId>) {
        let error = if ty.is_null() {
            self.xdecref(value);
            self.xdecref(tb);
            None
        } else {
            Some(PendingError {
                ptype: ty,
                pvalue: value,
                ptraceback: tb,
            })
        };

        self.replace_error(error);
    }

    pub fn err_clear(&mut self) {
        self.replace_error(None);
    }

    fn replace_error(&mut self, error: Option<PendingError>) {
        if let Some(old) = std::mem::replace(&mut self.error, error) {
            let _ = self.heap.decref(old.ptype);
            self.xdecref(old.pvalue);
            self.xdecref(old.ptraceback);
        }
    }

    /// True if `given` (a class or instance) matches `exc`.
    ///
    /// `exc` may be a list of classes, matching if any element matches.
    pub fn err_given_matches(&self, given: ObjId, exc: ObjId) -> bool {
        if given.is_null() || exc.is_null() {
            return false;
        }

        if let Ok(ObjectData::List(items)) = self.heap.get(exc) {
            return items.iter().any(|item| self.err_given_matches(given, *item));
        }

        let given = if self.is_type(given) {
            given
        } else {
            match self.type_of(given) {
                Ok(ty) => ty,
                Err(_) => return false,
            }
        };

        if self.is_type(exc) {
            self.is_subclass(given, exc)
        } else {
            given == exc
        }
    }

    /// True if the pending error matches `exc`.
    pub fn err_matches(&self, exc: ObjId) -> bool {
        self.err_occurred()
            .is_some_and(|ty| self.err_given_matches(ty, exc))
    }

    /// Ensure `value` is an instance of `ty`, constructing it if needed.
    ///
    /// On success the references in the three slots may have been replaced
    /// (old ones released). If construction fails the new error is pending,
    /// `Err(Raised)` is returned and the slots are left untouched.
    pub fn normalize_exception(
        &mut self,
        ty: &mut ObjId,
        value: &mut Option<ObjId>,
        tb: &mut Option<ObjId>,
    ) -> InterpResult<()> {
        if !self.is_exception_class(*ty) {
            let name = if self.is_type(*ty) {
                self.class_name(*ty)
            } else {
                self.type_name(*ty).unwrap_or_else(|_| "<freed>".to_string())
            };

            return Err(self.raise(
                "TypeError",
                &format!("exceptions must derive from BaseException, not '{}'", name),
            ));
        }

        if let Some(v) = *value
            && let Ok(ObjectData::Exception(exc)) = self.heap.get(v)
        {
            let class = exc.class;

            if self.is_subclass(class, *ty) {
                if class != *ty {
                    let _ = self.heap.incref(class);
                    let old = std::mem::replace(ty, class);
                    let _ = self.heap.decref(old);
                }

                self.attach_traceback(v, *tb);
                return Ok(());
            }
        }

        let args = match value.take() {
            None => Vec::new(),
            Some(v) => match self.heap.get(v) {
                Ok(ObjectData::None) => {
                    let _ = self.heap.decref(v);
                    Vec::new()
                }
                Ok(ObjectData::List(items)) => {
                    let items = items.clone();
                    for item in &items {
                        let _ = self.heap.incref(*item);
                    }
                    let _ = self.heap.decref(v);
                    items
                }
                _ => vec![v],
            },
        };

        let _ = self.heap.incref(*ty);
        let instance = self.heap.allocate(ObjectData::Exception(ExceptionObject {
            class: *ty,
            args,
            cause: None,
            traceback: None,
        }));

        self.attach_traceback(instance, *tb);
        *value = Some(instance);
        Ok(())
    }

    fn attach_traceback(&mut self, value: ObjId, tb: Option<ObjId>) {
        if let Some(tb) = tb
            && self.exception_traceback(value).is_none()
            && self.heap.incref(tb).is_ok()
        {
            let _ = self.set_exception_traceback(value, Some(tb));
        }
    }

    /// Raise a builtin exception with a traceback built from the active frames.
    pub fn raise(&mut self, class_name: &str, message: &str) -> Raised {
        let class = self
            .lookup_builtin(class_name)
            .or_else(|| self.lookup_builtin("SystemError"))
            .unwrap_or(ObjId::NULL);

        self.raise_instance(class, Some(message))
    }

    fn raise_instance(&mut self, class: ObjId, message: Option<&str>) -> Raised {
        let value = match self.new_exception(class, message) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("Cannot raise exception of class {}: {}", class, e);
                return Raised;
            }
        };

        let tb = self.traceback_from_frames();

        if let Some(tb) = tb {
            let _ = self.heap.incref(tb);
            let _ = self.set_exception_traceback(value, Some(tb));
        }

        let _ = self.heap.incref(class);
        self.replace_error(Some(PendingError {
            ptype: class,
            pvalue: Some(value),
            ptraceback: tb,
        }));

        Raised
    }

    // ---- frames ---------------------------------------------------------

    /// Run `f` with `frame` pushed on the interpreter call stack.
    pub fn with_frame<T>(&mut self, frame: FrameInfo, f: impl FnOnce(&mut Self) -> T) -> T {
        self.frames.push(frame);
        let result = f(self);
        self.frames.pop();
        result
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// New reference to a traceback chain of the active frames, outermost first.
    fn traceback_from_frames(&mut self) -> Option<ObjId> {
        let mut next = None;

        for frame in self.frames.clone().into_iter().rev() {
            next = Some(
                self.heap
                    .allocate(ObjectData::Traceback(TracebackEntry { frame, next })),
            );
        }

        next
    }

    // ---- operations -----------------------------------------------------

    /// `container[index]`. Returns a new reference.
    pub fn get_item(&mut self, container: ObjId, index: i64) -> InterpResult<ObjId> {
        enum Found {
            Item(ObjId),
            Char(char),
            OutOfRange(&'static str),
            NotSubscriptable,
        }

        fn resolve(index: i64, len: usize) -> Option<usize> {
            let idx = if index < 0 { index + len as i64 } else { index };
            (0..len as i64).contains(&idx).then_some(idx as usize)
        }

        let found = match self.heap.get(container) {
            Ok(ObjectData::List(items)) => match resolve(index, items.len()) {
                Some(i) => Found::Item(items[i]),
                None => Found::OutOfRange("list index out of range"),
            },
            Ok(ObjectData::Str(s)) => {
                let chars: Vec<char> = s.chars().collect();
                match resolve(index, chars.len()) {
                    Some(i) => Found::Char(chars[i]),
                    None => Found::OutOfRange("string index out of range"),
                }
            }
            Ok(_) => Found::NotSubscriptable,
            Err(e) => return Err(self.raise("SystemError", &e.to_string())),
        };

        match found {
            Found::Item(item) => {
                let _ = self.heap.incref(item);
                Ok(item)
            }
            Found::Char(c) => Ok(self.new_str(c.to_string())),
            Found::OutOfRange(message) => Err(self.raise("IndexError", message)),
            Found::NotSubscriptable => {
                let name = self.type_name(container).unwrap_or_default();
                Err(self.raise(
                    "TypeError",
                    &format!("'{}' object is not subscriptable", name),
                ))
            }
        }
    }

    // ---- formatting -----------------------------------------------------

    /// Full traceback report for an exception triple. All arguments borrowed.
    pub fn format_exception(&self, ty: ObjId, value: Option<ObjId>, tb: Option<ObjId>) -> String {
        traceback::format_exception(self, ty, value, tb)
    }

    /// Frame lines of a traceback chain.
    pub fn format_traceback(&self, tb: ObjId) -> String {
        traceback::format_tb(self, tb)
    }

    pub fn format_exception_only(&self, ty: ObjId, value: Option<ObjId>) -> String {
        traceback::format_exception_only(self, ty, value)
    }

    // ---- warnings -------------------------------------------------------

    /// Emit a warning of `category`. `stacklevel` 1 points at the innermost frame.
    pub fn warn(&mut self, category: ObjId, message: &str, stacklevel: u32) -> InterpResult<()> {
        match self.warning_action(category) {
            WarningAction::Ignore => Ok(()),
            WarningAction::Error => Err(self.raise_instance(category, Some(message))),
            WarningAction::Default => {
                let (filename, lineno) = self.warning_location(stacklevel);
                let category = self.class_name(category);

                tracing::debug!("{}:{}: {}: {}", filename, lineno, category, message);
                self.warnings.log.push(WarningMessage {
                    category,
                    message: message.to_string(),
                    filename,
                    lineno,
                });
                Ok(())
            }
        }
    }

    fn warning_action(&self, category: ObjId) -> WarningAction {
        self.warnings
            .filters
            .iter()
            .find(|(filter, _)| self.is_subclass(category, *filter))
            .map(|(_, action)| *action)
            .unwrap_or_default()
    }

    fn warning_location(&self, stacklevel: u32) -> (String, u32) {
        let depth = stacklevel.max(1) as usize;

        self.frames
            .len()
            .checked_sub(depth)
            .and_then(|i| self.frames.get(i))
            .map(|f| (f.filename.clone(), f.lineno))
            .unwrap_or_else(|| ("sys".to_string(), 1))
    }

    /// Install a filter for `category` (borrowed). Newer filters win.
    pub fn add_warning_filter(&mut self, category: ObjId, action: WarningAction) -> Result<(), HeapError> {
        self.heap.incref(category)?;
        self.warnings.filters.insert(0, (category, action));
        Ok(())
    }

    pub fn reset_warning_filters(&mut self) {
        for (category, _) in std::mem::take(&mut self.warnings.filters) {
            let _ = self.heap.decref(category);
        }
    }

    /// Drain the captured-warnings log.
    pub fn take_warnings(&mut self) -> Vec<WarningMessage> {
        std::mem::take(&mut self.warnings.log)
    }
}
