//! Object payloads stored on the interpreter heap.

use super::heap::ObjId;

/// Location of one interpreter frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub name: String,
    pub filename: String,
    pub lineno: u32,
    /// Source text of the executing line, shown under the frame in tracebacks.
    pub source_line: Option<String>,
}

impl FrameInfo {
    pub fn new(name: impl Into<String>, filename: impl Into<String>, lineno: u32) -> Self {
        Self {
            name: name.into(),
            filename: filename.into(),
            lineno,
            source_line: None,
        }
    }

    pub fn with_source(mut self, line: impl Into<String>) -> Self {
        self.source_line = Some(line.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct TypeObject {
    pub name: String,
    /// `None` for builtins.
    pub module: Option<String>,
    /// Owned reference to the base class.
    pub base: Option<ObjId>,
}

impl TypeObject {
    /// Name as shown in formatted tracebacks (`module.Name` for non-builtins).
    pub fn qualified_name(&self) -> String {
        match &self.module {
            Some(module) => format!("{}.{}", module, self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExceptionObject {
    /// Owned reference to the exception class.
    pub class: ObjId,
    pub args: Vec<ObjId>,
    pub cause: Option<ObjId>,
    pub traceback: Option<ObjId>,
}

#[derive(Debug, Clone)]
pub struct TracebackEntry {
    pub frame: FrameInfo,
    pub next: Option<ObjId>,
}

#[derive(Debug, Clone)]
pub enum ObjectData {
    None,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<ObjId>),
    Type(TypeObject),
    Exception(ExceptionObject),
    Traceback(TracebackEntry),
}

impl ObjectData {
    /// Push every owned reference held by this payload.
    pub fn children(&self, out: &mut Vec<ObjId>) {
        match self {
            ObjectData::None
            | ObjectData::Bool(_)
            | ObjectData::Int(_)
            | ObjectData::Str(_) => {}
            ObjectData::List(items) => out.extend_from_slice(items),
            ObjectData::Type(ty) => out.extend(ty.base),
            ObjectData::Exception(exc) => {
                out.push(exc.class);
                out.extend_from_slice(&exc.args);
                out.extend(exc.cause);
                out.extend(exc.traceback);
            }
            ObjectData::Traceback(tb) => out.extend(tb.next),
        }
    }

    /// Name of the builtin type backing a non-instance payload.
    pub fn builtin_type_name(&self) -> Option<&'static str> {
        match self {
            ObjectData::None => Some("NoneType"),
            ObjectData::Bool(_) => Some("bool"),
            ObjectData::Int(_) => Some("int"),
            ObjectData::Str(_) => Some("str"),
            ObjectData::List(_) => Some("list"),
            ObjectData::Type(_) => Some("type"),
            ObjectData::Traceback(_) => Some("traceback"),
            ObjectData::Exception(_) => None,
        }
    }
}
