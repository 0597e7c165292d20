//! Foreign-standard traceback formatting.

use std::collections::HashSet;

use super::Interpreter;
use super::heap::ObjId;
use super::object::ObjectData;

pub(super) const TRACEBACK_HEADER: &str = "Traceback (most recent call last):\n";
pub(super) const CAUSE_SEPARATOR: &str =
    "\nThe above exception was the direct cause of the following exception:\n\n";

/// Frame lines of a traceback chain, outermost first.
pub(super) fn format_tb(interp: &Interpreter, tb: ObjId) -> String {
    let mut out = String::new();
    let mut seen = HashSet::new();
    let mut current = Some(tb);

    while let Some(id) = current {
        if !seen.insert(id) {
            break;
        }

        let Ok(ObjectData::Traceback(entry)) = interp.get(id) else {
            break;
        };

        out.push_str(&format!(
            "  File \"{}\", line {}, in {}\n",
            entry.frame.filename, entry.frame.lineno, entry.frame.name
        ));

        if let Some(line) = &entry.frame.source_line {
            let line = line.trim();
            if !line.is_empty() {
                out.push_str(&format!("    {}\n", line));
            }
        }

        current = entry.next;
    }

    out
}

/// The final `Type: message` line (without newline).
pub(super) fn format_exception_only(interp: &Interpreter, ty: ObjId, value: Option<ObjId>) -> String {
    let name = match interp.get(ty) {
        Ok(ObjectData::Type(t)) => t.qualified_name(),
        _ => "<unknown>".to_string(),
    };

    let message = value.map(|v| interp.str_of(v)).unwrap_or_default();

    if message.is_empty() {
        name
    } else {
        format!("{}: {}", name, message)
    }
}

/// Full report including `__cause__` chains, causes first.
pub(super) fn format_exception(
    interp: &Interpreter,
    ty: ObjId,
    value: Option<ObjId>,
    tb: Option<ObjId>,
) -> String {
    let mut out = String::new();
    let mut seen = HashSet::new();

    if let Some(v) = value {
        seen.insert(v);
    }

    format_chained(interp, ty, value, tb, &mut seen, &mut out);
    out
}

fn format_chained(
    interp: &Interpreter,
    ty: ObjId,
    value: Option<ObjId>,
    tb: Option<ObjId>,
    seen: &mut HashSet<ObjId>,
    out: &mut String,
) {
    if let Some(v) = value
        && let Some(cause) = interp.exception_cause(v)
        && seen.insert(cause)
        && let Ok(cause_ty) = interp.type_of(cause)
    {
        let cause_tb = interp.exception_traceback(cause);
        format_chained(interp, cause_ty, Some(cause), cause_tb, seen, out);
        out.push_str(CAUSE_SEPARATOR);
    }

    let tb = tb.or_else(|| value.and_then(|v| interp.exception_traceback(v)));

    if let Some(tb) = tb {
        out.push_str(TRACEBACK_HEADER);
        out.push_str(&format_tb(interp, tb));
    }

    out.push_str(&format_exception_only(interp, ty, value));
    out.push('\n');
}
