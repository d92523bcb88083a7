use serde::Serialize;

use super::{Diagnostic, Severity};
use crate::asm::source_map::SourceMap;

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum Level {
    Error,
    Warning,
}

#[derive(Serialize)]
struct JsonLabel<'a> {
    start: usize,
    end: usize,
    message: &'a str,
    primary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    col: Option<usize>,
    /// The assembly line the label starts on.
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

#[derive(Serialize)]
struct JsonDiagnostic<'a> {
    severity: Level,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    message: &'a str,
    labels: Vec<JsonLabel<'a>>,
    notes: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<&'a str>,
}

/// One diagnostic as a single-line JSON object.
pub fn render(d: &Diagnostic) -> String {
    let source = d.source.as_deref().map(|text| (text, SourceMap::new(text)));
    let labels = d
        .labels
        .iter()
        .map(|l| {
            let position = source.as_ref().map(|(text, map)| {
                let (line, col) = map.lookup(l.span.start);
                (line, col, map.line_text(text, line))
            });
            JsonLabel {
                start: l.span.start,
                end: l.span.end,
                message: &l.message,
                primary: l.is_primary,
                line: position.map(|p| p.0),
                col: position.map(|p| p.1),
                text: position.map(|p| p.2),
            }
        })
        .collect();
    let out = JsonDiagnostic {
        severity: match d.severity {
            Severity::Error => Level::Error,
            Severity::Warning => Level::Warning,
        },
        code: d.code,
        message: &d.message,
        labels,
        notes: &d.notes,
        suggestion: d.suggestion.as_deref(),
    };
    serde_json::to_string(&out)
        .unwrap_or_else(|e| format!(r#"{{"severity":"error","message":"cannot serialize diagnostic: {e}"}}"#))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Span;
    use crate::vm::abort::{Abort, AbortReason, StackEntry};

    fn parse_json(s: &str) -> serde_json::Value {
        serde_json::from_str(s).expect("valid JSON")
    }

    #[test]
    fn abort_renders_code_and_trace() {
        let mut e = Abort::new(AbortReason::ReadNil);
        e.push_frame(StackEntry { function: "load".into(), file: None, line: Some(2) });
        let v = parse_json(&render(&Diagnostic::from(&e)));
        assert_eq!(v["severity"], "error");
        assert_eq!(v["code"], "ZVM-A001");
        assert_eq!(v["message"], "tried to read from address zero.");
        assert_eq!(v["notes"][0], "Called from load, line 2");
        assert!(v["labels"].as_array().unwrap().is_empty());
    }

    #[test]
    fn labels_get_line_and_column_from_source() {
        let d = Diagnostic::error("bad")
            .with_span(Span { start: 12, end: 14 }, "here")
            .with_source(".func f\n    nop\n.end\n");
        let v = parse_json(&render(&d));
        let label = &v["labels"][0];
        assert_eq!(label["start"], 12);
        assert_eq!(label["end"], 14);
        assert_eq!(label["primary"], true);
        assert_eq!(label["line"], 2);
        assert_eq!(label["col"], 5);
        assert_eq!(label["text"], "    nop");
    }

    #[test]
    fn labels_without_source_have_no_position() {
        let d = Diagnostic::error("bad").with_span(Span { start: 5, end: 8 }, "here");
        let v = parse_json(&render(&d));
        assert!(v["labels"][0].get("line").is_none());
        assert!(v.get("code").is_none());
        assert!(v.get("suggestion").is_none());
    }

    #[test]
    fn warning_and_suggestion() {
        let d = Diagnostic::warning("unused label").with_suggestion("remove it");
        let v = parse_json(&render(&d));
        assert_eq!(v["severity"], "warning");
        assert_eq!(v["suggestion"], "remove it");
    }
}
