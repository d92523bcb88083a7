//! Renderable diagnostics for assembler, builder, verifier and runtime
//! errors. One shape, two renderers: ANSI text and JSON.

pub mod ansi;
pub mod json;
pub mod registry;

use crate::asm::{AsmError, Span, codes};
use crate::vm::abort::Abort;
use crate::vm::builder::BuildError;
use crate::vm::function::DefineError;
use crate::vm::verify::VerifyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
    pub is_primary: bool,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Stable code, see [`registry`].
    pub code: Option<&'static str>,
    pub message: String,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            code: None,
            message: message.into(),
            labels: Vec::new(),
            notes: Vec::new(),
            suggestion: None,
            source: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic { severity: Severity::Warning, ..Diagnostic::error(message) }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label { span, message: label.into(), is_primary: true });
        self
    }

    pub fn with_secondary_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label { span, message: label.into(), is_primary: false });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Source text the label spans point into.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl From<&AsmError> for Diagnostic {
    fn from(e: &AsmError) -> Self {
        let mut d = Diagnostic::error(&e.message).with_code(e.code).with_span(e.span, "here");
        if let Some(hint) = &e.hint {
            d = d.with_suggestion(hint.clone());
        }
        d
    }
}

impl From<&VerifyError> for Diagnostic {
    fn from(e: &VerifyError) -> Self {
        let mut d = Diagnostic::error(&e.message)
            .with_code(codes::VERIFY)
            .with_note(format!("in function '{}'", e.function));
        if let Some(pc) = e.pc {
            d = d.with_note(format!("at pc {pc} (address {:08x})", pc * 4));
        }
        if let Some(hint) = &e.hint {
            d = d.with_suggestion(hint.clone());
        }
        d
    }
}

impl From<&BuildError> for Diagnostic {
    fn from(e: &BuildError) -> Self {
        match e {
            BuildError::Verify(v) => Diagnostic::from(v),
            other => Diagnostic::error(other.to_string()).with_code(codes::ENCODING),
        }
    }
}

impl From<&DefineError> for Diagnostic {
    fn from(e: &DefineError) -> Self {
        match e {
            DefineError::Verify(v) => Diagnostic::from(v),
            other => Diagnostic::error(other.to_string()).with_code(codes::DUPLICATE),
        }
    }
}

/// Runtime aborts: the reason as the headline, the stack trace as notes,
/// innermost activation first.
impl From<&Abort> for Diagnostic {
    fn from(e: &Abort) -> Self {
        let mut d = Diagnostic::error(e.to_string()).with_code(e.reason.diagnostic_code());
        for entry in &e.stack_trace {
            d = d.with_note(entry.to_string());
        }
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::abort::{AbortReason, StackEntry};

    #[test]
    fn builder_methods() {
        let d = Diagnostic::error("type mismatch")
            .with_code("ZVM-S004")
            .with_span(Span { start: 5, end: 8 }, "here")
            .with_note("in function 'foo'")
            .with_suggestion("use a float register");
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.code, Some("ZVM-S004"));
        assert_eq!(d.labels.len(), 1);
        assert!(d.labels[0].is_primary);
        assert_eq!(d.notes, vec!["in function 'foo'"]);
        assert_eq!(d.suggestion.as_deref(), Some("use a float register"));
        assert_eq!(Diagnostic::warning("w").severity, Severity::Warning);
    }

    #[test]
    fn from_asm_error_keeps_span_code_and_hint() {
        let e = AsmError::new(codes::OPERAND, Span { start: 10, end: 15 }, "operands do not fit `li`")
            .with_hint("expected `li dN, imm`");
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some(codes::OPERAND));
        assert_eq!(d.labels[0].span, Span { start: 10, end: 15 });
        assert_eq!(d.suggestion.as_deref(), Some("expected `li dN, imm`"));
    }

    #[test]
    fn from_verify_error_names_function_and_pc() {
        let e = VerifyError {
            function: "tick".into(),
            pc: Some(3),
            message: "jump target 9 outside code".into(),
            hint: None,
        };
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some(codes::VERIFY));
        assert!(d.notes.iter().any(|n| n.contains("tick")));
        assert!(d.notes.iter().any(|n| n.contains("0000000c")));
    }

    #[test]
    fn from_abort_lists_trace_innermost_first() {
        let mut e = Abort::new(AbortReason::DivisionByZero);
        e.push_frame(StackEntry { function: "inner".into(), file: Some("a.zs".into()), line: Some(4) });
        e.push_frame(StackEntry::native("outer"));
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("ZVM-A005"));
        assert_eq!(d.notes, vec!["Called from inner at a.zs, line 4", "Called from outer"]);
        assert!(d.labels.is_empty());
    }
}
