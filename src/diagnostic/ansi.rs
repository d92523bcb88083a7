use std::fmt::Write;

use super::{Diagnostic, Severity};
use crate::asm::source_map::SourceMap;

pub struct AnsiRenderer {
    pub use_color: bool,
}

impl AnsiRenderer {
    fn paint(&self, code: &str, s: &str) -> String {
        if self.use_color { format!("\x1b[{code}m{s}\x1b[0m") } else { s.to_string() }
    }

    fn bold(&self, s: &str) -> String {
        self.paint("1", s)
    }

    fn bold_red(&self, s: &str) -> String {
        self.paint("1;31", s)
    }

    fn bold_yellow(&self, s: &str) -> String {
        self.paint("1;33", s)
    }

    fn cyan(&self, s: &str) -> String {
        self.paint("36", s)
    }

    fn dim(&self, s: &str) -> String {
        self.paint("2", s)
    }

    pub fn render(&self, d: &Diagnostic) -> String {
        let mut out = String::new();

        // "error[ZVM-S004]: message"
        let severity = match d.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        let head = match d.code {
            Some(code) => format!("{severity}[{code}]"),
            None => severity.to_string(),
        };
        let head = match d.severity {
            Severity::Error => self.bold_red(&head),
            Severity::Warning => self.bold_yellow(&head),
        };
        let _ = writeln!(out, "{head}: {}", self.bold(&d.message));

        let primary = d.labels.iter().find(|l| l.is_primary);
        if let (Some(label), Some(source)) = (primary, &d.source) {
            let map = SourceMap::new(source);
            let (line, col) = map.lookup(label.span.start);
            let text = map.line_text(source, line);

            let gutter = line.to_string().len();
            let pipe = self.cyan("|");
            let pad = " ".repeat(gutter);

            let _ = writeln!(out, "  {} {line}:{col}", self.cyan("-->"));
            let _ = writeln!(out, "{pad} {pipe}");
            let _ = writeln!(out, "{} {pipe} {text}", self.cyan(&format!("{line:>gutter$}")));

            // Carets stop at the end of the line for spans that run past it.
            let room = text.len().saturating_sub(col - 1).max(1);
            let width = label.span.end.saturating_sub(label.span.start).clamp(1, room);
            let carets = self.bold_red(&"^".repeat(width));
            let indent = " ".repeat(col - 1);
            if label.message.is_empty() {
                let _ = writeln!(out, "{pad} {pipe} {indent}{carets}");
            } else {
                let _ = writeln!(out, "{pad} {pipe} {indent}{carets} {}", self.bold_red(&label.message));
            }
            let _ = writeln!(out, "{pad} {pipe}");
        }

        for label in d.labels.iter().filter(|l| !l.is_primary && !l.message.is_empty()) {
            let _ = writeln!(out, "  {} {}", self.dim("="), label.message);
        }
        for note in &d.notes {
            let _ = writeln!(out, "  {} note: {note}", self.dim("="));
        }
        if let Some(suggestion) = &d.suggestion {
            let _ = writeln!(out, "  {} help: {suggestion}", self.dim("="));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Span;

    const SRC: &str = ".func f\n    li d0, s1\n.end\n";

    fn make_diag(start: usize, end: usize) -> Diagnostic {
        Diagnostic::error("operands do not fit `li`")
            .with_code("ZVM-S004")
            .with_span(Span { start, end }, "here")
            .with_source(SRC)
            .with_note("in function 'f'")
            .with_suggestion("expected `li dN, imm`")
    }

    #[test]
    fn header_carries_code() {
        let out = AnsiRenderer { use_color: false }.render(&make_diag(12, 21));
        assert!(out.starts_with("error[ZVM-S004]: operands do not fit `li`"), "{out}");
    }

    #[test]
    fn snippet_points_at_line_and_column() {
        let out = AnsiRenderer { use_color: false }.render(&make_diag(12, 21));
        assert!(out.contains("--> 2:5"), "{out}");
        assert!(out.contains("2 |     li d0, s1"), "{out}");
        assert!(out.contains("|     ^^^^^^^^^ here"), "{out}");
    }

    #[test]
    fn notes_and_help_follow_snippet() {
        let out = AnsiRenderer { use_color: false }.render(&make_diag(12, 21));
        assert!(out.contains("= note: in function 'f'"), "{out}");
        assert!(out.contains("= help: expected `li dN, imm`"), "{out}");
    }

    #[test]
    fn carets_are_clamped_to_the_line() {
        let out = AnsiRenderer { use_color: false }.render(&make_diag(12, 40));
        assert!(out.contains("^^^^^^^^^ here"), "{out}");
        assert!(!out.contains("^^^^^^^^^^"), "{out}");
    }

    #[test]
    fn no_source_no_snippet() {
        let out = AnsiRenderer { use_color: false }.render(&Diagnostic::error("division by zero."));
        assert_eq!(out, "error: division by zero.\n");
    }

    #[test]
    fn color_toggle() {
        let d = make_diag(12, 21);
        assert!(AnsiRenderer { use_color: true }.render(&d).contains("\x1b["));
        assert!(!AnsiRenderer { use_color: false }.render(&d).contains("\x1b["));
    }
}
