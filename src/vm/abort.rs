//! Structured aborts raised by script code, natives and the JIT fault channel.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(i32)]
pub enum AbortReason {
    Other = 0,
    ReadNil = 1,
    WriteNil = 2,
    TooManyRetries = 3,
    ArrayOutOfBounds = 4,
    DivisionByZero = 5,
    BadSelf = 6,
    FormatError = 7,
}

impl AbortReason {
    pub const ALL: [AbortReason; 8] = [
        AbortReason::Other,
        AbortReason::ReadNil,
        AbortReason::WriteNil,
        AbortReason::TooManyRetries,
        AbortReason::ArrayOutOfBounds,
        AbortReason::DivisionByZero,
        AbortReason::BadSelf,
        AbortReason::FormatError,
    ];

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.get(usize::try_from(code).ok()?).copied()
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn default_message(self) -> &'static str {
        match self {
            AbortReason::Other => "VM execution aborted",
            AbortReason::ReadNil => "tried to read from address zero.",
            AbortReason::WriteNil => "tried to write to address zero.",
            AbortReason::TooManyRetries => "too many try-catch retries.",
            AbortReason::ArrayOutOfBounds => "array access out of bounds.",
            AbortReason::DivisionByZero => "division by zero.",
            AbortReason::BadSelf => "invalid self pointer.",
            AbortReason::FormatError => "string format failed.",
        }
    }

    /// Stable diagnostic code, see `diagnostic::registry`.
    pub fn diagnostic_code(self) -> &'static str {
        match self {
            AbortReason::Other => "ZVM-A000",
            AbortReason::ReadNil => "ZVM-A001",
            AbortReason::WriteNil => "ZVM-A002",
            AbortReason::TooManyRetries => "ZVM-A003",
            AbortReason::ArrayOutOfBounds => "ZVM-A004",
            AbortReason::DivisionByZero => "ZVM-A005",
            AbortReason::BadSelf => "ZVM-A006",
            AbortReason::FormatError => "ZVM-A007",
        }
    }
}

/// One line of a stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackEntry {
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl StackEntry {
    pub fn native(function: &str) -> Self {
        StackEntry { function: function.to_string(), file: None, line: None }
    }
}

impl fmt::Display for StackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Called from {}", self.function)?;
        if let Some(file) = &self.file {
            write!(f, " at {file}")?;
        }
        if let Some(line) = self.line {
            write!(f, ", line {line}")?;
        }
        Ok(())
    }
}

/// A script abort. Propagates to the host caller; every activation it
/// leaves appends one `StackEntry`, innermost first.
#[derive(Debug, Clone, PartialEq)]
pub struct Abort {
    pub reason: AbortReason,
    pub message: Option<String>,
    pub stack_trace: Vec<StackEntry>,
}

impl Abort {
    pub fn new(reason: AbortReason) -> Self {
        Abort { reason, message: None, stack_trace: Vec::new() }
    }

    pub fn with_message(reason: AbortReason, message: impl Into<String>) -> Self {
        Abort { reason, message: Some(message.into()), stack_trace: Vec::new() }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_message(AbortReason::Other, message)
    }

    pub(crate) fn out_of_bounds(size: i64, index: i32) -> Self {
        Self::with_message(
            AbortReason::ArrayOutOfBounds,
            format!("Max.index = {}, current index = {index}", size - 1),
        )
    }

    pub fn push_frame(&mut self, entry: StackEntry) {
        self.stack_trace.push(entry);
    }

    /// Full trace, one `Called from` line per activation.
    pub fn trace_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.stack_trace {
            out.push_str(&entry.to_string());
            out.push('\n');
        }
        out
    }
}

impl fmt::Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.reason, &self.message) {
            (AbortReason::Other, Some(msg)) => write!(f, "{msg}"),
            (reason, Some(msg)) => write!(f, "{} {msg}", reason.default_message()),
            (reason, None) => write!(f, "{}", reason.default_message()),
        }
    }
}

impl std::error::Error for Abort {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_entry_formats() {
        let mut e = StackEntry::native("print");
        assert_eq!(e.to_string(), "Called from print");
        e.file = Some("a.zs".into());
        assert_eq!(e.to_string(), "Called from print at a.zs");
        e.line = Some(4);
        assert_eq!(e.to_string(), "Called from print at a.zs, line 4");
    }

    #[test]
    fn message_combines_reason_and_detail() {
        let a = Abort::out_of_bounds(3, 5);
        assert_eq!(a.to_string(), "array access out of bounds. Max.index = 2, current index = 5");
        assert_eq!(Abort::other("boom").to_string(), "boom");
        assert_eq!(Abort::new(AbortReason::DivisionByZero).to_string(), "division by zero.");
    }

    #[test]
    fn reason_codes_round_trip() {
        for r in AbortReason::ALL {
            assert_eq!(AbortReason::from_code(r.code()), Some(r));
        }
        assert_eq!(AbortReason::from_code(-1), None);
        assert_eq!(AbortReason::from_code(8), None);
    }
}
