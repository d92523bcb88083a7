//! Textual assembly front end.
//!
//! ```text
//! .func add5 args d returns d file "demo.zs"
//! .line 3
//!     add_ri d0, d0, 5
//!     ret 0, d0, final
//! .end
//! .native print
//! ```
//!
//! Every `.func` header is declared before any body is assembled, so bodies
//! may reference functions that appear later in the file.

pub mod lexer;
pub mod parser;
pub mod source_map;

use std::sync::Arc;

use crate::vm::function::Function;

/// Byte range within assembly source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const UNKNOWN: Span = Span { start: 0, end: 0 };

    pub fn merge(self, other: Span) -> Span {
        Span { start: self.start.min(other.start), end: self.end.max(other.end) }
    }
}

/// Stable diagnostic codes of the assembler.
pub mod codes {
    pub const LEX: &str = "ZVM-S001";
    pub const SYNTAX: &str = "ZVM-S002";
    pub const UNKNOWN_INSTRUCTION: &str = "ZVM-S003";
    pub const OPERAND: &str = "ZVM-S004";
    pub const UNDEFINED: &str = "ZVM-S005";
    pub const DUPLICATE: &str = "ZVM-S006";
    pub const ENCODING: &str = "ZVM-S007";
    pub const VERIFY: &str = "ZVM-V001";
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct AsmError {
    pub span: Span,
    pub message: String,
    pub code: &'static str,
    pub hint: Option<String>,
}

impl AsmError {
    pub fn new(code: &'static str, span: Span, message: impl Into<String>) -> Self {
        AsmError { span, message: message.into(), code, hint: None }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// The functions of one assembled file, in declaration order.
#[derive(Debug, Default)]
pub struct Module {
    functions: Vec<Arc<Function>>,
    natives: Vec<Arc<Function>>,
}

impl Module {
    pub fn functions(&self) -> &[Arc<Function>] {
        &self.functions
    }

    /// Natives the file imported with `.native`.
    pub fn natives(&self) -> &[Arc<Function>] {
        &self.natives
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Function>> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn first(&self) -> Option<&Arc<Function>> {
        self.functions.first()
    }
}

/// Assemble `source`. `.native` directives resolve against `natives`.
pub fn assemble(source: &str, natives: &[Arc<Function>]) -> Result<Module, AsmError> {
    let tokens = lexer::lex(source)?;
    parser::Assembler::new(&tokens, natives).run()
}
