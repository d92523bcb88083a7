//! Functions, constant pools and line tables.

use std::ops::BitOr;
use std::sync::{Arc, OnceLock};

use super::abort::Abort;
use super::frame::RegCounts;
use super::opcodes::Op;
use super::scope::{ClassDescriptor, Side};
use super::value::{ReturnSlot, Value, VmValue};
use super::verify::{self, VerifyError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FunctionFlags(u32);

impl FunctionFlags {
    pub const NONE: Self = FunctionFlags(0);
    pub const NATIVE: Self = FunctionFlags(1);
    pub const METHOD: Self = FunctionFlags(2);
    pub const STATIC: Self = FunctionFlags(4);
    pub const ACTION: Self = FunctionFlags(8);
    pub const ABSTRACT: Self = FunctionFlags(16);
    pub const UNSAFE: Self = FunctionFlags(32);
    pub const VIRTUAL_SCOPE: Self = FunctionFlags(64);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Hidden leading arguments: self, and for actions the invoker and state.
    pub const fn implicit_args(self) -> usize {
        if self.contains(Self::ACTION) {
            3
        } else if self.contains(Self::METHOD) {
            1
        } else {
            0
        }
    }
}

impl BitOr for FunctionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        FunctionFlags(self.0 | rhs.0)
    }
}

/// Parameter and return type tags (`REGT_*`, one entry per parameter slot).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Proto {
    pub args: Vec<u8>,
    pub returns: Vec<u8>,
}

pub type NativeFn = fn(&[VmValue], &[Value], &mut [ReturnSlot]) -> Result<usize, Abort>;

/// Host-ABI scalar used by the direct-call fast path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeType {
    Int,
    Float,
    Pointer,
}

/// Shape of an `extern "C"` host function the JIT may call directly.
/// Direct natives cannot raise aborts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectNative {
    pub address: usize,
    pub args: Vec<NativeType>,
    pub ret: Option<NativeType>,
}

#[derive(Debug, Clone)]
pub struct NativeFunction {
    pub callback: NativeFn,
    pub direct: Option<DirectNative>,
}

/// `(first pc, line)`; each entry covers pcs up to the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub pc: u32,
    pub line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKind {
    String,
    StringArray(u16),
}

/// A value in the extra region that must be constructed and destroyed with
/// the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialInit {
    pub kind: SpecialKind,
    pub offset: u32,
}

impl SpecialInit {
    pub fn size(&self) -> usize {
        let one = std::mem::size_of::<String>();
        match self.kind {
            SpecialKind::String => one,
            SpecialKind::StringArray(n) => one * n as usize,
        }
    }

    pub fn count(&self) -> usize {
        match self.kind {
            SpecialKind::String => 1,
            SpecialKind::StringArray(n) => n as usize,
        }
    }
}

/// Address-pool entry, compared and embedded by identity.
#[derive(Debug, Clone)]
pub enum AddressConst {
    Null,
    Function(Arc<Function>),
    Class(Arc<ClassDescriptor>),
    Raw(usize),
}

impl AddressConst {
    pub fn addr(&self) -> *mut u8 {
        match self {
            AddressConst::Null => std::ptr::null_mut(),
            AddressConst::Function(f) => Arc::as_ptr(f) as *mut u8,
            AddressConst::Class(c) => Arc::as_ptr(c) as *mut u8,
            AddressConst::Raw(a) => *a as *mut u8,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            AddressConst::Function(f) => Some(f),
            _ => None,
        }
    }
}

/// Entry point of a compiled function. Returns the number of values written,
/// or -1 after recording a fault in the execution context.
pub type JitEntry = unsafe extern "C" fn(
    ctx: *mut u8,
    func: *const Function,
    params: *const VmValue<'static>,
    num_params: i32,
    rets: *mut ReturnSlot<'static>,
    num_rets: i32,
) -> i32;

#[derive(Debug, Clone, Copy)]
pub enum JitSlot {
    Compiled { runtime: u64, entry: JitEntry },
    Failed,
}

/// A defined script body. Immutable once published.
#[derive(Debug)]
pub struct ScriptFunction {
    pub code: Vec<Op>,
    pub line_info: Vec<LineEntry>,
    pub source_file: String,
    pub konst_int: Vec<i32>,
    pub konst_float: Vec<f64>,
    pub konst_string: Vec<String>,
    pub konst_address: Vec<AddressConst>,
    pub counts: RegCounts,
    pub special_inits: Vec<SpecialInit>,
    pub(crate) jit: OnceLock<JitSlot>,
}

impl ScriptFunction {
    pub fn new(code: Vec<Op>, counts: RegCounts) -> Self {
        ScriptFunction {
            code,
            line_info: Vec::new(),
            source_file: String::new(),
            konst_int: Vec::new(),
            konst_float: Vec::new(),
            konst_string: Vec::new(),
            konst_address: Vec::new(),
            counts,
            special_inits: Vec::new(),
            jit: OnceLock::new(),
        }
    }

    pub fn pc_to_line(&self, pc: usize) -> Option<u32> {
        let idx = self.line_info.partition_point(|e| e.pc as usize <= pc);
        idx.checked_sub(1).map(|i| self.line_info[i].line)
    }

    pub fn source_file(&self) -> Option<&str> {
        (!self.source_file.is_empty()).then_some(self.source_file.as_str())
    }

    pub fn jit_state(&self) -> Option<JitSlot> {
        self.jit.get().copied()
    }
}

#[derive(Debug)]
pub enum FunctionKind {
    Native(NativeFunction),
    /// Declared first so bodies can reference it; defined once.
    Script(OnceLock<ScriptFunction>),
}

#[derive(Debug, thiserror::Error)]
pub enum DefineError {
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("function '{0}' already has a body")]
    AlreadyDefined(String),
    #[error("'{0}' is a native function")]
    NotScript(String),
}

#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub flags: FunctionFlags,
    pub side: Side,
    pub proto: Proto,
    /// Default values, indexed by parameter slot.
    pub defaults: Vec<Value>,
    pub kind: FunctionKind,
}

impl Function {
    pub fn native(name: impl Into<String>, callback: NativeFn) -> Self {
        Function {
            name: name.into(),
            flags: FunctionFlags::NATIVE,
            side: Side::PlainData,
            proto: Proto::default(),
            defaults: Vec::new(),
            kind: FunctionKind::Native(NativeFunction { callback, direct: None }),
        }
    }

    pub fn native_direct(name: impl Into<String>, callback: NativeFn, direct: DirectNative) -> Self {
        let mut f = Self::native(name, callback);
        f.kind = FunctionKind::Native(NativeFunction { callback, direct: Some(direct) });
        f
    }

    /// Declare a script function without a body.
    pub fn script(name: impl Into<String>, flags: FunctionFlags, proto: Proto) -> Self {
        Function {
            name: name.into(),
            flags,
            side: Side::PlainData,
            proto,
            defaults: Vec::new(),
            kind: FunctionKind::Script(OnceLock::new()),
        }
    }

    pub fn with_side(mut self, side: Side) -> Self {
        self.side = side;
        self
    }

    pub fn with_defaults(mut self, defaults: Vec<Value>) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn implicit_args(&self) -> usize {
        self.flags.implicit_args()
    }

    pub fn is_native(&self) -> bool {
        matches!(self.kind, FunctionKind::Native(_))
    }

    pub fn body(&self) -> Option<&ScriptFunction> {
        match &self.kind {
            FunctionKind::Script(slot) => slot.get(),
            FunctionKind::Native(_) => None,
        }
    }

    /// Verify and publish a body. A function is defined at most once.
    pub fn define(&self, body: ScriptFunction) -> Result<(), DefineError> {
        let FunctionKind::Script(slot) = &self.kind else {
            return Err(DefineError::NotScript(self.name.clone()));
        };
        if slot.get().is_some() {
            return Err(DefineError::AlreadyDefined(self.name.clone()));
        }
        verify::verify(&self.name, &body)?;
        slot.set(body).map_err(|_| DefineError::AlreadyDefined(self.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::opcodes::*;

    fn nop(_: &[VmValue], _: &[Value], _: &mut [ReturnSlot]) -> Result<usize, Abort> {
        Ok(0)
    }

    #[test]
    fn implicit_args_follow_flags() {
        assert_eq!(FunctionFlags::STATIC.implicit_args(), 0);
        assert_eq!(FunctionFlags::METHOD.implicit_args(), 1);
        assert_eq!((FunctionFlags::METHOD | FunctionFlags::ACTION).implicit_args(), 3);
    }

    #[test]
    fn pc_to_line_uses_last_entry_at_or_before_pc() {
        let mut body = ScriptFunction::new(vec![], RegCounts::default());
        assert_eq!(body.pc_to_line(0), None);
        body.line_info = vec![LineEntry { pc: 0, line: 3 }, LineEntry { pc: 4, line: 7 }];
        assert_eq!(body.pc_to_line(0), Some(3));
        assert_eq!(body.pc_to_line(3), Some(3));
        assert_eq!(body.pc_to_line(4), Some(7));
        assert_eq!(body.pc_to_line(100), Some(7));
    }

    #[test]
    fn body_is_defined_once() {
        let f = Function::script("f", FunctionFlags::STATIC, Proto::default());
        let body = || ScriptFunction::new(vec![Op::abc(OP_RET, RET_FINAL, REGT_NIL, 0)], RegCounts::default());
        f.define(body()).unwrap();
        assert!(matches!(f.define(body()), Err(DefineError::AlreadyDefined(_))));
        assert!(f.body().is_some());
    }

    #[test]
    fn natives_cannot_take_bodies() {
        let f = Function::native("n", nop);
        let body = ScriptFunction::new(vec![Op::abc(OP_RET, RET_FINAL, REGT_NIL, 0)], RegCounts::default());
        assert!(matches!(f.define(body), Err(DefineError::NotScript(_))));
    }

    #[test]
    fn address_constants_expose_identity() {
        let f = Arc::new(Function::native("n", nop));
        let k = AddressConst::Function(f.clone());
        assert_eq!(k.addr() as *const Function, Arc::as_ptr(&f));
        assert!(AddressConst::Null.addr().is_null());
    }
}
