//! Register VM for game scripts: typed register banks, a block frame stack,
//! a portable interpreter and a Cranelift JIT sharing one calling convention.

pub mod abort;
pub mod builder;
pub mod disasm;
pub mod exec;
pub mod frame;
pub mod function;
pub mod opcodes;
pub mod scope;
pub mod value;
pub mod verify;

#[cfg(feature = "cranelift")]
pub mod jit_cranelift;
#[cfg(feature = "cranelift")]
use jit_cranelift::JitRuntime;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use abort::{Abort, AbortReason, StackEntry};
use frame::FrameStack;
use function::{Function, FunctionFlags, FunctionKind, JitEntry, JitSlot, ScriptFunction};
use opcodes::{REGT_FLOAT, REGT_INT, REGT_MULTIREG2, REGT_MULTIREG3, REGT_STRING, REGT_TYPE};
use value::{ReturnSlot, Value, VmValue};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Compile script functions on first call.
    pub jit: bool,
    /// Functions needing more virtual registers than this are interpreted.
    pub jit_max_registers: usize,
    pub max_call_depth: usize,
    pub stack_block_size: usize,
    /// Log generated Cranelift IR at trace level.
    pub dump_jit_ir: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            jit: cfg!(feature = "cranelift"),
            jit_max_registers: 768,
            max_call_depth: 1000,
            stack_block_size: frame::DEFAULT_BLOCK_SIZE,
            dump_jit_ir: false,
        }
    }
}

impl VmConfig {
    pub fn interpreted() -> Self {
        VmConfig { jit: false, ..Default::default() }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error("JIT backend unavailable: {0}")]
    Unavailable(String),
    #[error("`{op}` at pc {pc} is not supported by the JIT")]
    Unsupported { op: &'static str, pc: usize },
    #[error("function uses {count} registers, ceiling is {limit}")]
    TooManyRegisters { count: usize, limit: usize },
    #[error("jump target {target} falls inside a call sequence")]
    TargetInCall { target: usize },
    #[error("codegen: {0}")]
    Codegen(String),
}

/// Barrier hooks of the host's garbage collector.
pub trait GcHooks {
    /// Object pointer loaded from memory by LO.
    fn read_barrier(&self, obj: *mut u8) -> *mut u8 {
        obj
    }

    /// Object pointer stored to memory by SO.
    fn write_barrier(&self, _obj: *mut u8) {}
}

pub struct NoGc;

impl GcHooks for NoGc {}

#[cfg(not(feature = "cranelift"))]
pub struct JitRuntime;

#[cfg(not(feature = "cranelift"))]
impl JitRuntime {
    pub fn new(_config: &VmConfig) -> Result<Self, JitError> {
        Err(JitError::Unavailable("built without the `cranelift` feature".into()))
    }

    pub fn id(&self) -> u64 {
        0
    }

    pub fn compile(&self, _config: &VmConfig, _func: &Function, _body: &ScriptFunction) -> Result<JitEntry, JitError> {
        Err(JitError::Unavailable("built without the `cranelift` feature".into()))
    }
}

/// Fault record written by compiled code before returning -1.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct FaultRecord {
    pub reason: i32,
    pub pc: i32,
    pub operand: i64,
}

/// Reason value meaning "an abort is waiting in `ExecContext::pending`".
pub(crate) const FAULT_PENDING: i32 = -1;

/// State of one host call into the VM. Compiled code receives a pointer to
/// it and writes `fault` directly, so it must stay the first field.
#[repr(C)]
pub(crate) struct ExecContext<'v> {
    pub fault: FaultRecord,
    pub vm: &'v Vm,
    pub stack: &'v mut FrameStack,
    pub pending: Option<Abort>,
    pub depth: usize,
}

impl ExecContext<'_> {
    /// Turn a fault reported by compiled `func` into an abort and append
    /// that function's stack entry.
    pub(crate) fn take_fault(&mut self, func: &Function, body: &ScriptFunction) -> Abort {
        let fault = std::mem::take(&mut self.fault);
        let mut abort = match self.pending.take() {
            Some(pending) => pending,
            None => fault_to_abort(fault),
        };
        abort.push_frame(script_entry(func, body, fault.pc.max(0) as usize));
        abort
    }
}

pub(crate) fn fault_to_abort(fault: FaultRecord) -> Abort {
    match AbortReason::from_code(fault.reason) {
        Some(AbortReason::ArrayOutOfBounds) => Abort::out_of_bounds(fault.operand >> 32, fault.operand as i32),
        Some(reason) => Abort::new(reason),
        None => Abort::other("compiled code reported an unknown fault"),
    }
}

pub(crate) fn script_entry(func: &Function, body: &ScriptFunction, pc: usize) -> StackEntry {
    StackEntry {
        function: func.name.clone(),
        file: body.source_file().map(str::to_string),
        line: body.pc_to_line(pc),
    }
}

fn fill_defaults<'a>(func: &'a Function, params: &[VmValue<'a>]) -> Result<Vec<VmValue<'a>>, Abort> {
    let mut all = params.to_vec();
    for i in params.len()..func.proto.args.len() {
        match func.defaults.get(i) {
            Some(v) => all.push(v.as_param()),
            None => return Err(Abort::other(format!("{}: missing argument {}", func.name, i + 1))),
        }
    }
    Ok(all)
}

/// Script parameters must match the declared prototype slot by slot.
fn check_arguments(func: &Function, params: &[VmValue]) -> Result<(), Abort> {
    if params.len() > func.proto.args.len() {
        return Err(Abort::other(format!("{}: too many arguments", func.name)));
    }
    for (i, (p, &tag)) in params.iter().zip(&func.proto.args).enumerate() {
        if p.tag() != tag & REGT_TYPE {
            return Err(Abort::other(format!(
                "{}: argument {} should be {}, got {}",
                func.name,
                i + 1,
                value::tag_name(tag),
                value::tag_name(p.tag())
            )));
        }
    }
    Ok(())
}

/// Call any function, native or script, interpreted or compiled.
pub(crate) fn invoke(
    ctx: &mut ExecContext<'_>,
    func: &Function,
    params: &[VmValue],
    rets: &mut [ReturnSlot],
) -> Result<usize, Abort> {
    if func.implicit_args() > 0 && params.first().and_then(VmValue::as_pointer).is_none_or(|p| p.is_null()) {
        return Err(Abort::with_message(AbortReason::BadSelf, format!("calling {}", func.name)));
    }
    let body = match &func.kind {
        FunctionKind::Native(native) => {
            return (native.callback)(params, &func.defaults, rets).map_err(|mut e| {
                e.push_frame(StackEntry::native(&func.name));
                e
            });
        }
        FunctionKind::Script(slot) => slot.get(),
    };
    if func.flags.contains(FunctionFlags::ABSTRACT) {
        return Err(Abort::other(format!("Attempt to call abstract function {}", func.name)));
    }
    let Some(body) = body else {
        return Err(Abort::other(format!("Attempt to call undefined function {}", func.name)));
    };
    if ctx.depth >= ctx.vm.config.max_call_depth {
        return Err(Abort::other("call stack overflow"));
    }

    let filled;
    let params = if params.len() < func.proto.args.len() {
        filled = fill_defaults(func, params)?;
        filled.as_slice()
    } else {
        params
    };
    check_arguments(func, params)?;

    ctx.depth += 1;
    let result = match ctx.vm.jit_entry(func, body) {
        Some(entry) => run_compiled(ctx, entry, func, body, params, rets),
        None => exec::exec(ctx, func, body, params, rets),
    };
    ctx.depth -= 1;
    result
}

fn run_compiled(
    ctx: &mut ExecContext<'_>,
    entry: JitEntry,
    func: &Function,
    body: &ScriptFunction,
    params: &[VmValue],
    rets: &mut [ReturnSlot],
) -> Result<usize, Abort> {
    let ctx_ptr = ctx as *mut ExecContext<'_> as *mut u8;
    // SAFETY: `entry` was generated for `func` by this VM's runtime, which
    // lives as long as `ctx.vm`; the slices outlive the call.
    let n = unsafe {
        entry(
            ctx_ptr,
            func as *const Function,
            params.as_ptr().cast(),
            params.len() as i32,
            rets.as_mut_ptr().cast(),
            rets.len() as i32,
        )
    };
    if n >= 0 {
        Ok(n as usize)
    } else {
        Err(ctx.take_fault(func, body))
    }
}

/// Owned storage for one return value of [`Vm::call_values`].
enum ReturnStorage {
    Int(i32),
    Float(f64),
    String(String),
    Pointer(*mut u8),
    Vec2([f64; 2]),
    Vec3([f64; 3]),
}

impl ReturnStorage {
    fn for_tag(tag: u8) -> Self {
        match (tag & REGT_TYPE, tag & (REGT_MULTIREG2 | REGT_MULTIREG3)) {
            (REGT_FLOAT, REGT_MULTIREG2) => ReturnStorage::Vec2([0.0; 2]),
            (REGT_FLOAT, REGT_MULTIREG3) => ReturnStorage::Vec3([0.0; 3]),
            (REGT_INT, _) => ReturnStorage::Int(0),
            (REGT_FLOAT, _) => ReturnStorage::Float(0.0),
            (REGT_STRING, _) => ReturnStorage::String(String::new()),
            _ => ReturnStorage::Pointer(std::ptr::null_mut()),
        }
    }

    fn slot(&mut self) -> ReturnSlot<'_> {
        match self {
            ReturnStorage::Int(v) => ReturnSlot::int(v),
            ReturnStorage::Float(v) => ReturnSlot::float(v),
            ReturnStorage::String(v) => ReturnSlot::string(v),
            ReturnStorage::Pointer(v) => ReturnSlot::pointer(v),
            ReturnStorage::Vec2(v) => ReturnSlot::vector2(v),
            ReturnStorage::Vec3(v) => ReturnSlot::vector3(v),
        }
    }

    fn push_values(self, out: &mut Vec<Value>) {
        match self {
            ReturnStorage::Int(v) => out.push(Value::Int(v)),
            ReturnStorage::Float(v) => out.push(Value::Float(v)),
            ReturnStorage::String(v) => out.push(Value::String(v)),
            ReturnStorage::Pointer(v) => out.push(Value::Pointer(v as usize)),
            ReturnStorage::Vec2(v) => out.extend(v.map(Value::Float)),
            ReturnStorage::Vec3(v) => out.extend(v.map(Value::Float)),
        }
    }
}

pub struct Vm {
    config: VmConfig,
    jit: Option<JitRuntime>,
    hooks: Box<dyn GcHooks + Send + Sync>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        let jit = if config.jit {
            match JitRuntime::new(&config) {
                Ok(rt) => Some(rt),
                Err(e) => {
                    warn!(error = %e, "JIT unavailable, interpreting everything");
                    None
                }
            }
        } else {
            None
        };
        Vm { config, jit, hooks: Box::new(NoGc) }
    }

    pub fn with_gc_hooks(mut self, hooks: impl GcHooks + Send + Sync + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn jit_enabled(&self) -> bool {
        self.jit.is_some()
    }

    pub(crate) fn gc(&self) -> &dyn GcHooks {
        self.hooks.as_ref()
    }

    pub fn new_stack(&self) -> FrameStack {
        FrameStack::with_block_size(self.config.stack_block_size)
    }

    /// Execution entry point. Returns the number of return values written.
    pub fn call(
        &self,
        stack: &mut FrameStack,
        func: &Function,
        params: &[VmValue],
        rets: &mut [ReturnSlot],
    ) -> Result<usize, Abort> {
        let mut ctx = ExecContext { fault: FaultRecord::default(), vm: self, stack, pending: None, depth: 0 };
        invoke(&mut ctx, func, params, rets)
    }

    /// Call with owned arguments, collecting returns as declared by the
    /// function's prototype. Vector returns are flattened into floats.
    pub fn call_values(&self, stack: &mut FrameStack, func: &Function, args: &[Value]) -> Result<Vec<Value>, Abort> {
        let params: Vec<VmValue> = args.iter().map(Value::as_param).collect();
        let mut storage: Vec<ReturnStorage> = func.proto.returns.iter().map(|&t| ReturnStorage::for_tag(t)).collect();
        let mut slots: Vec<ReturnSlot> = storage.iter_mut().map(ReturnStorage::slot).collect();
        let n = self.call(stack, func, &params, &mut slots)?;
        drop(slots);
        let mut out = Vec::new();
        for s in storage.into_iter().take(n) {
            s.push_values(&mut out);
        }
        Ok(out)
    }

    /// Compiled entry for `func`, compiling on first use.
    pub(crate) fn jit_entry(&self, func: &Function, body: &ScriptFunction) -> Option<JitEntry> {
        let rt = self.jit.as_ref()?;
        let slot = body.jit.get_or_init(|| match rt.compile(&self.config, func, body) {
            Ok(entry) => {
                debug!(function = %func.name, "compiled");
                JitSlot::Compiled { runtime: rt.id(), entry }
            }
            Err(e) => {
                debug!(function = %func.name, reason = %e, "not compiled, interpreting");
                JitSlot::Failed
            }
        });
        match *slot {
            JitSlot::Compiled { runtime, entry } if runtime == rt.id() => Some(entry),
            _ => None,
        }
    }

    /// Whether calls to `func` from this VM run compiled code.
    pub fn is_compiled(&self, func: &Function) -> bool {
        match (func.body().and_then(ScriptFunction::jit_state), &self.jit) {
            (Some(JitSlot::Compiled { runtime, .. }), Some(rt)) => runtime == rt.id(),
            _ => false,
        }
    }

    /// Compile `func` now rather than on first call.
    pub fn precompile(&self, func: &Function) -> bool {
        func.body().and_then(|body| self.jit_entry(func, body)).is_some()
    }

    #[cfg(feature = "cranelift")]
    pub fn code_info(&self, address: usize) -> Option<jit_cranelift::CodeInfo> {
        self.jit.as_ref()?.code_info(address)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new(VmConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::builder::{Bank, CodeBuilder};
    use crate::vm::function::Proto;
    use crate::vm::opcodes::*;
    use std::sync::Arc;

    fn add5() -> Function {
        let f = Function::script("add5", FunctionFlags::STATIC, Proto { args: vec![REGT_INT, REGT_INT], returns: vec![REGT_INT] })
            .with_defaults(vec![Value::Int(0), Value::Int(10)]);
        let mut b = CodeBuilder::new("add5");
        b.alloc(Bank::Int, 2).unwrap();
        b.emit(OP_ADD_RI, 0, 1, 5);
        b.emit(OP_RET, RET_FINAL, REGT_INT, 0);
        f.define(b.finish("add5.zs").unwrap()).unwrap();
        f
    }

    #[test]
    fn config_reads_partial_json() {
        let c = VmConfig::from_json(r#"{"jit": false, "max_call_depth": 5}"#).unwrap();
        assert!(!c.jit);
        assert_eq!(c.max_call_depth, 5);
        assert_eq!(c.jit_max_registers, 768);
    }

    #[test]
    fn missing_arguments_come_from_defaults() {
        let vm = Vm::new(VmConfig::interpreted());
        let mut stack = vm.new_stack();
        let f = add5();
        assert_eq!(vm.call_values(&mut stack, &f, &[Value::Int(0)]).unwrap(), vec![Value::Int(15)]);
        assert_eq!(vm.call_values(&mut stack, &f, &[Value::Int(0), Value::Int(1)]).unwrap(), vec![Value::Int(6)]);
    }

    #[test]
    fn methods_need_self() {
        let vm = Vm::new(VmConfig::interpreted());
        let mut stack = vm.new_stack();
        let mut m = Function::native("m", |_, _, _| Ok(0));
        m.flags = FunctionFlags::NATIVE | FunctionFlags::METHOD;
        let err = vm.call(&mut stack, &m, &[VmValue::null()], &mut []).unwrap_err();
        assert_eq!(err.reason, AbortReason::BadSelf);
    }

    #[test]
    fn undefined_and_abstract_functions_abort() {
        let vm = Vm::new(VmConfig::interpreted());
        let mut stack = vm.new_stack();
        let f = Function::script("later", FunctionFlags::STATIC, Proto::default());
        let err = vm.call(&mut stack, &f, &[], &mut []).unwrap_err();
        assert!(err.to_string().contains("undefined function later"));
        let a = Function::script("abs", FunctionFlags::ABSTRACT, Proto::default());
        assert!(vm.call(&mut stack, &a, &[], &mut []).is_err());
    }

    #[test]
    fn recursion_is_bounded() {
        let vm = Vm::new(VmConfig { max_call_depth: 16, ..VmConfig::interpreted() });
        let mut stack = vm.new_stack();
        let f = Arc::new(Function::script("loop", FunctionFlags::STATIC, Proto::default()));
        let mut b = CodeBuilder::new("loop");
        let k = b.konst_address(function::AddressConst::Function(f.clone())).unwrap();
        b.emit(OP_CALL_K, k as u8, 0, 0);
        b.emit(OP_RET, RET_FINAL, REGT_NIL, 0);
        f.define(b.finish("").unwrap()).unwrap();
        let err = vm.call(&mut stack, &f, &[], &mut []).unwrap_err();
        assert_eq!(err.message.as_deref(), Some("call stack overflow"));
        assert_eq!(err.stack_trace.len(), 16);
        assert_eq!(stack.depth(), 0);
    }
}
