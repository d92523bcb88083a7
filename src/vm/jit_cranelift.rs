//! Cranelift JIT backend.
//!
//! Lowers a verified script body to one native function with the
//! [`JitEntry`] signature. Int, float and pointer registers become Cranelift
//! variables; strings stay in frame memory and are touched only through
//! helper calls. Faults are written into the [`ExecContext`] fault record and
//! reported by returning -1, so compiled and interpreted frames abort the
//! same way.

use std::collections::{HashMap, HashSet};
use std::mem::offset_of;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use cranelift_codegen::Context;
use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::types::{F32, F64, I32, I64};
use cranelift_codegen::ir::{
    AbiParam, Block, FuncRef, InstBuilder, MemFlags, SourceLoc, StackSlotData, StackSlotKind, Type, UserFuncName,
    Value,
};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module, default_libcall_names};
use tracing::trace;

use super::abort::{Abort, AbortReason};
use super::exec;
use super::frame::{FrameLayout, frame_layout};
use super::function::{Function, FunctionKind, JitEntry, LineEntry, NativeType, ScriptFunction};
use super::opcodes::*;
use super::value::{
    ReturnSlot, SLOT_LOCATION_OFFSET, SLOT_SIZE, SLOT_TAG_OFFSET, VALUE_BITS_OFFSET, VALUE_SIZE, VALUE_TAG_OFFSET,
    VmValue,
};
use super::verify::param_slots;
use super::{ExecContext, FAULT_PENDING, FaultRecord, JitError, VmConfig, invoke};

static NEXT_RUNTIME: AtomicU64 = AtomicU64::new(1);

/// Where a compiled function lives, for mapping native addresses back to
/// script source.
#[derive(Debug, Clone)]
pub struct CodeInfo {
    pub start: usize,
    pub len: usize,
    pub name: String,
    pub file: Option<String>,
    pub line_info: Vec<LineEntry>,
    /// `(native offset, pc)` for the start of each run of machine code
    /// emitted for one instruction, sorted by offset.
    pub pc_map: Vec<(u32, usize)>,
}

impl CodeInfo {
    pub fn contains(&self, address: usize) -> bool {
        address >= self.start && address < self.start + self.len
    }

    /// Bytecode pc whose lowering produced the machine code at `address`.
    /// Untagged code maps to the instruction before it; the prologue has no pc.
    pub fn pc_for_address(&self, address: usize) -> Option<usize> {
        if !self.contains(address) {
            return None;
        }
        let offset = (address - self.start) as u32;
        let idx = self.pc_map.partition_point(|&(start, _)| start <= offset);
        idx.checked_sub(1).map(|i| self.pc_map[i].1)
    }

    pub fn line_for_address(&self, address: usize) -> Option<u32> {
        let pc = self.pc_for_address(address)?;
        let idx = self.line_info.partition_point(|e| e.pc as usize <= pc);
        idx.checked_sub(1).map(|i| self.line_info[i].line)
    }
}

struct JitState {
    module: Option<JITModule>,
    ctx: Context,
    builder_ctx: FunctionBuilderContext,
    code: Vec<CodeInfo>,
    serial: u32,
}

// Only reached through the runtime's mutex.
unsafe impl Send for JitState {}

/// One executable-memory arena plus the code it holds. Entries compiled here
/// are tagged with [`JitRuntime::id`] and must not be called after the
/// runtime is dropped.
pub struct JitRuntime {
    id: u64,
    state: Mutex<JitState>,
}

impl JitRuntime {
    pub fn new(_config: &VmConfig) -> Result<Self, JitError> {
        let mut flags = settings::builder();
        flags.set("opt_level", "speed").map_err(|e| JitError::Unavailable(e.to_string()))?;
        let isa_builder = cranelift_native::builder().map_err(|e| JitError::Unavailable(e.to_string()))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flags))
            .map_err(|e| JitError::Unavailable(e.to_string()))?;
        if isa.pointer_type() != I64 {
            return Err(JitError::Unavailable("only 64-bit hosts are supported".into()));
        }

        let mut builder = JITBuilder::with_isa(isa, default_libcall_names());
        for helper in Helper::ALL {
            let (name, address, _, _) = helper.signature();
            builder.symbol(name, address as *const u8);
        }
        let module = JITModule::new(builder);

        Ok(JitRuntime {
            id: NEXT_RUNTIME.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(JitState {
                module: Some(module),
                ctx: Context::new(),
                builder_ctx: FunctionBuilderContext::new(),
                code: Vec::new(),
                serial: 0,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Compile `body` as the implementation of `func`.
    pub fn compile(&self, config: &VmConfig, func: &Function, body: &ScriptFunction) -> Result<JitEntry, JitError> {
        check_eligible(config, func, body)?;

        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;
        let module = state.module.as_mut().ok_or_else(|| JitError::Unavailable("runtime shut down".into()))?;
        let ptr_ty = module.target_config().pointer_type();

        let mut sig = module.make_signature();
        for ty in [ptr_ty, ptr_ty, ptr_ty, I32, ptr_ty, I32] {
            sig.params.push(AbiParam::new(ty));
        }
        sig.returns.push(AbiParam::new(I32));

        state.serial += 1;
        let symbol = format!("zvm_script_{}", state.serial);
        let id = module.declare_function(&symbol, Linkage::Local, &sig).map_err(codegen_error)?;
        state.ctx.func.signature = sig;
        state.ctx.func.name = UserFuncName::user(0, id.as_u32());

        let lowered = {
            let fb = FunctionBuilder::new(&mut state.ctx.func, &mut state.builder_ctx);
            lower(fb, module, func, body, ptr_ty)
        };
        if let Err(e) = lowered {
            module.clear_context(&mut state.ctx);
            return Err(e);
        }

        if config.dump_jit_ir {
            trace!(function = %func.name, "cranelift IR:\n{}", state.ctx.func.display());
        }

        if let Err(e) = module.define_function(id, &mut state.ctx) {
            module.clear_context(&mut state.ctx);
            return Err(codegen_error(e));
        }
        let (len, pc_map) = state.ctx.compiled_code().map_or((0, Vec::new()), |c| {
            let pcs: Vec<(u32, usize)> = c
                .buffer
                .get_srclocs_sorted()
                .iter()
                .filter(|s| !s.loc.is_default())
                .map(|s| (s.start, s.loc.bits() as usize))
                .collect();
            (c.code_buffer().len(), pcs)
        });
        module.clear_context(&mut state.ctx);
        module.finalize_definitions().map_err(codegen_error)?;

        let code = module.get_finalized_function(id);
        state.code.push(CodeInfo {
            start: code as usize,
            len,
            name: func.name.clone(),
            file: body.source_file().map(str::to_string),
            line_info: body.line_info.clone(),
            pc_map,
        });
        trace!(function = %func.name, address = code as usize, len, "code emitted");

        // SAFETY: the function was declared with exactly the `JitEntry`
        // signature above.
        Ok(unsafe { std::mem::transmute::<*const u8, JitEntry>(code) })
    }

    /// Compiled function containing the native `address`, if any.
    pub fn code_info(&self, address: usize) -> Option<CodeInfo> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.code.iter().find(|c| c.contains(address)).cloned()
    }
}

impl Drop for JitRuntime {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(module) = state.module.take() {
            // SAFETY: entries are only called through a `Vm` holding this
            // runtime, and the runtime id check keeps other VMs away.
            unsafe { module.free_memory() };
        }
    }
}

fn codegen_error(e: impl std::fmt::Debug) -> JitError {
    JitError::Codegen(format!("{e:?}"))
}

fn op_name(op: Op) -> &'static str {
    op.info().map_or("?", |i| i.name)
}

/// Checks that don't need the code generator: register ceiling, prototype
/// shape and call sequences that can be lowered statically.
fn check_eligible(config: &VmConfig, func: &Function, body: &ScriptFunction) -> Result<(), JitError> {
    let c = body.counts;
    let count = c.int as usize + c.float as usize + c.string as usize + c.pointer as usize;
    if count > config.jit_max_registers {
        return Err(JitError::TooManyRegisters { count, limit: config.jit_max_registers });
    }

    let mut per_bank = [0u16; 4];
    for &tag in &func.proto.args {
        per_bank[(tag & REGT_TYPE) as usize] += 1;
    }
    if per_bank[REGT_INT as usize] > c.int
        || per_bank[REGT_FLOAT as usize] > c.float
        || per_bank[REGT_STRING as usize] > c.string
        || per_bank[REGT_POINTER as usize] > c.pointer
    {
        return Err(JitError::Codegen(format!("{}: prototype needs more registers than the body has", func.name)));
    }

    let targets: HashSet<usize> = body
        .code
        .iter()
        .enumerate()
        .filter(|(_, op)| op.opcode() == OP_JMP)
        .map(|(pc, op)| op.jump_target(pc) as usize)
        .collect();

    // (first PARAM pc, slots pushed so far)
    let mut run: Option<(usize, usize)> = None;
    for (pc, &op) in body.code.iter().enumerate() {
        match op.opcode() {
            OP_PARAM | OP_PARAMI => {
                let slots = if op.opcode() == OP_PARAM { pushed_slots(op.a()) } else { 1 };
                run = Some(match run {
                    Some((start, n)) => (start, n + slots),
                    None => (pc, slots),
                });
            }
            OP_CALL | OP_CALL_K => {
                let (start, pushed) = run.take().unwrap_or((pc, 0));
                if let Some(&target) = targets.iter().filter(|&&t| t > start && t <= pc).min() {
                    return Err(JitError::TargetInCall { target });
                }
                if pushed != op.b() as usize {
                    return Err(JitError::Unsupported { op: op_name(op), pc });
                }
            }
            OP_JMP | OP_IJMP | OP_TEST | OP_RET | OP_RETI | OP_THROW if run.is_some() => {
                return Err(JitError::Unsupported { op: op_name(op), pc });
            }
            _ if run.is_some() && op.info().is_some_and(|i| i.is_compare()) => {
                return Err(JitError::Unsupported { op: op_name(op), pc });
            }
            _ => {}
        }
    }
    Ok(())
}

/// Parameter slots one PARAM op fills.
fn pushed_slots(flags: u8) -> usize {
    if flags & REGT_TYPE == REGT_FLOAT && flags & (REGT_ADDROF | REGT_NIL) == 0 {
        param_slots(flags) as usize
    } else {
        1
    }
}

fn multireg_width(flags: u8) -> usize {
    match flags & REGT_MULTIREG {
        REGT_MULTIREG2 => 2,
        REGT_MULTIREG3 => 3,
        _ => 1,
    }
}

// ── Runtime helpers called from compiled code ──────────────────────

#[derive(Clone, Copy)]
enum Arg {
    Int,
    Double,
    Ptr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Helper {
    Enter,
    Leave,
    StringCopy,
    ReadBarrier,
    WriteBarrier,
    Concat,
    StringLen,
    StringCompare,
    IntToString,
    UintToString,
    FloatToString,
    Vec2ToString,
    Vec3ToString,
    PointerToString,
    StringToInt,
    StringToFloat,
    Flop,
    Pow,
    Atan2,
    Call,
    Vtbl,
    Scope,
    Throw,
    FellOffEnd,
    RetInt,
    RetFloat,
    RetPointer,
    RetString,
    RetVector,
}

impl Helper {
    const ALL: [Helper; 29] = [
        Helper::Enter,
        Helper::Leave,
        Helper::StringCopy,
        Helper::ReadBarrier,
        Helper::WriteBarrier,
        Helper::Concat,
        Helper::StringLen,
        Helper::StringCompare,
        Helper::IntToString,
        Helper::UintToString,
        Helper::FloatToString,
        Helper::Vec2ToString,
        Helper::Vec3ToString,
        Helper::PointerToString,
        Helper::StringToInt,
        Helper::StringToFloat,
        Helper::Flop,
        Helper::Pow,
        Helper::Atan2,
        Helper::Call,
        Helper::Vtbl,
        Helper::Scope,
        Helper::Throw,
        Helper::FellOffEnd,
        Helper::RetInt,
        Helper::RetFloat,
        Helper::RetPointer,
        Helper::RetString,
        Helper::RetVector,
    ];

    /// Symbol, address, parameters and result.
    fn signature(self) -> (&'static str, usize, &'static [Arg], Option<Arg>) {
        use Arg::{Double, Int, Ptr};
        match self {
            Helper::Enter => ("zvm_enter", zvm_enter as usize, &[Ptr, Ptr], Some(Ptr)),
            Helper::Leave => ("zvm_leave", zvm_leave as usize, &[Ptr], None),
            Helper::StringCopy => ("zvm_string_copy", zvm_string_copy as usize, &[Ptr, Ptr], None),
            Helper::ReadBarrier => ("zvm_read_barrier", zvm_read_barrier as usize, &[Ptr, Ptr], Some(Ptr)),
            Helper::WriteBarrier => ("zvm_write_barrier", zvm_write_barrier as usize, &[Ptr, Ptr], None),
            Helper::Concat => ("zvm_concat", zvm_concat as usize, &[Ptr, Ptr, Ptr], None),
            Helper::StringLen => ("zvm_string_len", zvm_string_len as usize, &[Ptr], Some(Int)),
            Helper::StringCompare => ("zvm_string_compare", zvm_string_compare as usize, &[Ptr, Ptr, Int], Some(Int)),
            Helper::IntToString => ("zvm_int_to_string", zvm_int_to_string as usize, &[Ptr, Int], None),
            Helper::UintToString => ("zvm_uint_to_string", zvm_uint_to_string as usize, &[Ptr, Int], None),
            Helper::FloatToString => ("zvm_float_to_string", zvm_float_to_string as usize, &[Ptr, Double], None),
            Helper::Vec2ToString => ("zvm_vec2_to_string", zvm_vec2_to_string as usize, &[Ptr, Double, Double], None),
            Helper::Vec3ToString => {
                ("zvm_vec3_to_string", zvm_vec3_to_string as usize, &[Ptr, Double, Double, Double], None)
            }
            Helper::PointerToString => ("zvm_pointer_to_string", zvm_pointer_to_string as usize, &[Ptr, Ptr], None),
            Helper::StringToInt => ("zvm_string_to_int", zvm_string_to_int as usize, &[Ptr], Some(Int)),
            Helper::StringToFloat => ("zvm_string_to_float", zvm_string_to_float as usize, &[Ptr], Some(Double)),
            Helper::Flop => ("zvm_flop", zvm_flop as usize, &[Int, Double], Some(Double)),
            Helper::Pow => ("zvm_pow", zvm_pow as usize, &[Double, Double], Some(Double)),
            Helper::Atan2 => ("zvm_atan2", zvm_atan2 as usize, &[Double, Double], Some(Double)),
            Helper::Call => ("zvm_call", zvm_call as usize, &[Ptr, Ptr, Ptr, Int, Ptr, Int], Some(Int)),
            Helper::Vtbl => ("zvm_vtbl", zvm_vtbl as usize, &[Ptr, Ptr, Int], Some(Ptr)),
            Helper::Scope => ("zvm_scope", zvm_scope as usize, &[Ptr, Ptr, Int, Ptr], Some(Int)),
            Helper::Throw => ("zvm_throw", zvm_throw as usize, &[Ptr, Int, Ptr], None),
            Helper::FellOffEnd => ("zvm_fell_off_end", zvm_fell_off_end as usize, &[Ptr], None),
            Helper::RetInt => ("zvm_ret_int", zvm_ret_int as usize, &[Ptr, Ptr, Int, Int, Int], Some(Int)),
            Helper::RetFloat => ("zvm_ret_float", zvm_ret_float as usize, &[Ptr, Ptr, Int, Int, Double], Some(Int)),
            Helper::RetPointer => ("zvm_ret_pointer", zvm_ret_pointer as usize, &[Ptr, Ptr, Int, Int, Ptr], Some(Int)),
            Helper::RetString => ("zvm_ret_string", zvm_ret_string as usize, &[Ptr, Ptr, Int, Int, Ptr], Some(Int)),
            Helper::RetVector => {
                ("zvm_ret_vector", zvm_ret_vector as usize, &[Ptr, Ptr, Int, Int, Ptr, Int], Some(Int))
            }
        }
    }
}

/// # Safety
/// `ctx` must be the context pointer compiled code was entered with.
unsafe fn context<'a>(ctx: *mut u8) -> &'a mut ExecContext<'a> {
    unsafe { &mut *(ctx as *mut ExecContext<'a>) }
}

fn report(ctx: *mut u8, result: Result<(), Abort>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            unsafe { context(ctx) }.pending = Some(e);
            1
        }
    }
}

extern "C" fn zvm_enter(ctx: *mut u8, func: *const Function) -> *mut u8 {
    // SAFETY: compiled code passes its own context and function.
    let (ctx, func) = unsafe { (context(ctx), &*func) };
    let frame = ctx.stack.alloc_frame(func);
    frame.as_ptr() as *mut u8
}

extern "C" fn zvm_leave(ctx: *mut u8) {
    unsafe { context(ctx) }.stack.pop_top();
}

extern "C" fn zvm_string_copy(dst: *mut String, src: *const String) {
    if ptr::eq(dst, src) {
        return;
    }
    // SAFETY: both point at live strings in frame memory, constants or
    // host memory the script was given.
    unsafe {
        match src.as_ref() {
            Some(s) => (*dst).clone_from(s),
            None => (*dst).clear(),
        }
    }
}

extern "C" fn zvm_read_barrier(ctx: *mut u8, obj: *mut u8) -> *mut u8 {
    unsafe { context(ctx) }.vm.gc().read_barrier(obj)
}

extern "C" fn zvm_write_barrier(ctx: *mut u8, obj: *mut u8) {
    unsafe { context(ctx) }.vm.gc().write_barrier(obj);
}

extern "C" fn zvm_concat(dst: *mut String, x: *const String, y: *const String) {
    let joined = unsafe { exec::concat(&*x, &*y) };
    unsafe { *dst = joined };
}

extern "C" fn zvm_string_len(s: *const String) -> i32 {
    unsafe { (&*s).len() as i32 }
}

extern "C" fn zvm_string_compare(x: *const String, y: *const String, flags: i32) -> i32 {
    unsafe { exec::compare_strings(&*x, &*y, flags as u8) as i32 }
}

extern "C" fn zvm_int_to_string(dst: *mut String, v: i32) {
    unsafe { *dst = v.to_string() };
}

extern "C" fn zvm_uint_to_string(dst: *mut String, v: i32) {
    unsafe { *dst = (v as u32).to_string() };
}

extern "C" fn zvm_float_to_string(dst: *mut String, v: f64) {
    unsafe { *dst = exec::format_float(v) };
}

extern "C" fn zvm_vec2_to_string(dst: *mut String, x: f64, y: f64) {
    unsafe { *dst = exec::format_vector(&[x, y]) };
}

extern "C" fn zvm_vec3_to_string(dst: *mut String, x: f64, y: f64, z: f64) {
    unsafe { *dst = exec::format_vector(&[x, y, z]) };
}

extern "C" fn zvm_pointer_to_string(dst: *mut String, p: *mut u8) {
    unsafe { *dst = exec::format_pointer(p) };
}

extern "C" fn zvm_string_to_int(s: *const String) -> i32 {
    exec::parse_int(unsafe { &*s })
}

extern "C" fn zvm_string_to_float(s: *const String) -> f64 {
    exec::parse_float(unsafe { &*s })
}

extern "C" fn zvm_flop(code: i32, x: f64) -> f64 {
    flop(code as u8, x)
}

extern "C" fn zvm_pow(x: f64, y: f64) -> f64 {
    x.powf(y)
}

extern "C" fn zvm_atan2(y: f64, x: f64) -> f64 {
    exec::atan2_deg(y, x)
}

extern "C" fn zvm_call(
    ctx: *mut u8,
    target: *const Function,
    params: *const VmValue<'static>,
    num_params: i32,
    rets: *mut ReturnSlot<'static>,
    num_rets: i32,
) -> i32 {
    let ctx_ref = unsafe { context(ctx) };
    let Some(callee) = (unsafe { target.as_ref() }) else {
        ctx_ref.pending = Some(Abort::with_message(AbortReason::ReadNil, "attempt to call a null function"));
        return 1;
    };
    // SAFETY: compiled code sizes both areas for the counts it passes.
    let params = unsafe { std::slice::from_raw_parts(params, num_params as usize) };
    let rets = unsafe { std::slice::from_raw_parts_mut(rets, num_rets as usize) };
    report(ctx, invoke(ctx_ref, callee, params, rets).map(|_| ()))
}

extern "C" fn zvm_vtbl(ctx: *mut u8, obj: *mut u8, index: i32) -> *mut u8 {
    match exec::vtable_lookup(obj, index as usize) {
        Ok(f) => f,
        Err(e) => {
            unsafe { context(ctx) }.pending = Some(e);
            ptr::null_mut()
        }
    }
}

extern "C" fn zvm_scope(ctx: *mut u8, obj: *mut u8, caller: i32, callee: *const Function) -> i32 {
    let result = match unsafe { callee.as_ref() } {
        Some(callee) => exec::scope_check(obj, caller as u8, callee),
        None => Err(Abort::other("scope check without a function")),
    };
    report(ctx, result)
}

extern "C" fn zvm_throw(ctx: *mut u8, reason: i32, message: *const String) {
    unsafe { context(ctx) }.pending = Some(exec::throw(reason as u8, unsafe { &*message }));
}

extern "C" fn zvm_fell_off_end(ctx: *mut u8) {
    unsafe { context(ctx) }.pending = Some(Abort::other(exec::FELL_OFF_END));
}

/// # Safety
/// `rets` must hold `num_rets` slots.
unsafe fn ret_slot<'a>(rets: *mut ReturnSlot<'static>, num_rets: i32, idx: i32) -> Option<&'a mut ReturnSlot<'static>> {
    if idx < num_rets { Some(unsafe { &mut *rets.add(idx as usize) }) } else { None }
}

extern "C" fn zvm_ret_int(ctx: *mut u8, rets: *mut ReturnSlot<'static>, num_rets: i32, idx: i32, v: i32) -> i32 {
    match unsafe { ret_slot(rets, num_rets, idx) } {
        Some(slot) => report(ctx, slot.set_int(v)),
        None => 0,
    }
}

extern "C" fn zvm_ret_float(ctx: *mut u8, rets: *mut ReturnSlot<'static>, num_rets: i32, idx: i32, v: f64) -> i32 {
    match unsafe { ret_slot(rets, num_rets, idx) } {
        Some(slot) => report(ctx, slot.set_float(v)),
        None => 0,
    }
}

extern "C" fn zvm_ret_pointer(ctx: *mut u8, rets: *mut ReturnSlot<'static>, num_rets: i32, idx: i32, v: *mut u8) -> i32 {
    match unsafe { ret_slot(rets, num_rets, idx) } {
        Some(slot) => report(ctx, slot.set_pointer(v)),
        None => 0,
    }
}

extern "C" fn zvm_ret_string(
    ctx: *mut u8,
    rets: *mut ReturnSlot<'static>,
    num_rets: i32,
    idx: i32,
    v: *const String,
) -> i32 {
    match unsafe { ret_slot(rets, num_rets, idx) } {
        Some(slot) => report(ctx, slot.set_string(unsafe { &*v })),
        None => 0,
    }
}

extern "C" fn zvm_ret_vector(
    ctx: *mut u8,
    rets: *mut ReturnSlot<'static>,
    num_rets: i32,
    idx: i32,
    src: *const f64,
    n: i32,
) -> i32 {
    match unsafe { ret_slot(rets, num_rets, idx) } {
        Some(slot) => report(ctx, slot.set_vector(unsafe { std::slice::from_raw_parts(src, n as usize) })),
        None => 0,
    }
}

// ── Lowering ────────────────────────────────────────────────────────

/// Where one pushed parameter came from, for the direct native path.
#[derive(Clone, Copy)]
enum ParamSrc {
    Int(Value),
    Float(Value),
    Pointer(Value),
    AddrOf(u8, usize),
    Other,
}

#[derive(Clone, Copy)]
enum Src {
    Reg(usize),
    Konst(usize),
    Imm(i32),
}

#[derive(Clone, Copy)]
enum IntOp {
    Shl,
    Shr,
    Sar,
    Add,
    Sub,
    Mul,
    Div,
    DivU,
    Mod,
    ModU,
    And,
    Or,
    Xor,
    Min,
    Max,
}

#[derive(Clone, Copy)]
enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Min,
    Max,
}

struct Lower<'a, 'f> {
    fb: FunctionBuilder<'f>,
    module: &'a mut JITModule,
    body: &'a ScriptFunction,
    ptr_ty: Type,
    layout: FrameLayout,
    full_frame: bool,
    blocks: Vec<Block>,
    exit: Block,
    ivars: Vec<Variable>,
    fvars: Vec<Variable>,
    pvars: Vec<Variable>,
    ctx: Value,
    base: Value,
    rets: Value,
    num_rets: Value,
    result_slots: Value,
    refs: HashMap<Helper, FuncRef>,
    pending: Vec<ParamSrc>,
}

fn lower(
    mut fb: FunctionBuilder<'_>,
    module: &mut JITModule,
    func: &Function,
    body: &ScriptFunction,
    ptr_ty: Type,
) -> Result<(), JitError> {
    let counts = body.counts;
    let layout = frame_layout(counts);
    let full_frame = counts.string > 0 || counts.extra_size > 0 || !body.special_inits.is_empty();

    let entry = fb.create_block();
    fb.append_block_params_for_function_params(entry);
    fb.switch_to_block(entry);
    let params: Vec<Value> = fb.block_params(entry).to_vec();
    let (ctx, func_ptr, params_in, rets, num_rets) = (params[0], params[1], params[2], params[4], params[5]);

    let mut next_var = 0u32;
    let ivars = declare_vars(&mut fb, &mut next_var, counts.int, I32);
    let fvars = declare_vars(&mut fb, &mut next_var, counts.float, F64);
    let pvars = declare_vars(&mut fb, &mut next_var, counts.pointer, ptr_ty);

    let max_results = body
        .code
        .iter()
        .filter(|op| matches!(op.opcode(), OP_CALL | OP_CALL_K))
        .map(|op| op.c() as usize)
        .max()
        .unwrap_or(0)
        .max(1);
    let slots = fb.create_sized_stack_slot(StackSlotData::new(
        StackSlotKind::ExplicitSlot,
        (max_results * SLOT_SIZE) as u32,
        3,
    ));
    let result_slots = fb.ins().stack_addr(ptr_ty, slots, 0);

    let code_len = body.code.len();
    let blocks: Vec<Block> = (0..=code_len).map(|_| fb.create_block()).collect();
    let exit = fb.create_block();
    fb.append_block_param(exit, I32);

    let mut lw = Lower {
        fb,
        module,
        body,
        ptr_ty,
        layout,
        full_frame,
        blocks,
        exit,
        ivars,
        fvars,
        pvars,
        ctx,
        base: ctx,
        rets,
        num_rets,
        result_slots,
        refs: HashMap::new(),
        pending: Vec::new(),
    };

    lw.base = if full_frame {
        lw.call_value(Helper::Enter, &[ctx, func_ptr])?
    } else {
        let frame = lw.fb.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            layout.size as u32,
            4,
        ));
        lw.fb.ins().stack_addr(ptr_ty, frame, 0)
    };
    lw.init_registers(func, params_in)?;
    let first = lw.blocks[0];
    lw.fb.ins().jump(first, &[]);

    for pc in 0..code_len {
        let block = lw.blocks[pc];
        lw.fb.switch_to_block(block);
        lw.fb.set_srcloc(SourceLoc::new(pc as u32));
        if lw.lower_op(pc)? {
            let next = lw.blocks[pc + 1];
            lw.fb.ins().jump(next, &[]);
        }
    }

    let fell_off = lw.blocks[code_len];
    lw.fb.switch_to_block(fell_off);
    lw.fb.set_srcloc(SourceLoc::new(code_len as u32));
    lw.call_helper(Helper::FellOffEnd, &[ctx])?;
    lw.fault(FAULT_PENDING, code_len, None);

    lw.fb.switch_to_block(exit);
    lw.fb.set_srcloc(SourceLoc::default());
    let n = lw.fb.block_params(exit)[0];
    if lw.full_frame {
        lw.call_helper(Helper::Leave, &[ctx])?;
    }
    lw.fb.ins().return_(&[n]);

    lw.fb.seal_all_blocks();
    lw.fb.finalize();
    Ok(())
}

fn declare_vars(fb: &mut FunctionBuilder, next: &mut u32, n: u16, ty: Type) -> Vec<Variable> {
    (0..n)
        .map(|_| {
            let var = Variable::from_u32(*next);
            *next += 1;
            fb.declare_var(var, ty);
            var
        })
        .collect()
}

impl Lower<'_, '_> {
    fn init_registers(&mut self, func: &Function, params_in: Value) -> Result<(), JitError> {
        for i in 0..self.ivars.len() {
            let z = self.fb.ins().iconst(I32, 0);
            self.fb.def_var(self.ivars[i], z);
        }
        for i in 0..self.fvars.len() {
            let z = self.fb.ins().f64const(0.0);
            self.fb.def_var(self.fvars[i], z);
        }
        for i in 0..self.pvars.len() {
            let z = self.fb.ins().iconst(self.ptr_ty, 0);
            self.fb.def_var(self.pvars[i], z);
        }

        let mut next = [0usize; 4];
        let flags = MemFlags::trusted();
        for (i, &tag) in func.proto.args.iter().enumerate() {
            let bank = tag & REGT_TYPE;
            let reg = next[bank as usize];
            next[bank as usize] += 1;
            let at = (i * VALUE_SIZE) as i32 + VALUE_BITS_OFFSET;
            match bank {
                REGT_INT => {
                    let v = self.fb.ins().load(I32, flags, params_in, at);
                    self.set_d(reg, v);
                }
                REGT_FLOAT => {
                    let v = self.fb.ins().load(F64, flags, params_in, at);
                    self.set_f(reg, v);
                }
                REGT_STRING => {
                    let src = self.fb.ins().load(self.ptr_ty, flags, params_in, at);
                    let dst = self.s_addr(reg);
                    self.call_helper(Helper::StringCopy, &[dst, src])?;
                }
                _ => {
                    let v = self.fb.ins().load(self.ptr_ty, flags, params_in, at);
                    self.set_a(reg, v);
                }
            }
        }
        Ok(())
    }

    // ── helper calls ──

    fn helper_ref(&mut self, helper: Helper) -> Result<FuncRef, JitError> {
        if let Some(&f) = self.refs.get(&helper) {
            return Ok(f);
        }
        let (name, _, params, ret) = helper.signature();
        let mut sig = self.module.make_signature();
        for &p in params {
            sig.params.push(AbiParam::new(self.arg_type(p)));
        }
        if let Some(r) = ret {
            sig.returns.push(AbiParam::new(self.arg_type(r)));
        }
        let id = self.module.declare_function(name, Linkage::Import, &sig).map_err(codegen_error)?;
        let f = self.module.declare_func_in_func(id, self.fb.func);
        self.refs.insert(helper, f);
        Ok(f)
    }

    fn arg_type(&self, arg: Arg) -> Type {
        match arg {
            Arg::Int => I32,
            Arg::Double => F64,
            Arg::Ptr => self.ptr_ty,
        }
    }

    fn call_helper(&mut self, helper: Helper, args: &[Value]) -> Result<Option<Value>, JitError> {
        let f = self.helper_ref(helper)?;
        let inst = self.fb.ins().call(f, args);
        Ok(self.fb.inst_results(inst).first().copied())
    }

    fn call_value(&mut self, helper: Helper, args: &[Value]) -> Result<Value, JitError> {
        self.call_helper(helper, args)?
            .ok_or_else(|| JitError::Codegen(format!("{} returns nothing", helper.signature().0)))
    }

    // ── registers and constants ──

    fn d(&mut self, r: usize) -> Value {
        self.fb.use_var(self.ivars[r])
    }

    fn set_d(&mut self, r: usize, v: Value) {
        self.fb.def_var(self.ivars[r], v);
    }

    fn f(&mut self, r: usize) -> Value {
        self.fb.use_var(self.fvars[r])
    }

    fn set_f(&mut self, r: usize, v: Value) {
        self.fb.def_var(self.fvars[r], v);
    }

    fn a(&mut self, r: usize) -> Value {
        self.fb.use_var(self.pvars[r])
    }

    fn set_a(&mut self, r: usize, v: Value) {
        self.fb.def_var(self.pvars[r], v);
    }

    fn fvec(&mut self, r: usize, n: usize) -> Vec<Value> {
        (r..r + n).map(|i| self.f(i)).collect()
    }

    fn set_fvec(&mut self, r: usize, vals: &[Value]) {
        for (i, &v) in vals.iter().enumerate() {
            self.set_f(r + i, v);
        }
    }

    /// I32 constants must be zero-extended into the immediate.
    fn i32const(&mut self, v: i32) -> Value {
        self.fb.ins().iconst(I32, v as u32 as i64)
    }

    fn kd(&mut self, k: usize) -> Value {
        let v = self.body.konst_int[k];
        self.i32const(v)
    }

    fn kf(&mut self, k: usize) -> Value {
        let v = self.body.konst_float[k];
        self.fb.ins().f64const(v)
    }

    fn ka(&mut self, k: usize) -> Value {
        let p = self.body.konst_address[k].addr();
        self.fb.ins().iconst(self.ptr_ty, p as i64)
    }

    fn ks_addr(&mut self, k: usize) -> Value {
        let p = &self.body.konst_string[k] as *const String;
        self.fb.ins().iconst(self.ptr_ty, p as i64)
    }

    fn frame_addr(&mut self, offset: usize) -> Value {
        self.fb.ins().iadd_imm(self.base, offset as i64)
    }

    fn s_addr(&mut self, r: usize) -> Value {
        self.frame_addr(self.layout.string_offset + r * size_of::<String>())
    }

    /// Frame memory backing register `idx` of `bank`.
    fn reg_addr(&mut self, bank: u8, idx: usize) -> Value {
        let offset = match bank {
            REGT_INT => self.layout.int_offset + idx * 4,
            REGT_FLOAT => self.layout.float_offset + idx * 8,
            REGT_STRING => self.layout.string_offset + idx * size_of::<String>(),
            _ => self.layout.pointer_offset + idx * 8,
        };
        self.frame_addr(offset)
    }

    fn spill(&mut self, bank: u8, idx: usize) {
        let v = match bank {
            REGT_INT => self.d(idx),
            REGT_FLOAT => self.f(idx),
            REGT_POINTER => self.a(idx),
            _ => return,
        };
        let at = self.reg_addr(bank, idx);
        self.fb.ins().store(MemFlags::trusted(), v, at, 0);
    }

    fn reload(&mut self, bank: u8, idx: usize) {
        let at = self.reg_addr(bank, idx);
        let flags = MemFlags::trusted();
        match bank {
            REGT_INT => {
                let v = self.fb.ins().load(I32, flags, at, 0);
                self.set_d(idx, v);
            }
            REGT_FLOAT => {
                let v = self.fb.ins().load(F64, flags, at, 0);
                self.set_f(idx, v);
            }
            REGT_POINTER => {
                let v = self.fb.ins().load(self.ptr_ty, flags, at, 0);
                self.set_a(idx, v);
            }
            _ => {}
        }
    }

    fn int_src(&mut self, src: Src) -> Value {
        match src {
            Src::Reg(r) => self.d(r),
            Src::Konst(k) => self.kd(k),
            Src::Imm(v) => self.i32const(v),
        }
    }

    fn float_src(&mut self, src: Src) -> Value {
        match src {
            Src::Reg(r) => self.f(r),
            Src::Konst(k) => self.kf(k),
            Src::Imm(v) => self.fb.ins().f64const(v as f64),
        }
    }

    // ── faults and branches ──

    /// Record a fault and leave through the exit block.
    fn fault(&mut self, reason: i32, pc: usize, operand: Option<Value>) {
        let base = offset_of!(ExecContext<'static>, fault) as i32;
        let flags = MemFlags::trusted();
        let r = self.i32const(reason);
        self.fb.ins().store(flags, r, self.ctx, base + offset_of!(FaultRecord, reason) as i32);
        let p = self.i32const(pc as i32);
        self.fb.ins().store(flags, p, self.ctx, base + offset_of!(FaultRecord, pc) as i32);
        let operand = match operand {
            Some(v) => v,
            None => self.fb.ins().iconst(I64, 0),
        };
        self.fb.ins().store(flags, operand, self.ctx, base + offset_of!(FaultRecord, operand) as i32);
        let failed = self.i32const(-1);
        self.fb.ins().jump(self.exit, &[failed]);
    }

    /// Fault when `bad` is set, continue in a fresh block otherwise.
    fn guard(&mut self, bad: Value, reason: i32, pc: usize, operand: Option<Value>) {
        let fault_block = self.fb.create_block();
        let ok = self.fb.create_block();
        self.fb.ins().brif(bad, fault_block, &[], ok, &[]);
        self.fb.switch_to_block(fault_block);
        self.fault(reason, pc, operand);
        self.fb.switch_to_block(ok);
    }

    /// Fault with the pending abort when a helper returned nonzero.
    fn check_status(&mut self, status: Value, pc: usize) {
        let bad = self.fb.ins().icmp_imm(IntCC::NotEqual, status, 0);
        self.guard(bad, FAULT_PENDING, pc, None);
    }

    fn jump_target(&self, pc: usize) -> Block {
        self.blocks[self.body.code[pc].jump_target(pc) as usize]
    }

    /// Compare at `pc` fused with the JMP after it.
    fn fused(&mut self, pc: usize, flags: u8, cond: Value) {
        let taken = self.jump_target(pc + 1);
        let skip = self.blocks[pc + 2];
        if flags & CMP_CHECK != 0 {
            self.fb.ins().brif(cond, taken, &[], skip, &[]);
        } else {
            self.fb.ins().brif(cond, skip, &[], taken, &[]);
        }
    }

    fn int_branch(&mut self, pc: usize, flags: u8, cc: IntCC, x: Src, y: Src) {
        let (x, y) = (self.int_src(x), self.int_src(y));
        let cond = self.fb.ins().icmp(cc, x, y);
        self.fused(pc, flags, cond);
    }

    fn float_cond(&mut self, method: u8, flags: u8, x: Value, y: Value) -> Value {
        let approx = flags & CMP_APPROX != 0;
        if !approx {
            let cc = match method {
                CMP_LT => FloatCC::LessThan,
                CMP_LE => FloatCC::LessThanOrEqual,
                _ => FloatCC::Equal,
            };
            return self.fb.ins().fcmp(cc, x, y);
        }
        let eps = self.fb.ins().f64const(VM_EPSILON);
        match method {
            CMP_LT => {
                let diff = self.fb.ins().fsub(y, x);
                self.fb.ins().fcmp(FloatCC::GreaterThan, diff, eps)
            }
            CMP_LE => {
                let diff = self.fb.ins().fsub(x, y);
                self.fb.ins().fcmp(FloatCC::LessThan, diff, eps)
            }
            _ => {
                let diff = self.fb.ins().fsub(x, y);
                let diff = self.fb.ins().fabs(diff);
                self.fb.ins().fcmp(FloatCC::LessThan, diff, eps)
            }
        }
    }

    fn float_branch(&mut self, pc: usize, flags: u8, method: u8, x: Src, y: Src) {
        let (x, y) = (self.float_src(x), self.float_src(y));
        let cond = self.float_cond(method, flags, x, y);
        self.fused(pc, flags, cond);
    }

    fn vector_branch(&mut self, pc: usize, flags: u8, b: usize, c: usize, n: usize) {
        let (x, y) = (self.fvec(b, n), self.fvec(c, n));
        let mut all = self.float_cond(CMP_EQ, flags, x[0], y[0]);
        for i in 1..n {
            let next = self.float_cond(CMP_EQ, flags, x[i], y[i]);
            all = self.fb.ins().band(all, next);
        }
        self.fused(pc, flags, all);
    }

    // ── arithmetic ──

    fn int3(&mut self, a: usize, op: IntOp, x: Src, y: Src, pc: usize) {
        let divides = matches!(op, IntOp::Div | IntOp::DivU | IntOp::Mod | IntOp::ModU);
        if divides && matches!(y, Src::Konst(k) if self.body.konst_int[k] == 0) {
            // Constant zero divisor: fault unconditionally, no division emitted.
            self.fault(AbortReason::DivisionByZero.code(), pc, None);
            let dead = self.fb.create_block();
            self.fb.switch_to_block(dead);
            return;
        }
        let (x, y) = (self.int_src(x), self.int_src(y));
        let v = match op {
            IntOp::Shl => self.fb.ins().ishl(x, y),
            IntOp::Shr => self.fb.ins().ushr(x, y),
            IntOp::Sar => self.fb.ins().sshr(x, y),
            IntOp::Add => self.fb.ins().iadd(x, y),
            IntOp::Sub => self.fb.ins().isub(x, y),
            IntOp::Mul => self.fb.ins().imul(x, y),
            IntOp::And => self.fb.ins().band(x, y),
            IntOp::Or => self.fb.ins().bor(x, y),
            IntOp::Xor => self.fb.ins().bxor(x, y),
            IntOp::Min => self.fb.ins().smin(x, y),
            IntOp::Max => self.fb.ins().smax(x, y),
            IntOp::Div | IntOp::DivU | IntOp::Mod | IntOp::ModU => {
                let zero = self.fb.ins().icmp_imm(IntCC::Equal, y, 0);
                self.guard(zero, AbortReason::DivisionByZero.code(), pc, None);
                match op {
                    IntOp::DivU => self.fb.ins().udiv(x, y),
                    IntOp::ModU => self.fb.ins().urem(x, y),
                    _ => self.signed_divide(x, y, matches!(op, IntOp::Mod)),
                }
            }
        };
        self.set_d(a, v);
    }

    /// Signed division where `i32::MIN / -1` wraps instead of trapping.
    fn signed_divide(&mut self, x: Value, y: Value, remainder: bool) -> Value {
        let minus_one = self.i32const(-1);
        let is_minus_one = self.fb.ins().icmp(IntCC::Equal, y, minus_one);
        let one = self.i32const(1);
        let safe = self.fb.ins().select(is_minus_one, one, y);
        if remainder {
            let r = self.fb.ins().srem(x, safe);
            let zero = self.i32const(0);
            self.fb.ins().select(is_minus_one, zero, r)
        } else {
            let q = self.fb.ins().sdiv(x, safe);
            let negated = self.fb.ins().ineg(x);
            self.fb.ins().select(is_minus_one, negated, q)
        }
    }

    fn float3(&mut self, a: usize, op: FloatOp, x: Src, y: Src, pc: usize) -> Result<(), JitError> {
        let (x, y) = (self.float_src(x), self.float_src(y));
        let v = match op {
            FloatOp::Add => self.fb.ins().fadd(x, y),
            FloatOp::Sub => self.fb.ins().fsub(x, y),
            FloatOp::Mul => self.fb.ins().fmul(x, y),
            FloatOp::Div | FloatOp::Mod => {
                let zero = self.fb.ins().f64const(0.0);
                let is_zero = self.fb.ins().fcmp(FloatCC::Equal, y, zero);
                self.guard(is_zero, AbortReason::DivisionByZero.code(), pc, None);
                let q = self.fb.ins().fdiv(x, y);
                if matches!(op, FloatOp::Div) {
                    q
                } else {
                    let floored = self.fb.ins().floor(q);
                    let scaled = self.fb.ins().fmul(floored, y);
                    self.fb.ins().fsub(x, scaled)
                }
            }
            FloatOp::Pow => self.call_value(Helper::Pow, &[x, y])?,
            FloatOp::Min => {
                let lt = self.fb.ins().fcmp(FloatCC::LessThan, x, y);
                self.fb.ins().select(lt, x, y)
            }
            FloatOp::Max => {
                let gt = self.fb.ins().fcmp(FloatCC::GreaterThan, x, y);
                self.fb.ins().select(gt, x, y)
            }
        };
        self.set_f(a, v);
        Ok(())
    }

    fn flop(&mut self, a: usize, b: usize, code: u8) -> Result<(), JitError> {
        let x = self.f(b);
        let v = match code {
            FLOP_ABS => self.fb.ins().fabs(x),
            FLOP_NEG => self.fb.ins().fneg(x),
            FLOP_SQRT => self.fb.ins().sqrt(x),
            FLOP_CEIL => self.fb.ins().ceil(x),
            FLOP_FLOOR => self.fb.ins().floor(x),
            _ => {
                let k = self.i32const(code as i32);
                self.call_value(Helper::Flop, &[k, x])?
            }
        };
        self.set_f(a, v);
        Ok(())
    }

    fn vector_zip(&mut self, a: usize, b: usize, c: usize, n: usize, sub: bool) {
        let (x, y) = (self.fvec(b, n), self.fvec(c, n));
        let out: Vec<Value> = x
            .iter()
            .zip(&y)
            .map(|(&p, &q)| if sub { self.fb.ins().fsub(p, q) } else { self.fb.ins().fadd(p, q) })
            .collect();
        self.set_fvec(a, &out);
    }

    fn vector_scale(&mut self, a: usize, b: usize, n: usize, k: Src, divide: bool) {
        let x = self.fvec(b, n);
        let k = self.float_src(k);
        let out: Vec<Value> = x
            .iter()
            .map(|&p| if divide { self.fb.ins().fdiv(p, k) } else { self.fb.ins().fmul(p, k) })
            .collect();
        self.set_fvec(a, &out);
    }

    fn dot(&mut self, x: &[Value], y: &[Value]) -> Value {
        let mut sum = self.fb.ins().fmul(x[0], y[0]);
        for i in 1..x.len() {
            let term = self.fb.ins().fmul(x[i], y[i]);
            sum = self.fb.ins().fadd(sum, term);
        }
        sum
    }

    // ── memory ──

    fn mem_offset(&mut self, op: Op) -> Value {
        let c = op.c() as usize;
        match op.info() {
            Some(info) if info.mode.c == Operand::IntReg => self.d(c),
            _ => self.kd(c),
        }
    }

    /// Host address `base + offset`, faulting on a null base.
    fn host_addr(&mut self, base_reg: usize, offset: Option<Value>, reason: AbortReason, pc: usize) -> Value {
        let base = self.a(base_reg);
        let is_null = self.fb.ins().icmp_imm(IntCC::Equal, base, 0);
        self.guard(is_null, reason.code(), pc, None);
        match offset {
            Some(off) => {
                let off = self.fb.ins().sextend(self.ptr_ty, off);
                self.fb.ins().iadd(base, off)
            }
            None => base,
        }
    }

    fn load_op(&mut self, op: Op, pc: usize) -> Result<(), JitError> {
        let (a, b) = (op.a() as usize, op.b() as usize);
        let off = self.mem_offset(op);
        let p = self.host_addr(b, Some(off), AbortReason::ReadNil, pc);
        let host = MemFlags::new();
        match op.opcode() {
            OP_LB | OP_LB_R => {
                let v = self.fb.ins().sload8(I32, host, p, 0);
                self.set_d(a, v);
            }
            OP_LBU | OP_LBU_R => {
                let v = self.fb.ins().uload8(I32, host, p, 0);
                self.set_d(a, v);
            }
            OP_LH | OP_LH_R => {
                let v = self.fb.ins().sload16(I32, host, p, 0);
                self.set_d(a, v);
            }
            OP_LHU | OP_LHU_R => {
                let v = self.fb.ins().uload16(I32, host, p, 0);
                self.set_d(a, v);
            }
            OP_LW | OP_LW_R => {
                let v = self.fb.ins().load(I32, host, p, 0);
                self.set_d(a, v);
            }
            OP_LSP | OP_LSP_R => {
                let v = self.fb.ins().load(F32, host, p, 0);
                let v = self.fb.ins().fpromote(F64, v);
                self.set_f(a, v);
            }
            OP_LDP | OP_LDP_R => {
                let v = self.fb.ins().load(F64, host, p, 0);
                self.set_f(a, v);
            }
            OP_LP | OP_LP_R => {
                let v = self.fb.ins().load(self.ptr_ty, host, p, 0);
                self.set_a(a, v);
            }
            OP_LO | OP_LO_R => {
                let v = self.fb.ins().load(self.ptr_ty, host, p, 0);
                let v = self.call_value(Helper::ReadBarrier, &[self.ctx, v])?;
                self.set_a(a, v);
            }
            OP_LS | OP_LS_R => {
                let dst = self.s_addr(a);
                self.call_helper(Helper::StringCopy, &[dst, p])?;
            }
            OP_LV2 | OP_LV2_R | OP_LV3 | OP_LV3_R => {
                let n = if matches!(op.opcode(), OP_LV2 | OP_LV2_R) { 2 } else { 3 };
                let vals: Vec<Value> = (0..n).map(|i| self.fb.ins().load(F64, host, p, (i * 8) as i32)).collect();
                self.set_fvec(a, &vals);
            }
            _ => return Err(JitError::Unsupported { op: op_name(op), pc }),
        }
        Ok(())
    }

    fn store_op(&mut self, op: Op, pc: usize) -> Result<(), JitError> {
        let (a, b) = (op.a() as usize, op.b() as usize);
        let off = self.mem_offset(op);
        let p = self.host_addr(a, Some(off), AbortReason::WriteNil, pc);
        let host = MemFlags::new();
        match op.opcode() {
            OP_SB | OP_SB_R => {
                let v = self.d(b);
                self.fb.ins().istore8(host, v, p, 0);
            }
            OP_SH | OP_SH_R => {
                let v = self.d(b);
                self.fb.ins().istore16(host, v, p, 0);
            }
            OP_SW | OP_SW_R => {
                let v = self.d(b);
                self.fb.ins().store(host, v, p, 0);
            }
            OP_SSP | OP_SSP_R => {
                let v = self.f(b);
                let v = self.fb.ins().fdemote(F32, v);
                self.fb.ins().store(host, v, p, 0);
            }
            OP_SDP | OP_SDP_R => {
                let v = self.f(b);
                self.fb.ins().store(host, v, p, 0);
            }
            OP_SP | OP_SP_R => {
                let v = self.a(b);
                self.fb.ins().store(host, v, p, 0);
            }
            OP_SO | OP_SO_R => {
                let v = self.a(b);
                self.fb.ins().store(host, v, p, 0);
                self.call_helper(Helper::WriteBarrier, &[self.ctx, v])?;
            }
            OP_SS | OP_SS_R => {
                let src = self.s_addr(b);
                self.call_helper(Helper::StringCopy, &[p, src])?;
            }
            OP_SV2 | OP_SV2_R | OP_SV3 | OP_SV3_R => {
                let n = if matches!(op.opcode(), OP_SV2 | OP_SV2_R) { 2 } else { 3 };
                for (i, v) in self.fvec(b, n).into_iter().enumerate() {
                    self.fb.ins().store(host, v, p, (i * 8) as i32);
                }
            }
            _ => return Err(JitError::Unsupported { op: op_name(op), pc }),
        }
        Ok(())
    }

    fn bit_op(&mut self, op: Op, pc: usize) {
        let (a, b) = (op.a() as usize, op.b() as usize);
        let mask = op.c() as i32;
        let host = MemFlags::new();
        if op.opcode() == OP_LBIT {
            let p = self.host_addr(b, None, AbortReason::ReadNil, pc);
            let byte = self.fb.ins().uload8(I32, host, p, 0);
            let m = self.i32const(mask);
            let bits = self.fb.ins().band(byte, m);
            let set = self.fb.ins().icmp_imm(IntCC::NotEqual, bits, 0);
            let v = self.fb.ins().uextend(I32, set);
            self.set_d(a, v);
        } else {
            let p = self.host_addr(a, None, AbortReason::WriteNil, pc);
            let old = self.fb.ins().uload8(I32, host, p, 0);
            let flag = self.d(b);
            let on = self.fb.ins().icmp_imm(IntCC::NotEqual, flag, 0);
            let m = self.i32const(mask);
            let inv = self.i32const(!mask & 0xff);
            let with = self.fb.ins().bor(old, m);
            let without = self.fb.ins().band(old, inv);
            let new = self.fb.ins().select(on, with, without);
            self.fb.ins().istore8(host, new, p, 0);
        }
    }

    // ── casts ──

    fn cast(&mut self, a: usize, b: usize, kind: u8, pc: usize) -> Result<(), JitError> {
        match kind {
            CAST_I2F => {
                let x = self.d(b);
                let v = self.fb.ins().fcvt_from_sint(F64, x);
                self.set_f(a, v);
            }
            CAST_U2F => {
                let x = self.d(b);
                let v = self.fb.ins().fcvt_from_uint(F64, x);
                self.set_f(a, v);
            }
            CAST_F2I => {
                let x = self.f(b);
                let v = self.fb.ins().fcvt_to_sint_sat(I32, x);
                self.set_d(a, v);
            }
            CAST_F2U => {
                let x = self.f(b);
                let v = self.fb.ins().fcvt_to_uint_sat(I32, x);
                self.set_d(a, v);
            }
            CAST_I2S | CAST_U2S => {
                let dst = self.s_addr(a);
                let x = self.d(b);
                let helper = if kind == CAST_I2S { Helper::IntToString } else { Helper::UintToString };
                self.call_helper(helper, &[dst, x])?;
            }
            CAST_F2S => {
                let dst = self.s_addr(a);
                let x = self.f(b);
                self.call_helper(Helper::FloatToString, &[dst, x])?;
            }
            CAST_V22S | CAST_V32S => {
                let dst = self.s_addr(a);
                let (n, helper) = if kind == CAST_V22S { (2, Helper::Vec2ToString) } else { (3, Helper::Vec3ToString) };
                let mut args = vec![dst];
                args.extend(self.fvec(b, n));
                self.call_helper(helper, &args)?;
            }
            CAST_P2S => {
                let dst = self.s_addr(a);
                let x = self.a(b);
                self.call_helper(Helper::PointerToString, &[dst, x])?;
            }
            CAST_S2I => {
                let src = self.s_addr(b);
                let v = self.call_value(Helper::StringToInt, &[src])?;
                self.set_d(a, v);
            }
            CAST_S2F => {
                let src = self.s_addr(b);
                let v = self.call_value(Helper::StringToFloat, &[src])?;
                self.set_f(a, v);
            }
            _ => return Err(JitError::Unsupported { op: "cast", pc }),
        }
        Ok(())
    }

    fn castb(&mut self, a: usize, b: usize, kind: u8, pc: usize) -> Result<(), JitError> {
        let set = match kind {
            CASTB_I => {
                let x = self.d(b);
                self.fb.ins().icmp_imm(IntCC::NotEqual, x, 0)
            }
            CASTB_F => {
                let x = self.f(b);
                let zero = self.fb.ins().f64const(0.0);
                self.fb.ins().fcmp(FloatCC::NotEqual, x, zero)
            }
            CASTB_A => {
                let x = self.a(b);
                self.fb.ins().icmp_imm(IntCC::NotEqual, x, 0)
            }
            CASTB_S => {
                let s = self.s_addr(b);
                let len = self.call_value(Helper::StringLen, &[s])?;
                self.fb.ins().icmp_imm(IntCC::NotEqual, len, 0)
            }
            _ => return Err(JitError::Unsupported { op: "castb", pc }),
        };
        let v = self.fb.ins().uextend(I32, set);
        self.set_d(a, v);
        Ok(())
    }

    // ── calls and returns ──

    fn push_param(&mut self, bits: Value, tag: u8, src: ParamSrc) {
        let at = (self.layout.param_offset + self.pending.len() * VALUE_SIZE) as i32;
        let flags = MemFlags::trusted();
        let bits = if self.fb.func.dfg.value_type(bits) == I32 { self.fb.ins().uextend(I64, bits) } else { bits };
        self.fb.ins().store(flags, bits, self.base, at + VALUE_BITS_OFFSET);
        let tag_value = self.i32const(tag as i32);
        self.fb.ins().istore8(flags, tag_value, self.base, at + VALUE_TAG_OFFSET);
        self.pending.push(src);
    }

    fn param(&mut self, flags: u8, idx: usize) {
        if flags == REGT_NIL {
            let null = self.fb.ins().iconst(self.ptr_ty, 0);
            self.push_param(null, REGT_POINTER, ParamSrc::Pointer(null));
            return;
        }
        let bank = flags & REGT_TYPE;
        if flags & REGT_ADDROF != 0 {
            let p = self.reg_addr(bank, idx);
            self.push_param(p, REGT_POINTER, ParamSrc::AddrOf(bank, idx));
            return;
        }
        let konst = flags & REGT_KONST != 0;
        match bank {
            REGT_INT => {
                let v = if konst { self.kd(idx) } else { self.d(idx) };
                self.push_param(v, REGT_INT, ParamSrc::Int(v));
            }
            REGT_FLOAT => {
                for i in 0..multireg_width(flags) {
                    let v = if konst { self.kf(idx + i) } else { self.f(idx + i) };
                    self.push_param(v, REGT_FLOAT, ParamSrc::Float(v));
                }
            }
            REGT_STRING => {
                let p = if konst { self.ks_addr(idx) } else { self.s_addr(idx) };
                self.push_param(p, REGT_STRING, ParamSrc::Other);
            }
            _ => {
                let p = if konst { self.ka(idx) } else { self.a(idx) };
                self.push_param(p, REGT_POINTER, ParamSrc::Pointer(p));
            }
        }
    }

    /// CALL_K straight into an `extern "C"` host function, skipping the
    /// parameter area. Returns false when the call doesn't qualify.
    fn direct_call(&mut self, pc: usize, k: usize, num_params: usize, num_results: usize) -> bool {
        let body = self.body;
        let Some(callee) = body.konst_address[k].as_function() else {
            return false;
        };
        let FunctionKind::Native(native) = &callee.kind else {
            return false;
        };
        let Some(direct) = &native.direct else {
            return false;
        };
        if callee.implicit_args() > 0 || direct.args.len() != num_params || self.pending.len() != num_params {
            return false;
        }
        let mut args = Vec::with_capacity(num_params);
        for (src, ty) in self.pending.iter().zip(&direct.args) {
            match (*src, ty) {
                (ParamSrc::Int(v), NativeType::Int)
                | (ParamSrc::Float(v), NativeType::Float)
                | (ParamSrc::Pointer(v), NativeType::Pointer) => args.push(v),
                _ => return false,
            }
        }
        let result = match (num_results, direct.ret) {
            (0, _) => None,
            (1, Some(ret)) => {
                let rop = body.code[pc + 1];
                let flags = rop.a();
                let expected = match ret {
                    NativeType::Int => REGT_INT,
                    NativeType::Float => REGT_FLOAT,
                    NativeType::Pointer => REGT_POINTER,
                };
                if flags != expected {
                    return false;
                }
                Some((flags, rop.bc() as usize))
            }
            _ => return false,
        };

        let mut sig = self.module.make_signature();
        for ty in &direct.args {
            sig.params.push(AbiParam::new(self.native_type(*ty)));
        }
        if let Some(ret) = direct.ret {
            sig.returns.push(AbiParam::new(self.native_type(ret)));
        }
        let sig_ref = self.fb.import_signature(sig);
        let callee_addr = self.fb.ins().iconst(self.ptr_ty, direct.address as i64);
        let inst = self.fb.ins().call_indirect(sig_ref, callee_addr, &args);
        if let Some((flags, idx)) = result {
            let v = self.fb.inst_results(inst)[0];
            match flags {
                REGT_INT => self.set_d(idx, v),
                REGT_FLOAT => self.set_f(idx, v),
                _ => self.set_a(idx, v),
            }
        }
        self.pending.clear();
        let next = self.blocks[pc + 1 + num_results];
        self.fb.ins().jump(next, &[]);
        true
    }

    fn native_type(&self, ty: NativeType) -> Type {
        match ty {
            NativeType::Int => I32,
            NativeType::Float => F64,
            NativeType::Pointer => self.ptr_ty,
        }
    }

    fn call(&mut self, pc: usize, target: Value, num_params: usize, num_results: usize) -> Result<(), JitError> {
        let sources = std::mem::take(&mut self.pending);
        let mut reload: Vec<(u8, usize, usize)> = Vec::new();
        for src in &sources {
            if let ParamSrc::AddrOf(bank, idx) = *src {
                self.spill(bank, idx);
                reload.push((bank, idx, 1));
            }
        }

        let flags = MemFlags::trusted();
        for i in 0..num_results {
            let rop = self.body.code[pc + 1 + i];
            let (rflags, idx) = (rop.a(), rop.bc() as usize);
            let bank = rflags & REGT_TYPE;
            let location = self.reg_addr(bank, idx);
            let at = (i * SLOT_SIZE) as i32;
            self.fb.ins().store(flags, location, self.result_slots, at + SLOT_LOCATION_OFFSET);
            let tag = self.i32const((rflags & (REGT_TYPE | REGT_MULTIREG)) as i32);
            self.fb.ins().istore8(flags, tag, self.result_slots, at + SLOT_TAG_OFFSET);
            reload.push((bank, idx, if bank == REGT_FLOAT { multireg_width(rflags) } else { 1 }));
        }

        let params = self.frame_addr(self.layout.param_offset);
        let np = self.i32const(num_params as i32);
        let nr = self.i32const(num_results as i32);
        let status = self.call_value(Helper::Call, &[self.ctx, target, params, np, self.result_slots, nr])?;
        self.check_status(status, pc);
        for (bank, idx, width) in reload {
            for i in 0..width {
                self.reload(bank, idx + i);
            }
        }
        let next = self.blocks[pc + 1 + num_results];
        self.fb.ins().jump(next, &[]);
        Ok(())
    }

    fn ret(&mut self, pc: usize, slot: u8, flags: u8, idx: usize) -> Result<(), JitError> {
        let konst = flags & REGT_KONST != 0;
        let slot_index = (slot & !RET_FINAL) as i32;
        let si = self.i32const(slot_index);
        let (ctx, rets, nrets) = (self.ctx, self.rets, self.num_rets);
        let status = match (flags & REGT_TYPE, flags & REGT_MULTIREG) {
            (REGT_FLOAT, REGT_MULTIREG2 | REGT_MULTIREG3) => {
                let n = multireg_width(flags);
                let src = if konst {
                    let p = self.body.konst_float[idx..idx + n].as_ptr();
                    self.fb.ins().iconst(self.ptr_ty, p as i64)
                } else {
                    for i in 0..n {
                        self.spill(REGT_FLOAT, idx + i);
                    }
                    self.reg_addr(REGT_FLOAT, idx)
                };
                let count = self.i32const(n as i32);
                self.call_value(Helper::RetVector, &[ctx, rets, nrets, si, src, count])?
            }
            (REGT_INT, _) => {
                let v = if konst { self.kd(idx) } else { self.d(idx) };
                self.call_value(Helper::RetInt, &[ctx, rets, nrets, si, v])?
            }
            (REGT_FLOAT, _) => {
                let v = if konst { self.kf(idx) } else { self.f(idx) };
                self.call_value(Helper::RetFloat, &[ctx, rets, nrets, si, v])?
            }
            (REGT_STRING, _) => {
                let v = if konst { self.ks_addr(idx) } else { self.s_addr(idx) };
                self.call_value(Helper::RetString, &[ctx, rets, nrets, si, v])?
            }
            _ => {
                let v = if konst { self.ka(idx) } else { self.a(idx) };
                self.call_value(Helper::RetPointer, &[ctx, rets, nrets, si, v])?
            }
        };
        self.check_status(status, pc);
        if slot & RET_FINAL != 0 {
            self.finish(slot_index);
        }
        Ok(())
    }

    /// Leave with `min(idx + 1, num_rets)` values written.
    fn finish(&mut self, idx: i32) {
        let si = self.i32const(idx);
        let inside = self.fb.ins().icmp(IntCC::SignedLessThan, si, self.num_rets);
        let written = self.i32const(idx + 1);
        let n = self.fb.ins().select(inside, written, self.num_rets);
        self.fb.ins().jump(self.exit, &[n]);
    }

    fn ends_block(op: Op) -> bool {
        match op.opcode() {
            OP_JMP | OP_IJMP | OP_TEST | OP_CALL | OP_CALL_K | OP_THROW => true,
            OP_RET => op.b() == REGT_NIL || op.a() & RET_FINAL != 0,
            OP_RETI => op.a() & RET_FINAL != 0,
            _ => op.info().is_some_and(|i| i.is_compare()),
        }
    }

    /// Lower the instruction at `pc`. Returns whether control falls through
    /// to the next instruction.
    fn lower_op(&mut self, pc: usize) -> Result<bool, JitError> {
        let op = self.body.code[pc];
        let (a, b, c) = (op.a() as usize, op.b() as usize, op.c() as usize);
        let bc = op.bc() as usize;
        let flags = op.a();
        use Src::{Imm, Konst, Reg};

        match op.opcode() {
            OP_NOP => {}
            OP_JMP => {
                let target = self.jump_target(pc);
                self.fb.ins().jump(target, &[]);
            }
            OP_IJMP => {
                let index = self.d(a);
                for i in 0..bc {
                    let target = self.jump_target(pc + 1 + i);
                    let k = self.i32const(i as i32);
                    let hit = self.fb.ins().icmp(IntCC::Equal, index, k);
                    let next = self.fb.create_block();
                    self.fb.ins().brif(hit, target, &[], next, &[]);
                    self.fb.switch_to_block(next);
                }
                let past = self.blocks[pc + 1 + bc];
                self.fb.ins().jump(past, &[]);
            }
            OP_TEST => {
                let x = self.d(a);
                let k = self.i32const(op.sbc() as i32);
                let cond = self.fb.ins().icmp(IntCC::Equal, x, k);
                self.fused(pc, CMP_CHECK, cond);
            }
            OP_PARAM => self.param(flags, bc),
            OP_PARAMI => {
                let v = self.i32const(op.signed_immediate24());
                self.push_param(v, REGT_INT, ParamSrc::Int(v));
            }
            OP_CALL => {
                let target = self.a(a);
                self.call(pc, target, b, c)?;
            }
            OP_CALL_K => {
                if !self.direct_call(pc, a, b, c) {
                    let target = self.ka(a);
                    self.call(pc, target, b, c)?;
                }
            }
            OP_VTBL => {
                let obj = self.a(b);
                let index = self.i32const(c as i32);
                let f = self.call_value(Helper::Vtbl, &[self.ctx, obj, index])?;
                let missing = self.fb.ins().icmp_imm(IntCC::Equal, f, 0);
                self.guard(missing, FAULT_PENDING, pc, None);
                self.set_a(a, f);
            }
            OP_SCOPE => {
                let obj = self.a(a);
                let side = self.i32const(b as i32);
                let callee = self.ka(c);
                let status = self.call_value(Helper::Scope, &[self.ctx, obj, side, callee])?;
                self.check_status(status, pc);
            }
            // Consumed by the CALL before it; unreachable as an instruction.
            OP_RESULT => {}
            OP_RET => {
                if op.b() == REGT_NIL {
                    let zero = self.i32const(0);
                    self.fb.ins().jump(self.exit, &[zero]);
                } else {
                    self.ret(pc, flags, op.b(), c)?;
                }
            }
            OP_RETI => {
                let slot_index = (flags & !RET_FINAL) as i32;
                let si = self.i32const(slot_index);
                let v = self.i32const(op.sbc() as i32);
                let status = self.call_value(Helper::RetInt, &[self.ctx, self.rets, self.num_rets, si, v])?;
                self.check_status(status, pc);
                if flags & RET_FINAL != 0 {
                    self.finish(slot_index);
                }
            }
            OP_THROW => {
                let reason = self.i32const(a as i32);
                let message = self.ks_addr(bc);
                self.call_helper(Helper::Throw, &[self.ctx, reason, message])?;
                self.fault(FAULT_PENDING, pc, None);
            }
            OP_BOUND | OP_BOUND_K | OP_BOUND_R => {
                let index = self.d(a);
                let size = match op.opcode() {
                    OP_BOUND => self.i32const(bc as i32),
                    OP_BOUND_K => self.kd(bc),
                    _ => self.d(b),
                };
                let out = self.fb.ins().icmp(IntCC::UnsignedGreaterThanOrEqual, index, size);
                let wide_size = self.fb.ins().sextend(I64, size);
                let high = self.fb.ins().ishl_imm(wide_size, 32);
                let low = self.fb.ins().uextend(I64, index);
                let operand = self.fb.ins().bor(high, low);
                self.guard(out, AbortReason::ArrayOutOfBounds.code(), pc, Some(operand));
            }

            OP_LI => {
                let v = self.i32const(op.sbc() as i32);
                self.set_d(a, v);
            }
            OP_LK => {
                let v = self.kd(bc);
                self.set_d(a, v);
            }
            OP_LKF => {
                let v = self.kf(bc);
                self.set_f(a, v);
            }
            OP_LKS => {
                let dst = self.s_addr(a);
                let src = self.ks_addr(bc);
                self.call_helper(Helper::StringCopy, &[dst, src])?;
            }
            OP_LKP => {
                let v = self.ka(bc);
                self.set_a(a, v);
            }
            OP_LFP => {
                let v = self.frame_addr(self.layout.extra_offset);
                self.set_a(a, v);
            }

            OP_LB | OP_LB_R | OP_LH | OP_LH_R | OP_LW | OP_LW_R | OP_LBU | OP_LBU_R | OP_LHU | OP_LHU_R | OP_LSP
            | OP_LSP_R | OP_LDP | OP_LDP_R | OP_LS | OP_LS_R | OP_LP | OP_LP_R | OP_LO | OP_LO_R | OP_LV2
            | OP_LV2_R | OP_LV3 | OP_LV3_R => self.load_op(op, pc)?,
            OP_SB | OP_SB_R | OP_SH | OP_SH_R | OP_SW | OP_SW_R | OP_SSP | OP_SSP_R | OP_SDP | OP_SDP_R | OP_SS
            | OP_SS_R | OP_SP | OP_SP_R | OP_SO | OP_SO_R | OP_SV2 | OP_SV2_R | OP_SV3 | OP_SV3_R => {
                self.store_op(op, pc)?
            }
            OP_LBIT | OP_SBIT => self.bit_op(op, pc),

            OP_MOVE => {
                let v = self.d(b);
                self.set_d(a, v);
            }
            OP_MOVEF => {
                let v = self.f(b);
                self.set_f(a, v);
            }
            OP_MOVES => {
                let (dst, src) = (self.s_addr(a), self.s_addr(b));
                self.call_helper(Helper::StringCopy, &[dst, src])?;
            }
            OP_MOVEA => {
                let v = self.a(b);
                self.set_a(a, v);
            }
            OP_MOVEV2 | OP_MOVEV3 => {
                let n = if op.opcode() == OP_MOVEV2 { 2 } else { 3 };
                let v = self.fvec(b, n);
                self.set_fvec(a, &v);
            }
            OP_CAST => self.cast(a, b, op.c(), pc)?,
            OP_CASTB => self.castb(a, b, op.c(), pc)?,

            OP_SLL_RR => self.int3(a, IntOp::Shl, Reg(b), Reg(c), pc),
            OP_SLL_RI => self.int3(a, IntOp::Shl, Reg(b), Imm(c as i32), pc),
            OP_SLL_KR => self.int3(a, IntOp::Shl, Konst(b), Reg(c), pc),
            OP_SRL_RR => self.int3(a, IntOp::Shr, Reg(b), Reg(c), pc),
            OP_SRL_RI => self.int3(a, IntOp::Shr, Reg(b), Imm(c as i32), pc),
            OP_SRL_KR => self.int3(a, IntOp::Shr, Konst(b), Reg(c), pc),
            OP_SRA_RR => self.int3(a, IntOp::Sar, Reg(b), Reg(c), pc),
            OP_SRA_RI => self.int3(a, IntOp::Sar, Reg(b), Imm(c as i32), pc),
            OP_SRA_KR => self.int3(a, IntOp::Sar, Konst(b), Reg(c), pc),
            OP_ADD_RR => self.int3(a, IntOp::Add, Reg(b), Reg(c), pc),
            OP_ADD_RK => self.int3(a, IntOp::Add, Reg(b), Konst(c), pc),
            OP_ADD_RI => self.int3(a, IntOp::Add, Reg(b), Imm(op.c() as i8 as i32), pc),
            OP_SUB_RR => self.int3(a, IntOp::Sub, Reg(b), Reg(c), pc),
            OP_SUB_RK => self.int3(a, IntOp::Sub, Reg(b), Konst(c), pc),
            OP_SUB_KR => self.int3(a, IntOp::Sub, Konst(b), Reg(c), pc),
            OP_MUL_RR => self.int3(a, IntOp::Mul, Reg(b), Reg(c), pc),
            OP_MUL_RK => self.int3(a, IntOp::Mul, Reg(b), Konst(c), pc),
            OP_DIV_RR => self.int3(a, IntOp::Div, Reg(b), Reg(c), pc),
            OP_DIV_RK => self.int3(a, IntOp::Div, Reg(b), Konst(c), pc),
            OP_DIV_KR => self.int3(a, IntOp::Div, Konst(b), Reg(c), pc),
            OP_DIVU_RR => self.int3(a, IntOp::DivU, Reg(b), Reg(c), pc),
            OP_DIVU_RK => self.int3(a, IntOp::DivU, Reg(b), Konst(c), pc),
            OP_DIVU_KR => self.int3(a, IntOp::DivU, Konst(b), Reg(c), pc),
            OP_MOD_RR => self.int3(a, IntOp::Mod, Reg(b), Reg(c), pc),
            OP_MOD_RK => self.int3(a, IntOp::Mod, Reg(b), Konst(c), pc),
            OP_MOD_KR => self.int3(a, IntOp::Mod, Konst(b), Reg(c), pc),
            OP_MODU_RR => self.int3(a, IntOp::ModU, Reg(b), Reg(c), pc),
            OP_MODU_RK => self.int3(a, IntOp::ModU, Reg(b), Konst(c), pc),
            OP_MODU_KR => self.int3(a, IntOp::ModU, Konst(b), Reg(c), pc),
            OP_AND_RR => self.int3(a, IntOp::And, Reg(b), Reg(c), pc),
            OP_AND_RK => self.int3(a, IntOp::And, Reg(b), Konst(c), pc),
            OP_OR_RR => self.int3(a, IntOp::Or, Reg(b), Reg(c), pc),
            OP_OR_RK => self.int3(a, IntOp::Or, Reg(b), Konst(c), pc),
            OP_XOR_RR => self.int3(a, IntOp::Xor, Reg(b), Reg(c), pc),
            OP_XOR_RK => self.int3(a, IntOp::Xor, Reg(b), Konst(c), pc),
            OP_MIN_RR => self.int3(a, IntOp::Min, Reg(b), Reg(c), pc),
            OP_MIN_RK => self.int3(a, IntOp::Min, Reg(b), Konst(c), pc),
            OP_MAX_RR => self.int3(a, IntOp::Max, Reg(b), Reg(c), pc),
            OP_MAX_RK => self.int3(a, IntOp::Max, Reg(b), Konst(c), pc),
            OP_ABS | OP_NEG | OP_NOT => {
                let x = self.d(b);
                let v = match op.opcode() {
                    OP_ABS => self.fb.ins().iabs(x),
                    OP_NEG => self.fb.ins().ineg(x),
                    _ => self.fb.ins().bnot(x),
                };
                self.set_d(a, v);
            }

            OP_EQ_R => self.int_branch(pc, flags, IntCC::Equal, Reg(b), Reg(c)),
            OP_EQ_K => self.int_branch(pc, flags, IntCC::Equal, Reg(b), Konst(c)),
            OP_LT_RR => self.int_branch(pc, flags, IntCC::SignedLessThan, Reg(b), Reg(c)),
            OP_LT_RK => self.int_branch(pc, flags, IntCC::SignedLessThan, Reg(b), Konst(c)),
            OP_LT_KR => self.int_branch(pc, flags, IntCC::SignedLessThan, Konst(b), Reg(c)),
            OP_LE_RR => self.int_branch(pc, flags, IntCC::SignedLessThanOrEqual, Reg(b), Reg(c)),
            OP_LE_RK => self.int_branch(pc, flags, IntCC::SignedLessThanOrEqual, Reg(b), Konst(c)),
            OP_LE_KR => self.int_branch(pc, flags, IntCC::SignedLessThanOrEqual, Konst(b), Reg(c)),
            OP_LTU_RR => self.int_branch(pc, flags, IntCC::UnsignedLessThan, Reg(b), Reg(c)),
            OP_LTU_RK => self.int_branch(pc, flags, IntCC::UnsignedLessThan, Reg(b), Konst(c)),
            OP_LTU_KR => self.int_branch(pc, flags, IntCC::UnsignedLessThan, Konst(b), Reg(c)),
            OP_LEU_RR => self.int_branch(pc, flags, IntCC::UnsignedLessThanOrEqual, Reg(b), Reg(c)),
            OP_LEU_RK => self.int_branch(pc, flags, IntCC::UnsignedLessThanOrEqual, Reg(b), Konst(c)),
            OP_LEU_KR => self.int_branch(pc, flags, IntCC::UnsignedLessThanOrEqual, Konst(b), Reg(c)),

            OP_ADDF_RR => self.float3(a, FloatOp::Add, Reg(b), Reg(c), pc)?,
            OP_ADDF_RK => self.float3(a, FloatOp::Add, Reg(b), Konst(c), pc)?,
            OP_SUBF_RR => self.float3(a, FloatOp::Sub, Reg(b), Reg(c), pc)?,
            OP_SUBF_RK => self.float3(a, FloatOp::Sub, Reg(b), Konst(c), pc)?,
            OP_SUBF_KR => self.float3(a, FloatOp::Sub, Konst(b), Reg(c), pc)?,
            OP_MULF_RR => self.float3(a, FloatOp::Mul, Reg(b), Reg(c), pc)?,
            OP_MULF_RK => self.float3(a, FloatOp::Mul, Reg(b), Konst(c), pc)?,
            OP_DIVF_RR => self.float3(a, FloatOp::Div, Reg(b), Reg(c), pc)?,
            OP_DIVF_RK => self.float3(a, FloatOp::Div, Reg(b), Konst(c), pc)?,
            OP_DIVF_KR => self.float3(a, FloatOp::Div, Konst(b), Reg(c), pc)?,
            OP_MODF_RR => self.float3(a, FloatOp::Mod, Reg(b), Reg(c), pc)?,
            OP_MODF_RK => self.float3(a, FloatOp::Mod, Reg(b), Konst(c), pc)?,
            OP_MODF_KR => self.float3(a, FloatOp::Mod, Konst(b), Reg(c), pc)?,
            OP_POWF_RR => self.float3(a, FloatOp::Pow, Reg(b), Reg(c), pc)?,
            OP_POWF_RK => self.float3(a, FloatOp::Pow, Reg(b), Konst(c), pc)?,
            OP_POWF_KR => self.float3(a, FloatOp::Pow, Konst(b), Reg(c), pc)?,
            OP_MINF_RR => self.float3(a, FloatOp::Min, Reg(b), Reg(c), pc)?,
            OP_MINF_RK => self.float3(a, FloatOp::Min, Reg(b), Konst(c), pc)?,
            OP_MAXF_RR => self.float3(a, FloatOp::Max, Reg(b), Reg(c), pc)?,
            OP_MAXF_RK => self.float3(a, FloatOp::Max, Reg(b), Konst(c), pc)?,
            OP_ATAN2 => {
                let (y, x) = (self.f(b), self.f(c));
                let v = self.call_value(Helper::Atan2, &[y, x])?;
                self.set_f(a, v);
            }
            OP_FLOP => self.flop(a, b, op.c())?,

            OP_EQF_R => self.float_branch(pc, flags, CMP_EQ, Reg(b), Reg(c)),
            OP_EQF_K => self.float_branch(pc, flags, CMP_EQ, Reg(b), Konst(c)),
            OP_LTF_RR => self.float_branch(pc, flags, CMP_LT, Reg(b), Reg(c)),
            OP_LTF_RK => self.float_branch(pc, flags, CMP_LT, Reg(b), Konst(c)),
            OP_LTF_KR => self.float_branch(pc, flags, CMP_LT, Konst(b), Reg(c)),
            OP_LEF_RR => self.float_branch(pc, flags, CMP_LE, Reg(b), Reg(c)),
            OP_LEF_RK => self.float_branch(pc, flags, CMP_LE, Reg(b), Konst(c)),
            OP_LEF_KR => self.float_branch(pc, flags, CMP_LE, Konst(b), Reg(c)),

            OP_NEGV2 | OP_NEGV3 => {
                let n = if op.opcode() == OP_NEGV2 { 2 } else { 3 };
                let x = self.fvec(b, n);
                let out: Vec<Value> = x.iter().map(|&v| self.fb.ins().fneg(v)).collect();
                self.set_fvec(a, &out);
            }
            OP_ADDV2_RR => self.vector_zip(a, b, c, 2, false),
            OP_ADDV3_RR => self.vector_zip(a, b, c, 3, false),
            OP_SUBV2_RR => self.vector_zip(a, b, c, 2, true),
            OP_SUBV3_RR => self.vector_zip(a, b, c, 3, true),
            OP_DOTV2_RR | OP_DOTV3_RR => {
                let n = if op.opcode() == OP_DOTV2_RR { 2 } else { 3 };
                let (x, y) = (self.fvec(b, n), self.fvec(c, n));
                let v = self.dot(&x, &y);
                self.set_f(a, v);
            }
            OP_CROSSV_RR => {
                let (x, y) = (self.fvec(b, 3), self.fvec(c, 3));
                let mut out = Vec::with_capacity(3);
                for (i, j) in [(1, 2), (2, 0), (0, 1)] {
                    let p = self.fb.ins().fmul(x[i], y[j]);
                    let q = self.fb.ins().fmul(x[j], y[i]);
                    out.push(self.fb.ins().fsub(p, q));
                }
                self.set_fvec(a, &out);
            }
            OP_MULVF2_RR => self.vector_scale(a, b, 2, Reg(c), false),
            OP_MULVF2_RK => self.vector_scale(a, b, 2, Konst(c), false),
            OP_MULVF3_RR => self.vector_scale(a, b, 3, Reg(c), false),
            OP_MULVF3_RK => self.vector_scale(a, b, 3, Konst(c), false),
            OP_DIVVF2_RR => self.vector_scale(a, b, 2, Reg(c), true),
            OP_DIVVF2_RK => self.vector_scale(a, b, 2, Konst(c), true),
            OP_DIVVF3_RR => self.vector_scale(a, b, 3, Reg(c), true),
            OP_DIVVF3_RK => self.vector_scale(a, b, 3, Konst(c), true),
            OP_LENV2 | OP_LENV3 => {
                let n = if op.opcode() == OP_LENV2 { 2 } else { 3 };
                let x = self.fvec(b, n);
                let sq = self.dot(&x, &x);
                let v = self.fb.ins().sqrt(sq);
                self.set_f(a, v);
            }
            OP_EQV2_R => self.vector_branch(pc, flags, b, c, 2),
            OP_EQV3_R => self.vector_branch(pc, flags, b, c, 3),

            OP_CONCAT => {
                let (dst, x, y) = (self.s_addr(a), self.s_addr(b), self.s_addr(c));
                self.call_helper(Helper::Concat, &[dst, x, y])?;
            }
            OP_LENS => {
                let s = self.s_addr(b);
                let v = self.call_value(Helper::StringLen, &[s])?;
                self.set_d(a, v);
            }
            OP_CMPS => {
                let lhs = if flags & CMP_BK != 0 { self.ks_addr(b) } else { self.s_addr(b) };
                let rhs = if flags & CMP_CK != 0 { self.ks_addr(c) } else { self.s_addr(c) };
                let mode = self.i32const(flags as i32);
                let r = self.call_value(Helper::StringCompare, &[lhs, rhs, mode])?;
                let cond = self.fb.ins().icmp_imm(IntCC::NotEqual, r, 0);
                self.fused(pc, flags, cond);
            }

            OP_ADDA_RR | OP_ADDA_RK => {
                let p = self.a(b);
                let by = if op.opcode() == OP_ADDA_RR { self.d(c) } else { self.kd(c) };
                let by = self.fb.ins().sextend(self.ptr_ty, by);
                let moved = self.fb.ins().iadd(p, by);
                let is_null = self.fb.ins().icmp_imm(IntCC::Equal, p, 0);
                let v = self.fb.ins().select(is_null, p, moved);
                self.set_a(a, v);
            }
            OP_SUBA => {
                let (x, y) = (self.a(b), self.a(c));
                let diff = self.fb.ins().isub(x, y);
                let v = self.fb.ins().ireduce(I32, diff);
                self.set_d(a, v);
            }
            OP_EQA_R | OP_EQA_K => {
                let x = self.a(b);
                let y = if op.opcode() == OP_EQA_R { self.a(c) } else { self.ka(c) };
                let cond = self.fb.ins().icmp(IntCC::Equal, x, y);
                self.fused(pc, flags, cond);
            }

            _ => return Err(JitError::Unsupported { op: op_name(op), pc }),
        }
        Ok(!Self::ends_block(op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;
    use crate::vm::builder::{Bank, CodeBuilder};
    use crate::vm::frame::RegCounts;
    use crate::vm::function::{FunctionFlags, Proto};
    use crate::vm::value::Value as VmVal;

    fn int_fn(name: &str, build: impl FnOnce(&mut CodeBuilder)) -> Function {
        let f = Function::script(name, FunctionFlags::NONE, Proto { args: vec![REGT_INT], returns: vec![REGT_INT] });
        let mut b = CodeBuilder::new(name);
        b.alloc(Bank::Int, 2).unwrap();
        build(&mut b);
        f.define(b.finish("test.zs").unwrap()).unwrap();
        f
    }

    #[test]
    fn compiles_and_runs_simple_arithmetic() {
        let f = int_fn("add5", |b| {
            b.emit(OP_ADD_RI, 1, 0, 5);
            b.emit(OP_RET, RET_FINAL, REGT_INT, 1);
        });
        let vm = Vm::default();
        let mut stack = vm.new_stack();
        let out = vm.call_values(&mut stack, &f, &[VmVal::Int(10)]).unwrap();
        assert_eq!(out, vec![VmVal::Int(15)]);
        assert!(vm.is_compiled(&f));
    }

    #[test]
    fn division_by_zero_reports_a_fault() {
        let f = int_fn("div0", |b| {
            b.emit(OP_DIV_RR, 1, 0, 1);
            b.emit(OP_RET, RET_FINAL, REGT_INT, 1);
        });
        let vm = Vm::default();
        let mut stack = vm.new_stack();
        let err = vm.call_values(&mut stack, &f, &[VmVal::Int(7)]).unwrap_err();
        assert_eq!(err.reason, AbortReason::DivisionByZero);
        assert_eq!(err.stack_trace.len(), 1);
        assert_eq!(err.stack_trace[0].function, "div0");
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn register_ceiling_is_enforced() {
        let f = int_fn("small", |b| {
            b.emit(OP_RET, RET_FINAL, REGT_INT, 0);
        });
        let config = VmConfig { jit_max_registers: 1, ..VmConfig::default() };
        let body = f.body().unwrap();
        let err = check_eligible(&config, &f, body).unwrap_err();
        assert!(matches!(err, JitError::TooManyRegisters { count: 2, limit: 1 }));
    }

    #[test]
    fn jumps_into_call_sequences_are_rejected() {
        let f = Function::script("tangled", FunctionFlags::NONE, Proto::default());
        let code = vec![
            Op::i24(OP_JMP, 1),
            Op::i24(OP_PARAMI, 1),
            Op::i24(OP_PARAMI, 2),
            Op::abc(OP_CALL_K, 0, 2, 0),
            Op::abc(OP_RET, 0, REGT_NIL, 0),
        ];
        let body = ScriptFunction::new(code, RegCounts { max_param: 2, ..RegCounts::default() });
        let err = check_eligible(&VmConfig::default(), &f, &body).unwrap_err();
        assert!(matches!(err, JitError::TargetInCall { target: 2 }), "{err}");
    }

    #[test]
    fn code_info_maps_addresses_back_to_functions() {
        let f = int_fn("located", |b| {
            b.emit(OP_RET, RET_FINAL, REGT_INT, 0);
        });
        let rt = JitRuntime::new(&VmConfig::default()).unwrap();
        let entry = rt.compile(&VmConfig::default(), &f, f.body().unwrap()).unwrap();
        let info = rt.code_info(entry as usize).unwrap();
        assert_eq!(info.name, "located");
        assert_eq!(info.file.as_deref(), Some("test.zs"));
        assert!(info.len > 0);
    }

    #[test]
    fn native_addresses_resolve_to_source_lines() {
        let f = int_fn("lined", |b| {
            b.begin_statement(10);
            b.emit(OP_DIV_RR, 1, 0, 0);
            b.begin_statement(20);
            b.emit(OP_RET, RET_FINAL, REGT_INT, 1);
        });
        let body = f.body().unwrap();
        let rt = JitRuntime::new(&VmConfig::default()).unwrap();
        let entry = rt.compile(&VmConfig::default(), &f, body).unwrap();
        let info = rt.code_info(entry as usize).unwrap();

        assert!(!info.pc_map.is_empty());
        let mut lines = Vec::new();
        for &(offset, pc) in &info.pc_map {
            let address = info.start + offset as usize;
            assert_eq!(info.pc_for_address(address), Some(pc));
            let line = info.line_for_address(address);
            assert_eq!(line, body.pc_to_line(pc), "offset {offset} pc {pc}");
            lines.extend(line);
        }
        assert!(lines.contains(&10), "{:?}", info.pc_map);
        assert!(lines.contains(&20), "{:?}", info.pc_map);

        assert_eq!(info.line_for_address(info.start + info.len), None);
        assert_eq!(info.line_for_address(info.start.wrapping_sub(1)), None);
    }
}
