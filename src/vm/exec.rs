//! Portable interpreter: one `match` over the opcode per instruction.
//!
//! The value semantics here are the reference the JIT must reproduce; the
//! helpers at the bottom are shared with compiled code.

use std::ptr;
use std::sync::Arc;

use super::abort::{Abort, AbortReason};
use super::frame::{Frame, Registers};
use super::function::{Function, ScriptFunction};
use super::opcodes::*;
use super::scope::{self, ClassDescriptor, ObjectHeader, Side};
use super::value::{ReturnSlot, VmValue};
use super::{ExecContext, invoke, script_entry};

/// Run `body` in a fresh frame. Aborts leave with this function's stack
/// entry appended.
pub(crate) fn exec(
    ctx: &mut ExecContext<'_>,
    func: &Function,
    body: &ScriptFunction,
    params: &[VmValue],
    rets: &mut [ReturnSlot],
) -> Result<usize, Abort> {
    let mut frame = ctx.stack.alloc_frame(func);
    // SAFETY: the frame stays live until popped below and `interp` is the
    // only view of its registers.
    let regs = unsafe { frame.registers() };
    let mut interp = Interp { body, regs, num_param: 0, pc: 0 };
    let result = match interp.regs.load_params(params) {
        Ok(()) => interp.run(ctx, &mut frame, rets),
        Err(e) => Err(e),
    };
    let pc = interp.pc;
    drop(interp);
    ctx.stack.pop_frame(frame);
    result.map_err(|mut e| {
        e.push_frame(script_entry(func, body, pc));
        e
    })
}

pub(crate) const FELL_OFF_END: &str = "execution ran past the end of the function";

struct Interp<'b, 'f> {
    body: &'b ScriptFunction,
    regs: Registers<'f>,
    num_param: usize,
    pc: usize,
}

impl Interp<'_, '_> {
    fn run(&mut self, ctx: &mut ExecContext<'_>, frame: &mut Frame, rets: &mut [ReturnSlot]) -> Result<usize, Abort> {
        let body = self.body;
        let code = body.code.as_slice();
        let kd = body.konst_int.as_slice();
        let kf = body.konst_float.as_slice();
        let ks = body.konst_string.as_slice();
        let ka = body.konst_address.as_slice();

        loop {
            let pc = self.pc;
            let Some(&op) = code.get(pc) else {
                return Err(Abort::other(FELL_OFF_END));
            };
            let (a, b, c) = (op.a() as usize, op.b() as usize, op.c() as usize);
            let bc = op.bc() as usize;
            let mut next = pc + 1;
            let r = &mut self.regs;

            // Script memory accesses go to host memory; the VM trusts the
            // pointers the host hands it and only checks for null.
            match op.opcode() {
                OP_NOP => {}
                OP_JMP => next = op.jump_target(pc) as usize,
                OP_IJMP => {
                    let n = bc;
                    let idx = r.d[a];
                    next = if idx >= 0 && (idx as usize) < n {
                        let at = pc + 1 + idx as usize;
                        code[at].jump_target(at) as usize
                    } else {
                        pc + 1 + n
                    };
                }
                OP_TEST => next = fused(code, pc, CMP_CHECK, r.d[a] == op.sbc() as i32),
                OP_PARAM => self.param(op.a(), bc)?,
                OP_PARAMI => self.push_param(VmValue::int(op.signed_immediate24()))?,
                OP_CALL => {
                    let target = r.a[a] as *const Function;
                    next = self.call(ctx, frame, pc, target, b, c)?;
                }
                OP_CALL_K => {
                    let target = ka[a].addr() as *const Function;
                    next = self.call(ctx, frame, pc, target, b, c)?;
                }
                OP_VTBL => r.a[a] = vtable_lookup(r.a[b], c)?,
                OP_SCOPE => {
                    let callee = ka[c].as_function().ok_or_else(|| Abort::other("scope check without a function"))?;
                    scope_check(r.a[a], op.b(), callee)?;
                }
                OP_RESULT => return Err(Abort::other("result outside a call")),
                OP_RET => {
                    if op.b() == REGT_NIL {
                        return Ok(0);
                    }
                    let idx = (op.a() & !RET_FINAL) as usize;
                    if let Some(slot) = rets.get_mut(idx) {
                        self.write_return(slot, op.b(), c)?;
                    }
                    if op.a() & RET_FINAL != 0 {
                        return Ok(finished(idx, rets.len()));
                    }
                }
                OP_RETI => {
                    let idx = (op.a() & !RET_FINAL) as usize;
                    if let Some(slot) = rets.get_mut(idx) {
                        slot.set_int(op.sbc() as i32)?;
                    }
                    if op.a() & RET_FINAL != 0 {
                        return Ok(finished(idx, rets.len()));
                    }
                }
                OP_THROW => return Err(throw(op.a(), &ks[bc])),
                OP_BOUND => bound(r.d[a], bc as i32)?,
                OP_BOUND_K => bound(r.d[a], kd[bc])?,
                OP_BOUND_R => bound(r.d[a], r.d[b])?,

                OP_LI => r.d[a] = op.sbc() as i32,
                OP_LK => r.d[a] = kd[bc],
                OP_LKF => r.f[a] = kf[bc],
                OP_LKS => r.s[a].clone_from(&ks[bc]),
                OP_LKP => r.a[a] = ka[bc].addr(),
                OP_LFP => r.a[a] = r.extra,

                OP_LB | OP_LB_R => {
                    let p = address(r.a[b], mem_offset(op, kd, r.d), AbortReason::ReadNil)?;
                    r.d[a] = unsafe { load::<i8>(p) } as i32;
                }
                OP_LH | OP_LH_R => {
                    let p = address(r.a[b], mem_offset(op, kd, r.d), AbortReason::ReadNil)?;
                    r.d[a] = unsafe { load::<i16>(p) } as i32;
                }
                OP_LW | OP_LW_R => {
                    let p = address(r.a[b], mem_offset(op, kd, r.d), AbortReason::ReadNil)?;
                    r.d[a] = unsafe { load::<i32>(p) };
                }
                OP_LBU | OP_LBU_R => {
                    let p = address(r.a[b], mem_offset(op, kd, r.d), AbortReason::ReadNil)?;
                    r.d[a] = unsafe { load::<u8>(p) } as i32;
                }
                OP_LHU | OP_LHU_R => {
                    let p = address(r.a[b], mem_offset(op, kd, r.d), AbortReason::ReadNil)?;
                    r.d[a] = unsafe { load::<u16>(p) } as i32;
                }
                OP_LSP | OP_LSP_R => {
                    let p = address(r.a[b], mem_offset(op, kd, r.d), AbortReason::ReadNil)?;
                    r.f[a] = unsafe { load::<f32>(p) } as f64;
                }
                OP_LDP | OP_LDP_R => {
                    let p = address(r.a[b], mem_offset(op, kd, r.d), AbortReason::ReadNil)?;
                    r.f[a] = unsafe { load::<f64>(p) };
                }
                OP_LS | OP_LS_R => {
                    let p = address(r.a[b], mem_offset(op, kd, r.d), AbortReason::ReadNil)?;
                    r.s[a].clone_from(unsafe { &*(p as *const String) });
                }
                OP_LP | OP_LP_R => {
                    let p = address(r.a[b], mem_offset(op, kd, r.d), AbortReason::ReadNil)?;
                    r.a[a] = unsafe { load::<*mut u8>(p) };
                }
                OP_LO | OP_LO_R => {
                    let p = address(r.a[b], mem_offset(op, kd, r.d), AbortReason::ReadNil)?;
                    r.a[a] = ctx.vm.gc().read_barrier(unsafe { load::<*mut u8>(p) });
                }
                OP_LV2 | OP_LV2_R => {
                    let p = address(r.a[b], mem_offset(op, kd, r.d), AbortReason::ReadNil)?;
                    for i in 0..2 {
                        r.f[a + i] = unsafe { load::<f64>(p.add(i * 8)) };
                    }
                }
                OP_LV3 | OP_LV3_R => {
                    let p = address(r.a[b], mem_offset(op, kd, r.d), AbortReason::ReadNil)?;
                    for i in 0..3 {
                        r.f[a + i] = unsafe { load::<f64>(p.add(i * 8)) };
                    }
                }
                OP_LBIT => {
                    let p = address(r.a[b], 0, AbortReason::ReadNil)?;
                    r.d[a] = (unsafe { load::<u8>(p) } & op.c() != 0) as i32;
                }

                OP_SB | OP_SB_R => {
                    let p = address(r.a[a], mem_offset(op, kd, r.d), AbortReason::WriteNil)?;
                    unsafe { store(p, r.d[b] as u8) };
                }
                OP_SH | OP_SH_R => {
                    let p = address(r.a[a], mem_offset(op, kd, r.d), AbortReason::WriteNil)?;
                    unsafe { store(p, r.d[b] as u16) };
                }
                OP_SW | OP_SW_R => {
                    let p = address(r.a[a], mem_offset(op, kd, r.d), AbortReason::WriteNil)?;
                    unsafe { store(p, r.d[b]) };
                }
                OP_SSP | OP_SSP_R => {
                    let p = address(r.a[a], mem_offset(op, kd, r.d), AbortReason::WriteNil)?;
                    unsafe { store(p, r.f[b] as f32) };
                }
                OP_SDP | OP_SDP_R => {
                    let p = address(r.a[a], mem_offset(op, kd, r.d), AbortReason::WriteNil)?;
                    unsafe { store(p, r.f[b]) };
                }
                OP_SS | OP_SS_R => {
                    let p = address(r.a[a], mem_offset(op, kd, r.d), AbortReason::WriteNil)?;
                    unsafe { (*(p as *mut String)).clone_from(&r.s[b]) };
                }
                OP_SP | OP_SP_R => {
                    let p = address(r.a[a], mem_offset(op, kd, r.d), AbortReason::WriteNil)?;
                    unsafe { store(p, r.a[b]) };
                }
                OP_SO | OP_SO_R => {
                    let p = address(r.a[a], mem_offset(op, kd, r.d), AbortReason::WriteNil)?;
                    unsafe { store(p, r.a[b]) };
                    ctx.vm.gc().write_barrier(r.a[b]);
                }
                OP_SV2 | OP_SV2_R => {
                    let p = address(r.a[a], mem_offset(op, kd, r.d), AbortReason::WriteNil)?;
                    for i in 0..2 {
                        unsafe { store(p.add(i * 8), r.f[b + i]) };
                    }
                }
                OP_SV3 | OP_SV3_R => {
                    let p = address(r.a[a], mem_offset(op, kd, r.d), AbortReason::WriteNil)?;
                    for i in 0..3 {
                        unsafe { store(p.add(i * 8), r.f[b + i]) };
                    }
                }
                OP_SBIT => {
                    let p = address(r.a[a], 0, AbortReason::WriteNil)?;
                    let old = unsafe { load::<u8>(p) };
                    let new = if r.d[b] != 0 { old | op.c() } else { old & !op.c() };
                    unsafe { store(p, new) };
                }

                OP_MOVE => r.d[a] = r.d[b],
                OP_MOVEF => r.f[a] = r.f[b],
                OP_MOVES => {
                    if a != b {
                        let v = r.s[b].clone();
                        r.s[a] = v;
                    }
                }
                OP_MOVEA => r.a[a] = r.a[b],
                OP_MOVEV2 => r.f.copy_within(b..b + 2, a),
                OP_MOVEV3 => r.f.copy_within(b..b + 3, a),
                OP_CAST => cast(r, a, b, op.c())?,
                OP_CASTB => {
                    r.d[a] = match op.c() {
                        CASTB_I => r.d[b] != 0,
                        CASTB_F => r.f[b] != 0.0,
                        CASTB_A => !r.a[b].is_null(),
                        CASTB_S => !r.s[b].is_empty(),
                        other => return Err(Abort::other(format!("bad castb kind {other}"))),
                    } as i32
                }

                OP_SLL_RR => r.d[a] = shl(r.d[b], r.d[c]),
                OP_SLL_RI => r.d[a] = shl(r.d[b], c as i32),
                OP_SLL_KR => r.d[a] = shl(kd[b], r.d[c]),
                OP_SRL_RR => r.d[a] = shr_logical(r.d[b], r.d[c]),
                OP_SRL_RI => r.d[a] = shr_logical(r.d[b], c as i32),
                OP_SRL_KR => r.d[a] = shr_logical(kd[b], r.d[c]),
                OP_SRA_RR => r.d[a] = shr_arith(r.d[b], r.d[c]),
                OP_SRA_RI => r.d[a] = shr_arith(r.d[b], c as i32),
                OP_SRA_KR => r.d[a] = shr_arith(kd[b], r.d[c]),
                OP_ADD_RR => r.d[a] = r.d[b].wrapping_add(r.d[c]),
                OP_ADD_RK => r.d[a] = r.d[b].wrapping_add(kd[c]),
                OP_ADD_RI => r.d[a] = r.d[b].wrapping_add(op.c() as i8 as i32),
                OP_SUB_RR => r.d[a] = r.d[b].wrapping_sub(r.d[c]),
                OP_SUB_RK => r.d[a] = r.d[b].wrapping_sub(kd[c]),
                OP_SUB_KR => r.d[a] = kd[b].wrapping_sub(r.d[c]),
                OP_MUL_RR => r.d[a] = r.d[b].wrapping_mul(r.d[c]),
                OP_MUL_RK => r.d[a] = r.d[b].wrapping_mul(kd[c]),
                OP_DIV_RR => r.d[a] = div(r.d[b], r.d[c])?,
                OP_DIV_RK => r.d[a] = div(r.d[b], kd[c])?,
                OP_DIV_KR => r.d[a] = div(kd[b], r.d[c])?,
                OP_DIVU_RR => r.d[a] = divu(r.d[b], r.d[c])?,
                OP_DIVU_RK => r.d[a] = divu(r.d[b], kd[c])?,
                OP_DIVU_KR => r.d[a] = divu(kd[b], r.d[c])?,
                OP_MOD_RR => r.d[a] = rem(r.d[b], r.d[c])?,
                OP_MOD_RK => r.d[a] = rem(r.d[b], kd[c])?,
                OP_MOD_KR => r.d[a] = rem(kd[b], r.d[c])?,
                OP_MODU_RR => r.d[a] = remu(r.d[b], r.d[c])?,
                OP_MODU_RK => r.d[a] = remu(r.d[b], kd[c])?,
                OP_MODU_KR => r.d[a] = remu(kd[b], r.d[c])?,
                OP_AND_RR => r.d[a] = r.d[b] & r.d[c],
                OP_AND_RK => r.d[a] = r.d[b] & kd[c],
                OP_OR_RR => r.d[a] = r.d[b] | r.d[c],
                OP_OR_RK => r.d[a] = r.d[b] | kd[c],
                OP_XOR_RR => r.d[a] = r.d[b] ^ r.d[c],
                OP_XOR_RK => r.d[a] = r.d[b] ^ kd[c],
                OP_MIN_RR => r.d[a] = r.d[b].min(r.d[c]),
                OP_MIN_RK => r.d[a] = r.d[b].min(kd[c]),
                OP_MAX_RR => r.d[a] = r.d[b].max(r.d[c]),
                OP_MAX_RK => r.d[a] = r.d[b].max(kd[c]),
                OP_ABS => r.d[a] = r.d[b].wrapping_abs(),
                OP_NEG => r.d[a] = r.d[b].wrapping_neg(),
                OP_NOT => r.d[a] = !r.d[b],

                OP_EQ_R => next = fused(code, pc, op.a(), r.d[b] == r.d[c]),
                OP_EQ_K => next = fused(code, pc, op.a(), r.d[b] == kd[c]),
                OP_LT_RR => next = fused(code, pc, op.a(), r.d[b] < r.d[c]),
                OP_LT_RK => next = fused(code, pc, op.a(), r.d[b] < kd[c]),
                OP_LT_KR => next = fused(code, pc, op.a(), kd[b] < r.d[c]),
                OP_LE_RR => next = fused(code, pc, op.a(), r.d[b] <= r.d[c]),
                OP_LE_RK => next = fused(code, pc, op.a(), r.d[b] <= kd[c]),
                OP_LE_KR => next = fused(code, pc, op.a(), kd[b] <= r.d[c]),
                OP_LTU_RR => next = fused(code, pc, op.a(), (r.d[b] as u32) < (r.d[c] as u32)),
                OP_LTU_RK => next = fused(code, pc, op.a(), (r.d[b] as u32) < (kd[c] as u32)),
                OP_LTU_KR => next = fused(code, pc, op.a(), (kd[b] as u32) < (r.d[c] as u32)),
                OP_LEU_RR => next = fused(code, pc, op.a(), (r.d[b] as u32) <= (r.d[c] as u32)),
                OP_LEU_RK => next = fused(code, pc, op.a(), (r.d[b] as u32) <= (kd[c] as u32)),
                OP_LEU_KR => next = fused(code, pc, op.a(), (kd[b] as u32) <= (r.d[c] as u32)),

                OP_ADDF_RR => r.f[a] = r.f[b] + r.f[c],
                OP_ADDF_RK => r.f[a] = r.f[b] + kf[c],
                OP_SUBF_RR => r.f[a] = r.f[b] - r.f[c],
                OP_SUBF_RK => r.f[a] = r.f[b] - kf[c],
                OP_SUBF_KR => r.f[a] = kf[b] - r.f[c],
                OP_MULF_RR => r.f[a] = r.f[b] * r.f[c],
                OP_MULF_RK => r.f[a] = r.f[b] * kf[c],
                OP_DIVF_RR => r.f[a] = fdiv(r.f[b], r.f[c])?,
                OP_DIVF_RK => r.f[a] = fdiv(r.f[b], kf[c])?,
                OP_DIVF_KR => r.f[a] = fdiv(kf[b], r.f[c])?,
                OP_MODF_RR => r.f[a] = fmod(r.f[b], r.f[c])?,
                OP_MODF_RK => r.f[a] = fmod(r.f[b], kf[c])?,
                OP_MODF_KR => r.f[a] = fmod(kf[b], r.f[c])?,
                OP_POWF_RR => r.f[a] = r.f[b].powf(r.f[c]),
                OP_POWF_RK => r.f[a] = r.f[b].powf(kf[c]),
                OP_POWF_KR => r.f[a] = kf[b].powf(r.f[c]),
                OP_MINF_RR => r.f[a] = fmin(r.f[b], r.f[c]),
                OP_MINF_RK => r.f[a] = fmin(r.f[b], kf[c]),
                OP_MAXF_RR => r.f[a] = fmax(r.f[b], r.f[c]),
                OP_MAXF_RK => r.f[a] = fmax(r.f[b], kf[c]),
                OP_ATAN2 => r.f[a] = atan2_deg(r.f[b], r.f[c]),
                OP_FLOP => r.f[a] = flop(op.c(), r.f[b]),

                OP_EQF_R => next = fused(code, pc, op.a(), feq(r.f[b], r.f[c], op.a())),
                OP_EQF_K => next = fused(code, pc, op.a(), feq(r.f[b], kf[c], op.a())),
                OP_LTF_RR => next = fused(code, pc, op.a(), flt(r.f[b], r.f[c], op.a())),
                OP_LTF_RK => next = fused(code, pc, op.a(), flt(r.f[b], kf[c], op.a())),
                OP_LTF_KR => next = fused(code, pc, op.a(), flt(kf[b], r.f[c], op.a())),
                OP_LEF_RR => next = fused(code, pc, op.a(), fle(r.f[b], r.f[c], op.a())),
                OP_LEF_RK => next = fused(code, pc, op.a(), fle(r.f[b], kf[c], op.a())),
                OP_LEF_KR => next = fused(code, pc, op.a(), fle(kf[b], r.f[c], op.a())),

                OP_NEGV2 => vector_map::<2>(r.f, a, b, |x| -x),
                OP_NEGV3 => vector_map::<3>(r.f, a, b, |x| -x),
                OP_ADDV2_RR => vector_zip::<2>(r.f, a, b, c, |x, y| x + y),
                OP_ADDV3_RR => vector_zip::<3>(r.f, a, b, c, |x, y| x + y),
                OP_SUBV2_RR => vector_zip::<2>(r.f, a, b, c, |x, y| x - y),
                OP_SUBV3_RR => vector_zip::<3>(r.f, a, b, c, |x, y| x - y),
                OP_DOTV2_RR => r.f[a] = r.f[b] * r.f[c] + r.f[b + 1] * r.f[c + 1],
                OP_DOTV3_RR => {
                    r.f[a] = r.f[b] * r.f[c] + r.f[b + 1] * r.f[c + 1] + r.f[b + 2] * r.f[c + 2];
                }
                OP_CROSSV_RR => {
                    let (x, y) = (vec3(r.f, b), vec3(r.f, c));
                    r.f[a..a + 3].copy_from_slice(&cross(x, y));
                }
                OP_MULVF2_RR => {
                    let k = r.f[c];
                    vector_map::<2>(r.f, a, b, |x| x * k);
                }
                OP_MULVF2_RK => vector_map::<2>(r.f, a, b, |x| x * kf[c]),
                OP_MULVF3_RR => {
                    let k = r.f[c];
                    vector_map::<3>(r.f, a, b, |x| x * k);
                }
                OP_MULVF3_RK => vector_map::<3>(r.f, a, b, |x| x * kf[c]),
                OP_DIVVF2_RR => {
                    let k = r.f[c];
                    vector_map::<2>(r.f, a, b, |x| x / k);
                }
                OP_DIVVF2_RK => vector_map::<2>(r.f, a, b, |x| x / kf[c]),
                OP_DIVVF3_RR => {
                    let k = r.f[c];
                    vector_map::<3>(r.f, a, b, |x| x / k);
                }
                OP_DIVVF3_RK => vector_map::<3>(r.f, a, b, |x| x / kf[c]),
                OP_LENV2 => r.f[a] = (r.f[b] * r.f[b] + r.f[b + 1] * r.f[b + 1]).sqrt(),
                OP_LENV3 => {
                    r.f[a] = (r.f[b] * r.f[b] + r.f[b + 1] * r.f[b + 1] + r.f[b + 2] * r.f[b + 2]).sqrt();
                }
                OP_EQV2_R => next = fused(code, pc, op.a(), veq(&r.f[b..b + 2], &r.f[c..c + 2], op.a())),
                OP_EQV3_R => next = fused(code, pc, op.a(), veq(&r.f[b..b + 3], &r.f[c..c + 3], op.a())),

                OP_CONCAT => {
                    let joined = concat(&r.s[b], &r.s[c]);
                    r.s[a] = joined;
                }
                OP_LENS => r.d[a] = r.s[b].len() as i32,
                OP_CMPS => {
                    let flags = op.a();
                    let lhs = if flags & CMP_BK != 0 { &ks[b] } else { &r.s[b] };
                    let rhs = if flags & CMP_CK != 0 { &ks[c] } else { &r.s[c] };
                    next = fused(code, pc, flags, compare_strings(lhs, rhs, flags));
                }

                OP_ADDA_RR => r.a[a] = offset_pointer(r.a[b], r.d[c]),
                OP_ADDA_RK => r.a[a] = offset_pointer(r.a[b], kd[c]),
                OP_SUBA => r.d[a] = (r.a[b] as isize).wrapping_sub(r.a[c] as isize) as i32,
                OP_EQA_R => next = fused(code, pc, op.a(), r.a[b] == r.a[c]),
                OP_EQA_K => next = fused(code, pc, op.a(), r.a[b] == ka[c].addr()),

                other => return Err(Abort::other(format!("unknown opcode {other}"))),
            }
            self.pc = next;
        }
    }

    fn push_param(&mut self, v: VmValue<'static>) -> Result<(), Abort> {
        let slot = self
            .regs
            .params
            .get_mut(self.num_param)
            .ok_or_else(|| Abort::other("too many parameters pushed"))?;
        *slot = v;
        self.num_param += 1;
        Ok(())
    }

    fn param(&mut self, flags: u8, idx: usize) -> Result<(), Abort> {
        let body = self.body;
        let r = &mut self.regs;
        let width = match flags & REGT_MULTIREG {
            REGT_MULTIREG2 => 2,
            REGT_MULTIREG3 => 3,
            _ => 1,
        };
        let mut vals = [VmValue::null(); 3];
        if flags == REGT_NIL {
            // null pointer
        } else if flags & REGT_ADDROF != 0 {
            let p = match flags & REGT_TYPE {
                REGT_INT => &mut r.d[idx] as *mut i32 as *mut u8,
                REGT_FLOAT => &mut r.f[idx] as *mut f64 as *mut u8,
                REGT_STRING => &mut r.s[idx] as *mut String as *mut u8,
                _ => &mut r.a[idx] as *mut *mut u8 as *mut u8,
            };
            vals[0] = VmValue::pointer(p);
        } else {
            let konst = flags & REGT_KONST != 0;
            for (i, v) in vals.iter_mut().take(width).enumerate() {
                *v = match (flags & REGT_TYPE, konst) {
                    (REGT_INT, true) => VmValue::int(body.konst_int[idx]),
                    (REGT_INT, false) => VmValue::int(r.d[idx]),
                    (REGT_FLOAT, true) => VmValue::float(body.konst_float[idx + i]),
                    (REGT_FLOAT, false) => VmValue::float(r.f[idx + i]),
                    (REGT_STRING, true) => string_param(&body.konst_string[idx]),
                    (REGT_STRING, false) => string_param(&r.s[idx]),
                    (_, true) => VmValue::pointer(body.konst_address[idx].addr()),
                    (_, false) => VmValue::pointer(r.a[idx]),
                };
            }
        }
        let count = if flags & REGT_TYPE == REGT_FLOAT && flags & (REGT_ADDROF | REGT_NIL) == 0 { width } else { 1 };
        for v in vals.into_iter().take(count) {
            self.push_param(v)?;
        }
        Ok(())
    }

    /// Destination for one RESULT op, pointing into this frame's registers.
    fn result_slot(&mut self, op: Op) -> ReturnSlot<'static> {
        let flags = op.a();
        let idx = op.bc() as usize;
        let r = &mut self.regs;
        let location = match flags & REGT_TYPE {
            REGT_INT => &mut r.d[idx] as *mut i32 as *mut u8,
            REGT_FLOAT => &mut r.f[idx] as *mut f64 as *mut u8,
            REGT_STRING => &mut r.s[idx] as *mut String as *mut u8,
            _ => &mut r.a[idx] as *mut *mut u8 as *mut u8,
        };
        ReturnSlot::from_raw(location, flags & (REGT_TYPE | REGT_MULTIREG))
    }

    fn call(
        &mut self,
        ctx: &mut ExecContext<'_>,
        frame: &mut Frame,
        pc: usize,
        target: *const Function,
        num_params: usize,
        num_results: usize,
    ) -> Result<usize, Abort> {
        // SAFETY: function pointers in registers and constants come from
        // address constants or vtables, which keep their functions alive.
        let Some(callee) = (unsafe { target.as_ref() }) else {
            return Err(Abort::with_message(AbortReason::ReadNil, "attempt to call a null function"));
        };
        if num_params != self.num_param {
            return Err(Abort::other(format!(
                "{}: {} parameters pushed, call passes {}",
                callee.name, self.num_param, num_params
            )));
        }
        let body = self.body;
        let code = &body.code;
        let mut slots: Vec<ReturnSlot> = Vec::with_capacity(num_results);
        for i in 0..num_results {
            let rop = code[pc + 1 + i];
            slots.push(self.result_slot(rop));
        }
        frame.set_pc(pc);
        frame.set_num_param(num_params as u16);
        self.num_param = 0;
        let params: &[VmValue] = &self.regs.params[..num_params];
        let result = invoke(ctx, callee, params, &mut slots);
        frame.set_num_param(0);
        result?;
        Ok(pc + 1 + num_results)
    }

    fn write_return(&mut self, slot: &mut ReturnSlot, flags: u8, idx: usize) -> Result<(), Abort> {
        let body = self.body;
        let r = &self.regs;
        let konst = flags & REGT_KONST != 0;
        match (flags & REGT_TYPE, flags & REGT_MULTIREG) {
            (REGT_FLOAT, REGT_MULTIREG2 | REGT_MULTIREG3) => {
                let n = if flags & REGT_MULTIREG2 != 0 { 2 } else { 3 };
                let src = if konst { &body.konst_float[idx..idx + n] } else { &r.f[idx..idx + n] };
                slot.set_vector(src)
            }
            (REGT_INT, _) => slot.set_int(if konst { body.konst_int[idx] } else { r.d[idx] }),
            (REGT_FLOAT, _) => slot.set_float(if konst { body.konst_float[idx] } else { r.f[idx] }),
            (REGT_STRING, _) => slot.set_string(if konst { &body.konst_string[idx] } else { &r.s[idx] }),
            _ => slot.set_pointer(if konst { body.konst_address[idx].addr() } else { r.a[idx] }),
        }
    }
}

fn string_param(s: &String) -> VmValue<'static> {
    VmValue::from_raw(s as *const String as usize as u64, REGT_STRING)
}

fn finished(idx: usize, num_rets: usize) -> usize {
    if idx < num_rets { idx + 1 } else { num_rets }
}

/// Next pc after a compare fused with the JMP that follows it.
fn fused(code: &[Op], pc: usize, flags: u8, result: bool) -> usize {
    if result == (flags & CMP_CHECK != 0) {
        code[pc + 1].jump_target(pc + 1) as usize
    } else {
        pc + 2
    }
}

fn mem_offset(op: Op, kd: &[i32], d: &[i32]) -> i32 {
    let c = op.c() as usize;
    match op.info() {
        Some(info) if info.mode.c == Operand::IntReg => d[c],
        _ => kd[c],
    }
}

fn address(base: *mut u8, offset: i32, reason: AbortReason) -> Result<*mut u8, Abort> {
    if base.is_null() {
        Err(Abort::new(reason))
    } else {
        Ok(base.wrapping_offset(offset as isize))
    }
}

/// # Safety
/// `p` must be valid for reading a `T`.
unsafe fn load<T: Copy>(p: *mut u8) -> T {
    unsafe { ptr::read_unaligned(p as *const T) }
}

/// # Safety
/// `p` must be valid for writing a `T`.
unsafe fn store<T>(p: *mut u8, v: T) {
    unsafe { ptr::write_unaligned(p as *mut T, v) }
}

fn vec3(f: &[f64], i: usize) -> [f64; 3] {
    [f[i], f[i + 1], f[i + 2]]
}

fn vector_map<const N: usize>(f: &mut [f64], a: usize, b: usize, op: impl Fn(f64) -> f64) {
    let src: [f64; N] = std::array::from_fn(|i| f[b + i]);
    for (i, x) in src.into_iter().enumerate() {
        f[a + i] = op(x);
    }
}

fn vector_zip<const N: usize>(f: &mut [f64], a: usize, b: usize, c: usize, op: impl Fn(f64, f64) -> f64) {
    let lhs: [f64; N] = std::array::from_fn(|i| f[b + i]);
    let rhs: [f64; N] = std::array::from_fn(|i| f[c + i]);
    for i in 0..N {
        f[a + i] = op(lhs[i], rhs[i]);
    }
}

fn cast(r: &mut Registers, a: usize, b: usize, kind: u8) -> Result<(), Abort> {
    match kind {
        CAST_I2F => r.f[a] = r.d[b] as f64,
        CAST_U2F => r.f[a] = r.d[b] as u32 as f64,
        CAST_F2I => r.d[a] = r.f[b] as i32,
        CAST_F2U => r.d[a] = r.f[b] as u32 as i32,
        CAST_I2S => r.s[a] = r.d[b].to_string(),
        CAST_U2S => r.s[a] = (r.d[b] as u32).to_string(),
        CAST_F2S => r.s[a] = format_float(r.f[b]),
        CAST_V22S => r.s[a] = format_vector(&r.f[b..b + 2]),
        CAST_V32S => r.s[a] = format_vector(&r.f[b..b + 3]),
        CAST_P2S => r.s[a] = format_pointer(r.a[b]),
        CAST_S2I => r.d[a] = parse_int(&r.s[b]),
        CAST_S2F => r.f[a] = parse_float(&r.s[b]),
        other => return Err(Abort::other(format!("bad cast kind {other}"))),
    }
    Ok(())
}

// ── Shared semantics ────────────────────────────────────────────────

pub(crate) fn shl(x: i32, n: i32) -> i32 {
    x.wrapping_shl(n as u32)
}

pub(crate) fn shr_logical(x: i32, n: i32) -> i32 {
    (x as u32).wrapping_shr(n as u32) as i32
}

pub(crate) fn shr_arith(x: i32, n: i32) -> i32 {
    x.wrapping_shr(n as u32)
}

pub(crate) fn div(x: i32, y: i32) -> Result<i32, Abort> {
    if y == 0 { Err(Abort::new(AbortReason::DivisionByZero)) } else { Ok(x.wrapping_div(y)) }
}

pub(crate) fn divu(x: i32, y: i32) -> Result<i32, Abort> {
    if y == 0 { Err(Abort::new(AbortReason::DivisionByZero)) } else { Ok(((x as u32) / (y as u32)) as i32) }
}

pub(crate) fn rem(x: i32, y: i32) -> Result<i32, Abort> {
    if y == 0 { Err(Abort::new(AbortReason::DivisionByZero)) } else { Ok(x.wrapping_rem(y)) }
}

pub(crate) fn remu(x: i32, y: i32) -> Result<i32, Abort> {
    if y == 0 { Err(Abort::new(AbortReason::DivisionByZero)) } else { Ok(((x as u32) % (y as u32)) as i32) }
}

pub(crate) fn fdiv(x: f64, y: f64) -> Result<f64, Abort> {
    if y == 0.0 { Err(Abort::new(AbortReason::DivisionByZero)) } else { Ok(x / y) }
}

/// Floored modulo: the result takes the sign of the divisor.
pub(crate) fn fmod(x: f64, y: f64) -> Result<f64, Abort> {
    if y == 0.0 { Err(Abort::new(AbortReason::DivisionByZero)) } else { Ok(fmod_unchecked(x, y)) }
}

pub(crate) fn fmod_unchecked(x: f64, y: f64) -> f64 {
    x - (x / y).floor() * y
}

pub(crate) fn fmin(x: f64, y: f64) -> f64 {
    if x < y { x } else { y }
}

pub(crate) fn fmax(x: f64, y: f64) -> f64 {
    if x > y { x } else { y }
}

pub(crate) fn atan2_deg(y: f64, x: f64) -> f64 {
    y.atan2(x).to_degrees()
}

pub(crate) fn feq(x: f64, y: f64, flags: u8) -> bool {
    if flags & CMP_APPROX != 0 { (x - y).abs() < VM_EPSILON } else { x == y }
}

pub(crate) fn flt(x: f64, y: f64, flags: u8) -> bool {
    if flags & CMP_APPROX != 0 { y - x > VM_EPSILON } else { x < y }
}

pub(crate) fn fle(x: f64, y: f64, flags: u8) -> bool {
    if flags & CMP_APPROX != 0 { x - y < VM_EPSILON } else { x <= y }
}

fn veq(x: &[f64], y: &[f64], flags: u8) -> bool {
    x.iter().zip(y).all(|(&p, &q)| feq(p, q, flags))
}

pub(crate) fn cross(x: [f64; 3], y: [f64; 3]) -> [f64; 3] {
    [x[1] * y[2] - x[2] * y[1], x[2] * y[0] - x[0] * y[2], x[0] * y[1] - x[1] * y[0]]
}

pub(crate) fn offset_pointer(p: *mut u8, by: i32) -> *mut u8 {
    if p.is_null() { p } else { p.wrapping_offset(by as isize) }
}

pub(crate) fn concat(x: &str, y: &str) -> String {
    let mut s = String::with_capacity(x.len() + y.len());
    s.push_str(x);
    s.push_str(y);
    s
}

pub(crate) fn compare_strings(x: &str, y: &str, flags: u8) -> bool {
    let ord = if flags & CMP_APPROX != 0 {
        x.bytes().map(|b| b.to_ascii_lowercase()).cmp(y.bytes().map(|b| b.to_ascii_lowercase()))
    } else {
        x.cmp(y)
    };
    match flags & CMP_METHOD_MASK {
        CMP_LT => ord.is_lt(),
        CMP_LE => ord.is_le(),
        _ => ord.is_eq(),
    }
}

pub(crate) fn format_float(x: f64) -> String {
    format!("{x:.5}")
}

pub(crate) fn format_vector(v: &[f64]) -> String {
    let parts: Vec<String> = v.iter().map(|x| format!("{x:.5}")).collect();
    format!("({})", parts.join(", "))
}

pub(crate) fn format_pointer(p: *mut u8) -> String {
    format!("{:#x}", p as usize)
}

/// Leading integer of `s`, decimal or `0x` hex, 0 if none.
pub(crate) fn parse_int(s: &str) -> i32 {
    let t = s.trim_start();
    let (neg, rest) = match t.as_bytes().first() {
        Some(b'-') => (true, &t[1..]),
        Some(b'+') => (false, &t[1..]),
        _ => (false, t),
    };
    let (radix, digits) = match rest.get(..2) {
        Some("0x" | "0X") => (16, &rest[2..]),
        _ => (10, rest),
    };
    let mut v: u32 = 0;
    for ch in digits.chars() {
        match ch.to_digit(radix) {
            Some(d) => v = v.wrapping_mul(radix).wrapping_add(d),
            None => break,
        }
    }
    let v = v as i32;
    if neg { v.wrapping_neg() } else { v }
}

/// Longest numeric prefix of `s` as a float, 0.0 if none.
pub(crate) fn parse_float(s: &str) -> f64 {
    let t = s.trim_start();
    let end = t
        .char_indices()
        .take_while(|&(_, ch)| ch.is_ascii_digit() || matches!(ch, '+' | '-' | '.' | 'e' | 'E'))
        .last()
        .map_or(0, |(i, ch)| i + ch.len_utf8());
    (1..=end).rev().find_map(|n| t[..n].parse::<f64>().ok()).unwrap_or(0.0)
}

pub(crate) fn bound(index: i32, size: i32) -> Result<(), Abort> {
    if (index as u32) < (size as u32) { Ok(()) } else { Err(Abort::out_of_bounds(size as i64, index)) }
}

pub(crate) fn throw(reason: u8, message: &str) -> Abort {
    let reason = AbortReason::from_code(reason as i32).unwrap_or(AbortReason::Other);
    if message.is_empty() { Abort::new(reason) } else { Abort::with_message(reason, message) }
}

fn object_class<'o>(obj: *mut u8) -> Result<Option<&'o ClassDescriptor>, Abort> {
    if obj.is_null() {
        return Err(Abort::new(AbortReason::ReadNil));
    }
    // SAFETY: objects handed to scripts begin with an `ObjectHeader` whose
    // class outlives the object.
    Ok(unsafe { (*(obj as *const ObjectHeader)).class.as_ref() })
}

pub(crate) fn vtable_lookup(obj: *mut u8, index: usize) -> Result<*mut u8, Abort> {
    let class = object_class(obj)?.ok_or_else(|| Abort::other("object has no class"))?;
    class
        .vtable
        .get(index)
        .map(|f| Arc::as_ptr(f) as *mut u8)
        .ok_or_else(|| Abort::other(format!("vtable index {index} out of range for {}", class.name)))
}

pub(crate) fn scope_check(obj: *mut u8, caller: u8, callee: &Function) -> Result<(), Abort> {
    let class = object_class(obj)?;
    let caller = Side::from_u8(caller).unwrap_or_default();
    scope::check_call(caller, scope::effective_side(callee, class), &callee.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_division_rules() {
        assert_eq!(div(7, -2).unwrap(), -3);
        assert_eq!(div(i32::MIN, -1).unwrap(), i32::MIN);
        assert_eq!(rem(i32::MIN, -1).unwrap(), 0);
        assert_eq!(divu(-1, 2).unwrap(), i32::MAX);
        assert_eq!(div(1, 0).unwrap_err().reason, AbortReason::DivisionByZero);
        assert_eq!(remu(1, 0).unwrap_err().reason, AbortReason::DivisionByZero);
    }

    #[test]
    fn shifts_mask_the_count() {
        assert_eq!(shl(1, 33), 2);
        assert_eq!(shr_logical(-1, 28), 15);
        assert_eq!(shr_arith(-16, 2), -4);
    }

    #[test]
    fn float_modulo_follows_divisor_sign() {
        assert_eq!(fmod(5.5, 2.0).unwrap(), 1.5);
        assert_eq!(fmod(-1.0, 3.0).unwrap(), 2.0);
        assert!(fmod(1.0, 0.0).is_err());
    }

    #[test]
    fn approximate_compares_use_epsilon() {
        let flags = CMP_APPROX;
        assert!(feq(1.0, 1.0 + VM_EPSILON / 2.0, flags));
        assert!(!feq(1.0, 1.0 + VM_EPSILON / 2.0, 0));
        assert!(!flt(1.0, 1.0 + VM_EPSILON / 2.0, flags));
        assert!(fle(1.0 + VM_EPSILON / 2.0, 1.0, flags));
    }

    #[test]
    fn string_compares() {
        assert!(compare_strings("abc", "ABC", CMP_EQ | CMP_APPROX));
        assert!(!compare_strings("abc", "ABC", CMP_EQ));
        assert!(compare_strings("abc", "abd", CMP_LT));
        assert!(compare_strings("abc", "abc", CMP_LE));
    }

    #[test]
    fn string_to_number_takes_prefixes() {
        assert_eq!(parse_int("  42abc"), 42);
        assert_eq!(parse_int("-0x1F"), -31);
        assert_eq!(parse_int("nope"), 0);
        assert_eq!(parse_float("2.5e1x"), 25.0);
        assert_eq!(parse_float("1e"), 1.0);
        assert_eq!(parse_float(""), 0.0);
    }

    #[test]
    fn number_formatting() {
        assert_eq!(format_float(1.5), "1.50000");
        assert_eq!(format_vector(&[1.0, -2.0]), "(1.00000, -2.00000)");
    }

    #[test]
    fn bounds_are_unsigned() {
        assert!(bound(0, 3).is_ok());
        let err = bound(-1, 3).unwrap_err();
        assert_eq!(err.reason, AbortReason::ArrayOutOfBounds);
        assert_eq!(err.message.as_deref(), Some("Max.index = 2, current index = -1"));
    }

    #[test]
    fn cross_product() {
        assert_eq!(cross([1.0, 0.0, 0.0], [0.0, 1.0, 0.0]), [0.0, 0.0, 1.0]);
    }
}
