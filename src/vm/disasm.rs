//! Human-readable listing of a script body. Read-only over the data model.
//!
//! Line format: `{byte_addr:08x}: {raw:08x}  {mnemonic:<10}{operands}`, padded
//! to [`COMMENT_COLUMN`], then `; a,b,c` echoing the raw operand bytes.

use std::fmt::Write;

use super::function::{AddressConst, Function, FunctionKind, ScriptFunction};
use super::opcodes::*;
use super::scope::Side;

pub const COMMENT_COLUMN: usize = 60;

pub const CASTB_NAMES: [&str; 4] = ["i", "f", "a", "s"];

/// Listing of `func`, headed by its name.
pub fn disassemble(func: &Function) -> String {
    let mut out = format!("{}:\n", func.name);
    match &func.kind {
        FunctionKind::Native(_) => out.push_str("    <native>\n"),
        FunctionKind::Script(slot) => match slot.get() {
            Some(body) => out.push_str(&disassemble_body(body)),
            None => out.push_str("    <undefined>\n"),
        },
    }
    out
}

pub fn disassemble_body(body: &ScriptFunction) -> String {
    let mut out = String::new();
    for pc in 0..body.code.len() {
        out.push_str(&format_instruction(body, pc));
        out.push('\n');
    }
    out
}

/// One listing line for the instruction at `pc`.
pub fn format_instruction(body: &ScriptFunction, pc: usize) -> String {
    let op = body.code[pc];
    let (mnemonic, operands) = decode(body, pc);
    let mut line = format!("{:08x}: {:08x}  {:<10}{}", pc * 4, op.bits(), mnemonic, operands);
    let width = line.chars().count();
    if width < COMMENT_COLUMN {
        line.extend(std::iter::repeat_n(' ', COMMENT_COLUMN - width));
    } else {
        line.push(' ');
    }
    let _ = write!(line, "; {},{},{}", op.a(), op.b(), op.c());
    line
}

fn reg(kind: Operand, n: usize) -> String {
    match kind {
        Operand::IntReg => format!("d{n}"),
        Operand::FloatReg => format!("f{n}"),
        Operand::StringReg => format!("s{n}"),
        Operand::PointerReg => format!("a{n}"),
        Operand::Vec2Reg => format!("f{n}:2"),
        Operand::Vec3Reg => format!("f{n}:3"),
        _ => format!("{n}"),
    }
}

fn address_literal(k: Option<&AddressConst>) -> String {
    match k {
        Some(AddressConst::Null) => "@null".into(),
        Some(AddressConst::Function(f)) => format!("@{}", f.name),
        Some(AddressConst::Class(c)) => format!("class {}", c.name),
        Some(AddressConst::Raw(a)) => format!("{a:#x}"),
        None => "?".into(),
    }
}

fn konst(body: &ScriptFunction, kind: Operand, idx: usize) -> String {
    match kind {
        Operand::IntKonst | Operand::JointIntKonst => {
            body.konst_int.get(idx).map_or_else(|| "?".into(), |v| format!("#{v}"))
        }
        Operand::FloatKonst | Operand::JointFloatKonst => {
            body.konst_float.get(idx).map_or_else(|| "?".into(), |v| format!("#{v:?}"))
        }
        Operand::StringKonst | Operand::JointStringKonst => {
            body.konst_string.get(idx).map_or_else(|| "?".into(), |v| format!("#{v:?}"))
        }
        _ => address_literal(body.konst_address.get(idx)),
    }
}

fn operand(body: &ScriptFunction, pc: usize, kind: Operand, field: u8, op: Op) -> String {
    match kind {
        Operand::Imm => format!("{}", field as i8),
        Operand::UImm | Operand::CmpFlags => format!("{field}"),
        Operand::JointImm => format!("{}", op.sbc()),
        Operand::JointUImm => format!("{}", op.bc()),
        Operand::JointIntKonst | Operand::JointFloatKonst | Operand::JointStringKonst | Operand::JointPointerKonst => {
            konst(body, kind, op.bc() as usize)
        }
        Operand::Imm24 => format!("{:08x}", op.jump_target(pc).max(0) as usize * 4),
        k if k.is_konst() => konst(body, k, field as usize),
        k => reg(k, field as usize),
    }
}

/// Register or constant named by PARAM/RESULT/RET flags.
fn typed_operand(body: &ScriptFunction, flags: u8, idx: usize) -> String {
    if flags == REGT_NIL {
        return "void".into();
    }
    let kind = match (flags & REGT_TYPE, flags & REGT_MULTIREG) {
        (REGT_FLOAT, REGT_MULTIREG2) => Operand::Vec2Reg,
        (REGT_FLOAT, REGT_MULTIREG3) => Operand::Vec3Reg,
        (REGT_INT, _) => Operand::IntReg,
        (REGT_FLOAT, _) => Operand::FloatReg,
        (REGT_STRING, _) => Operand::StringReg,
        _ => Operand::PointerReg,
    };
    if flags & REGT_KONST != 0 {
        let k = match flags & REGT_TYPE {
            REGT_INT => Operand::IntKonst,
            REGT_FLOAT => Operand::FloatKonst,
            REGT_STRING => Operand::StringKonst,
            _ => Operand::PointerKonst,
        };
        let base = konst(body, k, idx);
        match kind {
            Operand::Vec2Reg => format!("{base}:2"),
            Operand::Vec3Reg => format!("{base}:3"),
            _ => base,
        }
    } else if flags & REGT_ADDROF != 0 {
        format!("&{}", reg(kind, idx))
    } else {
        reg(kind, idx)
    }
}

fn branch_target(body: &ScriptFunction, pc: usize) -> String {
    match body.code.get(pc + 1) {
        Some(jmp) if jmp.opcode() == OP_JMP => format!("{:08x}", jmp.jump_target(pc + 1).max(0) as usize * 4),
        _ => "?".into(),
    }
}

fn branch_name(base: (&str, &str), flags: u8) -> String {
    let mut name = if flags & CMP_CHECK != 0 { base.0 } else { base.1 }.to_string();
    if flags & CMP_APPROX != 0 {
        name.push('~');
    }
    name
}

fn decode(body: &ScriptFunction, pc: usize) -> (String, String) {
    let op = body.code[pc];
    let Some(info) = op.info() else {
        return ("???".into(), String::new());
    };
    let (a, b, c) = (op.a(), op.b(), op.c());
    let ret_tail = |final_bit: bool| if final_bit { ", final" } else { "" };
    match op.opcode() {
        OP_PARAM => ("param".into(), typed_operand(body, a, op.bc() as usize)),
        OP_PARAMI => ("parami".into(), format!("{}", op.signed_immediate24())),
        OP_RESULT => ("result".into(), typed_operand(body, a, op.bc() as usize)),
        OP_RET => {
            if b == REGT_NIL {
                return ("ret".into(), "void".into());
            }
            let slot = a & !RET_FINAL;
            (
                "ret".into(),
                format!("{slot}, {}{}", typed_operand(body, b, c as usize), ret_tail(a & RET_FINAL != 0)),
            )
        }
        OP_RETI => {
            let slot = a & !RET_FINAL;
            ("reti".into(), format!("{slot}, {}{}", op.sbc(), ret_tail(a & RET_FINAL != 0)))
        }
        OP_CALL_K => {
            let target = body.konst_address.get(a as usize);
            let name = match target.and_then(AddressConst::as_function) {
                Some(f) => f.name.clone(),
                None => address_literal(target),
            };
            ("call_k".into(), format!("{name}, {b}, {c}"))
        }
        OP_CAST => match cast_info(c) {
            Some((name, dst, src)) => ("cast".into(), format!("{}, {}, {name}", reg(dst, a as usize), reg(src, b as usize))),
            None => ("cast".into(), format!("d{a}, {b}, {c}")),
        },
        OP_CASTB => {
            let src = castb_source(c).map_or_else(|| format!("{b}"), |k| reg(k, b as usize));
            let kind = CASTB_NAMES.get(c as usize).copied().unwrap_or("?");
            ("castb".into(), format!("d{a}, {src}, {kind}"))
        }
        OP_FLOP => {
            let name = FLOP_NAMES.get(c as usize).copied().unwrap_or("?");
            ("flop".into(), format!("f{a}, f{b}, {name}"))
        }
        OP_CMPS => {
            let names = match a & CMP_METHOD_MASK {
                CMP_LT => ("blts", "bges"),
                CMP_LE => ("bles", "bgts"),
                _ => ("beqs", "bnes"),
            };
            let lhs = if a & CMP_BK != 0 { konst(body, Operand::StringKonst, b as usize) } else { format!("s{b}") };
            let rhs = if a & CMP_CK != 0 { konst(body, Operand::StringKonst, c as usize) } else { format!("s{c}") };
            (branch_name(names, a), format!("{lhs}, {rhs}, {}", branch_target(body, pc)))
        }
        OP_SCOPE => {
            let side = Side::from_u8(b).map_or_else(|| format!("{b}"), |s| s.name().to_string());
            ("scope".into(), format!("a{a}, {side}, {}", konst(body, Operand::PointerKonst, c as usize)))
        }
        _ if info.is_compare() => {
            let names = info.branch.unwrap_or((info.name, info.name));
            let lhs = operand(body, pc, info.mode.b, b, op);
            let rhs = operand(body, pc, info.mode.c, c, op);
            (branch_name(names, a), format!("{lhs}, {rhs}, {}", branch_target(body, pc)))
        }
        _ => {
            let mut parts = Vec::new();
            if info.mode.a != Operand::Unused {
                parts.push(operand(body, pc, info.mode.a, a, op));
            }
            if info.mode.b != Operand::Unused {
                parts.push(operand(body, pc, info.mode.b, b, op));
            }
            if info.mode.c != Operand::Unused && !info.mode.b.is_joint() {
                parts.push(operand(body, pc, info.mode.c, c, op));
            }
            (info.name.to_string(), parts.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::builder::{Bank, CodeBuilder, RkOperand};

    fn body() -> ScriptFunction {
        let mut b = CodeBuilder::new("demo");
        for _ in 0..3 {
            b.alloc(Bank::Int, 1).unwrap();
        }
        b.emit_rk(OP_ADD_RR, 0, 1, RkOperand::Int(1000)).unwrap();
        let skip = b.emit_branch(OP_LT_RR, CMP_CHECK, 0, 2);
        b.emit(OP_RETI, RET_FINAL, 0, 7);
        b.backpatch_to_here(skip).unwrap();
        b.emit(OP_RET, RET_FINAL, REGT_INT, 0);
        b.finish("demo.zs").unwrap()
    }

    #[test]
    fn lines_have_address_raw_word_and_comment() {
        let text = disassemble_body(&body());
        let first = text.lines().next().unwrap();
        assert!(first.starts_with("00000000: "), "{first}");
        assert!(first.contains("add_rk    d0, d1, #1000"), "{first}");
        assert!(first.ends_with("; 0,1,0"), "{first}");
        assert_eq!(first.find(';'), Some(COMMENT_COLUMN));
    }

    #[test]
    fn fused_compares_print_as_branches() {
        let text = disassemble_body(&body());
        let line = text.lines().nth(1).unwrap();
        assert!(line.contains("blt       d0, d2, 00000010"), "{line}");
    }

    #[test]
    fn returns_use_special_shapes() {
        let text = disassemble_body(&body());
        assert!(text.contains("reti      0, 7, final"));
        assert!(text.contains("ret       0, d0, final"));
    }
}
