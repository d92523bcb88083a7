//! Code builder used by front ends to emit one function's bytecode.

use std::collections::HashMap;

use super::frame::RegCounts;
use super::function::{AddressConst, LineEntry, ScriptFunction, SpecialInit, SpecialKind};
use super::opcodes::*;
use super::verify::{self, VerifyError, param_slots};

pub const MAX_REGS: usize = 256;
const MAX_KONSTS: usize = 1 << 16;
const MAX_JUMP: isize = 0x7F_FFFF;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("out of {bank} registers (limit {MAX_REGS})")]
    OutOfRegisters { bank: &'static str },
    #[error("{pool} constant pool is full")]
    PoolFull { pool: &'static str },
    #[error("{pool} constant {index} cannot be encoded in an 8-bit operand")]
    KonstOutOfReach { pool: &'static str, index: u16 },
    #[error("jump distance {distance} exceeds 24 bits")]
    JumpOutOfRange { distance: isize },
    #[error("`{op}` has no constant or immediate form")]
    NoAlternate { op: &'static str },
    #[error("operand does not fit `{op}`")]
    OperandMismatch { op: &'static str },
    #[error("immediate {value} out of range")]
    ImmediateOutOfRange { value: i64 },
    #[error("extra region overflow")]
    ExtraOverflow,
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bank {
    Int = 0,
    Float = 1,
    String = 2,
    Pointer = 3,
}

impl Bank {
    pub const ALL: [Bank; 4] = [Bank::Int, Bank::Float, Bank::String, Bank::Pointer];

    pub fn name(self) -> &'static str {
        match self {
            Bank::Int => "int",
            Bank::Float => "float",
            Bank::String => "string",
            Bank::Pointer => "pointer",
        }
    }
}

/// Free/used bitmap for one register bank.
#[derive(Debug, Clone, Default)]
pub struct RegAvailability {
    used: [u64; MAX_REGS / 64],
    most_used: usize,
}

impl RegAvailability {
    pub fn is_used(&self, reg: usize) -> bool {
        self.used[reg / 64] & (1 << (reg % 64)) != 0
    }

    fn set(&mut self, reg: usize, on: bool) {
        if on {
            self.used[reg / 64] |= 1 << (reg % 64);
        } else {
            self.used[reg / 64] &= !(1 << (reg % 64));
        }
    }

    /// First free run of `count` contiguous registers, marked used.
    pub fn get(&mut self, count: usize) -> Option<u8> {
        if count == 0 || count > MAX_REGS {
            return None;
        }
        let mut start = 0;
        while start + count <= MAX_REGS {
            match (start..start + count).find(|&r| self.is_used(r)) {
                Some(busy) => start = busy + 1,
                None => {
                    for r in start..start + count {
                        self.set(r, true);
                    }
                    self.most_used = self.most_used.max(start + count);
                    return Some(start as u8);
                }
            }
        }
        None
    }

    pub fn return_regs(&mut self, reg: u8, count: usize) {
        for r in reg as usize..(reg as usize + count).min(MAX_REGS) {
            debug_assert!(self.is_used(r), "returning free register {r}");
            self.set(r, false);
        }
    }

    /// Claim a specific register. Returns false if it was already taken.
    pub fn reuse(&mut self, reg: u8) -> bool {
        let r = reg as usize;
        let was_free = !self.is_used(r);
        self.set(r, true);
        self.most_used = self.most_used.max(r + 1);
        was_free
    }

    pub fn most_used(&self) -> usize {
        self.most_used
    }
}

/// Register, constant or immediate third operand for [`CodeBuilder::emit_rk`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RkOperand {
    Reg(u8),
    Int(i32),
    Float(f64),
}

/// A forward jump awaiting its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct JumpLabel(usize);

impl JumpLabel {
    pub fn pc(self) -> usize {
        self.0
    }
}

pub struct CodeBuilder {
    name: String,
    code: Vec<Op>,
    line_info: Vec<LineEntry>,
    registers: [RegAvailability; 4],
    konst_int: Vec<i32>,
    int_map: HashMap<i32, u16>,
    konst_float: Vec<f64>,
    float_map: HashMap<u64, u16>,
    konst_string: Vec<String>,
    string_map: HashMap<String, u16>,
    konst_address: Vec<AddressConst>,
    address_map: HashMap<usize, u16>,
    active_param: u16,
    max_param: u16,
    extra_size: u32,
    special_inits: Vec<SpecialInit>,
}

fn narrow(pool: &'static str, index: u16) -> Result<u8, BuildError> {
    u8::try_from(index).map_err(|_| BuildError::KonstOutOfReach { pool, index })
}

impl CodeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        CodeBuilder {
            name: name.into(),
            code: Vec::new(),
            line_info: Vec::new(),
            registers: Default::default(),
            konst_int: Vec::new(),
            int_map: HashMap::new(),
            konst_float: Vec::new(),
            float_map: HashMap::new(),
            konst_string: Vec::new(),
            string_map: HashMap::new(),
            konst_address: Vec::new(),
            address_map: HashMap::new(),
            active_param: 0,
            max_param: 0,
            extra_size: 0,
            special_inits: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pc(&self) -> usize {
        self.code.len()
    }

    pub fn code(&self) -> &[Op] {
        &self.code
    }

    // ── Registers ───────────────────────────────────────────────────

    pub fn registers(&mut self, bank: Bank) -> &mut RegAvailability {
        &mut self.registers[bank as usize]
    }

    pub fn alloc(&mut self, bank: Bank, count: usize) -> Result<u8, BuildError> {
        self.registers[bank as usize]
            .get(count)
            .ok_or(BuildError::OutOfRegisters { bank: bank.name() })
    }

    pub fn free(&mut self, bank: Bank, reg: u8, count: usize) {
        self.registers[bank as usize].return_regs(reg, count);
    }

    // ── Constants ───────────────────────────────────────────────────

    pub fn konst_int(&mut self, v: i32) -> Result<u16, BuildError> {
        if let Some(&i) = self.int_map.get(&v) {
            return Ok(i);
        }
        let i = Self::next_index(self.konst_int.len(), "int")?;
        self.konst_int.push(v);
        self.int_map.insert(v, i);
        Ok(i)
    }

    /// Floats are deduplicated by bit pattern, so 0.0 and -0.0 stay distinct.
    pub fn konst_float(&mut self, v: f64) -> Result<u16, BuildError> {
        if let Some(&i) = self.float_map.get(&v.to_bits()) {
            return Ok(i);
        }
        let i = Self::next_index(self.konst_float.len(), "float")?;
        self.konst_float.push(v);
        self.float_map.insert(v.to_bits(), i);
        Ok(i)
    }

    /// Contiguous run of floats, e.g. a vector constant.
    pub fn konst_floats(&mut self, vs: &[f64]) -> Result<u16, BuildError> {
        match vs {
            [] => return Err(BuildError::OperandMismatch { op: "lkf" }),
            [one] => return self.konst_float(*one),
            _ => {}
        }
        let same = |w: &[f64]| w.iter().zip(vs).all(|(a, b)| a.to_bits() == b.to_bits());
        if let Some(i) = self.konst_float.windows(vs.len()).position(same) {
            return Ok(i as u16);
        }
        Self::next_index(self.konst_float.len() + vs.len() - 1, "float")?;
        let first = self.konst_float.len();
        for (k, v) in vs.iter().enumerate() {
            self.konst_float.push(*v);
            self.float_map.entry(v.to_bits()).or_insert((first + k) as u16);
        }
        Ok(first as u16)
    }

    pub fn konst_string(&mut self, v: &str) -> Result<u16, BuildError> {
        if let Some(&i) = self.string_map.get(v) {
            return Ok(i);
        }
        let i = Self::next_index(self.konst_string.len(), "string")?;
        self.konst_string.push(v.to_string());
        self.string_map.insert(v.to_string(), i);
        Ok(i)
    }

    /// Address constants are keyed by identity.
    pub fn konst_address(&mut self, v: AddressConst) -> Result<u16, BuildError> {
        let key = v.addr() as usize;
        if let Some(&i) = self.address_map.get(&key) {
            return Ok(i);
        }
        let i = Self::next_index(self.konst_address.len(), "address")?;
        self.konst_address.push(v);
        self.address_map.insert(key, i);
        Ok(i)
    }

    fn next_index(len: usize, pool: &'static str) -> Result<u16, BuildError> {
        if len >= MAX_KONSTS {
            Err(BuildError::PoolFull { pool })
        } else {
            Ok(len as u16)
        }
    }

    // ── Emission ────────────────────────────────────────────────────

    fn push(&mut self, op: Op) -> usize {
        match op.opcode() {
            OP_PARAM => self.active_param = self.active_param.saturating_add(param_slots(op.a())),
            OP_PARAMI => self.active_param = self.active_param.saturating_add(1),
            OP_CALL | OP_CALL_K => self.active_param = self.active_param.saturating_sub(op.b() as u16),
            _ => {}
        }
        self.max_param = self.max_param.max(self.active_param);
        self.code.push(op);
        self.code.len() - 1
    }

    pub fn emit(&mut self, op: u8, a: u8, b: u8, c: u8) -> usize {
        self.push(Op::abc(op, a, b, c))
    }

    pub fn emit_abx(&mut self, op: u8, a: u8, bx: u16) -> usize {
        self.push(Op::abx(op, a, bx))
    }

    pub fn emit_i24(&mut self, op: u8, imm: i32) -> Result<usize, BuildError> {
        if !(-(MAX_JUMP as i32) - 1..=MAX_JUMP as i32).contains(&imm) {
            return Err(BuildError::ImmediateOutOfRange { value: imm as i64 });
        }
        Ok(self.push(Op::i24(op, imm)))
    }

    /// Emit `op` with a register third operand, or its constant/immediate
    /// alternate form when `c` is a value.
    pub fn emit_rk(&mut self, op: u8, a: u8, b: u8, c: RkOperand) -> Result<usize, BuildError> {
        let name = info(op).map_or("?", |i| i.name);
        let value = match c {
            RkOperand::Reg(r) => return Ok(self.emit(op, a, b, r)),
            other => other,
        };
        if op == OP_ADD_RR {
            if let RkOperand::Int(v) = value {
                if let Ok(imm) = i8::try_from(v) {
                    return Ok(self.emit(OP_ADD_RI, a, b, imm as u8));
                }
            }
        }
        let alt = info(op).and_then(|i| i.alt).ok_or(BuildError::NoAlternate { op: name })?;
        let c = match (OP_INFO[alt as usize].mode.c, value) {
            (Operand::IntKonst, RkOperand::Int(v)) => narrow("int", self.konst_int(v)?)?,
            (Operand::FloatKonst, RkOperand::Float(v)) => narrow("float", self.konst_float(v)?)?,
            (Operand::Imm, RkOperand::Int(v)) => {
                i8::try_from(v).map_err(|_| BuildError::ImmediateOutOfRange { value: v as i64 })? as u8
            }
            (Operand::UImm, RkOperand::Int(v)) => {
                u8::try_from(v).map_err(|_| BuildError::ImmediateOutOfRange { value: v as i64 })?
            }
            _ => return Err(BuildError::OperandMismatch { op: name }),
        };
        Ok(self.emit(alt, a, b, c))
    }

    /// LI for values that fit 16 bits, LK otherwise.
    pub fn emit_load_int(&mut self, reg: u8, v: i32) -> Result<usize, BuildError> {
        match i16::try_from(v) {
            Ok(imm) => Ok(self.emit_abx(OP_LI, reg, imm as u16)),
            Err(_) => {
                let k = self.konst_int(v)?;
                Ok(self.emit_abx(OP_LK, reg, k))
            }
        }
    }

    /// PARAMI for values that fit 24 bits, a constant PARAM otherwise.
    pub fn emit_param_int(&mut self, v: i32) -> Result<usize, BuildError> {
        if (-(MAX_JUMP as i32) - 1..=MAX_JUMP as i32).contains(&v) {
            Ok(self.push(Op::i24(OP_PARAMI, v)))
        } else {
            let k = self.konst_int(v)?;
            Ok(self.emit_abx(OP_PARAM, REGT_INT | REGT_KONST, k))
        }
    }

    // ── Jumps ───────────────────────────────────────────────────────

    pub fn emit_jump(&mut self) -> JumpLabel {
        JumpLabel(self.push(Op::i24(OP_JMP, 0)))
    }

    /// Comparison fused with a forward jump; taken when the comparison
    /// result equals `check`.
    pub fn emit_branch(&mut self, cmp: u8, flags: u8, b: u8, c: u8) -> JumpLabel {
        self.emit(cmp, flags, b, c);
        self.emit_jump()
    }

    fn jump_offset(from: usize, target: usize) -> Result<i32, BuildError> {
        let distance = target as isize - from as isize - 1;
        if (-MAX_JUMP - 1..=MAX_JUMP).contains(&distance) {
            Ok(distance as i32)
        } else {
            Err(BuildError::JumpOutOfRange { distance })
        }
    }

    pub fn backpatch(&mut self, label: JumpLabel, target: usize) -> Result<(), BuildError> {
        let offset = Self::jump_offset(label.0, target)?;
        self.code[label.0] = self.code[label.0].with_i24(offset);
        Ok(())
    }

    pub fn backpatch_to_here(&mut self, label: JumpLabel) -> Result<(), BuildError> {
        self.backpatch(label, self.pc())
    }

    pub fn backpatch_list_to_here(&mut self, labels: &[JumpLabel]) -> Result<(), BuildError> {
        let here = self.pc();
        labels.iter().try_for_each(|&l| self.backpatch(l, here))
    }

    pub fn emit_jump_to(&mut self, target: usize) -> Result<usize, BuildError> {
        let offset = Self::jump_offset(self.pc(), target)?;
        Ok(self.push(Op::i24(OP_JMP, offset)))
    }

    // ── Lines, extra region, result ─────────────────────────────────

    pub fn begin_statement(&mut self, line: u32) {
        let pc = self.pc() as u32;
        match self.line_info.last_mut() {
            Some(last) if last.line == line => {}
            Some(last) if last.pc == pc => last.line = line,
            _ => self.line_info.push(LineEntry { pc, line }),
        }
    }

    fn alloc_extra(&mut self, kind: SpecialKind) -> Result<u32, BuildError> {
        let align = std::mem::align_of::<String>() as u32;
        let offset = self.extra_size.div_ceil(align) * align;
        let special = SpecialInit { kind, offset };
        let end = offset
            .checked_add(special.size() as u32)
            .ok_or(BuildError::ExtraOverflow)?;
        self.extra_size = end;
        self.special_inits.push(special);
        Ok(offset)
    }

    /// Reserve a string in the extra region; returns its byte offset.
    pub fn alloc_extra_string(&mut self) -> Result<u32, BuildError> {
        self.alloc_extra(SpecialKind::String)
    }

    pub fn alloc_extra_string_array(&mut self, n: u16) -> Result<u32, BuildError> {
        self.alloc_extra(SpecialKind::StringArray(n))
    }

    pub fn reg_counts(&self) -> RegCounts {
        let n = |b: Bank| self.registers[b as usize].most_used() as u16;
        RegCounts {
            int: n(Bank::Int),
            float: n(Bank::Float),
            string: n(Bank::String),
            pointer: n(Bank::Pointer),
            max_param: self.max_param,
            extra_size: self.extra_size,
        }
    }

    /// Produce the verified function body.
    pub fn finish(self, source_file: &str) -> Result<ScriptFunction, BuildError> {
        let counts = self.reg_counts();
        let mut body = ScriptFunction::new(self.code, counts);
        body.line_info = self.line_info;
        body.source_file = source_file.to_string();
        body.konst_int = self.konst_int;
        body.konst_float = self.konst_float;
        body.konst_string = self.konst_string;
        body.konst_address = self.konst_address;
        body.special_inits = self.special_inits;
        verify::verify(&self.name, &body)?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::vm::function::Function;

    #[test]
    fn registers_come_in_contiguous_runs() {
        let mut r = RegAvailability::default();
        assert_eq!(r.get(1), Some(0));
        assert_eq!(r.get(3), Some(1));
        r.return_regs(0, 1);
        assert_eq!(r.get(2), Some(4));
        assert_eq!(r.get(1), Some(0));
        assert_eq!(r.most_used(), 6);
    }

    #[test]
    fn bank_overflow_is_a_build_error() {
        let mut b = CodeBuilder::new("f");
        for _ in 0..MAX_REGS {
            b.alloc(Bank::Int, 1).unwrap();
        }
        assert!(matches!(b.alloc(Bank::Int, 1), Err(BuildError::OutOfRegisters { bank: "int" })));
        assert!(b.alloc(Bank::Float, 3).is_ok());
    }

    #[test]
    fn constants_deduplicate_per_pool() {
        let mut b = CodeBuilder::new("f");
        assert_eq!(b.konst_int(7).unwrap(), b.konst_int(7).unwrap());
        assert_eq!(b.konst_float(7.0).unwrap(), b.konst_float(7.0).unwrap());
        assert_ne!(b.konst_float(0.0).unwrap(), b.konst_float(-0.0).unwrap());
        assert_eq!(b.konst_string("x").unwrap(), b.konst_string("x").unwrap());
        let f = Arc::new(Function::native("n", |_, _, _| Ok(0)));
        let a1 = b.konst_address(AddressConst::Function(f.clone())).unwrap();
        let a2 = b.konst_address(AddressConst::Function(f)).unwrap();
        assert_eq!(a1, a2);
        assert_eq!(b.konst_address(AddressConst::Null).unwrap(), 1);
        assert_eq!(b.konst_int(8).unwrap(), 1);
    }

    #[test]
    fn vector_constants_reuse_runs() {
        let mut b = CodeBuilder::new("f");
        let v = b.konst_floats(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(b.konst_floats(&[1.0, 2.0, 3.0]).unwrap(), v);
        assert_eq!(b.konst_floats(&[2.0, 3.0]).unwrap(), v + 1);
        assert_eq!(b.konst_float(3.0).unwrap(), v + 2);
    }

    #[test]
    fn rk_switches_to_alternate_form() {
        let mut b = CodeBuilder::new("f");
        b.emit_rk(OP_ADD_RR, 0, 1, RkOperand::Int(5)).unwrap();
        b.emit_rk(OP_ADD_RR, 0, 1, RkOperand::Int(1000)).unwrap();
        b.emit_rk(OP_MULF_RR, 0, 1, RkOperand::Float(2.5)).unwrap();
        b.emit_rk(OP_SLL_RR, 0, 1, RkOperand::Int(3)).unwrap();
        let ops: Vec<u8> = b.code().iter().map(|o| o.opcode()).collect();
        assert_eq!(ops, vec![OP_ADD_RI, OP_ADD_RK, OP_MULF_RK, OP_SLL_RI]);
        assert!(b.emit_rk(OP_ABS, 0, 1, RkOperand::Int(1)).is_err());
    }

    #[test]
    fn int_loads_pick_shortest_form() {
        let mut b = CodeBuilder::new("f");
        b.emit_load_int(0, -5).unwrap();
        b.emit_load_int(0, 100_000).unwrap();
        assert_eq!(b.code()[0].opcode(), OP_LI);
        assert_eq!(b.code()[0].sbc(), -5);
        assert_eq!(b.code()[1].opcode(), OP_LK);
        b.emit_param_int(3).unwrap();
        b.emit_param_int(i32::MAX).unwrap();
        assert_eq!(b.code()[2].opcode(), OP_PARAMI);
        assert_eq!(b.code()[3].opcode(), OP_PARAM);
    }

    #[test]
    fn max_param_tracks_open_calls() {
        let mut b = CodeBuilder::new("f");
        b.emit_param_int(1).unwrap();
        b.emit_abx(OP_PARAM, REGT_FLOAT | REGT_MULTIREG3, 0);
        b.emit(OP_CALL, 0, 4, 0);
        b.emit_param_int(1).unwrap();
        b.emit(OP_CALL, 0, 1, 0);
        assert_eq!(b.reg_counts().max_param, 4);
    }

    #[test]
    fn backpatching_resolves_forward_jumps() {
        let mut b = CodeBuilder::new("f");
        b.registers(Bank::Int).reuse(0);
        let skip = b.emit_branch(OP_EQ_K, CMP_CHECK, 0, 0);
        let exits = [b.emit_jump(), b.emit_jump()];
        b.backpatch_to_here(skip).unwrap();
        b.emit(OP_NOP, 0, 0, 0);
        b.backpatch_list_to_here(&exits).unwrap();
        let top = b.pc();
        b.emit_abc_ret();
        assert_eq!(b.code()[1].jump_target(1), 4);
        assert_eq!(b.code()[2].jump_target(2), top as isize);
        assert_eq!(b.code()[3].jump_target(3), top as isize);
        b.emit_jump_to(0).unwrap();
        assert_eq!(b.code()[top + 1].jump_target(top + 1), 0);
    }

    #[test]
    fn line_table_records_changes_only() {
        let mut b = CodeBuilder::new("f");
        b.begin_statement(1);
        b.begin_statement(2);
        b.emit(OP_NOP, 0, 0, 0);
        b.begin_statement(2);
        b.emit(OP_NOP, 0, 0, 0);
        b.begin_statement(5);
        b.emit_abc_ret();
        let body = b.finish("t.zs").unwrap();
        assert_eq!(body.line_info, vec![LineEntry { pc: 0, line: 2 }, LineEntry { pc: 2, line: 5 }]);
        assert_eq!(body.pc_to_line(1), Some(2));
    }

    #[test]
    fn extra_strings_are_aligned() {
        let mut b = CodeBuilder::new("f");
        let a = b.alloc_extra_string().unwrap();
        let arr = b.alloc_extra_string_array(3).unwrap();
        assert_eq!(a, 0);
        assert_eq!(arr as usize, std::mem::size_of::<String>());
        b.emit_abc_ret();
        let body = b.finish("").unwrap();
        assert_eq!(body.counts.extra_size as usize, 4 * std::mem::size_of::<String>());
        assert_eq!(body.special_inits.len(), 2);
    }

    impl CodeBuilder {
        fn emit_abc_ret(&mut self) {
            self.emit(OP_RET, RET_FINAL, REGT_NIL, 0);
        }
    }
}
