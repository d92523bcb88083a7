//! Bytecode verifier. Every script body passes through here before it is
//! published, so the interpreter and JIT can trust operand indices.

use std::collections::HashSet;

use super::abort::AbortReason;
use super::function::{AddressConst, ScriptFunction};
use super::opcodes::*;

#[derive(Debug, Clone)]
pub struct VerifyError {
    pub function: String,
    pub pc: Option<usize>,
    pub message: String,
    pub hint: Option<String>,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "verify: {} in '{}'", self.message, self.function)?;
        if let Some(pc) = self.pc {
            write!(f, " at pc {pc}")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for VerifyError {}

struct Verifier<'a> {
    name: &'a str,
    body: &'a ScriptFunction,
    jump_targets: HashSet<usize>,
}

type VResult = Result<(), VerifyError>;

/// Number of parameter slots one PARAM with these flags occupies.
pub fn param_slots(flags: u8) -> u16 {
    if flags & REGT_MULTIREG3 != 0 {
        3
    } else if flags & REGT_MULTIREG2 != 0 {
        2
    } else {
        1
    }
}

impl<'a> Verifier<'a> {
    fn err(&self, pc: Option<usize>, message: impl Into<String>, hint: Option<&str>) -> VerifyError {
        VerifyError {
            function: self.name.to_string(),
            pc,
            message: message.into(),
            hint: hint.map(str::to_string),
        }
    }

    fn check_range(&self, pc: usize, what: &str, index: usize, width: usize, len: usize) -> VResult {
        if index + width <= len {
            Ok(())
        } else {
            Err(self.err(Some(pc), format!("{what} {index} out of range (have {len})"), None))
        }
    }

    fn check_operand(&self, pc: usize, kind: Operand, v: usize) -> VResult {
        let b = self.body;
        let c = &b.counts;
        match kind {
            Operand::IntReg => self.check_range(pc, "int register", v, 1, c.int as usize),
            Operand::FloatReg => self.check_range(pc, "float register", v, 1, c.float as usize),
            Operand::Vec2Reg => self.check_range(pc, "vector2 register", v, 2, c.float as usize),
            Operand::Vec3Reg => self.check_range(pc, "vector3 register", v, 3, c.float as usize),
            Operand::StringReg => self.check_range(pc, "string register", v, 1, c.string as usize),
            Operand::PointerReg => self.check_range(pc, "pointer register", v, 1, c.pointer as usize),
            Operand::IntKonst | Operand::JointIntKonst => {
                self.check_range(pc, "int constant", v, 1, b.konst_int.len())
            }
            Operand::FloatKonst | Operand::JointFloatKonst => {
                self.check_range(pc, "float constant", v, 1, b.konst_float.len())
            }
            Operand::StringKonst | Operand::JointStringKonst => {
                self.check_range(pc, "string constant", v, 1, b.konst_string.len())
            }
            Operand::PointerKonst | Operand::JointPointerKonst => {
                self.check_range(pc, "address constant", v, 1, b.konst_address.len())
            }
            _ => Ok(()),
        }
    }

    /// A register or constant described by a `REGT_*` flag byte.
    fn check_typed(&self, pc: usize, flags: u8, index: usize, allow_addrof: bool) -> VResult {
        let ty = flags & REGT_TYPE;
        let konst = flags & REGT_KONST != 0;
        let addrof = flags & REGT_ADDROF != 0;
        let multi = flags & REGT_MULTIREG;
        if flags & !(REGT_TYPE | REGT_KONST | REGT_ADDROF | REGT_MULTIREG) != 0
            || (multi != 0 && (ty != REGT_FLOAT || addrof))
            || multi == REGT_MULTIREG
            || (konst && addrof)
            || (addrof && !allow_addrof)
        {
            return Err(self.err(Some(pc), format!("invalid operand flags {flags:#04x}"), None));
        }
        let width = param_slots(flags) as usize;
        let b = self.body;
        let c = &b.counts;
        match (ty, konst) {
            (REGT_INT, false) => self.check_range(pc, "int register", index, 1, c.int as usize),
            (REGT_INT, true) => self.check_range(pc, "int constant", index, 1, b.konst_int.len()),
            (REGT_FLOAT, false) => self.check_range(pc, "float register", index, width, c.float as usize),
            (REGT_FLOAT, true) => self.check_range(pc, "float constant", index, width, b.konst_float.len()),
            (REGT_STRING, false) => self.check_range(pc, "string register", index, 1, c.string as usize),
            (REGT_STRING, true) => self.check_range(pc, "string constant", index, 1, b.konst_string.len()),
            (_, false) => self.check_range(pc, "pointer register", index, 1, c.pointer as usize),
            (_, true) => self.check_range(pc, "address constant", index, 1, b.konst_address.len()),
        }
    }

    fn check_jump(&mut self, pc: usize, target: isize) -> VResult {
        if target < 0 || target as usize >= self.body.code.len() {
            return Err(self.err(Some(pc), format!("jump target {target} outside code"), None));
        }
        self.jump_targets.insert(target as usize);
        Ok(())
    }

    fn expect_jmp(&self, pc: usize) -> VResult {
        match self.body.code.get(pc + 1) {
            Some(op) if op.opcode() == OP_JMP => Ok(()),
            _ => Err(self.err(
                Some(pc),
                "comparison not followed by jmp",
                Some("every comparison and TEST is fused with the next JMP"),
            )),
        }
    }

    fn function_konst(&self, pc: usize, index: usize) -> VResult {
        match self.body.konst_address.get(index) {
            Some(AddressConst::Function(_)) => Ok(()),
            _ => Err(self.err(Some(pc), format!("address constant {index} is not a function"), None)),
        }
    }

    fn is_terminator(op: Op) -> bool {
        match op.opcode() {
            OP_JMP | OP_THROW => true,
            OP_RET => op.a() & RET_FINAL != 0 || op.b() == REGT_NIL,
            OP_RETI => op.a() & RET_FINAL != 0,
            _ => false,
        }
    }

    fn run(mut self) -> VResult {
        let body = self.body;
        let code = &body.code;
        if code.is_empty() {
            return Err(self.err(None, "empty function body", None));
        }
        let max_param = self.body.counts.max_param;
        let mut pending_params: u16 = 0;
        let mut expected_results: usize = 0;
        let mut result_pcs = Vec::new();

        for (pc, &op) in code.iter().enumerate() {
            let Some(info) = op.info() else {
                return Err(self.err(Some(pc), format!("unknown opcode {}", op.opcode()), None));
            };
            let opcode = op.opcode();

            if expected_results > 0 {
                if opcode != OP_RESULT {
                    return Err(self.err(Some(pc), "call is missing RESULT instructions", None));
                }
                expected_results -= 1;
            } else if opcode == OP_RESULT {
                return Err(self.err(Some(pc), "RESULT outside a call", None));
            }

            let mode = info.mode;
            if mode.b.is_joint() {
                self.check_operand(pc, mode.a, op.a() as usize)?;
                self.check_operand(pc, mode.b, op.bc() as usize)?;
            } else if mode.a != Operand::Imm24 {
                self.check_operand(pc, mode.a, op.a() as usize)?;
                self.check_operand(pc, mode.b, op.b() as usize)?;
                self.check_operand(pc, mode.c, op.c() as usize)?;
            }
            if info.is_compare() || opcode == OP_TEST {
                self.expect_jmp(pc)?;
            }

            match opcode {
                OP_JMP => self.check_jump(pc, op.jump_target(pc))?,
                OP_IJMP => {
                    let n = op.bc() as usize;
                    for entry in pc + 1..=pc + n {
                        match code.get(entry) {
                            Some(j) if j.opcode() == OP_JMP => {}
                            _ => return Err(self.err(Some(pc), "jump table entry is not a jmp", None)),
                        }
                    }
                    if pc + n + 1 >= code.len() {
                        return Err(self.err(Some(pc), "jump table falls off the end", None));
                    }
                    self.jump_targets.insert(pc + n + 1);
                }
                OP_PARAM => {
                    if op.a() != REGT_NIL {
                        self.check_typed(pc, op.a(), op.bc() as usize, true)?;
                    }
                    pending_params = pending_params.saturating_add(param_slots(op.a()));
                }
                OP_PARAMI => pending_params = pending_params.saturating_add(1),
                OP_CALL | OP_CALL_K => {
                    if opcode == OP_CALL_K {
                        self.function_konst(pc, op.a() as usize)?;
                    }
                    if op.b() as u16 > pending_params {
                        return Err(self.err(Some(pc), "call takes more parameters than were pushed", None));
                    }
                    pending_params = 0;
                    expected_results = op.c() as usize;
                }
                OP_RESULT => {
                    self.check_typed(pc, op.a(), op.bc() as usize, false)?;
                    if op.a() & REGT_KONST != 0 {
                        return Err(self.err(Some(pc), "RESULT cannot target a constant", None));
                    }
                    result_pcs.push(pc);
                }
                OP_RET => {
                    if op.b() != REGT_NIL {
                        self.check_typed(pc, op.b(), op.c() as usize, false)?;
                    }
                }
                OP_THROW => {
                    if AbortReason::from_code(op.a() as i32).is_none() {
                        return Err(self.err(Some(pc), format!("unknown abort reason {}", op.a()), None));
                    }
                }
                OP_SCOPE => {
                    if op.b() > 4 {
                        return Err(self.err(Some(pc), format!("unknown side {}", op.b()), None));
                    }
                    self.function_konst(pc, op.c() as usize)?;
                }
                OP_CAST => {
                    let Some((_, dst, src)) = cast_info(op.c()) else {
                        return Err(self.err(Some(pc), format!("unknown cast {}", op.c()), None));
                    };
                    self.check_operand(pc, dst, op.a() as usize)?;
                    self.check_operand(pc, src, op.b() as usize)?;
                }
                OP_CASTB => {
                    let Some(src) = castb_source(op.c()) else {
                        return Err(self.err(Some(pc), format!("unknown bool cast {}", op.c()), None));
                    };
                    self.check_operand(pc, src, op.b() as usize)?;
                }
                OP_FLOP => {
                    if op.c() as usize >= FLOP_NAMES.len() {
                        return Err(self.err(Some(pc), format!("unknown flop {}", op.c()), None));
                    }
                }
                OP_CMPS => {
                    let a = op.a();
                    let b_kind = if a & CMP_BK != 0 { Operand::StringKonst } else { Operand::StringReg };
                    let c_kind = if a & CMP_CK != 0 { Operand::StringKonst } else { Operand::StringReg };
                    self.check_operand(pc, b_kind, op.b() as usize)?;
                    self.check_operand(pc, c_kind, op.c() as usize)?;
                    if a & CMP_METHOD_MASK == CMP_METHOD_MASK {
                        return Err(self.err(Some(pc), "unknown string comparison", None));
                    }
                }
                _ => {}
            }

            if pending_params > max_param {
                return Err(self.err(
                    Some(pc),
                    format!("{pending_params} parameters pushed but frame holds {max_param}"),
                    Some("raise max_param"),
                ));
            }
        }

        if expected_results > 0 {
            return Err(self.err(Some(code.len() - 1), "call is missing RESULT instructions", None));
        }
        let last = code.len() - 1;
        if !Self::is_terminator(code[last]) {
            return Err(self.err(
                Some(last),
                "control can fall off the end of the function",
                Some("end with `ret ..., final`, `jmp` or `throw`"),
            ));
        }
        for pc in result_pcs {
            if self.jump_targets.contains(&pc) {
                return Err(self.err(Some(pc), "jump into a RESULT list", None));
            }
        }

        let extra = self.body.counts.extra_size as usize;
        for special in &self.body.special_inits {
            if special.offset as usize % std::mem::align_of::<String>() != 0
                || special.offset as usize + special.size() > extra
            {
                return Err(self.err(None, "special value outside the extra region", None));
            }
        }
        Ok(())
    }
}

pub fn verify(name: &str, body: &ScriptFunction) -> Result<(), VerifyError> {
    Verifier { name, body, jump_targets: HashSet::new() }.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::frame::RegCounts;
    use crate::vm::function::{SpecialInit, SpecialKind};

    fn body(code: Vec<Op>, counts: RegCounts) -> ScriptFunction {
        ScriptFunction::new(code, counts)
    }

    fn ints(n: u16) -> RegCounts {
        RegCounts { int: n, ..Default::default() }
    }

    fn ret0() -> Op {
        Op::abc(OP_RET, RET_FINAL, REGT_INT, 0)
    }

    #[test]
    fn accepts_minimal_function() {
        let b = body(vec![Op::abc(OP_ADD_RI, 0, 1, 5), ret0()], ints(2));
        verify("f", &b).unwrap();
    }

    #[test]
    fn rejects_out_of_range_register() {
        let b = body(vec![Op::abc(OP_ADD_RI, 0, 2, 5), ret0()], ints(2));
        let e = verify("f", &b).unwrap_err();
        assert!(e.message.contains("int register 2"), "{e}");
        assert_eq!(e.pc, Some(0));
    }

    #[test]
    fn rejects_missing_constant() {
        let b = body(vec![Op::abx(OP_LK, 0, 0), ret0()], ints(1));
        assert!(verify("f", &b).unwrap_err().message.contains("int constant"));
    }

    #[test]
    fn rejects_fall_through() {
        let b = body(vec![Op::abc(OP_NOP, 0, 0, 0)], ints(0));
        assert!(verify("f", &b).unwrap_err().message.contains("fall off"));
    }

    #[test]
    fn compare_needs_jmp() {
        let b = body(vec![Op::abc(OP_EQ_R, CMP_CHECK, 0, 0), ret0()], ints(1));
        assert!(verify("f", &b).unwrap_err().message.contains("not followed by jmp"));
        let ok = body(vec![Op::abc(OP_EQ_R, CMP_CHECK, 0, 0), Op::i24(OP_JMP, 0), ret0()], ints(1));
        verify("f", &ok).unwrap();
    }

    #[test]
    fn jump_must_stay_inside() {
        let b = body(vec![Op::i24(OP_JMP, 5), ret0()], ints(1));
        assert!(verify("f", &b).unwrap_err().message.contains("jump target"));
    }

    #[test]
    fn vector_group_must_fit() {
        let counts = RegCounts { float: 3, ..Default::default() };
        let b = body(vec![Op::abc(OP_NEGV3, 1, 0, 0), Op::abc(OP_RET, RET_FINAL, REGT_NIL, 0)], counts);
        assert!(verify("f", &b).is_err());
    }

    #[test]
    fn params_bounded_by_max_param() {
        let counts = RegCounts { int: 1, pointer: 1, max_param: 1, ..Default::default() };
        let code = vec![
            Op::abx(OP_PARAM, REGT_INT, 0),
            Op::abx(OP_PARAM, REGT_INT, 0),
            Op::abc(OP_CALL, 0, 2, 0),
            ret0(),
        ];
        assert!(verify("f", &body(code, counts)).unwrap_err().message.contains("frame holds"));
    }

    #[test]
    fn results_follow_calls() {
        let counts = RegCounts { int: 1, pointer: 1, max_param: 1, ..Default::default() };
        let stray = vec![Op::abx(OP_RESULT, REGT_INT, 0), ret0()];
        assert!(verify("f", &body(stray, counts)).is_err());
        let missing = vec![Op::abc(OP_CALL, 0, 0, 1), ret0()];
        assert!(verify("f", &body(missing, counts)).is_err());
        let ok = vec![Op::abc(OP_CALL, 0, 0, 1), Op::abx(OP_RESULT, REGT_INT, 0), ret0()];
        verify("f", &body(ok, counts)).unwrap();
    }

    #[test]
    fn unknown_cast_rejected() {
        let counts = RegCounts { int: 1, float: 1, ..Default::default() };
        let b = body(vec![Op::abc(OP_CAST, 0, 0, 99), ret0()], counts);
        assert!(verify("f", &b).unwrap_err().message.contains("unknown cast"));
    }

    #[test]
    fn specials_stay_in_extra_region() {
        let mut b = body(vec![Op::abc(OP_RET, RET_FINAL, REGT_NIL, 0)], RegCounts::default());
        b.special_inits = vec![SpecialInit { kind: SpecialKind::String, offset: 0 }];
        assert!(verify("f", &b).is_err());
        b.counts.extra_size = std::mem::size_of::<String>() as u32;
        verify("f", &b).unwrap();
    }
}
