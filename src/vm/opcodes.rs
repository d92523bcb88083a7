//! Instruction set: the packed [`Op`] word and the single opcode table that the
//! builder, verifier, interpreter, JIT, assembler and disassembler all read.

use std::fmt;

// ── Instruction encoding ────────────────────────────────────────────
//
// ABC mode:  [OP:8 | A:8 | B:8 | C:8]
// ABx mode:  [OP:8 | A:8 | Bx:16]   (Bx signed or unsigned, spans B and C)
// I24 mode:  [OP:8 | imm:24]        (signed, spans A, B and C)

/// One 32-bit instruction. Every interpretation of the word goes through an
/// accessor; nothing relies on field overlap.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Op(u32);

impl Op {
    #[inline(always)]
    pub const fn abc(op: u8, a: u8, b: u8, c: u8) -> Self {
        Op((op as u32) << 24 | (a as u32) << 16 | (b as u32) << 8 | c as u32)
    }

    #[inline(always)]
    pub const fn abx(op: u8, a: u8, bx: u16) -> Self {
        Op((op as u32) << 24 | (a as u32) << 16 | bx as u32)
    }

    #[inline(always)]
    pub const fn i24(op: u8, imm: i32) -> Self {
        Op((op as u32) << 24 | (imm as u32 & 0x00FF_FFFF))
    }

    pub const fn from_bits(bits: u32) -> Self {
        Op(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub const fn opcode(self) -> u8 {
        (self.0 >> 24) as u8
    }

    #[inline(always)]
    pub const fn a(self) -> u8 {
        (self.0 >> 16) as u8
    }

    #[inline(always)]
    pub const fn b(self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[inline(always)]
    pub const fn c(self) -> u8 {
        self.0 as u8
    }

    /// B and C joined as an unsigned 16-bit field.
    #[inline(always)]
    pub const fn bc(self) -> u16 {
        self.0 as u16
    }

    /// B and C joined as a signed 16-bit field.
    #[inline(always)]
    pub const fn sbc(self) -> i16 {
        self.0 as u16 as i16
    }

    /// A, B and C joined as a signed 24-bit field.
    #[inline(always)]
    pub const fn signed_immediate24(self) -> i32 {
        ((self.0 << 8) as i32) >> 8
    }

    /// Same instruction with its 24-bit immediate replaced (jump backpatching).
    pub const fn with_i24(self, imm: i32) -> Self {
        Op::i24(self.opcode(), imm)
    }

    pub fn info(self) -> Option<&'static OpInfo> {
        OP_INFO.get(self.opcode() as usize)
    }

    /// Destination of a JMP located at `pc`.
    #[inline(always)]
    pub fn jump_target(self, pc: usize) -> isize {
        pc as isize + 1 + self.signed_immediate24() as isize
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.info() {
            Some(info) => write!(f, "Op({} {} {} {})", info.name, self.a(), self.b(), self.c()),
            None => write!(f, "Op(?{:#010x})", self.0),
        }
    }
}

// ── Operand modes ───────────────────────────────────────────────────

/// How one operand field of an instruction is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Unused,
    IntReg,
    FloatReg,
    StringReg,
    PointerReg,
    /// Two contiguous float registers.
    Vec2Reg,
    /// Three contiguous float registers.
    Vec3Reg,
    IntKonst,
    FloatKonst,
    StringKonst,
    PointerKonst,
    /// Signed 8-bit immediate.
    Imm,
    /// Unsigned 8-bit immediate.
    UImm,
    /// Comparison flags (`CMP_*`).
    CmpFlags,
    /// Signed 16-bit immediate spanning B and C.
    JointImm,
    /// Unsigned 16-bit immediate spanning B and C.
    JointUImm,
    JointIntKonst,
    JointFloatKonst,
    JointStringKonst,
    JointPointerKonst,
    /// Signed 24-bit immediate spanning A, B and C.
    Imm24,
    /// Shape depends on flag bits carried by the instruction itself.
    Variable,
}

impl Operand {
    /// True for kinds occupying both B and C.
    pub fn is_joint(self) -> bool {
        matches!(
            self,
            Operand::JointImm
                | Operand::JointUImm
                | Operand::JointIntKonst
                | Operand::JointFloatKonst
                | Operand::JointStringKonst
                | Operand::JointPointerKonst
        )
    }

    pub fn is_konst(self) -> bool {
        matches!(
            self,
            Operand::IntKonst
                | Operand::FloatKonst
                | Operand::StringKonst
                | Operand::PointerKonst
                | Operand::JointIntKonst
                | Operand::JointFloatKonst
                | Operand::JointStringKonst
                | Operand::JointPointerKonst
        )
    }

    pub fn is_immediate(self) -> bool {
        matches!(self, Operand::Imm | Operand::UImm | Operand::JointImm | Operand::JointUImm)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpMode {
    pub a: Operand,
    pub b: Operand,
    pub c: Operand,
}

/// One row of the opcode table.
#[derive(Debug)]
pub struct OpInfo {
    pub name: &'static str,
    pub mode: OpMode,
    /// Variant taking a constant or immediate in place of the last register.
    pub alt: Option<u8>,
    /// Pseudo-mnemonics for the fused compare+jump pair: (check set, check clear).
    pub branch: Option<(&'static str, &'static str)>,
}

impl OpInfo {
    pub fn is_compare(&self) -> bool {
        self.mode.a == Operand::CmpFlags
    }
}

pub fn info(opcode: u8) -> Option<&'static OpInfo> {
    OP_INFO.get(opcode as usize)
}

pub fn lookup(name: &str) -> Option<u8> {
    OP_INFO.iter().position(|i| i.name == name).map(|i| i as u8)
}

const NA: Operand = Operand::Unused;
const RI: Operand = Operand::IntReg;
const RF: Operand = Operand::FloatReg;
const RS: Operand = Operand::StringReg;
const RP: Operand = Operand::PointerReg;
const RV2: Operand = Operand::Vec2Reg;
const RV3: Operand = Operand::Vec3Reg;
const KI: Operand = Operand::IntKonst;
const KF: Operand = Operand::FloatKonst;
const KP: Operand = Operand::PointerKonst;
const IM: Operand = Operand::Imm;
const UI: Operand = Operand::UImm;
const CMP: Operand = Operand::CmpFlags;
const JS: Operand = Operand::JointImm;
const JU: Operand = Operand::JointUImm;
const JKI: Operand = Operand::JointIntKonst;
const JKF: Operand = Operand::JointFloatKonst;
const JKS: Operand = Operand::JointStringKonst;
const JKP: Operand = Operand::JointPointerKonst;
const I24: Operand = Operand::Imm24;
const VAR: Operand = Operand::Variable;

macro_rules! opcodes {
    ($( $name:ident = $mnemonic:literal, [$a:ident, $b:ident, $c:ident]
        $(, alt $alt:ident)? $(, branch $bt:literal $bf:literal)? ;)*) => {
        #[allow(non_camel_case_types, clippy::upper_case_acronyms)]
        #[repr(u8)]
        enum Index { $($name,)* Count }

        $( pub const $name: u8 = Index::$name as u8; )*

        pub const OP_COUNT: usize = Index::Count as usize;

        pub static OP_INFO: [OpInfo; OP_COUNT] = [
            $( OpInfo {
                name: $mnemonic,
                mode: OpMode { a: $a, b: $b, c: $c },
                alt: opcodes!(@alt $($alt)?),
                branch: opcodes!(@branch $($bt $bf)?),
            }, )*
        ];
    };
    (@alt) => { None };
    (@alt $alt:ident) => { Some($alt) };
    (@branch) => { None };
    (@branch $bt:literal $bf:literal) => { Some(($bt, $bf)) };
}

opcodes! {
    // Control flow and calls
    OP_NOP = "nop", [NA, NA, NA];
    OP_JMP = "jmp", [I24, NA, NA];
    OP_IJMP = "ijmp", [RI, JU, NA];
    OP_TEST = "test", [RI, JS, NA];
    OP_PARAM = "param", [VAR, VAR, VAR];
    OP_PARAMI = "parami", [I24, NA, NA];
    OP_CALL = "call", [RP, UI, UI];
    OP_CALL_K = "call_k", [KP, UI, UI];
    OP_VTBL = "vtbl", [RP, RP, UI];
    OP_SCOPE = "scope", [RP, UI, KP];
    OP_RESULT = "result", [VAR, VAR, VAR];
    OP_RET = "ret", [VAR, VAR, VAR];
    OP_RETI = "reti", [VAR, VAR, VAR];
    OP_THROW = "throw", [UI, JKS, NA];
    OP_BOUND = "bound", [RI, JU, NA];
    OP_BOUND_K = "bound_k", [RI, JKI, NA];
    OP_BOUND_R = "bound_r", [RI, RI, NA];

    // Constant loads
    OP_LI = "li", [RI, JS, NA];
    OP_LK = "lk", [RI, JKI, NA];
    OP_LKF = "lkf", [RF, JKF, NA];
    OP_LKS = "lks", [RS, JKS, NA];
    OP_LKP = "lkp", [RP, JKP, NA];
    OP_LFP = "lfp", [RP, NA, NA];

    // Memory loads: B = base pointer, C = offset (int constant or register)
    OP_LB = "lb", [RI, RP, KI];
    OP_LB_R = "lb_r", [RI, RP, RI], alt OP_LB;
    OP_LH = "lh", [RI, RP, KI];
    OP_LH_R = "lh_r", [RI, RP, RI], alt OP_LH;
    OP_LW = "lw", [RI, RP, KI];
    OP_LW_R = "lw_r", [RI, RP, RI], alt OP_LW;
    OP_LBU = "lbu", [RI, RP, KI];
    OP_LBU_R = "lbu_r", [RI, RP, RI], alt OP_LBU;
    OP_LHU = "lhu", [RI, RP, KI];
    OP_LHU_R = "lhu_r", [RI, RP, RI], alt OP_LHU;
    OP_LSP = "lsp", [RF, RP, KI];
    OP_LSP_R = "lsp_r", [RF, RP, RI], alt OP_LSP;
    OP_LDP = "ldp", [RF, RP, KI];
    OP_LDP_R = "ldp_r", [RF, RP, RI], alt OP_LDP;
    OP_LS = "ls", [RS, RP, KI];
    OP_LS_R = "ls_r", [RS, RP, RI], alt OP_LS;
    OP_LP = "lp", [RP, RP, KI];
    OP_LP_R = "lp_r", [RP, RP, RI], alt OP_LP;
    OP_LO = "lo", [RP, RP, KI];
    OP_LO_R = "lo_r", [RP, RP, RI], alt OP_LO;
    OP_LV2 = "lv2", [RV2, RP, KI];
    OP_LV2_R = "lv2_r", [RV2, RP, RI], alt OP_LV2;
    OP_LV3 = "lv3", [RV3, RP, KI];
    OP_LV3_R = "lv3_r", [RV3, RP, RI], alt OP_LV3;
    OP_LBIT = "lbit", [RI, RP, UI];

    // Memory stores: A = base pointer, B = value, C = offset
    OP_SB = "sb", [RP, RI, KI];
    OP_SB_R = "sb_r", [RP, RI, RI], alt OP_SB;
    OP_SH = "sh", [RP, RI, KI];
    OP_SH_R = "sh_r", [RP, RI, RI], alt OP_SH;
    OP_SW = "sw", [RP, RI, KI];
    OP_SW_R = "sw_r", [RP, RI, RI], alt OP_SW;
    OP_SSP = "ssp", [RP, RF, KI];
    OP_SSP_R = "ssp_r", [RP, RF, RI], alt OP_SSP;
    OP_SDP = "sdp", [RP, RF, KI];
    OP_SDP_R = "sdp_r", [RP, RF, RI], alt OP_SDP;
    OP_SS = "ss", [RP, RS, KI];
    OP_SS_R = "ss_r", [RP, RS, RI], alt OP_SS;
    OP_SP = "sp", [RP, RP, KI];
    OP_SP_R = "sp_r", [RP, RP, RI], alt OP_SP;
    OP_SO = "so", [RP, RP, KI];
    OP_SO_R = "so_r", [RP, RP, RI], alt OP_SO;
    OP_SV2 = "sv2", [RP, RV2, KI];
    OP_SV2_R = "sv2_r", [RP, RV2, RI], alt OP_SV2;
    OP_SV3 = "sv3", [RP, RV3, KI];
    OP_SV3_R = "sv3_r", [RP, RV3, RI], alt OP_SV3;
    OP_SBIT = "sbit", [RP, RI, UI];

    // Moves and casts
    OP_MOVE = "move", [RI, RI, NA];
    OP_MOVEF = "movef", [RF, RF, NA];
    OP_MOVES = "moves", [RS, RS, NA];
    OP_MOVEA = "movea", [RP, RP, NA];
    OP_MOVEV2 = "movev2", [RV2, RV2, NA];
    OP_MOVEV3 = "movev3", [RV3, RV3, NA];
    OP_CAST = "cast", [VAR, VAR, UI];
    OP_CASTB = "castb", [RI, VAR, UI];

    // Integer arithmetic
    OP_SLL_RR = "sll_rr", [RI, RI, RI], alt OP_SLL_RI;
    OP_SLL_RI = "sll_ri", [RI, RI, UI];
    OP_SLL_KR = "sll_kr", [RI, KI, RI];
    OP_SRL_RR = "srl_rr", [RI, RI, RI], alt OP_SRL_RI;
    OP_SRL_RI = "srl_ri", [RI, RI, UI];
    OP_SRL_KR = "srl_kr", [RI, KI, RI];
    OP_SRA_RR = "sra_rr", [RI, RI, RI], alt OP_SRA_RI;
    OP_SRA_RI = "sra_ri", [RI, RI, UI];
    OP_SRA_KR = "sra_kr", [RI, KI, RI];
    OP_ADD_RR = "add_rr", [RI, RI, RI], alt OP_ADD_RK;
    OP_ADD_RK = "add_rk", [RI, RI, KI];
    OP_ADD_RI = "add_ri", [RI, RI, IM];
    OP_SUB_RR = "sub_rr", [RI, RI, RI], alt OP_SUB_RK;
    OP_SUB_RK = "sub_rk", [RI, RI, KI];
    OP_SUB_KR = "sub_kr", [RI, KI, RI];
    OP_MUL_RR = "mul_rr", [RI, RI, RI], alt OP_MUL_RK;
    OP_MUL_RK = "mul_rk", [RI, RI, KI];
    OP_DIV_RR = "div_rr", [RI, RI, RI], alt OP_DIV_RK;
    OP_DIV_RK = "div_rk", [RI, RI, KI];
    OP_DIV_KR = "div_kr", [RI, KI, RI];
    OP_DIVU_RR = "divu_rr", [RI, RI, RI], alt OP_DIVU_RK;
    OP_DIVU_RK = "divu_rk", [RI, RI, KI];
    OP_DIVU_KR = "divu_kr", [RI, KI, RI];
    OP_MOD_RR = "mod_rr", [RI, RI, RI], alt OP_MOD_RK;
    OP_MOD_RK = "mod_rk", [RI, RI, KI];
    OP_MOD_KR = "mod_kr", [RI, KI, RI];
    OP_MODU_RR = "modu_rr", [RI, RI, RI], alt OP_MODU_RK;
    OP_MODU_RK = "modu_rk", [RI, RI, KI];
    OP_MODU_KR = "modu_kr", [RI, KI, RI];
    OP_AND_RR = "and_rr", [RI, RI, RI], alt OP_AND_RK;
    OP_AND_RK = "and_rk", [RI, RI, KI];
    OP_OR_RR = "or_rr", [RI, RI, RI], alt OP_OR_RK;
    OP_OR_RK = "or_rk", [RI, RI, KI];
    OP_XOR_RR = "xor_rr", [RI, RI, RI], alt OP_XOR_RK;
    OP_XOR_RK = "xor_rk", [RI, RI, KI];
    OP_MIN_RR = "min_rr", [RI, RI, RI], alt OP_MIN_RK;
    OP_MIN_RK = "min_rk", [RI, RI, KI];
    OP_MAX_RR = "max_rr", [RI, RI, RI], alt OP_MAX_RK;
    OP_MAX_RK = "max_rk", [RI, RI, KI];
    OP_ABS = "abs", [RI, RI, NA];
    OP_NEG = "neg", [RI, RI, NA];
    OP_NOT = "not", [RI, RI, NA];

    // Integer comparisons (fused with the following JMP)
    OP_EQ_R = "eq_r", [CMP, RI, RI], alt OP_EQ_K, branch "beq" "bne";
    OP_EQ_K = "eq_k", [CMP, RI, KI], branch "beq" "bne";
    OP_LT_RR = "lt_rr", [CMP, RI, RI], alt OP_LT_RK, branch "blt" "bge";
    OP_LT_RK = "lt_rk", [CMP, RI, KI], branch "blt" "bge";
    OP_LT_KR = "lt_kr", [CMP, KI, RI], branch "blt" "bge";
    OP_LE_RR = "le_rr", [CMP, RI, RI], alt OP_LE_RK, branch "ble" "bgt";
    OP_LE_RK = "le_rk", [CMP, RI, KI], branch "ble" "bgt";
    OP_LE_KR = "le_kr", [CMP, KI, RI], branch "ble" "bgt";
    OP_LTU_RR = "ltu_rr", [CMP, RI, RI], alt OP_LTU_RK, branch "bltu" "bgeu";
    OP_LTU_RK = "ltu_rk", [CMP, RI, KI], branch "bltu" "bgeu";
    OP_LTU_KR = "ltu_kr", [CMP, KI, RI], branch "bltu" "bgeu";
    OP_LEU_RR = "leu_rr", [CMP, RI, RI], alt OP_LEU_RK, branch "bleu" "bgtu";
    OP_LEU_RK = "leu_rk", [CMP, RI, KI], branch "bleu" "bgtu";
    OP_LEU_KR = "leu_kr", [CMP, KI, RI], branch "bleu" "bgtu";

    // Float arithmetic
    OP_ADDF_RR = "addf_rr", [RF, RF, RF], alt OP_ADDF_RK;
    OP_ADDF_RK = "addf_rk", [RF, RF, KF];
    OP_SUBF_RR = "subf_rr", [RF, RF, RF], alt OP_SUBF_RK;
    OP_SUBF_RK = "subf_rk", [RF, RF, KF];
    OP_SUBF_KR = "subf_kr", [RF, KF, RF];
    OP_MULF_RR = "mulf_rr", [RF, RF, RF], alt OP_MULF_RK;
    OP_MULF_RK = "mulf_rk", [RF, RF, KF];
    OP_DIVF_RR = "divf_rr", [RF, RF, RF], alt OP_DIVF_RK;
    OP_DIVF_RK = "divf_rk", [RF, RF, KF];
    OP_DIVF_KR = "divf_kr", [RF, KF, RF];
    OP_MODF_RR = "modf_rr", [RF, RF, RF], alt OP_MODF_RK;
    OP_MODF_RK = "modf_rk", [RF, RF, KF];
    OP_MODF_KR = "modf_kr", [RF, KF, RF];
    OP_POWF_RR = "powf_rr", [RF, RF, RF], alt OP_POWF_RK;
    OP_POWF_RK = "powf_rk", [RF, RF, KF];
    OP_POWF_KR = "powf_kr", [RF, KF, RF];
    OP_MINF_RR = "minf_rr", [RF, RF, RF], alt OP_MINF_RK;
    OP_MINF_RK = "minf_rk", [RF, RF, KF];
    OP_MAXF_RR = "maxf_rr", [RF, RF, RF], alt OP_MAXF_RK;
    OP_MAXF_RK = "maxf_rk", [RF, RF, KF];
    OP_ATAN2 = "atan2", [RF, RF, RF];
    OP_FLOP = "flop", [RF, RF, UI];

    // Float comparisons
    OP_EQF_R = "eqf_r", [CMP, RF, RF], alt OP_EQF_K, branch "beqf" "bnef";
    OP_EQF_K = "eqf_k", [CMP, RF, KF], branch "beqf" "bnef";
    OP_LTF_RR = "ltf_rr", [CMP, RF, RF], alt OP_LTF_RK, branch "bltf" "bgef";
    OP_LTF_RK = "ltf_rk", [CMP, RF, KF], branch "bltf" "bgef";
    OP_LTF_KR = "ltf_kr", [CMP, KF, RF], branch "bltf" "bgef";
    OP_LEF_RR = "lef_rr", [CMP, RF, RF], alt OP_LEF_RK, branch "blef" "bgtf";
    OP_LEF_RK = "lef_rk", [CMP, RF, KF], branch "blef" "bgtf";
    OP_LEF_KR = "lef_kr", [CMP, KF, RF], branch "blef" "bgtf";

    // Two-component vectors
    OP_NEGV2 = "negv2", [RV2, RV2, NA];
    OP_ADDV2_RR = "addv2_rr", [RV2, RV2, RV2];
    OP_SUBV2_RR = "subv2_rr", [RV2, RV2, RV2];
    OP_DOTV2_RR = "dotv2_rr", [RF, RV2, RV2];
    OP_MULVF2_RR = "mulvf2_rr", [RV2, RV2, RF], alt OP_MULVF2_RK;
    OP_MULVF2_RK = "mulvf2_rk", [RV2, RV2, KF];
    OP_DIVVF2_RR = "divvf2_rr", [RV2, RV2, RF], alt OP_DIVVF2_RK;
    OP_DIVVF2_RK = "divvf2_rk", [RV2, RV2, KF];
    OP_LENV2 = "lenv2", [RF, RV2, NA];
    OP_EQV2_R = "eqv2_r", [CMP, RV2, RV2], branch "beqv2" "bnev2";

    // Three-component vectors
    OP_NEGV3 = "negv3", [RV3, RV3, NA];
    OP_ADDV3_RR = "addv3_rr", [RV3, RV3, RV3];
    OP_SUBV3_RR = "subv3_rr", [RV3, RV3, RV3];
    OP_DOTV3_RR = "dotv3_rr", [RF, RV3, RV3];
    OP_CROSSV_RR = "crossv_rr", [RV3, RV3, RV3];
    OP_MULVF3_RR = "mulvf3_rr", [RV3, RV3, RF], alt OP_MULVF3_RK;
    OP_MULVF3_RK = "mulvf3_rk", [RV3, RV3, KF];
    OP_DIVVF3_RR = "divvf3_rr", [RV3, RV3, RF], alt OP_DIVVF3_RK;
    OP_DIVVF3_RK = "divvf3_rk", [RV3, RV3, KF];
    OP_LENV3 = "lenv3", [RF, RV3, NA];
    OP_EQV3_R = "eqv3_r", [CMP, RV3, RV3], branch "beqv3" "bnev3";

    // Strings
    OP_CONCAT = "concat", [RS, RS, RS];
    OP_LENS = "lens", [RI, RS, NA];
    OP_CMPS = "cmps", [CMP, VAR, VAR];

    // Pointers
    OP_ADDA_RR = "adda_rr", [RP, RP, RI], alt OP_ADDA_RK;
    OP_ADDA_RK = "adda_rk", [RP, RP, KI];
    OP_SUBA = "suba", [RI, RP, RP];
    OP_EQA_R = "eqa_r", [CMP, RP, RP], alt OP_EQA_K, branch "beqa" "bnea";
    OP_EQA_K = "eqa_k", [CMP, RP, KP], branch "beqa" "bnea";
}

// ── Register type tags ──────────────────────────────────────────────

pub const REGT_INT: u8 = 0;
pub const REGT_FLOAT: u8 = 1;
pub const REGT_STRING: u8 = 2;
pub const REGT_POINTER: u8 = 3;
pub const REGT_TYPE: u8 = 3;
/// Operand names a constant-pool slot instead of a register.
pub const REGT_KONST: u8 = 4;
pub const REGT_MULTIREG2: u8 = 8;
pub const REGT_MULTIREG3: u8 = 16;
pub const REGT_MULTIREG: u8 = REGT_MULTIREG2 | REGT_MULTIREG3;
/// Pass the address of the register rather than its value.
pub const REGT_ADDROF: u8 = 32;
/// RET without a value.
pub const REGT_NIL: u8 = 128;

/// Set on RET/RETI's A operand for the last return of a function.
pub const RET_FINAL: u8 = 0x80;

// ── Comparison flags ────────────────────────────────────────────────

pub const CMP_CHECK: u8 = 1;
pub const CMP_APPROX: u8 = 2;
pub const CMP_METHOD_MASK: u8 = 0x0C;
pub const CMP_EQ: u8 = 0x00;
pub const CMP_LT: u8 = 0x04;
pub const CMP_LE: u8 = 0x08;
/// CMPS: B names a string constant.
pub const CMP_BK: u8 = 0x20;
/// CMPS: C names a string constant.
pub const CMP_CK: u8 = 0x40;

/// Tolerance of approximate float comparisons.
pub const VM_EPSILON: f64 = 1.0 / 65536.0;

// ── CAST / CASTB kinds ──────────────────────────────────────────────

pub const CAST_I2F: u8 = 1;
pub const CAST_U2F: u8 = 2;
pub const CAST_F2I: u8 = 3;
pub const CAST_F2U: u8 = 4;
pub const CAST_I2S: u8 = 5;
pub const CAST_U2S: u8 = 6;
pub const CAST_F2S: u8 = 7;
pub const CAST_V22S: u8 = 8;
pub const CAST_V32S: u8 = 9;
pub const CAST_P2S: u8 = 10;
pub const CAST_S2I: u8 = 11;
pub const CAST_S2F: u8 = 12;

/// (kind, name, destination operand, source operand)
pub static CASTS: &[(u8, &str, Operand, Operand)] = &[
    (CAST_I2F, "i2f", RF, RI),
    (CAST_U2F, "u2f", RF, RI),
    (CAST_F2I, "f2i", RI, RF),
    (CAST_F2U, "f2u", RI, RF),
    (CAST_I2S, "i2s", RS, RI),
    (CAST_U2S, "u2s", RS, RI),
    (CAST_F2S, "f2s", RS, RF),
    (CAST_V22S, "v22s", RS, RV2),
    (CAST_V32S, "v32s", RS, RV3),
    (CAST_P2S, "p2s", RS, RP),
    (CAST_S2I, "s2i", RI, RS),
    (CAST_S2F, "s2f", RF, RS),
];

pub fn cast_info(kind: u8) -> Option<(&'static str, Operand, Operand)> {
    CASTS.iter().find(|c| c.0 == kind).map(|c| (c.1, c.2, c.3))
}

pub const CASTB_I: u8 = 0;
pub const CASTB_F: u8 = 1;
pub const CASTB_A: u8 = 2;
pub const CASTB_S: u8 = 3;

/// Source operand kind of a CASTB.
pub fn castb_source(kind: u8) -> Option<Operand> {
    match kind {
        CASTB_I => Some(RI),
        CASTB_F => Some(RF),
        CASTB_A => Some(RP),
        CASTB_S => Some(RS),
        _ => None,
    }
}

// ── FLOP functions ──────────────────────────────────────────────────

pub const FLOP_ABS: u8 = 0;
pub const FLOP_NEG: u8 = 1;
pub const FLOP_EXP: u8 = 2;
pub const FLOP_LOG: u8 = 3;
pub const FLOP_LOG10: u8 = 4;
pub const FLOP_SQRT: u8 = 5;
pub const FLOP_CEIL: u8 = 6;
pub const FLOP_FLOOR: u8 = 7;
pub const FLOP_ACOS: u8 = 8;
pub const FLOP_ASIN: u8 = 9;
pub const FLOP_ATAN: u8 = 10;
pub const FLOP_COS: u8 = 11;
pub const FLOP_SIN: u8 = 12;
pub const FLOP_TAN: u8 = 13;
pub const FLOP_ACOS_DEG: u8 = 14;
pub const FLOP_ASIN_DEG: u8 = 15;
pub const FLOP_ATAN_DEG: u8 = 16;
pub const FLOP_COS_DEG: u8 = 17;
pub const FLOP_SIN_DEG: u8 = 18;
pub const FLOP_TAN_DEG: u8 = 19;
pub const FLOP_COSH: u8 = 20;
pub const FLOP_SINH: u8 = 21;
pub const FLOP_TANH: u8 = 22;
pub const FLOP_ROUND: u8 = 23;

pub static FLOP_NAMES: [&str; 24] = [
    "abs", "neg", "exp", "log", "log10", "sqrt", "ceil", "floor", "acos", "asin", "atan", "cos",
    "sin", "tan", "acos_deg", "asin_deg", "atan_deg", "cos_deg", "sin_deg", "tan_deg", "cosh",
    "sinh", "tanh", "round",
];

/// The FLOP table. Shared by the interpreter and the JIT helper so both
/// produce bit-identical results.
pub fn flop(code: u8, x: f64) -> f64 {
    match code {
        FLOP_ABS => x.abs(),
        FLOP_NEG => -x,
        FLOP_EXP => x.exp(),
        FLOP_LOG => x.ln(),
        FLOP_LOG10 => x.log10(),
        FLOP_SQRT => x.sqrt(),
        FLOP_CEIL => x.ceil(),
        FLOP_FLOOR => x.floor(),
        FLOP_ACOS => x.acos(),
        FLOP_ASIN => x.asin(),
        FLOP_ATAN => x.atan(),
        FLOP_COS => x.cos(),
        FLOP_SIN => x.sin(),
        FLOP_TAN => x.tan(),
        FLOP_ACOS_DEG => x.acos().to_degrees(),
        FLOP_ASIN_DEG => x.asin().to_degrees(),
        FLOP_ATAN_DEG => x.atan().to_degrees(),
        FLOP_COS_DEG => x.to_radians().cos(),
        FLOP_SIN_DEG => x.to_radians().sin(),
        FLOP_TAN_DEG => x.to_radians().tan(),
        FLOP_COSH => x.cosh(),
        FLOP_SINH => x.sinh(),
        FLOP_TANH => x.tanh(),
        FLOP_ROUND => x.round(),
        _ => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_accessors_use_explicit_bits() {
        let op = Op::abc(OP_ADD_RR, 1, 2, 3);
        assert_eq!(op.opcode(), OP_ADD_RR);
        assert_eq!((op.a(), op.b(), op.c()), (1, 2, 3));
        assert_eq!(op.bc(), 0x0203);
    }

    #[test]
    fn joined_fields_sign_extend() {
        let op = Op::abx(OP_LI, 4, (-2i16) as u16);
        assert_eq!(op.a(), 4);
        assert_eq!(op.sbc(), -2);
        let jmp = Op::i24(OP_JMP, -5);
        assert_eq!(jmp.signed_immediate24(), -5);
        assert_eq!(jmp.opcode(), OP_JMP);
        assert_eq!(Op::i24(OP_JMP, 0x7F_FFFF).signed_immediate24(), 0x7F_FFFF);
    }

    #[test]
    fn jump_target_is_relative_to_next_instruction() {
        assert_eq!(Op::i24(OP_JMP, 3).jump_target(10), 14);
        assert_eq!(Op::i24(OP_JMP, -11).jump_target(10), 0);
    }

    #[test]
    fn table_is_consistent() {
        assert!(OP_COUNT <= 256);
        for (i, info) in OP_INFO.iter().enumerate() {
            assert_eq!(lookup(info.name), Some(i as u8), "duplicate name {}", info.name);
            if let Some(alt) = info.alt {
                let alt_info = &OP_INFO[alt as usize];
                assert_eq!(alt_info.mode.a, info.mode.a, "{} alt changes A", info.name);
            }
            if info.branch.is_some() {
                assert!(info.is_compare(), "{} has branch names but no flags", info.name);
            }
        }
    }

    #[test]
    fn alternate_forms_take_constants() {
        assert_eq!(OP_INFO[OP_ADD_RR as usize].alt, Some(OP_ADD_RK));
        assert_eq!(OP_INFO[OP_ADD_RK as usize].mode.c, Operand::IntKonst);
        assert_eq!(OP_INFO[OP_LW_R as usize].alt, Some(OP_LW));
        assert_eq!(OP_INFO[OP_SLL_RI as usize].mode.c, Operand::UImm);
    }

    #[test]
    fn flop_degrees() {
        assert!((flop(FLOP_SIN_DEG, 90.0) - 1.0).abs() < 1e-12);
        assert_eq!(flop(FLOP_NEG, 2.0), -2.0);
        assert!(flop(200, 1.0).is_nan());
    }
}
