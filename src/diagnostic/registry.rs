/// An entry in the error code registry.
pub struct ErrorEntry {
    pub code: &'static str,
    /// One-line description for listings.
    pub short: &'static str,
    /// Full explanation printed by `zvm explain`.
    pub long: &'static str,
}

/// Every stable code the assembler, verifier and runtime report.
pub static REGISTRY: &[ErrorEntry] = &[
    // ── Runtime aborts ──────────────────────────────────────────────────
    ErrorEntry {
        code: "ZVM-A000",
        short: "script aborted",
        long: r#"## ZVM-A000: script aborted

Execution stopped for a reason that has no dedicated code: a `throw`
with reason 0, a native that refused its arguments, a call to an abstract
or undefined function, a scope violation between ui and play code, or a
call nested deeper than `max_call_depth`.

The message names the cause. The notes list the stack trace, innermost
activation first.
"#,
    },
    ErrorEntry {
        code: "ZVM-A001",
        short: "read through a null pointer",
        long: r#"## ZVM-A001: read through a null pointer

A load instruction (`lb`, `lw`, `ldp`, `ls`, `lp`, `lv3`, ...) used a base
pointer register holding zero. No register was written.

**Example:**

    lkp a0, @null
    lw  d0, a0, 8       ; aborts here

Check the pointer with `beqa a0, @null, skip` before dereferencing it.
"#,
    },
    ErrorEntry {
        code: "ZVM-A002",
        short: "write through a null pointer",
        long: r#"## ZVM-A002: write through a null pointer

A store instruction (`sb`, `sw`, `sdp`, `ss`, `sp`, `sv3`, ...) used a base
pointer register holding zero. Memory was left untouched.
"#,
    },
    ErrorEntry {
        code: "ZVM-A003",
        short: "too many retries",
        long: r#"## ZVM-A003: too many retries

Reserved for hosts that retry script operations. Raised only by `throw 3`
or by natives that choose this reason.
"#,
    },
    ErrorEntry {
        code: "ZVM-A004",
        short: "array index out of bounds",
        long: r#"## ZVM-A004: array index out of bounds

A `bound`, `bound_k` or `bound_r` check failed. The index is compared as
an unsigned number, so negative indices fail too. The message reports the
largest valid index and the index that was used.

**Example:**

    li    d0, 5
    bound d0, 3         ; Max.index = 2, current index = 5
"#,
    },
    ErrorEntry {
        code: "ZVM-A005",
        short: "division by zero",
        long: r#"## ZVM-A005: division by zero

An integer `div`, `divu`, `mod` or `modu` instruction had a zero divisor,
from a register or a constant. The destination register keeps its old
value. Float division follows IEEE rules and never aborts.
"#,
    },
    ErrorEntry {
        code: "ZVM-A006",
        short: "invalid self pointer",
        long: r#"## ZVM-A006: invalid self pointer

A method or action was called with a null first argument. Functions
declared `method` or `action` receive `self` in their first pointer
parameter, and it must not be null.
"#,
    },
    ErrorEntry {
        code: "ZVM-A007",
        short: "string format failed",
        long: r#"## ZVM-A007: string format failed

A formatting native could not build its result. Raised by natives or by
`throw 7`.
"#,
    },

    // ── Assembler ───────────────────────────────────────────────────────
    ErrorEntry {
        code: "ZVM-S001",
        short: "unexpected character",
        long: r#"## ZVM-S001: unexpected character

The assembly text contains a character that starts no token, or a string
literal with an unknown escape.

**Example:**

    li d0, $3           ; `$` is not an operand prefix

Constants use `#`, function references use `@`, address-of uses `&`.
"#,
    },
    ErrorEntry {
        code: "ZVM-S002",
        short: "syntax error",
        long: r#"## ZVM-S002: syntax error

A line does not have the expected shape: an unknown directive, an
instruction outside `.func` ... `.end`, a nested `.func`, a missing
`.end`, or a malformed function header.

**Header shape:**

    .func name args d f returns d file "x.zs" method side play
"#,
    },
    ErrorEntry {
        code: "ZVM-S003",
        short: "unknown instruction",
        long: r#"## ZVM-S003: unknown instruction

The mnemonic names no opcode and no branch pseudo-instruction. Opcode
names are lowercase with a form suffix: `add_rr`, `add_rk`, `add_ri`.
Branches are written `beq`, `blt`, `bgef`, `bnea`, `beqs` and so on.
`zvm disasm` prints the mnemonics of existing code.
"#,
    },
    ErrorEntry {
        code: "ZVM-S004",
        short: "operands do not fit the instruction",
        long: r#"## ZVM-S004: operands do not fit the instruction

An operand has the wrong register bank, the wrong vector width, or an
immediate outside its range. When the last operand of a register form is
a constant, the assembler switches to the constant form (`add_rr` with
`#1000` becomes `add_rk`); other mismatches are errors.

**Example:**

    add_ri d0, d0, 300  ; add_ri takes a signed 8-bit immediate

**Fix:**

    add_rr d0, d0, #300
"#,
    },
    ErrorEntry {
        code: "ZVM-S005",
        short: "undefined name",
        long: r#"## ZVM-S005: undefined name

A jump names a label that does not exist in the function, `@name` refers
to a function that is neither declared with `.func` nor imported with
`.native`, or `.native` names a native the host did not register.
"#,
    },
    ErrorEntry {
        code: "ZVM-S006",
        short: "duplicate definition",
        long: r#"## ZVM-S006: duplicate definition

A function, native import or label is defined twice. Labels are local to
their function; function names share one namespace with natives.
"#,
    },
    ErrorEntry {
        code: "ZVM-S007",
        short: "encoding limit exceeded",
        long: r#"## ZVM-S007: encoding limit exceeded

The instruction cannot be encoded: a constant index above 255 in an
8-bit operand, a jump farther than 24 bits, more than 256 registers in a
bank, or a full constant pool.

Load large constants into a register with `lk` and use the register form.
"#,
    },

    // ── Verifier ────────────────────────────────────────────────────────
    ErrorEntry {
        code: "ZVM-V001",
        short: "bytecode rejected by the verifier",
        long: r#"## ZVM-V001: bytecode rejected by the verifier

Every function body is checked before it is published. The verifier
rejects out-of-range registers and constants, comparisons not followed
by `jmp`, jumps outside the code, calls without their `result` list,
unknown casts, and bodies whose last instruction can fall through.

**Example:**

    .func f
        li d0, 1        ; control can fall off the end
    .end

**Fix:** end every path with `ret ..., final`, `ret void`, `jmp` or `throw`.
"#,
    },
];

/// Look up an entry by code (e.g. `"ZVM-A005"`). Case-insensitive.
pub fn lookup(code: &str) -> Option<&'static ErrorEntry> {
    REGISTRY.iter().find(|e| e.code.eq_ignore_ascii_case(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::codes;
    use crate::vm::abort::AbortReason;

    #[test]
    fn lookup_known_code() {
        let e = lookup("zvm-a005").expect("ZVM-A005 should be in registry");
        assert_eq!(e.code, "ZVM-A005");
        assert!(e.long.contains("ZVM-A005"));
    }

    #[test]
    fn lookup_unknown_returns_none() {
        assert!(lookup("ZVM-X999").is_none());
        assert!(lookup("").is_none());
    }

    #[test]
    fn every_reported_code_is_registered() {
        for reason in AbortReason::ALL {
            assert!(lookup(reason.diagnostic_code()).is_some(), "{reason:?}");
        }
        for code in [
            codes::LEX,
            codes::SYNTAX,
            codes::UNKNOWN_INSTRUCTION,
            codes::OPERAND,
            codes::UNDEFINED,
            codes::DUPLICATE,
            codes::ENCODING,
            codes::VERIFY,
        ] {
            assert!(lookup(code).is_some(), "{code}");
        }
    }

    #[test]
    fn all_codes_unique_with_content() {
        let mut seen: Vec<&str> = REGISTRY.iter().map(|e| e.code).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), REGISTRY.len(), "duplicate codes in registry");
        for entry in REGISTRY {
            assert!(!entry.short.is_empty(), "{} missing short description", entry.code);
            assert!(entry.long.starts_with(&format!("## {}", entry.code)), "{}", entry.code);
        }
    }
}
