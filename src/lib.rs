//! zvm: a register bytecode VM for game scripts, with a text assembler,
//! a verifier, a portable interpreter and an optional Cranelift JIT.

pub mod asm;
pub mod diagnostic;
pub mod host;
pub mod logging;
pub mod vm;

pub use asm::{AsmError, Module, assemble};
pub use vm::abort::{Abort, AbortReason};
pub use vm::function::Function;
pub use vm::value::Value;
pub use vm::{Vm, VmConfig};
