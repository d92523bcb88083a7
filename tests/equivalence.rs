//! The interpreter and the compiled path must agree on every result and on
//! every abort reason.

use zvm::vm::frame::FrameStack;
use zvm::vm::scope::{ClassDescriptor, ObjectHeader, Side};
use zvm::{AbortReason, Module, Value, Vm, VmConfig, assemble};

type Outcome = Result<Vec<Value>, AbortReason>;

struct Pair {
    interp: Vm,
    jit: Vm,
}

impl Pair {
    fn new() -> Self {
        Pair { interp: Vm::new(VmConfig::interpreted()), jit: Vm::default() }
    }

    /// Runs `name` on both engines and returns the shared outcome.
    fn run(&self, module: &Module, name: &str, args: &[Value]) -> Outcome {
        let f = module.get(name).unwrap();
        let a = call(&self.interp, f, args);
        let b = call(&self.jit, f, args);
        if cfg!(feature = "cranelift") {
            assert!(self.jit.is_compiled(f), "{name} was not compiled");
        }
        assert_eq!(a, b, "{name}{args:?}: interpreter vs compiled");
        a
    }
}

fn call(vm: &Vm, f: &zvm::Function, args: &[Value]) -> Outcome {
    let mut stack = vm.new_stack();
    let before = stack.snapshot();
    let out = vm.call_values(&mut stack, f, args).map_err(|e| e.reason);
    assert_eq!(stack.snapshot(), before, "frame stack not restored after {}", f.name);
    out
}

fn int(v: i32) -> Value {
    Value::Int(v)
}

#[test]
fn add_immediate_returns_fifteen() {
    let module = assemble(".func add5 args d d returns d\n    add_ri d0, d1, 5\n    ret 0, d0, final\n.end\n", &[]).unwrap();
    let pair = Pair::new();
    assert_eq!(pair.run(&module, "add5", &[int(0), int(10)]), Ok(vec![int(15)]));
}

#[test]
fn randomized_integer_arithmetic() {
    let src = "\
.func mix args d d returns d d d d
    add_rr d2, d0, d1
    sub_rr d3, d0, d1
    mul_rr d4, d2, d3
    xor_rr d4, d4, d0
    sra_rr d5, d4, d1
    srl_ri d6, d4, 7
    min_rr d7, d0, d1
    max_rk d8, d7, #-12345
    divu_rr d9, d4, d1
    mod_rr d10, d0, d1
    sub_rr d5, d5, d6
    add_rr d5, d5, d8
    ret 0, d5
    ret 1, d9
    ret 2, d10
    ret 3, d4, final
.end
";
    let module = assemble(src, &[]).unwrap();
    let pair = Pair::new();
    let mut rng = fastrand::Rng::with_seed(0x5eed);
    let mut aborted = 0;
    for i in 0..400 {
        let x = rng.i32(..);
        let y = match i % 8 {
            0 => 0,
            1 => -1,
            2 => rng.i32(-4..4),
            _ => rng.i32(..),
        };
        let x = if i % 16 == 1 { i32::MIN } else { x };
        if pair.run(&module, "mix", &[int(x), int(y)]).is_err() {
            aborted += 1;
        }
    }
    assert!(aborted > 0, "zero divisors should have been drawn");
}

#[test]
fn randomized_float_arithmetic() {
    let src = "\
.func poly args f f returns f f d
    mulf_rr f2, f0, f0
    mulf_rr f3, f1, f1
    mulf_rk f3, f3, #3.25
    addf_rr f2, f2, f3
    subf_kr f3, #1.5, f0
    divf_rr f4, f2, f3
    flop f5, f2, sqrt
    cast d0, f5, f2i
    ret 0, f4
    ret 1, f5
    ret 2, d0, final
.end
";
    let module = assemble(src, &[]).unwrap();
    let pair = Pair::new();
    let mut rng = fastrand::Rng::with_seed(42);
    for _ in 0..300 {
        let x = rng.f64() * 200.0 - 100.0;
        let y = rng.f64() * 50.0 - 25.0;
        pair.run(&module, "poly", &[Value::Float(x), Value::Float(y)]).unwrap();
    }
}

#[test]
fn division_by_constant_zero_aborts_on_both_paths() {
    let src = "\
.func by_zero args d d returns d
    li d0, 77
    div_rk d0, d1, #0
    ret 0, d0, final
.end
.func mod_zero args d d returns d
    modu_rr d0, d0, d1
    ret 0, d0, final
.end
";
    let module = assemble(src, &[]).unwrap();
    let pair = Pair::new();
    assert_eq!(pair.run(&module, "by_zero", &[int(1), int(10)]), Err(AbortReason::DivisionByZero));
    assert_eq!(pair.run(&module, "mod_zero", &[int(9), int(0)]), Err(AbortReason::DivisionByZero));
    assert_eq!(pair.run(&module, "mod_zero", &[int(9), int(4)]), Ok(vec![int(1)]));
}

#[test]
fn null_loads_and_stores_abort_before_touching_memory() {
    let loads = [
        "lb d0, a0, 0",
        "lhu d0, a0, 2",
        "lw d0, a0, 4",
        "lw_r d0, a0, d0",
        "lsp f0, a0, 0",
        "ldp f0, a0, 8",
        "ls s0, a0, 0",
        "lp a1, a0, 8",
        "lv2 f0:2, a0, 0",
        "lv3 f0:3, a0, 0",
    ];
    let stores = [
        "sb a0, d0, 0",
        "sh a0, d0, 2",
        "sw a0, d0, 4",
        "sw_r a0, d0, d0",
        "ssp a0, f0, 0",
        "sdp a0, f0, 8",
        "ss a0, s0, 0",
        "sp a0, a1, 8",
        "sv2 a0, f0:2, 0",
        "sv3 a0, f0:3, 0",
    ];
    let pair = Pair::new();
    for (insns, reason) in [(&loads, AbortReason::ReadNil), (&stores, AbortReason::WriteNil)] {
        for insn in insns {
            let src = format!(".func access args a d\n    {insn}\n    ret void\n.end\n");
            let module = assemble(&src, &[]).unwrap();
            assert_eq!(pair.run(&module, "access", &[Value::Pointer(0), int(0)]), Err(reason), "{insn}");
        }
    }
}

#[test]
fn stores_before_a_null_store_are_kept() {
    let src = "\
.func fill args a a d
    sw a0, d0, 0
    sw a1, d0, 0
    sw a0, d0, 4
    ret void
.end
";
    let module = assemble(src, &[]).unwrap();
    for vm in [Vm::new(VmConfig::interpreted()), Vm::default()] {
        let mut cells = [0i32; 2];
        let p = Value::Pointer(cells.as_mut_ptr() as usize);
        let f = module.get("fill").unwrap();
        let err = vm.call_values(&mut vm.new_stack(), f, &[p, Value::Pointer(0), int(-9)]).unwrap_err();
        assert_eq!(err.reason, AbortReason::WriteNil);
        assert_eq!(cells, [-9, 0]);
    }
}

#[test]
fn loads_read_host_memory() {
    let src = "\
.func sum args a returns d f
    lw d0, a0, 0
    lw d1, a0, 4
    add_rr d0, d0, d1
    ldp f0, a0, 8
    ret 0, d0
    ret 1, f0, final
.end
";
    #[repr(C)]
    struct Record {
        a: i32,
        b: i32,
        c: f64,
    }
    let mut rec = Record { a: 40, b: 2, c: 0.5 };
    let p = Value::Pointer(&mut rec as *mut Record as usize);
    let module = assemble(src, &[]).unwrap();
    let pair = Pair::new();
    assert_eq!(pair.run(&module, "sum", &[p]), Ok(vec![int(42), Value::Float(0.5)]));
    assert_eq!((rec.a, rec.b, rec.c), (40, 2, 0.5));
}

/// Branch taken reports 1, fall-through reports 0.
fn branch_fn(name: &str, args: &str, mnemonic: &str, lhs: &str, rhs: &str) -> String {
    format!(
        ".func {name} args {args} returns d\n    {mnemonic} {lhs}, {rhs}, taken\n    reti 0, 0, final\ntaken:\n    reti 0, 1, final\n.end\n"
    )
}

#[test]
fn fused_integer_branches_follow_the_comparison() {
    type Pred = fn(i32, i32) -> bool;
    let table: [(&str, Pred); 10] = [
        ("beq", |x, y| x == y),
        ("bne", |x, y| x != y),
        ("blt", |x, y| x < y),
        ("bge", |x, y| x >= y),
        ("ble", |x, y| x <= y),
        ("bgt", |x, y| x > y),
        ("bltu", |x, y| (x as u32) < (y as u32)),
        ("bgeu", |x, y| (x as u32) >= (y as u32)),
        ("bleu", |x, y| (x as u32) <= (y as u32)),
        ("bgtu", |x, y| (x as u32) > (y as u32)),
    ];
    let values = [i32::MIN, -7, -1, 0, 1, 7, i32::MAX];
    let pair = Pair::new();
    for (mnemonic, pred) in table {
        // Register/register, register/constant, and constant/register where one exists.
        let mut src = branch_fn("rr", "d d", mnemonic, "d0", "d1");
        src += &branch_fn("rk", "d", mnemonic, "d0", "#7");
        let has_kr = !matches!(mnemonic, "beq" | "bne");
        if has_kr {
            src += &branch_fn("kr", "d", mnemonic, "#7", "d0");
        }
        let module = assemble(&src, &[]).unwrap();
        for &x in &values {
            for &y in &values {
                let want = Ok(vec![int(pred(x, y) as i32)]);
                assert_eq!(pair.run(&module, "rr", &[int(x), int(y)]), want, "{mnemonic} {x} {y}");
            }
            let want = Ok(vec![int(pred(x, 7) as i32)]);
            assert_eq!(pair.run(&module, "rk", &[int(x)]), want, "{mnemonic} {x} #7");
            if has_kr {
                let want = Ok(vec![int(pred(7, x) as i32)]);
                assert_eq!(pair.run(&module, "kr", &[int(x)]), want, "{mnemonic} #7 {x}");
            }
        }
    }
}

#[test]
fn fused_float_branches_follow_the_comparison() {
    type Pred = fn(f64, f64) -> bool;
    let table: [(&str, Pred); 6] = [
        ("beqf", |x, y| x == y),
        ("bnef", |x, y| x != y),
        ("bltf", |x, y| x < y),
        ("bgef", |x, y| !(x < y)),
        ("blef", |x, y| x <= y),
        ("bgtf", |x, y| !(x <= y)),
    ];
    let values = [f64::NEG_INFINITY, -2.5, -0.0, 0.0, 1.0, 2.5, f64::NAN];
    let pair = Pair::new();
    for (mnemonic, pred) in table {
        let module = assemble(&branch_fn("ff", "f f", mnemonic, "f0", "f1"), &[]).unwrap();
        for &x in &values {
            for &y in &values {
                let want = Ok(vec![int(pred(x, y) as i32)]);
                let got = pair.run(&module, "ff", &[Value::Float(x), Value::Float(y)]);
                assert_eq!(got, want, "{mnemonic} {x} {y}");
            }
        }
    }
}

#[test]
fn approximate_and_vector_branches_agree() {
    let mut src = branch_fn("near", "f", "beqf~", "f0", "#1.0");
    src += &branch_fn("same2", "v2 v2", "beqv2", "f0:2", "f2:2");
    src += &branch_fn("diff3", "v3 v3", "bnev3", "f0:3", "f3:3");
    src += &branch_fn("ptr", "a a", "beqa", "a0", "a1");
    src += &branch_fn("text", "s", "bnes", "s0", "#\"zvm\"");
    let module = assemble(&src, &[]).unwrap();
    let pair = Pair::new();
    let f = Value::Float;
    assert_eq!(pair.run(&module, "near", &[f(1.0 + 1e-9)]), Ok(vec![int(1)]));
    assert_eq!(pair.run(&module, "near", &[f(1.1)]), Ok(vec![int(0)]));
    assert_eq!(pair.run(&module, "same2", &[f(1.0), f(2.0), f(1.0), f(2.0)]), Ok(vec![int(1)]));
    assert_eq!(pair.run(&module, "same2", &[f(1.0), f(2.0), f(1.0), f(-2.0)]), Ok(vec![int(0)]));
    let v3 = [f(1.0), f(2.0), f(3.0), f(1.0), f(2.0), f(3.5)];
    assert_eq!(pair.run(&module, "diff3", &v3), Ok(vec![int(1)]));
    assert_eq!(pair.run(&module, "ptr", &[Value::Pointer(16), Value::Pointer(16)]), Ok(vec![int(1)]));
    assert_eq!(pair.run(&module, "ptr", &[Value::Pointer(16), Value::Pointer(0)]), Ok(vec![int(0)]));
    assert_eq!(pair.run(&module, "text", &[Value::String("zvm".into())]), Ok(vec![int(0)]));
    assert_eq!(pair.run(&module, "text", &[Value::String("vm".into())]), Ok(vec![int(1)]));
}

#[test]
fn script_calls_agree_and_restore_the_stack() {
    let src = "\
.func fib args d returns d
    blt d0, #2, base
    add_ri d1, d0, -1
    param d1
    call_k @fib, 1, 1
    result d2
    add_ri d1, d0, -2
    param d1
    call_k @fib, 1, 1
    result d3
    add_rr d0, d2, d3
base:
    ret 0, d0, final
.end
";
    let module = assemble(src, &[]).unwrap();
    let pair = Pair::new();
    for (n, want) in [(0, 0), (1, 1), (2, 1), (10, 55), (15, 610)] {
        assert_eq!(pair.run(&module, "fib", &[int(n)]), Ok(vec![int(want)]));
    }

    // Interleaving calls on one stack leaves no residue.
    let vm = Vm::default();
    let mut stack = FrameStack::new();
    let before = stack.snapshot();
    for n in 0..12 {
        vm.call_values(&mut stack, module.get("fib").unwrap(), &[int(n)]).unwrap();
        assert_eq!(stack.snapshot(), before);
    }
}

#[test]
fn callee_returning_extra_values_fills_only_the_requested_results() {
    let src = "\
.func two returns d d
    reti 0, 7
    reti 1, 9, final
.end
.func caller returns d
    call_k @two, 0, 1
    result d0
    ret 0, d0, final
.end
";
    let module = assemble(src, &[]).unwrap();
    assert_eq!(Pair::new().run(&module, "caller", &[]), Ok(vec![int(7)]));
}

// --- scope barrier and virtual dispatch ---

/// A host object of class `class`; both must outlive every call using it.
struct Object {
    _class: Box<ClassDescriptor>,
    header: Box<ObjectHeader>,
}

impl Object {
    fn new(name: &str, side: Side, vtable: Vec<std::sync::Arc<zvm::Function>>) -> Self {
        let class = Box::new(ClassDescriptor { name: name.into(), side, vtable });
        let header = Box::new(ObjectHeader { class: &*class });
        Object { _class: class, header }
    }

    fn value(&self) -> Value {
        Value::Pointer(&*self.header as *const ObjectHeader as usize)
    }
}

const NULL: Value = Value::Pointer(0);

const SCOPED: &str = "\
.func menu side ui
    ret void
.end
.func tick side play
    ret void
.end
.func hook side virtual
    ret void
.end
.func helper
    ret void
.end
.func play_calls_menu args a returns d
    scope a0, play, @menu
    reti 0, 1, final
.end
.func play_calls_tick args a returns d
    scope a0, play, @tick
    reti 0, 1, final
.end
.func ui_calls_tick args a returns d
    scope a0, ui, @tick
    reti 0, 1, final
.end
.func play_calls_hook args a returns d
    scope a0, play, @hook
    reti 0, 1, final
.end
.func ui_calls_helper args a returns d
    scope a0, ui, @helper
    reti 0, 1, final
.end
";

#[test]
fn scope_check_on_null_object_reads_nil() {
    let module = assemble(SCOPED, &[]).unwrap();
    let pair = Pair::new();
    for name in ["play_calls_menu", "play_calls_tick", "play_calls_hook"] {
        assert_eq!(pair.run(&module, name, &[NULL]), Err(AbortReason::ReadNil), "{name}");
    }
}

#[test]
fn scope_barrier_rejects_crossing_between_ui_and_play() {
    let module = assemble(SCOPED, &[]).unwrap();
    let pair = Pair::new();
    let obj = Object::new("Thing", Side::PlainData, vec![]);

    assert_eq!(pair.run(&module, "play_calls_menu", &[obj.value()]), Err(AbortReason::Other));
    assert_eq!(pair.run(&module, "ui_calls_tick", &[obj.value()]), Err(AbortReason::Other));
    assert_eq!(pair.run(&module, "play_calls_tick", &[obj.value()]), Ok(vec![int(1)]));
    assert_eq!(pair.run(&module, "ui_calls_helper", &[obj.value()]), Ok(vec![int(1)]));

    let f = module.get("play_calls_menu").unwrap();
    for vm in [&pair.interp, &pair.jit] {
        let err = vm.call_values(&mut vm.new_stack(), f, &[obj.value()]).unwrap_err();
        assert_eq!(err.to_string(), "Can't call ui function menu from play context");
    }
}

#[test]
fn virtual_scope_takes_the_side_of_the_object_class() {
    let module = assemble(SCOPED, &[]).unwrap();
    let pair = Pair::new();
    let hud = Object::new("Hud", Side::Ui, vec![]);
    let actor = Object::new("Actor", Side::Play, vec![]);
    let data = Object::new("Data", Side::PlainData, vec![]);

    assert_eq!(pair.run(&module, "play_calls_hook", &[hud.value()]), Err(AbortReason::Other));
    assert_eq!(pair.run(&module, "play_calls_hook", &[actor.value()]), Ok(vec![int(1)]));
    assert_eq!(pair.run(&module, "play_calls_hook", &[data.value()]), Ok(vec![int(1)]));

    let f = module.get("play_calls_hook").unwrap();
    let err = pair.jit.call_values(&mut pair.jit.new_stack(), f, &[hud.value()]).unwrap_err();
    assert_eq!(err.to_string(), "Can't call ui function hook from play context");
}

#[test]
fn vtable_calls_dispatch_by_index() {
    let src = "\
.func seven returns d
    reti 0, 7, final
.end
.func eight returns d
    reti 0, 8, final
.end
.func slot1 args a returns d
    vtbl a1, a0, 1
    call a1, 0, 1
    result d0
    ret 0, d0, final
.end
.func slot2 args a returns d
    vtbl a1, a0, 2
    call a1, 0, 1
    result d0
    ret 0, d0, final
.end
";
    let module = assemble(src, &[]).unwrap();
    let pair = Pair::new();
    let vtable = vec![module.get("seven").unwrap().clone(), module.get("eight").unwrap().clone()];
    let obj = Object::new("Counter", Side::PlainData, vtable);

    assert_eq!(pair.run(&module, "slot1", &[obj.value()]), Ok(vec![int(8)]));
    assert_eq!(pair.run(&module, "slot2", &[obj.value()]), Err(AbortReason::Other));
    assert_eq!(pair.run(&module, "slot1", &[NULL]), Err(AbortReason::ReadNil));

    let f = module.get("slot2").unwrap();
    for vm in [&pair.interp, &pair.jit] {
        let err = vm.call_values(&mut vm.new_stack(), f, &[obj.value()]).unwrap_err();
        assert_eq!(err.to_string(), "vtable index 2 out of range for Counter");
    }
}
