//! A calls B calls native N: the trace lists N, B, A whichever engine runs
//! each script function.

use std::sync::Arc;

use zvm::vm::value::{ReturnSlot, VmValue};
use zvm::{Abort, AbortReason, Function, Value, Vm, VmConfig, assemble};

fn refuse(params: &[VmValue], _defaults: &[Value], _rets: &mut [ReturnSlot]) -> Result<usize, Abort> {
    let n = params.first().and_then(VmValue::as_int).unwrap_or(0);
    Err(Abort::with_message(AbortReason::ArrayOutOfBounds, format!("refused {n}")))
}

/// `pad` pushes a function past the compile ceiling so it stays interpreted.
fn source(pad_a: bool, pad_b: bool) -> String {
    let pad = |on: bool| if on { "    li d40, 0\n" } else { "" };
    format!(
        "\
.native N
.func A args d returns d file \"trace.zs\"
.line 10
{}    param d0
    call_k @B, 1, 1
    result d1
    ret 0, d1, final
.end
.func B args d returns d file \"trace.zs\"
.line 20
{}    add_ri d0, d0, 1
    param d0
    call_k @N, 1, 0
    ret 0, d0, final
.end
",
        pad(pad_a),
        pad(pad_b)
    )
}

/// Runs one engine mix and returns the trace as rendered text.
fn trace(jit: bool, pad_a: bool, pad_b: bool) -> Vec<String> {
    let natives = vec![Arc::new(Function::native("N", refuse))];
    let module = assemble(&source(pad_a, pad_b), &natives).unwrap();
    let config = VmConfig { jit, jit_max_registers: 16, ..VmConfig::default() };
    let vm = Vm::new(config);
    let mut stack = vm.new_stack();
    let a = module.get("A").unwrap();
    let err = vm.call_values(&mut stack, a, &[Value::Int(4)]).unwrap_err();

    assert_eq!(err.reason, AbortReason::ArrayOutOfBounds);
    assert_eq!(err.message.as_deref(), Some("refused 5"));
    assert_eq!(stack.depth(), 0);
    if cfg!(feature = "cranelift") && jit {
        assert_eq!(vm.is_compiled(a), !pad_a, "A compiled");
        assert_eq!(vm.is_compiled(module.get("B").unwrap()), !pad_b, "B compiled");
    }
    err.stack_trace.iter().map(ToString::to_string).collect()
}

#[test]
fn trace_is_innermost_first_for_every_engine_mix() {
    let expected = vec![
        "Called from N".to_string(),
        "Called from B at trace.zs, line 20".to_string(),
        "Called from A at trace.zs, line 10".to_string(),
    ];
    assert_eq!(trace(false, false, false), expected, "interpreted");
    for (pad_a, pad_b) in [(false, false), (true, false), (false, true), (true, true)] {
        assert_eq!(trace(true, pad_a, pad_b), expected, "compiled A: {}, B: {}", !pad_a, !pad_b);
    }
}

#[test]
fn thrown_abort_carries_the_throwing_function_first() {
    let src = "\
.func outer file \"t.zs\"
.line 3
    call_k @inner, 0, 0
    ret void
.end
.func inner file \"t.zs\"
.line 7
    throw 0, #\"nope\"
.end
";
    let module = assemble(src, &[]).unwrap();
    for config in [VmConfig::interpreted(), VmConfig::default()] {
        let vm = Vm::new(config);
        let err = vm.call_values(&mut vm.new_stack(), module.get("outer").unwrap(), &[]).unwrap_err();
        assert_eq!(err.to_string(), "nope");
        let names: Vec<&str> = err.stack_trace.iter().map(|e| e.function.as_str()).collect();
        assert_eq!(names, ["inner", "outer"]);
        assert_eq!(err.stack_trace[0].line, Some(7));
        assert_eq!(err.stack_trace[1].line, Some(3));
    }
}
