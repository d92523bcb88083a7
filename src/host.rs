//! Natives the command-line driver registers for scripts.

use std::sync::Arc;

use crate::vm::abort::Abort;
use crate::vm::function::{DirectNative, Function, NativeType};
use crate::vm::value::{ReturnSlot, Value, VmValue};

/// Space-separated rendering of native arguments.
pub fn format_params(params: &[VmValue]) -> String {
    params.iter().map(|p| p.to_owned_value().to_string()).collect::<Vec<_>>().join(" ")
}

fn print(params: &[VmValue], _defaults: &[Value], _rets: &mut [ReturnSlot]) -> Result<usize, Abort> {
    println!("{}", format_params(params));
    Ok(0)
}

/// `assert(cond[, message])`: aborts when `cond` is zero.
fn assert(params: &[VmValue], _defaults: &[Value], _rets: &mut [ReturnSlot]) -> Result<usize, Abort> {
    let cond = params
        .first()
        .and_then(VmValue::as_int)
        .ok_or_else(|| Abort::other("assert: expected an int condition"))?;
    if cond != 0 {
        return Ok(0);
    }
    Err(match params.get(1).and_then(VmValue::as_str) {
        Some(msg) => Abort::other(format!("assertion failed: {msg}")),
        None => Abort::other("assertion failed"),
    })
}

pub extern "C" fn imax_direct(a: i32, b: i32) -> i32 {
    a.max(b)
}

fn imax(params: &[VmValue], _defaults: &[Value], rets: &mut [ReturnSlot]) -> Result<usize, Abort> {
    let (Some(a), Some(b)) = (params.first().and_then(VmValue::as_int), params.get(1).and_then(VmValue::as_int))
    else {
        return Err(Abort::other("imax: expected two ints"));
    };
    match rets.first_mut() {
        Some(slot) => {
            slot.set_int(imax_direct(a, b))?;
            Ok(1)
        }
        None => Ok(0),
    }
}

/// Every host native, ready for `asm::assemble`.
pub fn natives() -> Vec<Arc<Function>> {
    vec![
        Arc::new(Function::native("print", print)),
        Arc::new(Function::native("assert", assert)),
        Arc::new(Function::native_direct(
            "imax",
            imax,
            DirectNative {
                address: imax_direct as usize,
                args: vec![NativeType::Int, NativeType::Int],
                ret: Some(NativeType::Int),
            },
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;
    use crate::vm::abort::AbortReason;
    use crate::vm::{Vm, VmConfig};

    const SRC: &str = "\
.native imax
.native assert
.func biggest args d d returns d
    param d0
    param d1
    call_k @imax, 2, 1
    result d2
    param d2
    param #\"positive\"
    call_k @assert, 2, 0
    ret 0, d2, final
.end
";

    #[test]
    fn formats_mixed_params() {
        let s = String::from("hi");
        let params = [VmValue::int(3), VmValue::float(1.5), VmValue::string(&s)];
        assert_eq!(format_params(&params), "3 1.5 hi");
    }

    #[test]
    fn natives_run_interpreted_and_compiled() {
        let natives = natives();
        let module = assemble(SRC, &natives).unwrap();
        let f = module.get("biggest").unwrap();
        for config in [VmConfig::interpreted(), VmConfig::default()] {
            let vm = Vm::new(config);
            let mut stack = vm.new_stack();
            let out = vm.call_values(&mut stack, f, &[Value::Int(4), Value::Int(9)]).unwrap();
            assert_eq!(out, vec![Value::Int(9)]);
            let err = vm.call_values(&mut stack, f, &[Value::Int(0), Value::Int(0)]).unwrap_err();
            assert_eq!(err.reason, AbortReason::Other);
            assert_eq!(err.message.as_deref(), Some("assertion failed: positive"));
            assert_eq!(err.stack_trace[0].function, "assert");
            assert_eq!(err.stack_trace[1].function, "biggest");
        }
    }
}
