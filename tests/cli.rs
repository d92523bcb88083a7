use std::io::Write;
use std::process::{Command, Output};

use tempfile::NamedTempFile;

fn zvm() -> Command {
    Command::new(env!("CARGO_BIN_EXE_zvm"))
}

fn script(text: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".zasm").tempfile().expect("temp file");
    file.write_all(text.as_bytes()).expect("write script");
    file
}

fn run(file: &NamedTempFile, args: &[&str]) -> Output {
    zvm().arg("run").arg(file.path()).args(args).output().expect("failed to run zvm")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

const MATH: &str = "\
.func scale args d f returns d f
    cast f1, d0, i2f
    mulf_rr f1, f1, f0
    add_ri d0, d0, 1
    ret 0, d0
    ret 1, f1, final
.end
.func greet args s
    param #\"hello\"
    param s0
    call_k @print, 2, 0
    ret void
.end
.func halve args d returns d file \"math.zs\"
.line 4
    div_rk d0, d0, #0
    ret 0, d0, final
.end
.native print
";

// --- run ---

#[test]
fn run_first_function_prints_each_return() {
    let file = script(MATH);
    let out = run(&file, &["4", "2.5"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "5\n10\n");
}

#[test]
fn run_named_function_with_string_arg() {
    let file = script(MATH);
    let out = run(&file, &["--func", "greet", "world"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "hello world\n");
}

#[test]
fn run_negative_args_after_separator() {
    let file = script(MATH);
    let out = run(&file, &["--no-jit", "--", "-3", "-0.5"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "-2\n1.5\n");
}

#[test]
fn run_abort_prints_trace_and_fails() {
    let file = script(MATH);
    let out = run(&file, &["--func", "halve", "8"]);
    assert_eq!(out.status.code(), Some(1));
    let err = stderr(&out);
    assert!(err.contains("error[ZVM-A005]: division by zero."), "{err}");
    assert!(err.contains("note: Called from halve at math.zs, line 4"), "{err}");
    assert!(stdout(&out).is_empty());
}

#[test]
fn run_abort_as_json() {
    let file = script(MATH);
    let out = run(&file, &["--func", "halve", "--json", "8"]);
    assert_eq!(out.status.code(), Some(1));
    let v: serde_json::Value = serde_json::from_str(stderr(&out).trim()).expect("JSON diagnostic");
    assert_eq!(v["code"], "ZVM-A005");
    assert_eq!(v["notes"][0], "Called from halve at math.zs, line 4");
}

#[test]
fn run_reads_config_file() {
    let file = script(MATH);
    let mut config = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    config.write_all(br#"{"jit": false, "max_call_depth": 8}"#).unwrap();
    let out = run(&file, &["--config", config.path().to_str().unwrap(), "1", "1.0"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "2\n1\n");
}

#[test]
fn run_unknown_function_fails() {
    let file = script(MATH);
    let out = run(&file, &["--func", "missing"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("no function named `missing`"));
}

#[test]
fn assembly_error_points_at_source() {
    let file = script(".func f\n    add_ri d0, d0, s1\n    ret void\n.end\n");
    let out = run(&file, &[]);
    assert_eq!(out.status.code(), Some(1));
    let err = stderr(&out);
    assert!(err.contains("error[ZVM-S004]"), "{err}");
    assert!(err.contains("--> 2:"), "{err}");
    assert!(err.contains("add_ri d0, d0, s1"), "{err}");
}

// --- disasm ---

#[test]
fn disasm_lists_every_function() {
    let file = script(MATH);
    let out = zvm().arg("disasm").arg(file.path()).output().unwrap();
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let text = stdout(&out);
    for name in ["scale:", "greet:", "halve:"] {
        assert!(text.contains(name), "{name} missing from\n{text}");
    }
    assert!(text.contains("add_ri"), "{text}");
}

#[test]
fn disasm_single_function() {
    let file = script(MATH);
    let out = zvm().arg("disasm").arg(file.path()).args(["--func", "halve"]).output().unwrap();
    assert!(out.status.success());
    let text = stdout(&out);
    assert!(text.starts_with("halve:\n"), "{text}");
    assert!(!text.contains("scale:"), "{text}");
}

// --- explain ---

#[test]
fn explain_known_code() {
    let out = zvm().args(["explain", "zvm-a005"]).output().unwrap();
    assert!(out.status.success());
    assert!(stdout(&out).starts_with("## ZVM-A005: division by zero"));
}

#[test]
fn explain_unknown_code_fails() {
    let out = zvm().args(["explain", "ZVM-Q999"]).output().unwrap();
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("unknown error code"));
}
