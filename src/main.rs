use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::debug;

use zvm::diagnostic::Diagnostic;
use zvm::diagnostic::ansi::AnsiRenderer;
use zvm::diagnostic::{json, registry};
use zvm::vm::disasm;
use zvm::{Function, Module, Value, Vm, VmConfig, assemble, host, logging};

#[derive(Parser)]
#[command(name = "zvm", version, about = "Assemble and run zvm bytecode")]
struct Cli {
    /// Log compilation outcomes and other VM activity to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assemble a file and call one of its functions.
    Run {
        file: PathBuf,
        /// Function to call (default: the first one declared).
        #[arg(long)]
        func: Option<String>,
        /// Interpret everything.
        #[arg(long)]
        no_jit: bool,
        /// VM settings as JSON.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Print diagnostics as JSON.
        #[arg(long)]
        json: bool,
        /// Arguments, parsed as int, then float, then string.
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print the disassembly of a file's functions.
    Disasm {
        file: PathBuf,
        #[arg(long)]
        func: Option<String>,
    },
    /// Explain an error code such as ZVM-A005.
    Explain { code: String },
}

/// Errors that have already been reported to the user.
struct Reported;

fn report(diag: Diagnostic, as_json: bool) -> Reported {
    if as_json {
        eprintln!("{}", json::render(&diag));
    } else {
        let renderer = AnsiRenderer { use_color: std::io::stderr().is_terminal() };
        eprint!("{}", renderer.render(&diag));
    }
    Reported
}

fn load(path: &Path, as_json: bool) -> Result<Module, Reported> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| report(Diagnostic::error(format!("cannot read {}: {e}", path.display())), as_json))?;
    assemble(&source, &host::natives()).map_err(|e| report(Diagnostic::from(&e).with_source(source.as_str()), as_json))
}

fn pick<'m>(module: &'m Module, name: Option<&str>, as_json: bool) -> Result<&'m Arc<Function>, Reported> {
    let found = match name {
        Some(name) => module.get(name),
        None => module.first(),
    };
    found.ok_or_else(|| {
        let msg = match name {
            Some(name) => format!("no function named `{name}`"),
            None => "the file declares no functions".to_string(),
        };
        report(Diagnostic::error(msg), as_json)
    })
}

fn load_config(path: Option<&Path>, no_jit: bool, as_json: bool) -> Result<VmConfig, Reported> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| report(Diagnostic::error(format!("cannot read {}: {e}", path.display())), as_json))?;
            VmConfig::from_json(&text)
                .map_err(|e| report(Diagnostic::error(format!("bad config {}: {e}", path.display())), as_json))?
        }
        None => VmConfig::default(),
    };
    if no_jit {
        config.jit = false;
    }
    Ok(config)
}

fn run(command: Command) -> Result<(), Reported> {
    match command {
        Command::Run { file, func, no_jit, config, json, args } => {
            let config = load_config(config.as_deref(), no_jit, json)?;
            let module = load(&file, json)?;
            let func = pick(&module, func.as_deref(), json)?;
            let args: Vec<Value> = args.iter().map(|a| Value::parse_arg(a)).collect();
            debug!(function = %func.name, args = args.len(), jit = config.jit, "running");

            let vm = Vm::new(config);
            let mut stack = vm.new_stack();
            let values = vm.call_values(&mut stack, func, &args).map_err(|e| report(Diagnostic::from(&e), json))?;
            for value in values {
                println!("{value}");
            }
            Ok(())
        }
        Command::Disasm { file, func } => {
            let module = load(&file, false)?;
            match func {
                Some(name) => print!("{}", disasm::disassemble(pick(&module, Some(name.as_str()), false)?)),
                None => {
                    for f in module.functions() {
                        print!("{}", disasm::disassemble(f));
                    }
                }
            }
            Ok(())
        }
        Command::Explain { code } => match registry::lookup(&code) {
            Some(entry) => {
                print!("{}", entry.long);
                Ok(())
            }
            None => Err(report(Diagnostic::error(format!("unknown error code `{code}`")), false)),
        },
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.verbose) {
        eprintln!("warning: logging disabled: {e}");
    }
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Reported) => ExitCode::FAILURE,
    }
}
