//! Craven CLI
//!
//! Front door for the interpreter: an interactive line-edited REPL when
//! run bare, a file runner when given a script, and a bytecode dumper for
//! poking at what the compiler emits.
//!
//! Exit codes follow the sysexits convention: 64 usage, 65 compile error,
//! 70 runtime error, 74 I/O error.

use std::path::{Path, PathBuf};
use std::process;

use clap::error::ErrorKind;
use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use craven_core::debug::disassemble_chunk;
use craven_core::heap::Heap;
use craven_core::object::{ObjKind, ObjRef};
use craven_runtime::{InterpretResult, Vm, VmOptions};

#[derive(Parser)]
#[command(name = "craven")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Craven interpreter - run .crv scripts or start a REPL", long_about = None)]
struct Cli {
    /// Script to run; starts the REPL when omitted
    script: Option<PathBuf>,

    /// Compile the script and print its bytecode instead of running it
    #[arg(long)]
    dump_bytecode: bool,

    /// Collect garbage on every allocation (for debugging the collector)
    #[arg(long)]
    gc_stress: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e)
            if e.kind() == ErrorKind::DisplayHelp || e.kind() == ErrorKind::DisplayVersion =>
        {
            let _ = e.print();
            return;
        }
        Err(e) => {
            let _ = e.print();
            process::exit(64);
        }
    };

    let options = VmOptions {
        gc_stress: cli.gc_stress,
    };

    match cli.script {
        Some(script) if cli.dump_bytecode => dump_bytecode(&script),
        Some(script) => run_file(&script, options),
        None if cli.dump_bytecode => {
            eprintln!("--dump-bytecode needs a script file");
            process::exit(64);
        }
        None => repl(options),
    }
}

fn read_source(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(_) => {
            eprintln!("Could not open file \"{}\".", path.display());
            process::exit(74);
        }
    }
}

fn run_file(path: &Path, options: VmOptions) {
    let source = read_source(path);
    let mut vm = Vm::with_options(options, Box::new(std::io::stdout()));
    match vm.interpret(&source) {
        InterpretResult::Ok => {}
        InterpretResult::CompileError => process::exit(65),
        InterpretResult::RuntimeError => process::exit(70),
    }
}

/// Compile only, then disassemble the script and every function it
/// transitively carries in its constant pools.
fn dump_bytecode(path: &Path) {
    let source = read_source(path);
    let mut heap = Heap::new();
    let script = match cravenc::compile(&mut heap, &source) {
        Ok(script) => script,
        Err(e) => {
            eprintln!("{e}");
            process::exit(65);
        }
    };

    let mut pending = vec![script];
    let mut seen: Vec<ObjRef> = Vec::new();
    while let Some(function) = pending.pop() {
        if seen.contains(&function) {
            continue;
        }
        seen.push(function);
        let (name, chunk) = match &heap.get(function).kind {
            ObjKind::Function(f) => {
                let name = match f.name {
                    Some(name) => heap.string(name).chars.to_string(),
                    None => "<script>".to_string(),
                };
                (name, &f.chunk)
            }
            _ => continue,
        };
        print!("{}", disassemble_chunk(&heap, chunk, &name));
        for constant in &chunk.constants {
            if constant.is_obj()
                && matches!(heap.get(constant.as_obj()).kind, ObjKind::Function(_))
            {
                pending.push(constant.as_obj());
            }
        }
    }
}

fn history_path() -> Option<PathBuf> {
    home::home_dir().map(|dir| dir.join(".craven_history"))
}

/// Read a line, interpret it, loop until EOF. Globals persist across
/// lines; errors leave the session alive.
fn repl(options: VmOptions) {
    let mut vm = Vm::with_options(options, Box::new(std::io::stdout()));
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("Could not start line editor: {e}");
            process::exit(74);
        }
    };

    let history = history_path();
    if let Some(path) = &history {
        let _ = editor.load_history(path);
    }

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                vm.interpret(&line);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Input error: {e}");
                process::exit(74);
            }
        }
    }

    if let Some(path) = &history {
        let _ = editor.save_history(path);
    }
}
