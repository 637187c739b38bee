//! Shared harness: run a source buffer on a fresh VM and capture what it
//! prints.

// Not every test binary exercises every helper.
#![allow(dead_code)]

use std::io::Write;
use std::sync::{Arc, Mutex};

use craven_runtime::{InterpretResult, Vm, VmOptions};

/// A `Write` sink tests can keep a handle to after handing it to the VM.
#[derive(Clone, Default)]
pub struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl SharedOutput {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub fn run_with(source: &str, options: VmOptions) -> (InterpretResult, String) {
    let output = SharedOutput::default();
    let mut vm = Vm::with_options(options, Box::new(output.clone()));
    let result = vm.interpret(source);
    (result, output.contents())
}

pub fn run(source: &str) -> (InterpretResult, String) {
    run_with(source, VmOptions::default())
}

/// Interpret and compare the printed lines.
#[track_caller]
pub fn assert_prints(source: &str, expected: &[&str]) {
    let (result, output) = run(source);
    assert_eq!(result, InterpretResult::Ok, "program failed:\n{source}");
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines, expected, "for program:\n{source}");
}

/// Interpret and expect a runtime error.
#[track_caller]
pub fn assert_runtime_error(source: &str) {
    let (result, _) = run(source);
    assert_eq!(
        result,
        InterpretResult::RuntimeError,
        "expected runtime error for:\n{source}"
    );
}
