//! Runtime error paths: every failure should report and leave the VM in a
//! reusable state.

mod common;

use common::{assert_runtime_error, run, SharedOutput};
use craven_runtime::{InterpretResult, Vm};

#[test]
fn test_undefined_variable() {
    assert_runtime_error("print missing;");
    assert_runtime_error("missing = 1;");
}

#[test]
fn test_calling_non_callables() {
    assert_runtime_error("1();");
    assert_runtime_error("\"text\"();");
    assert_runtime_error("nil();");
    assert_runtime_error("[1]();");
}

#[test]
fn test_arity_mismatch() {
    assert_runtime_error("func f(a) { return a; } f();");
    assert_runtime_error("func f() { return 1; } f(1, 2);");
    assert_runtime_error("\"abc\".length(1);");
}

#[test]
fn test_operand_type_errors() {
    assert_runtime_error("print 1 + \"a\";");
    assert_runtime_error("print \"a\" + 1;");
    assert_runtime_error("print true + true;");
    assert_runtime_error("print -\"a\";");
    assert_runtime_error("print 1 < \"a\";");
}

#[test]
fn test_indexing_errors() {
    assert_runtime_error("var l = [1]; l[5];");
    assert_runtime_error("var l = [1]; l[-1];");
    assert_runtime_error("var l = [1]; l[0.5];");
    assert_runtime_error("var l = [1]; l[\"k\"];");
    assert_runtime_error("5[0];");
    assert_runtime_error("\"abc\"[10];");
}

#[test]
fn test_unhashable_dict_key() {
    assert_runtime_error("var d = dict {}; d[[1]] = 2;");
    assert_runtime_error("var d = dict { [1] => 2 };");
}

#[test]
fn test_properties_on_primitives() {
    assert_runtime_error("true.length;");
    assert_runtime_error("(1).anything();");
}

#[test]
fn test_unknown_builtin_member() {
    assert_runtime_error("\"abc\".missing();");
    assert_runtime_error("[1].missing;");
}

#[test]
fn test_stack_overflow_on_runaway_recursion() {
    assert_runtime_error("func f() { return f(); } f();");
}

#[test]
fn test_unwrap_none() {
    let (result, output) = run("none.unwrap();");
    assert_eq!(result, InterpretResult::RuntimeError);
    // Nothing was printed before the failure.
    assert_eq!(output, "");
}

#[test]
fn test_output_stops_at_the_error() {
    let (result, output) = run("print 1; missing; print 2;");
    assert_eq!(result, InterpretResult::RuntimeError);
    assert_eq!(output, "1\n");
}

#[test]
fn test_vm_survives_a_runtime_error() {
    let output = SharedOutput::default();
    let mut vm = Vm::with_options(Default::default(), Box::new(output.clone()));
    assert_eq!(vm.interpret("missing;"), InterpretResult::RuntimeError);
    assert_eq!(vm.interpret("print 7;"), InterpretResult::Ok);
    assert_eq!(output.contents(), "7\n");
}

#[test]
fn test_vm_survives_a_compile_error() {
    let output = SharedOutput::default();
    let mut vm = Vm::with_options(Default::default(), Box::new(output.clone()));
    assert_eq!(vm.interpret("var = ;"), InterpretResult::CompileError);
    assert_eq!(vm.interpret("print 8;"), InterpretResult::Ok);
    assert_eq!(output.contents(), "8\n");
}
