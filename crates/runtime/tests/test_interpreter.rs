//! End-to-end interpreter behavior: expressions, statements, control flow.

mod common;

use common::{assert_prints, run};
use craven_runtime::InterpretResult;

#[test]
fn test_arithmetic_and_precedence() {
    assert_prints("print 1 + 2;", &["3"]);
    assert_prints("print 1 + 2 * 3;", &["7"]);
    assert_prints("print (1 + 2) * 3;", &["9"]);
    assert_prints("print 10 / 4;", &["2.5"]);
    assert_prints("print -3 + 5;", &["2"]);
    assert_prints("print 2 - 3 - 4;", &["-5"]);
}

#[test]
fn test_comparison_and_equality() {
    assert_prints("print 1 < 2;", &["true"]);
    assert_prints("print 2 <= 2;", &["true"]);
    assert_prints("print 3 > 4;", &["false"]);
    assert_prints("print 3 >= 4;", &["false"]);
    assert_prints("print 1 == 1;", &["true"]);
    assert_prints("print 1 != 1;", &["false"]);
    assert_prints("print \"a\" == \"a\";", &["true"]);
    assert_prints("print \"a\" == \"b\";", &["false"]);
    assert_prints("print 1 == \"1\";", &["false"]);
}

#[test]
fn test_interning_makes_built_strings_equal() {
    assert_prints("print \"he\" + \"llo\" == \"hello\";", &["true"]);
}

#[test]
fn test_logical_operators_yield_operands() {
    assert_prints("print true and 2;", &["2"]);
    assert_prints("print false and 2;", &["false"]);
    assert_prints("print false or 3;", &["3"]);
    assert_prints("print 1 or 2;", &["1"]);
    assert_prints("print not true;", &["false"]);
    assert_prints("print not 0;", &["true"]);
}

#[test]
fn test_falsiness() {
    assert_prints("if 0 { print 1; } else { print 2; }", &["2"]);
    assert_prints("if none { print 1; } else { print 2; }", &["2"]);
    assert_prints("if false { print 1; } else { print 2; }", &["2"]);
    // The empty string and empty collections are truthy.
    assert_prints("if \"\" { print 1; } else { print 2; }", &["1"]);
    assert_prints("if [] { print 1; } else { print 2; }", &["1"]);
}

#[test]
fn test_assignment_yields_assigned_value() {
    assert_prints("var a = 1; var b = a = 3; print b; print a;", &["3", "3"]);
}

#[test]
fn test_globals_persist_across_interprets() {
    let output = common::SharedOutput::default();
    let mut vm =
        craven_runtime::Vm::with_options(Default::default(), Box::new(output.clone()));
    assert_eq!(vm.interpret("var a = 41;"), InterpretResult::Ok);
    assert_eq!(vm.interpret("print a + 1;"), InterpretResult::Ok);
    assert_eq!(output.contents(), "42\n");
}

#[test]
fn test_while_loop() {
    assert_prints("var i = 0; while i < 3 { i = i + 1; } print i;", &["3"]);
    // A loop whose condition is false from the start runs zero times.
    assert_prints("var i = 9; while i < 3 { i = 100; } print i;", &["9"]);
}

#[test]
fn test_if_as_expression() {
    assert_prints("var x = if true { 1 } else { 2 }; print x;", &["1"]);
    assert_prints("var x = if false { 1 } else { 2 }; print x;", &["2"]);
    // Without an else, a failed condition yields nil.
    assert_prints("var x = if false { 1 }; print x;", &["nil"]);
}

#[test]
fn test_block_expressions() {
    assert_prints("print { 1; 2; 3 };", &["3"]);
    assert_prints("var x = { var y = 2; y * 3 }; print x;", &["6"]);
    // An empty block yields nil.
    assert_prints("print {};", &["nil"]);
}

#[test]
fn test_uninitialized_var_is_nil() {
    assert_prints("var a; print a;", &["nil"]);
}

#[test]
fn test_string_concatenation() {
    assert_prints("print \"foo\" + \"bar\";", &["foobar"]);
    assert_prints("var s = \"a\"; s = s + \"b\"; s = s + \"c\"; print s;", &["abc"]);
}

#[test]
fn test_fibonacci() {
    assert_prints(
        "func fib(n) { if n < 2 { return n; } return fib(n-1) + fib(n-2); } print fib(10);",
        &["55"],
    );
}

#[test]
fn test_anonymous_function() {
    assert_prints("var f = func(x) { return x * 2; }; print f(21);", &["42"]);
}

#[test]
fn test_function_returns_last_value_without_return() {
    assert_prints("func f() { 40 + 2 } print f();", &["42"]);
    assert_prints("func f() {} print f();", &["nil"]);
}

#[test]
fn test_print_formats() {
    assert_prints("print 1.5;", &["1.5"]);
    assert_prints("print true;", &["true"]);
    assert_prints("print \"text\";", &["text"]);
    assert_prints("print [1, \"a\", true];", &["[1, a, true]"]);
    assert_prints("print some(5);", &["some(5)"]);
    assert_prints("print none;", &["none"]);
    assert_prints("func f() {} print f;", &["<func f>"]);
    assert_prints("print clock;", &["<native fn>"]);
}

#[test]
fn test_clock_is_a_number() {
    let (result, output) = run("print clock() > 0;");
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(output, "true\n");
}

#[test]
fn test_compile_error_result() {
    let (result, _) = run("var 1 = 2;");
    assert_eq!(result, InterpretResult::CompileError);
}
