//! Closure and upvalue behavior: capture, sharing, closing on scope exit.

mod common;

use common::assert_prints;

#[test]
fn test_counter_closure() {
    assert_prints(
        "func make() { var i = 0; func inc() { i = i + 1; return i; } return inc; } \
         var f = make(); print f(); print f(); print f();",
        &["1", "2", "3"],
    );
}

#[test]
fn test_two_closures_share_one_upvalue() {
    assert_prints(
        "func make() { \
             var i = 0; \
             func inc() { i = i + 1; return i; } \
             func get() { return i; } \
             return [inc, get]; \
         } \
         var fs = make(); fs[0](); fs[0](); print fs[1]();",
        &["2"],
    );
}

#[test]
fn test_separate_instances_do_not_share() {
    assert_prints(
        "func make() { var i = 0; func inc() { i = i + 1; return i; } return inc; } \
         var a = make(); var b = make(); a(); a(); print a(); print b();",
        &["3", "1"],
    );
}

#[test]
fn test_capture_of_enclosing_parameter() {
    assert_prints(
        "func adder(n) { return func(x) { return x + n; }; } \
         var add2 = adder(2); print add2(40);",
        &["42"],
    );
}

#[test]
fn test_closure_over_block_local() {
    // The block's locals are closed when the block's scope ends, while the
    // block still evaluates to its last statement's value.
    assert_prints(
        "var f = { var captured = 10; func get() { return captured; } get }; print f();",
        &["10"],
    );
}

#[test]
fn test_capture_of_loop_variable() {
    assert_prints(
        "var fs = []; \
         for x in [1, 2, 3] { fs.append(func() { return x; }); } \
         print fs[0]() + fs[1]() + fs[2]();",
        &["9"],
    );
}

#[test]
fn test_write_through_upvalue_before_close() {
    assert_prints(
        "func outer() { \
             var x = 1; \
             func set() { x = 2; } \
             set(); \
             return x; \
         } \
         print outer();",
        &["2"],
    );
}

#[test]
fn test_nested_capture_through_two_levels() {
    assert_prints(
        "func a() { \
             var value = 7; \
             func b() { func c() { return value; } return c; } \
             return b(); \
         } \
         print a()();",
        &["7"],
    );
}
