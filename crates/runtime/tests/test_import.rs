//! The `import` hook: compile and run a file, expose its globals as the
//! properties of a module object.

mod common;

use std::io::Write;

use common::{run, SharedOutput};
use craven_runtime::{InterpretResult, Vm};

/// Write a module source to disk and return its (escaped) path literal.
fn write_module(dir: &tempfile::TempDir, name: &str, source: &str) -> String {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).expect("create module file");
    file.write_all(source.as_bytes()).expect("write module file");
    path.display().to_string()
}

fn run_ok(source: &str) -> String {
    let output = SharedOutput::default();
    let mut vm = Vm::with_options(Default::default(), Box::new(output.clone()));
    assert_eq!(vm.interpret(source), InterpretResult::Ok, "program:\n{source}");
    output.contents()
}

#[test]
fn test_import_exposes_module_globals() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_module(&dir, "answers.crv", "var x = 42; var label = \"answer\";");
    let output = run_ok(&format!(
        "var m = import(\"{path}\"); print m.x; print m.label;"
    ));
    assert_eq!(output, "42\nanswer\n");
}

#[test]
fn test_imported_functions_are_callable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_module(&dir, "mathy.crv", "func double(x) { return x * 2; }");
    let output = run_ok(&format!("var m = import(\"{path}\"); print m.double(21);"));
    assert_eq!(output, "42\n");
}

#[test]
fn test_module_side_effects_run_once_at_import() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_module(&dir, "noisy.crv", "print \"loading\";");
    let output = run_ok(&format!("import(\"{path}\"); print \"done\";"));
    assert_eq!(output, "loading\ndone\n");
}

#[test]
fn test_module_globals_do_not_leak_into_importer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_module(&dir, "scoped.crv", "var private = 1;");
    let (result, _) = run(&format!("import(\"{path}\"); print private;"));
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn test_importer_globals_survive_the_import() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_module(&dir, "other.crv", "var y = 2;");
    let output = run_ok(&format!(
        "var mine = 1; var m = import(\"{path}\"); print mine + m.y;"
    ));
    assert_eq!(output, "3\n");
}

#[test]
fn test_modules_can_import() {
    let dir = tempfile::tempdir().expect("tempdir");
    let inner = write_module(&dir, "inner.crv", "var value = 40;");
    let outer = write_module(
        &dir,
        "outer.crv",
        &format!("var m = import(\"{inner}\"); var value = m.value + 2;"),
    );
    let output = run_ok(&format!("print import(\"{outer}\").value;"));
    assert_eq!(output, "42\n");
}

#[test]
fn test_missing_file_is_a_runtime_error() {
    let (result, _) = run("import(\"/no/such/file.crv\");");
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn test_module_compile_error_propagates_as_runtime_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_module(&dir, "broken.crv", "var = ;");
    let (result, _) = run(&format!("import(\"{path}\");"));
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn test_import_path_must_be_a_string() {
    let (result, _) = run("import(42);");
    assert_eq!(result, InterpretResult::RuntimeError);
}
