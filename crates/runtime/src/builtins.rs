//! Native builtins
//!
//! Natives follow one calling convention: `(vm, arg_count, args_base) ->
//! bool`, where `args_base` indexes the first argument on the VM stack and
//! the receiver (for member natives) sits at `args_base - 1`. On success
//! the native leaves exactly one result on top; on failure it reports a
//! runtime error and returns `false`.
//!
//! Installed at startup: the `clock` and `import` globals, and the member
//! tables consulted by property lookup on strings, lists, dicts and
//! options.

use std::time::{SystemTime, UNIX_EPOCH};

use craven_core::object::{
    ObjClass, ObjClosure, ObjInstance, ObjKind, ObjList, ObjNative, ObjRef,
};
use craven_core::table::Table;
use craven_core::value::Value;

use crate::vm::{InterpretResult, Vm};

/// Native callback signature: argument count and stack index of the first
/// argument. One result value is pushed on success.
pub type NativeFn = fn(&mut Vm, usize, usize) -> bool;

/// Per-type method tables for the built-in values.
pub struct Builtins {
    pub string_members: Table,
    pub list_members: Table,
    pub dict_members: Table,
    pub option_members: Table,
}

impl Builtins {
    pub fn new() -> Builtins {
        Builtins {
            string_members: Table::new(),
            list_members: Table::new(),
            dict_members: Table::new(),
            option_members: Table::new(),
        }
    }
}

impl Default for Builtins {
    fn default() -> Self {
        Self::new()
    }
}

enum MemberTable {
    String,
    List,
    Dict,
    Option,
}

/// Register every native with a fresh VM.
pub(crate) fn install(vm: &mut Vm) {
    vm.define_native("clock", clock_native);
    vm.define_native("import", import_native);

    add_member(vm, MemberTable::String, "length", string_length_native);
    add_member(vm, MemberTable::String, "upper", string_upper_native);
    add_member(vm, MemberTable::String, "lower", string_lower_native);
    add_member(vm, MemberTable::String, "contains", string_contains_native);

    add_member(vm, MemberTable::List, "append", list_append_native);
    add_member(vm, MemberTable::List, "length", list_length_native);
    add_member(vm, MemberTable::List, "pop", list_pop_native);
    add_member(vm, MemberTable::List, "contains", list_contains_native);

    add_member(vm, MemberTable::Dict, "length", dict_length_native);
    add_member(vm, MemberTable::Dict, "keys", dict_keys_native);
    add_member(vm, MemberTable::Dict, "values", dict_values_native);
    add_member(vm, MemberTable::Dict, "has", dict_has_native);
    add_member(vm, MemberTable::Dict, "remove", dict_remove_native);

    add_member(vm, MemberTable::Option, "unwrap", option_unwrap_native);
    add_member(vm, MemberTable::Option, "unwrapOr", option_unwrap_or_native);
    add_member(vm, MemberTable::Option, "isSome", option_is_some_native);
    add_member(vm, MemberTable::Option, "isNone", option_is_none_native);
}

fn add_member(vm: &mut Vm, table: MemberTable, name: &str, function: NativeFn) {
    let id = vm.register_native(function);
    let name_ref = vm.intern(name);
    // Shield both objects on the stack while the second allocates; the
    // member tables only become roots once the entry lands.
    vm.push_or_kill(Value::object(name_ref));
    let native = vm.alloc(ObjKind::Native(ObjNative { function: id }));
    vm.push_or_kill(Value::object(native));
    let hash = vm.heap.string(name_ref).hash;
    let members = match table {
        MemberTable::String => &mut vm.builtins.string_members,
        MemberTable::List => &mut vm.builtins.list_members,
        MemberTable::Dict => &mut vm.builtins.dict_members,
        MemberTable::Option => &mut vm.builtins.option_members,
    };
    members.set(Value::object(name_ref), hash, Value::object(native));
    vm.pop();
    vm.pop();
}

/// Verify the exact argument count, reporting like the other runtime
/// arity errors.
fn check_arg_count(vm: &mut Vm, expected: usize, got: usize) -> bool {
    if expected != got {
        let message = format!("{expected} args expected but got {got}.");
        vm.runtime_error(&message);
        return false;
    }
    true
}

fn receiver(vm: &Vm, args_base: usize) -> Value {
    vm.stack[args_base - 1]
}

// =============================================================================
// Globals
// =============================================================================

/// Seconds since the epoch, as a double. Good enough for timing scripts.
fn clock_native(vm: &mut Vm, arg_count: usize, _args_base: usize) -> bool {
    if !check_arg_count(vm, 0, arg_count) {
        return false;
    }
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    vm.push(Value::number(seconds))
}

/// `import(path)`: compile and run the file in a fresh globals scope, then
/// return an instance whose fields are the module's globals. The outer
/// globals ride out the nested run in the reserve slot.
fn import_native(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, 1, arg_count) {
        return false;
    }
    let path_value = vm.stack[args_base];
    if !vm.heap.is_string(path_value) {
        vm.runtime_error("Import path must be a string.");
        return false;
    }
    let path = vm.heap.string_value(path_value).to_string();

    let source = match std::fs::read_to_string(&path) {
        Ok(source) => source,
        Err(_) => {
            let message = format!("Could not open file \"{path}\".");
            vm.runtime_error(&message);
            return false;
        }
    };

    tracing::debug!(path = %path, "importing module");
    let function = match cravenc::compile(&mut vm.heap, &source) {
        Ok(function) => function,
        Err(e) => {
            eprintln!("{e}");
            let message = format!("Could not compile \"{path}\".");
            vm.runtime_error(&message);
            return false;
        }
    };

    // The module sees a fresh globals table seeded with the native
    // globals; the outer table is parked locally, its contents shielded on
    // the VM stack so nested imports each protect their own caller.
    let mut module_globals = Table::new();
    for name in ["clock", "import"] {
        let name_ref = vm.intern(name);
        let hash = vm.heap.string(name_ref).hash;
        if let Some(value) = vm.globals.get(Value::object(name_ref), hash) {
            module_globals.set(Value::object(name_ref), hash, value);
        }
    }
    let saved_globals = std::mem::replace(&mut vm.globals, module_globals);
    let shield = shield_table(vm, &saved_globals);
    if !vm.push(shield) {
        vm.globals = saved_globals;
        return false;
    }

    let ok = run_module(vm, function);

    let module_globals = std::mem::replace(&mut vm.globals, saved_globals);
    if !ok {
        vm.pop();
        return false;
    }

    // The module result: an instance of a synthetic class named after the
    // path, fields copied from the module's globals. The parked module
    // table rides in the reserve slot while these allocate; nothing in
    // this phase re-enters the interpreter, so the slot cannot be
    // clobbered.
    vm.reserve = shield_table(vm, &module_globals);
    let name = vm.intern(&path);
    vm.push_or_kill(Value::object(name));
    let class = vm.alloc(ObjKind::Class(ObjClass {
        name,
        methods: Table::new(),
    }));
    vm.pop();
    vm.push_or_kill(Value::object(class));
    let instance = vm.alloc(ObjKind::Instance(ObjInstance {
        class,
        fields: Table::new(),
    }));
    vm.pop();
    vm.reserve = Value::NIL;

    let fields: Vec<(Value, u32, Value)> = module_globals
        .iter()
        .filter_map(|(key, value)| vm.heap.hash_value(key).map(|hash| (key, hash, value)))
        .collect();
    match &mut vm.heap.get_mut(instance).kind {
        ObjKind::Instance(i) => {
            for (key, hash, value) in fields {
                i.fields.set(key, hash, value);
            }
        }
        _ => unreachable!("instance changed kind"),
    }

    vm.pop(); // the caller-globals shield
    vm.push(Value::object(instance))
}

/// Flatten a parked table's keys and values into a heap list so the
/// collector can see them. Direct heap allocation: no collection runs
/// before the list is referenced from the reserve slot.
fn shield_table(vm: &mut Vm, table: &Table) -> Value {
    let values: Vec<Value> = table.iter().flat_map(|(k, v)| [k, v]).collect();
    let list = vm.heap.alloc(ObjKind::List(ObjList { values }));
    Value::object(list)
}

/// Call the module's script function and run it to completion on this
/// VM's stack (the one reentrant path into the interpreter).
fn run_module(vm: &mut Vm, function: ObjRef) -> bool {
    if !vm.push(Value::object(function)) {
        return false;
    }
    let closure = vm.alloc(ObjKind::Closure(ObjClosure {
        function,
        upvalues: Vec::new(),
    }));
    vm.pop();
    if !vm.push(Value::object(closure)) {
        return false;
    }
    let floor = vm.frames.len();
    if !vm.call_closure(closure, 0) {
        return false;
    }
    vm.run(floor) == InterpretResult::Ok
}

// =============================================================================
// String members
// =============================================================================

fn string_length_native(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, 0, arg_count) {
        return false;
    }
    let length = vm.heap.string(receiver(vm, args_base).as_obj()).len();
    vm.push(Value::number(length as f64))
}

fn string_upper_native(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, 0, arg_count) {
        return false;
    }
    let text = vm
        .heap
        .string(receiver(vm, args_base).as_obj())
        .chars
        .to_uppercase();
    let result = vm.intern(&text);
    vm.push(Value::object(result))
}

fn string_lower_native(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, 0, arg_count) {
        return false;
    }
    let text = vm
        .heap
        .string(receiver(vm, args_base).as_obj())
        .chars
        .to_lowercase();
    let result = vm.intern(&text);
    vm.push(Value::object(result))
}

fn string_contains_native(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, 1, arg_count) {
        return false;
    }
    let needle_value = vm.stack[args_base];
    if !vm.heap.is_string(needle_value) {
        vm.runtime_error("Argument to contains must be a string.");
        return false;
    }
    let haystack = &vm.heap.string(receiver(vm, args_base).as_obj()).chars;
    let needle = &vm.heap.string(needle_value.as_obj()).chars;
    let found = haystack.contains(&**needle);
    vm.push(Value::boolean(found))
}

// =============================================================================
// List members
// =============================================================================

fn list_native_receiver(vm: &Vm, args_base: usize) -> ObjRef {
    receiver(vm, args_base).as_obj()
}

fn list_append_native(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, 1, arg_count) {
        return false;
    }
    let list = list_native_receiver(vm, args_base);
    let value = vm.stack[args_base];
    match &mut vm.heap.get_mut(list).kind {
        ObjKind::List(l) => l.values.push(value),
        _ => unreachable!("expected list receiver"),
    }
    vm.push(value)
}

fn list_length_native(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, 0, arg_count) {
        return false;
    }
    let list = list_native_receiver(vm, args_base);
    let length = match &vm.heap.get(list).kind {
        ObjKind::List(l) => l.values.len(),
        _ => unreachable!("expected list receiver"),
    };
    vm.push(Value::number(length as f64))
}

fn list_pop_native(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, 0, arg_count) {
        return false;
    }
    let list = list_native_receiver(vm, args_base);
    let popped = match &mut vm.heap.get_mut(list).kind {
        ObjKind::List(l) => l.values.pop(),
        _ => unreachable!("expected list receiver"),
    };
    match popped {
        Some(value) => vm.push(value),
        None => {
            vm.runtime_error("Cannot pop from an empty list.");
            false
        }
    }
}

fn list_contains_native(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, 1, arg_count) {
        return false;
    }
    let list = list_native_receiver(vm, args_base);
    let needle = vm.stack[args_base];
    let found = match &vm.heap.get(list).kind {
        ObjKind::List(l) => l.values.iter().any(|v| *v == needle),
        _ => unreachable!("expected list receiver"),
    };
    vm.push(Value::boolean(found))
}

// =============================================================================
// Dict members (the separate iteration path for dicts)
// =============================================================================

fn dict_native_receiver(vm: &Vm, args_base: usize) -> ObjRef {
    receiver(vm, args_base).as_obj()
}

fn dict_length_native(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, 0, arg_count) {
        return false;
    }
    let dict = dict_native_receiver(vm, args_base);
    let length = match &vm.heap.get(dict).kind {
        ObjKind::Dict(d) => d.values.len(),
        _ => unreachable!("expected dict receiver"),
    };
    vm.push(Value::number(length as f64))
}

fn dict_keys_native(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, 0, arg_count) {
        return false;
    }
    let dict = dict_native_receiver(vm, args_base);
    let keys: Vec<Value> = match &vm.heap.get(dict).kind {
        ObjKind::Dict(d) => d.values.iter().map(|(k, _)| k).collect(),
        _ => unreachable!("expected dict receiver"),
    };
    // The keys stay reachable through the receiver during this allocation.
    let list = vm.alloc(ObjKind::List(ObjList { values: keys }));
    vm.push(Value::object(list))
}

fn dict_values_native(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, 0, arg_count) {
        return false;
    }
    let dict = dict_native_receiver(vm, args_base);
    let values: Vec<Value> = match &vm.heap.get(dict).kind {
        ObjKind::Dict(d) => d.values.iter().map(|(_, v)| v).collect(),
        _ => unreachable!("expected dict receiver"),
    };
    let list = vm.alloc(ObjKind::List(ObjList { values }));
    vm.push(Value::object(list))
}

fn dict_has_native(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, 1, arg_count) {
        return false;
    }
    let dict = dict_native_receiver(vm, args_base);
    let key = vm.stack[args_base];
    let Some(hash) = vm.heap.hash_value(key) else {
        vm.fatal_error("Unhashable type.");
        return false;
    };
    let present = match &vm.heap.get(dict).kind {
        ObjKind::Dict(d) => d.values.get(key, hash).is_some(),
        _ => unreachable!("expected dict receiver"),
    };
    vm.push(Value::boolean(present))
}

fn dict_remove_native(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, 1, arg_count) {
        return false;
    }
    let dict = dict_native_receiver(vm, args_base);
    let key = vm.stack[args_base];
    let Some(hash) = vm.heap.hash_value(key) else {
        vm.fatal_error("Unhashable type.");
        return false;
    };
    let removed = match &mut vm.heap.get_mut(dict).kind {
        ObjKind::Dict(d) => d.values.delete(key, hash),
        _ => unreachable!("expected dict receiver"),
    };
    vm.push(Value::boolean(removed))
}

// =============================================================================
// Option members
// =============================================================================

fn option_contents(vm: &Vm, args_base: usize) -> Option<Value> {
    match &vm.heap.get(receiver(vm, args_base).as_obj()).kind {
        ObjKind::Option(o) => o.value,
        _ => unreachable!("expected option receiver"),
    }
}

fn option_unwrap_native(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, 0, arg_count) {
        return false;
    }
    match option_contents(vm, args_base) {
        Some(value) => vm.push(value),
        None => {
            vm.runtime_error("Attempted to unwrap `none`");
            false
        }
    }
}

fn option_unwrap_or_native(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, 1, arg_count) {
        return false;
    }
    let fallback = vm.stack[args_base];
    let value = option_contents(vm, args_base).unwrap_or(fallback);
    vm.push(value)
}

fn option_is_some_native(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, 0, arg_count) {
        return false;
    }
    let is_some = option_contents(vm, args_base).is_some();
    vm.push(Value::boolean(is_some))
}

fn option_is_none_native(vm: &mut Vm, arg_count: usize, args_base: usize) -> bool {
    if !check_arg_count(vm, 0, arg_count) {
        return false;
    }
    let is_none = option_contents(vm, args_base).is_none();
    vm.push(Value::boolean(is_none))
}
