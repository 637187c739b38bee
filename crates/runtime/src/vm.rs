//! The virtual machine
//!
//! A fixed-capacity value stack, a fixed-capacity call-frame array, and one
//! dispatch loop. The VM owns the heap, the globals table, the builtin
//! member tables, the native registry, the open-upvalue list and the
//! collector's trigger points.
//!
//! Runtime errors are reported where they arise (message plus stack trace
//! on stderr) and bubble as `false`/`RuntimeError` outcomes; the `kill`
//! flag is polled once per instruction so helpers without an error channel
//! can abort mid-flight.

use std::io::Write;

use craven_core::chunk::{Chunk, OpCode};
use craven_core::heap::Heap;
use craven_core::object::{ObjClosure, ObjDict, ObjFunction, ObjKind, ObjList, ObjOption, ObjRef};
use craven_core::table::Table;
use craven_core::value::Value;

use crate::builtins::{self, Builtins, NativeFn};

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Outcome of interpreting one source buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VmOptions {
    /// Collect on every allocation instead of waiting for the growth
    /// threshold. Slow, and merciless to liveness bugs.
    pub gc_stress: bool,
}

/// One function invocation: the closure being run, the instruction offset
/// into its chunk, and the base of its stack window. `stack[slots]` is the
/// receiver slot (`this` for methods, the callee for plain calls).
pub(crate) struct CallFrame {
    pub closure: ObjRef,
    pub ip: usize,
    pub slots: usize,
}

pub struct Vm {
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) stack: Vec<Value>,
    pub(crate) globals: Table,
    pub(crate) heap: Heap,
    pub(crate) builtins: Builtins,
    pub(crate) natives: Vec<NativeFn>,
    pub(crate) init_string: ObjRef,
    /// Head of the open-upvalue list, sorted by descending stack slot.
    pub(crate) open_upvalues: Option<ObjRef>,
    /// Shield slot for native helpers with allocations in flight.
    pub(crate) reserve: Value,
    pub(crate) kill: bool,
    pub(crate) stdout: Box<dyn Write>,
}

/// Bail out of the dispatch loop when a helper reports failure.
macro_rules! rt {
    ($cond:expr) => {
        if !$cond {
            return InterpretResult::RuntimeError;
        }
    };
}

macro_rules! binary_op {
    ($self:ident, $wrap:path, $op:tt) => {{
        if !$self.peek(0).is_number() || !$self.peek(1).is_number() {
            $self.runtime_error("Operands must be numbers.");
            return InterpretResult::RuntimeError;
        }
        let b = $self.pop().as_number();
        let a = $self.pop().as_number();
        rt!($self.push($wrap(a $op b)));
    }};
}

impl Vm {
    pub fn new() -> Vm {
        Vm::with_options(VmOptions::default(), Box::new(std::io::stdout()))
    }

    /// Build a VM with explicit options and output sink. Tests hand in a
    /// shared buffer to capture program output.
    pub fn with_options(options: VmOptions, stdout: Box<dyn Write>) -> Vm {
        let mut heap = Heap::new();
        heap.stress = options.gc_stress;
        let init_string = heap.intern("init");

        let mut vm = Vm {
            frames: Vec::with_capacity(FRAMES_MAX),
            stack: Vec::with_capacity(STACK_MAX),
            globals: Table::new(),
            heap,
            builtins: Builtins::new(),
            natives: Vec::new(),
            init_string,
            open_upvalues: None,
            reserve: Value::NIL,
            kill: false,
            stdout,
        };
        builtins::install(&mut vm);
        vm
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Compile and execute one source buffer against this VM's state.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function = match cravenc::compile(&mut self.heap, source) {
            Ok(function) => function,
            Err(e) => {
                eprintln!("{e}");
                return InterpretResult::CompileError;
            }
        };

        self.kill = false;
        if !self.push(Value::object(function)) {
            self.reset_stack();
            return InterpretResult::RuntimeError;
        }
        let closure = self.alloc(ObjKind::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        if !self.push(Value::object(closure)) || !self.call_closure(closure, 0) {
            self.reset_stack();
            return InterpretResult::RuntimeError;
        }

        let result = self.run(0);
        if result == InterpretResult::RuntimeError {
            // Leave the VM usable for the next REPL line.
            self.reset_stack();
        }
        result
    }

    // =========================================================================
    // Stack
    // =========================================================================

    pub(crate) fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        self.reserve = Value::NIL;
    }

    #[must_use]
    pub(crate) fn push(&mut self, value: Value) -> bool {
        if self.stack.len() >= STACK_MAX {
            self.runtime_error("Stack overflow.");
            return false;
        }
        self.stack.push(value);
        true
    }

    /// Push from a context with no error channel; overflow trips the kill
    /// flag and the dispatch loop exits after the current instruction.
    pub(crate) fn push_or_kill(&mut self, value: Value) {
        if !self.push(value) {
            self.kill = true;
        }
    }

    pub(crate) fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(value) => value,
            None => unreachable!("value stack underflow"),
        }
    }

    pub(crate) fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // =========================================================================
    // Errors
    // =========================================================================

    /// Report a runtime error: the message, then one `[line N] in <name>`
    /// frame per live call, innermost first. The caller unwinds by
    /// returning `false` up to the dispatch loop.
    pub(crate) fn runtime_error(&mut self, message: &str) {
        eprintln!("{message}");
        for frame in self.frames.iter().rev() {
            let function = self.frame_function(frame);
            let instruction = frame.ip.saturating_sub(1);
            let line = function.chunk.lines.get(instruction).copied().unwrap_or(0);
            match function.name {
                Some(name) => {
                    eprintln!("[line {line}] in {}()", self.heap.string(name).chars)
                }
                None => eprintln!("[line {line}] in script"),
            }
        }
        eprintln!();
    }

    /// A runtime error from which the current instruction cannot cleanly
    /// unwind; the loop exits at the next kill-flag poll.
    pub(crate) fn fatal_error(&mut self, message: &str) {
        self.runtime_error(message);
        self.kill = true;
    }

    // =========================================================================
    // Allocation (collection trigger points)
    // =========================================================================

    /// Heap allocation from the interpreter: may collect first, so every
    /// transient object the caller still needs must be reachable (on the
    /// stack or in the reserve slot).
    pub(crate) fn alloc(&mut self, kind: ObjKind) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc(kind)
    }

    /// Interning wrapper with the same collection discipline as [`Vm::alloc`].
    pub(crate) fn intern(&mut self, chars: &str) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.intern(chars)
    }

    // =========================================================================
    // Natives
    // =========================================================================

    pub(crate) fn register_native(&mut self, function: NativeFn) -> craven_core::object::NativeId {
        self.natives.push(function);
        craven_core::object::NativeId((self.natives.len() - 1) as u16)
    }

    /// Install a native as a global. Both allocations are shielded on the
    /// stack until the globals table (a root) holds them.
    pub(crate) fn define_native(&mut self, name: &str, function: NativeFn) {
        let id = self.register_native(function);
        let name_ref = self.intern(name);
        self.push_or_kill(Value::object(name_ref));
        let native = self.alloc(ObjKind::Native(craven_core::object::ObjNative {
            function: id,
        }));
        self.push_or_kill(Value::object(native));
        let hash = self.heap.string(name_ref).hash;
        self.globals
            .set(Value::object(name_ref), hash, Value::object(native));
        self.pop();
        self.pop();
    }

    // =========================================================================
    // Frame and chunk access
    // =========================================================================

    pub(crate) fn frame(&self) -> &CallFrame {
        &self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    pub(crate) fn closure_function(&self, closure: ObjRef) -> ObjRef {
        match &self.heap.get(closure).kind {
            ObjKind::Closure(c) => c.function,
            _ => unreachable!("call frame holds a non-closure"),
        }
    }

    pub(crate) fn function(&self, function: ObjRef) -> &ObjFunction {
        match &self.heap.get(function).kind {
            ObjKind::Function(f) => f,
            _ => unreachable!("expected function object"),
        }
    }

    fn frame_function(&self, frame: &CallFrame) -> &ObjFunction {
        self.function(self.closure_function(frame.closure))
    }

    fn chunk(&self) -> &Chunk {
        &self.frame_function(self.frame()).chunk
    }

    fn read_byte(&mut self) -> u8 {
        let byte = self.chunk().code[self.frame().ip];
        self.frame_mut().ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let ip = self.frame().ip;
        let chunk = self.chunk();
        let value = u16::from_be_bytes([chunk.code[ip], chunk.code[ip + 1]]);
        self.frame_mut().ip += 2;
        value
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.chunk().constants[index]
    }

    /// Read a constant known to be an interned string (a name operand).
    fn read_string(&mut self) -> ObjRef {
        self.read_constant().as_obj()
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Execute until the frame count returns to `frame_floor`. Natives that
    /// re-enter the interpreter (`import`) pass the current depth.
    pub(crate) fn run(&mut self, frame_floor: usize) -> InterpretResult {
        loop {
            let op = match OpCode::try_from(self.read_byte()) {
                Ok(op) => op,
                Err(_) => {
                    self.runtime_error("Unknown opcode.");
                    return InterpretResult::RuntimeError;
                }
            };

            match op {
                OpCode::Constant => {
                    let constant = self.read_constant();
                    rt!(self.push(constant));
                }
                OpCode::Nil => rt!(self.push(Value::NIL)),
                OpCode::True => rt!(self.push(Value::TRUE)),
                OpCode::False => rt!(self.push(Value::FALSE)),
                OpCode::Int => {
                    let byte = self.read_byte();
                    rt!(self.push(Value::number(f64::from(byte))));
                }
                OpCode::List => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len() - count;
                    // The elements stay on the stack through the allocation
                    // so a collection here cannot reap them.
                    let values = self.stack[start..].to_vec();
                    let list = self.alloc(ObjKind::List(ObjList { values }));
                    self.stack.truncate(start);
                    rt!(self.push(Value::object(list)));
                }
                OpCode::Dict => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len() - 2 * count;
                    let dict = self.alloc(ObjKind::Dict(ObjDict {
                        values: Table::new(),
                    }));
                    for i in 0..count {
                        let key = self.stack[start + 2 * i];
                        let value = self.stack[start + 2 * i + 1];
                        rt!(self.dict_set(dict, key, value));
                    }
                    self.stack.truncate(start);
                    rt!(self.push(Value::object(dict)));
                }
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().slots + slot];
                    rt!(self.push(value));
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    match self.globals.get(Value::object(name), hash) {
                        Some(value) => rt!(self.push(value)),
                        None => {
                            let message = format!(
                                "Undefined variable '{}'.",
                                self.heap.string(name).chars
                            );
                            self.runtime_error(&message);
                            return InterpretResult::RuntimeError;
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    let value = self.pop();
                    self.globals.set(Value::object(name), hash, value);
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    let value = self.peek(0);
                    if self.globals.set(Value::object(name), hash, value) {
                        // The set created the key: assignment to an
                        // undefined global. Undo and report.
                        self.globals.delete(Value::object(name), hash);
                        let message =
                            format!("Undefined variable '{}'.", self.heap.string(name).chars);
                        self.runtime_error(&message);
                        return InterpretResult::RuntimeError;
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.current_upvalue(slot);
                    let value = self.upvalue_value(upvalue);
                    rt!(self.push(value));
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.current_upvalue(slot);
                    let value = self.peek(0);
                    self.set_upvalue_value(upvalue, value);
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    rt!(self.get_property(self.peek(0), name));
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    rt!(self.set_property(self.peek(1), name, self.peek(0)));
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop();
                    rt!(self.check_class(superclass));
                    rt!(self.bind_method(superclass.as_obj(), name));
                }
                OpCode::GetIndex => {
                    let index = self.pop();
                    let object = self.pop();
                    rt!(self.get_index(object, index));
                }
                OpCode::SetIndex => {
                    let value = self.pop();
                    let index = self.pop();
                    let object = self.pop();
                    rt!(self.set_index(object, index, value));
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    rt!(self.push(Value::boolean(a == b)));
                }
                OpCode::Greater => binary_op!(self, Value::boolean, >),
                OpCode::Less => binary_op!(self, Value::boolean, <),
                OpCode::Add => {
                    if self.heap.is_string(self.peek(0)) && self.heap.is_string(self.peek(1)) {
                        rt!(self.concatenate());
                    } else if self.peek(0).is_number() && self.peek(1).is_number() {
                        let b = self.pop().as_number();
                        let a = self.pop().as_number();
                        rt!(self.push(Value::number(a + b)));
                    } else {
                        self.runtime_error("Operands must be two numbers or two strings.");
                        return InterpretResult::RuntimeError;
                    }
                }
                OpCode::Subtract => binary_op!(self, Value::number, -),
                OpCode::Multiply => binary_op!(self, Value::number, *),
                OpCode::Divide => binary_op!(self, Value::number, /),
                OpCode::Not => {
                    let value = self.pop();
                    let falsey = self.is_falsey(value);
                    rt!(self.push(Value::boolean(falsey)));
                }
                OpCode::Negate => {
                    if !self.peek(0).is_number() {
                        self.runtime_error("Operand must be a number.");
                        return InterpretResult::RuntimeError;
                    }
                    let value = self.pop().as_number();
                    rt!(self.push(Value::number(-value)));
                }
                OpCode::Print => {
                    let text = self.format_value(self.peek(0));
                    let _ = writeln!(self.stdout, "{text}");
                }
                OpCode::Jump => {
                    let offset = self.read_short() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    let condition = self.peek(0);
                    if self.is_falsey(condition) {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::NextJump => {
                    let offset = self.read_short() as usize;
                    let index = self.pop().as_number() as usize;
                    let iter = self.peek(0);
                    let iterable = iter.is_obj()
                        && matches!(
                            self.heap.get(iter.as_obj()).kind,
                            ObjKind::List(_) | ObjKind::String(_)
                        );
                    if !iterable {
                        self.runtime_error("Can only iterate list or string.");
                        return InterpretResult::RuntimeError;
                    }
                    rt!(self.push(Value::number((index + 1) as f64)));
                    if !self.raw_get_index(iter, index) {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short() as usize;
                    self.frame_mut().ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    rt!(self.call_value(self.peek(arg_count), arg_count));
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    rt!(self.invoke(name, arg_count));
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    let superclass = self.pop();
                    rt!(self.check_class(superclass));
                    rt!(self.invoke_from_class(superclass.as_obj(), name, arg_count));
                }
                OpCode::Closure => {
                    let function = self.read_constant().as_obj();
                    let upvalue_count = self.function(function).upvalue_count;
                    let closure = self.alloc(ObjKind::Closure(ObjClosure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    // Rooted before upvalue capture allocates anything.
                    rt!(self.push(Value::object(closure)));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let slot = self.frame().slots + index;
                            self.capture_upvalue(slot)
                        } else {
                            match &self.heap.get(self.frame().closure).kind {
                                ObjKind::Closure(c) => c.upvalues[index],
                                _ => unreachable!("frame closure is not a closure"),
                            }
                        };
                        match &mut self.heap.get_mut(closure).kind {
                            ObjKind::Closure(c) => c.upvalues.push(upvalue),
                            _ => unreachable!("closure changed kind"),
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::PopUnder => {
                    let top = self.pop();
                    self.pop();
                    rt!(self.push(top));
                }
                OpCode::CloseUnder => {
                    let top = self.pop();
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                    rt!(self.push(top));
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame_slots = self.frame().slots;
                    self.close_upvalues(frame_slots);
                    self.frames.pop();
                    self.stack.truncate(frame_slots);
                    if self.frames.len() == frame_floor {
                        return InterpretResult::Ok;
                    }
                    rt!(self.push(result));
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let class = self.alloc(ObjKind::Class(craven_core::object::ObjClass {
                        name,
                        methods: Table::new(),
                    }));
                    rt!(self.push(Value::object(class)));
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    if !self.is_class(superclass) {
                        self.runtime_error("Superclass must be a class.");
                        return InterpretResult::RuntimeError;
                    }
                    let subclass = self.peek(0).as_obj();
                    self.copy_methods(superclass.as_obj(), subclass);
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    self.define_method(name);
                }
                OpCode::Some => {
                    let value = self.peek(0);
                    let option = self.alloc(ObjKind::Option(ObjOption { value: Some(value) }));
                    self.pop();
                    rt!(self.push(Value::object(option)));
                }
                OpCode::None => {
                    let option = self.alloc(ObjKind::Option(ObjOption { value: None }));
                    rt!(self.push(Value::object(option)));
                }
            }

            if self.kill {
                return InterpretResult::RuntimeError;
            }
        }
    }

    fn check_class(&mut self, value: Value) -> bool {
        if self.is_class(value) {
            true
        } else {
            self.runtime_error("Superclass must be a class.");
            false
        }
    }

    fn is_class(&self, value: Value) -> bool {
        self.heap
            .kind_matches(value, |k| matches!(k, ObjKind::Class(_)))
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
