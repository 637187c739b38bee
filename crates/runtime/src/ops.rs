//! Interpreter helpers: calls, property and index access, upvalue
//! machinery, and value formatting
//!
//! Each helper returns `false` after reporting a runtime error; the
//! dispatch loop observes that and exits with `RuntimeError`. Pushes from
//! contexts without an error channel go through `push_or_kill`, which trips
//! the kill flag instead.

use craven_core::object::{
    ObjBoundMethod, ObjBoundNative, ObjKind, ObjRef, ObjUpvalue, UpvalueLocation,
};
use craven_core::value::{format_number, Value};

use crate::vm::{Vm, FRAMES_MAX};

impl Vm {
    // =========================================================================
    // Truthiness and keying
    // =========================================================================

    /// `nil`, `false`, numeric zero, and a `none` option are false;
    /// everything else is true.
    pub(crate) fn is_falsey(&self, value: Value) -> bool {
        if value.is_nil() {
            return true;
        }
        if value.is_bool() {
            return !value.as_bool();
        }
        if value.is_number() {
            return value.as_number() == 0.0;
        }
        if value.is_obj() {
            if let ObjKind::Option(option) = &self.heap.get(value.as_obj()).kind {
                return option.is_none();
            }
        }
        false
    }

    /// Hash a prospective table key. An unhashable key is fatal, the same
    /// way the table layer treats it: report, trip the kill flag, and let
    /// the caller unwind.
    fn key_hash(&mut self, key: Value) -> Option<u32> {
        match self.heap.hash_value(key) {
            Some(hash) => Some(hash),
            None => {
                self.fatal_error("Unhashable type.");
                None
            }
        }
    }

    pub(crate) fn dict_set(&mut self, dict: ObjRef, key: Value, value: Value) -> bool {
        let Some(hash) = self.key_hash(key) else {
            return false;
        };
        match &mut self.heap.get_mut(dict).kind {
            ObjKind::Dict(d) => {
                d.values.set(key, hash, value);
                true
            }
            _ => unreachable!("expected dict object"),
        }
    }

    // =========================================================================
    // Calls
    // =========================================================================

    pub(crate) fn call_closure(&mut self, closure: ObjRef, arg_count: usize) -> bool {
        let arity = self.function(self.closure_function(closure)).arity;
        if arg_count != arity {
            let message = format!("Expected {arity} arguments but got {arg_count}.");
            self.runtime_error(&message);
            return false;
        }

        if self.frames.len() == FRAMES_MAX {
            self.runtime_error("Stack overflow.");
            return false;
        }

        self.frames.push(crate::vm::CallFrame {
            closure,
            ip: 0,
            slots: self.stack.len() - arg_count - 1,
        });
        true
    }

    /// Dispatch a call on any callee kind. The callee sits below its
    /// arguments; `stack[top - arg_count - 1]` is the receiver slot.
    pub(crate) fn call_value(&mut self, callee: Value, arg_count: usize) -> bool {
        if callee.is_obj() {
            match &self.heap.get(callee.as_obj()).kind {
                ObjKind::BoundMethod(bound) => {
                    let receiver = bound.receiver;
                    let method = bound.method;
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = receiver;
                    return self.call_closure(method, arg_count);
                }
                ObjKind::BoundNative(bound) => {
                    let receiver = bound.receiver;
                    let native = bound.method;
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = receiver;
                    return self.call_native(native, arg_count);
                }
                ObjKind::Class(_) => {
                    let class = callee.as_obj();
                    // The class in the receiver slot keeps itself alive
                    // through this allocation, then the instance takes the
                    // slot.
                    let instance = self.alloc(ObjKind::Instance(
                        craven_core::object::ObjInstance {
                            class,
                            fields: craven_core::table::Table::new(),
                        },
                    ));
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = Value::object(instance);

                    let init_hash = self.heap.string(self.init_string).hash;
                    let initializer = match &self.heap.get(class).kind {
                        ObjKind::Class(c) => {
                            c.methods.get(Value::object(self.init_string), init_hash)
                        }
                        _ => unreachable!("class changed kind"),
                    };
                    return match initializer {
                        Some(init) => self.call_closure(init.as_obj(), arg_count),
                        None if arg_count != 0 => {
                            let message =
                                format!("Expected 0 arguments but got {arg_count}.");
                            self.runtime_error(&message);
                            false
                        }
                        None => true,
                    };
                }
                ObjKind::Closure(_) => return self.call_closure(callee.as_obj(), arg_count),
                ObjKind::Native(native) => {
                    let native = native.function;
                    return self.call_native(native, arg_count);
                }
                _ => {}
            }
        }
        self.runtime_error("Can only call functions and classes.");
        false
    }

    /// Run a native callback: it sees `arg_count` and the stack index of
    /// its first argument (receiver at `args_base - 1`), and on success
    /// leaves one result on top. The VM then collapses
    /// `[receiver, args...]` into that result.
    fn call_native(&mut self, native: craven_core::object::NativeId, arg_count: usize) -> bool {
        let function = self.natives[native.0 as usize];
        let args_base = self.stack.len() - arg_count;
        if !function(self, arg_count, args_base) {
            return false;
        }
        let result = self.pop();
        self.stack.truncate(self.stack.len() - arg_count - 1);
        self.push(result)
    }

    /// Fused property-access-and-call on the value at `peek(arg_count)`.
    pub(crate) fn invoke(&mut self, name: ObjRef, arg_count: usize) -> bool {
        let receiver = self.peek(arg_count);
        if !receiver.is_obj() {
            self.runtime_error("Value has no properties.");
            return false;
        }
        match &self.heap.get(receiver.as_obj()).kind {
            ObjKind::Instance(instance) => {
                let class = instance.class;
                let name_hash = self.heap.string(name).hash;
                let field = match &self.heap.get(receiver.as_obj()).kind {
                    ObjKind::Instance(i) => i.fields.get(Value::object(name), name_hash),
                    _ => unreachable!("instance changed kind"),
                };
                if let Some(value) = field {
                    // A callable stored in a field: plain call, no binding.
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = value;
                    return self.call_value(value, arg_count);
                }
                self.invoke_from_class(class, name, arg_count)
            }
            ObjKind::String(_) | ObjKind::List(_) | ObjKind::Dict(_) | ObjKind::Option(_) => {
                match self.member_native(receiver, name) {
                    Some(native) => {
                        let bound = self.alloc(ObjKind::BoundNative(ObjBoundNative {
                            receiver,
                            method: native,
                        }));
                        self.call_value(Value::object(bound), arg_count)
                    }
                    None => {
                        let message =
                            format!("Undefined method '{}'.", self.heap.string(name).chars);
                        self.runtime_error(&message);
                        false
                    }
                }
            }
            _ => {
                self.runtime_error("Value has no properties.");
                false
            }
        }
    }

    pub(crate) fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        arg_count: usize,
    ) -> bool {
        let name_hash = self.heap.string(name).hash;
        let method = match &self.heap.get(class).kind {
            ObjKind::Class(c) => c.methods.get(Value::object(name), name_hash),
            _ => unreachable!("expected class object"),
        };
        match method {
            Some(method) => self.call_closure(method.as_obj(), arg_count),
            None => {
                let message =
                    format!("Undefined property '{}'.", self.heap.string(name).chars);
                self.runtime_error(&message);
                false
            }
        }
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Look `name` up in the builtin member table for the receiver's type.
    fn member_native(&self, receiver: Value, name: ObjRef) -> Option<craven_core::object::NativeId> {
        let table = match &self.heap.get(receiver.as_obj()).kind {
            ObjKind::String(_) => &self.builtins.string_members,
            ObjKind::List(_) => &self.builtins.list_members,
            ObjKind::Dict(_) => &self.builtins.dict_members,
            ObjKind::Option(_) => &self.builtins.option_members,
            _ => return None,
        };
        let name_hash = self.heap.string(name).hash;
        let value = table.get(Value::object(name), name_hash)?;
        match &self.heap.get(value.as_obj()).kind {
            ObjKind::Native(native) => Some(native.function),
            _ => None,
        }
    }

    /// Bind `class`'s method `name` to the receiver on top of the stack,
    /// replacing it.
    pub(crate) fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> bool {
        let name_hash = self.heap.string(name).hash;
        let method = match &self.heap.get(class).kind {
            ObjKind::Class(c) => c.methods.get(Value::object(name), name_hash),
            _ => unreachable!("expected class object"),
        };
        let Some(method) = method else {
            let message = format!("Undefined property '{}'.", self.heap.string(name).chars);
            self.runtime_error(&message);
            return false;
        };

        let bound = self.alloc(ObjKind::BoundMethod(ObjBoundMethod {
            receiver: self.peek(0),
            method: method.as_obj(),
        }));
        self.pop();
        self.push_or_kill(Value::object(bound));
        true
    }

    /// `GET_PROPERTY`: replace the receiver on top of the stack with the
    /// named field, bound method, or bound builtin.
    pub(crate) fn get_property(&mut self, object: Value, name: ObjRef) -> bool {
        if !object.is_obj() {
            self.runtime_error("Value has no properties.");
            return false;
        }
        match &self.heap.get(object.as_obj()).kind {
            ObjKind::Instance(instance) => {
                let class = instance.class;
                let name_hash = self.heap.string(name).hash;
                let field = match &self.heap.get(object.as_obj()).kind {
                    ObjKind::Instance(i) => i.fields.get(Value::object(name), name_hash),
                    _ => unreachable!("instance changed kind"),
                };
                if let Some(value) = field {
                    self.pop();
                    self.push_or_kill(value);
                    return true;
                }
                self.bind_method(class, name)
            }
            ObjKind::String(_) | ObjKind::List(_) | ObjKind::Dict(_) | ObjKind::Option(_) => {
                match self.member_native(object, name) {
                    Some(native) => {
                        let bound = self.alloc(ObjKind::BoundNative(ObjBoundNative {
                            receiver: object,
                            method: native,
                        }));
                        self.pop();
                        self.push_or_kill(Value::object(bound));
                        true
                    }
                    None => {
                        let message =
                            format!("Undefined property '{}'.", self.heap.string(name).chars);
                        self.runtime_error(&message);
                        false
                    }
                }
            }
            _ => {
                self.runtime_error("Value has no properties.");
                false
            }
        }
    }

    /// `SET_PROPERTY`: store into an instance field; the assigned value is
    /// left as the expression result.
    pub(crate) fn set_property(&mut self, object: Value, name: ObjRef, value: Value) -> bool {
        if object.is_obj() {
            if let ObjKind::Instance(_) = &self.heap.get(object.as_obj()).kind {
                let name_hash = self.heap.string(name).hash;
                match &mut self.heap.get_mut(object.as_obj()).kind {
                    ObjKind::Instance(instance) => {
                        instance.fields.set(Value::object(name), name_hash, value);
                    }
                    _ => unreachable!("instance changed kind"),
                }
                self.pop(); // value
                self.pop(); // object
                self.push_or_kill(value);
                return true;
            }
        }
        self.runtime_error("Value has no fields.");
        false
    }

    // =========================================================================
    // Indexing
    // =========================================================================

    pub(crate) fn get_index(&mut self, object: Value, index: Value) -> bool {
        if object.is_obj() {
            match &self.heap.get(object.as_obj()).kind {
                ObjKind::Dict(_) => {
                    let Some(hash) = self.key_hash(index) else {
                        return false;
                    };
                    let value = match &self.heap.get(object.as_obj()).kind {
                        ObjKind::Dict(d) => d.values.get(index, hash),
                        _ => unreachable!("dict changed kind"),
                    };
                    return match value {
                        Some(value) => {
                            self.push_or_kill(value);
                            true
                        }
                        None => {
                            self.runtime_error("Dict key not present.");
                            false
                        }
                    };
                }
                ObjKind::List(list) => {
                    let count = list.values.len();
                    let Some(i) = self.check_list_index(index, count, "List") else {
                        return false;
                    };
                    let value = match &self.heap.get(object.as_obj()).kind {
                        ObjKind::List(l) => l.values[i],
                        _ => unreachable!("list changed kind"),
                    };
                    self.push_or_kill(value);
                    return true;
                }
                ObjKind::String(string) => {
                    let count = string.len();
                    let Some(i) = self.check_list_index(index, count, "String") else {
                        return false;
                    };
                    let byte = self.heap.string(object.as_obj()).chars.as_bytes()[i];
                    let text = String::from_utf8_lossy(&[byte]).into_owned();
                    let interned = self.intern(&text);
                    self.push_or_kill(Value::object(interned));
                    return true;
                }
                _ => {}
            }
        }
        self.runtime_error("Can only index lists and strings.");
        false
    }

    /// Validate a numeric index against `count`; reports with the
    /// container's name on failure.
    fn check_list_index(&mut self, index: Value, count: usize, what: &str) -> Option<usize> {
        if !index.is_number() {
            self.runtime_error(&format!("{what} index must be a number."));
            return None;
        }
        let idx = index.as_number();
        if idx != idx.floor() {
            self.runtime_error(&format!("{what} index must be a whole number."));
            return None;
        }
        if idx < 0.0 || idx >= count as f64 {
            self.runtime_error(&format!("{what} index out of bounds."));
            return None;
        }
        Some(idx as usize)
    }

    /// Silent indexed access for the iterator protocol: pushes the element
    /// and answers `true`, or answers `false` (no error) past the end.
    /// Dicts iterate through their own builtin path, never through this.
    pub(crate) fn raw_get_index(&mut self, object: Value, index: usize) -> bool {
        match &self.heap.get(object.as_obj()).kind {
            ObjKind::List(list) => {
                if index >= list.values.len() {
                    return false;
                }
                let value = list.values[index];
                self.push_or_kill(value);
                true
            }
            ObjKind::String(string) => {
                if index >= string.len() {
                    return false;
                }
                let byte = string.chars.as_bytes()[index];
                let text = String::from_utf8_lossy(&[byte]).into_owned();
                let interned = self.intern(&text);
                self.push_or_kill(Value::object(interned));
                true
            }
            _ => false,
        }
    }

    pub(crate) fn set_index(&mut self, object: Value, index: Value, value: Value) -> bool {
        if object.is_obj() {
            match &self.heap.get(object.as_obj()).kind {
                ObjKind::Dict(_) => {
                    if !self.dict_set(object.as_obj(), index, value) {
                        return false;
                    }
                    self.push_or_kill(value);
                    return true;
                }
                ObjKind::List(list) => {
                    let count = list.values.len();
                    let Some(i) = self.check_list_index(index, count, "List") else {
                        return false;
                    };
                    match &mut self.heap.get_mut(object.as_obj()).kind {
                        ObjKind::List(l) => l.values[i] = value,
                        _ => unreachable!("list changed kind"),
                    }
                    self.push_or_kill(value);
                    return true;
                }
                ObjKind::String(_) => {
                    self.runtime_error("Cannot assign to string indexes.");
                    return false;
                }
                _ => {}
            }
        }
        self.runtime_error("Can only index lists and strings.");
        false
    }

    // =========================================================================
    // Classes
    // =========================================================================

    /// `INHERIT`: copy every method of `superclass` into `subclass`.
    /// Methods the subclass defines afterwards override the copies.
    pub(crate) fn copy_methods(&mut self, superclass: ObjRef, subclass: ObjRef) {
        let methods: Vec<(Value, Value)> = match &self.heap.get(superclass).kind {
            ObjKind::Class(c) => c.methods.iter().collect(),
            _ => unreachable!("expected class object"),
        };
        for (name, method) in methods {
            let hash = self.heap.string(name.as_obj()).hash;
            match &mut self.heap.get_mut(subclass).kind {
                ObjKind::Class(c) => {
                    c.methods.set(name, hash, method);
                }
                _ => unreachable!("expected class object"),
            }
        }
    }

    /// `METHOD`: install the closure on top onto the class below it.
    pub(crate) fn define_method(&mut self, name: ObjRef) {
        let method = self.peek(0);
        let class = self.peek(1).as_obj();
        let hash = self.heap.string(name).hash;
        match &mut self.heap.get_mut(class).kind {
            ObjKind::Class(c) => {
                c.methods.set(Value::object(name), hash, method);
            }
            _ => unreachable!("method target is not a class"),
        }
        self.pop();
    }

    // =========================================================================
    // Upvalues
    // =========================================================================

    pub(crate) fn current_upvalue(&self, slot: usize) -> ObjRef {
        match &self.heap.get(self.frame().closure).kind {
            ObjKind::Closure(c) => c.upvalues[slot],
            _ => unreachable!("frame closure is not a closure"),
        }
    }

    fn upvalue(&self, upvalue: ObjRef) -> &ObjUpvalue {
        match &self.heap.get(upvalue).kind {
            ObjKind::Upvalue(u) => u,
            _ => unreachable!("expected upvalue object"),
        }
    }

    pub(crate) fn upvalue_value(&self, upvalue: ObjRef) -> Value {
        match self.upvalue(upvalue).location {
            UpvalueLocation::Stack(slot) => self.stack[slot],
            UpvalueLocation::Closed(value) => value,
        }
    }

    pub(crate) fn set_upvalue_value(&mut self, upvalue: ObjRef, value: Value) {
        let location = self.upvalue(upvalue).location;
        match location {
            UpvalueLocation::Stack(slot) => self.stack[slot] = value,
            UpvalueLocation::Closed(_) => match &mut self.heap.get_mut(upvalue).kind {
                ObjKind::Upvalue(u) => u.location = UpvalueLocation::Closed(value),
                _ => unreachable!("expected upvalue object"),
            },
        }
    }

    fn open_upvalue_slot(&self, upvalue: ObjRef) -> usize {
        match self.upvalue(upvalue).location {
            UpvalueLocation::Stack(slot) => slot,
            UpvalueLocation::Closed(_) => {
                unreachable!("closed upvalue on the open list")
            }
        }
    }

    /// Find or create the upvalue for a stack slot. The open list is kept
    /// sorted by descending slot so the scan can stop early, and two
    /// closures capturing the same variable share one upvalue.
    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut previous: Option<ObjRef> = None;
        let mut current = self.open_upvalues;
        while let Some(upvalue) = current {
            if self.open_upvalue_slot(upvalue) <= slot {
                break;
            }
            previous = Some(upvalue);
            current = self.upvalue(upvalue).next;
        }

        if let Some(upvalue) = current {
            if self.open_upvalue_slot(upvalue) == slot {
                return upvalue;
            }
        }

        let created = self.alloc(ObjKind::Upvalue(ObjUpvalue {
            location: UpvalueLocation::Stack(slot),
            next: current,
        }));
        match previous {
            Some(previous) => match &mut self.heap.get_mut(previous).kind {
                ObjKind::Upvalue(u) => u.next = Some(created),
                _ => unreachable!("expected upvalue object"),
            },
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Close every open upvalue at or above `last`: copy the stack value
    /// into the upvalue and unlink it from the open list.
    pub(crate) fn close_upvalues(&mut self, last: usize) {
        while let Some(upvalue) = self.open_upvalues {
            let slot = match self.upvalue(upvalue).location {
                UpvalueLocation::Stack(slot) => slot,
                UpvalueLocation::Closed(_) => break,
            };
            if slot < last {
                break;
            }
            let value = self.stack[slot];
            let next = self.upvalue(upvalue).next;
            match &mut self.heap.get_mut(upvalue).kind {
                ObjKind::Upvalue(u) => {
                    u.location = UpvalueLocation::Closed(value);
                    u.next = None;
                }
                _ => unreachable!("expected upvalue object"),
            }
            self.open_upvalues = next;
        }
    }

    // =========================================================================
    // Strings
    // =========================================================================

    /// `ADD` on two strings: build the joined buffer, intern it, replace
    /// the operands. The operands stay on the stack until the result
    /// exists, keeping them safe across a collection.
    pub(crate) fn concatenate(&mut self) -> bool {
        let b = self.peek(0).as_obj();
        let a = self.peek(1).as_obj();
        let mut text = String::with_capacity(
            self.heap.string(a).len() + self.heap.string(b).len(),
        );
        text.push_str(&self.heap.string(a).chars);
        text.push_str(&self.heap.string(b).chars);
        let result = self.intern(&text);
        self.pop();
        self.pop();
        self.push(Value::object(result))
    }

    // =========================================================================
    // Formatting
    // =========================================================================

    /// Render a value the way `print` shows it.
    pub fn format_value(&self, value: Value) -> String {
        if value.is_nil() {
            return "nil".to_string();
        }
        if value.is_bool() {
            return value.as_bool().to_string();
        }
        if value.is_number() {
            return format_number(value.as_number());
        }
        if value.is_empty() {
            return "<empty value>".to_string();
        }
        match &self.heap.get(value.as_obj()).kind {
            ObjKind::String(s) => s.chars.to_string(),
            ObjKind::Function(f) => self.format_function_name(f.name),
            ObjKind::Closure(c) => {
                self.format_function_name(self.function(c.function).name)
            }
            ObjKind::BoundMethod(b) => {
                let function = self.closure_function(b.method);
                self.format_function_name(self.function(function).name)
            }
            ObjKind::Native(_) | ObjKind::BoundNative(_) => "<native fn>".to_string(),
            ObjKind::Class(c) => self.heap.string(c.name).chars.to_string(),
            ObjKind::Instance(i) => {
                let class_name = match &self.heap.get(i.class).kind {
                    ObjKind::Class(c) => &self.heap.string(c.name).chars,
                    _ => unreachable!("instance of a non-class"),
                };
                format!("{class_name} instance")
            }
            ObjKind::List(l) => {
                let items: Vec<String> =
                    l.values.iter().map(|v| self.format_value(*v)).collect();
                format!("[{}]", items.join(", "))
            }
            ObjKind::Dict(d) => {
                let entries: Vec<String> = d
                    .values
                    .iter()
                    .map(|(k, v)| {
                        format!("{} => {}", self.format_value(k), self.format_value(v))
                    })
                    .collect();
                if entries.is_empty() {
                    "dict {}".to_string()
                } else {
                    format!("dict {{{}}}", entries.join(", "))
                }
            }
            ObjKind::Upvalue(_) => "upvalue".to_string(),
            ObjKind::Option(o) => match o.value {
                Some(inner) => format!("some({})", self.format_value(inner)),
                None => "none".to_string(),
            },
        }
    }

    fn format_function_name(&self, name: Option<ObjRef>) -> String {
        match name {
            Some(name) => format!("<func {}>", self.heap.string(name).chars),
            None => "<script>".to_string(),
        }
    }
}
