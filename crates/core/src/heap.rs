//! Slab heap and collector plumbing
//!
//! Objects live in a slab of slots addressed by [`ObjRef`] handles. An
//! intrusive allocation list (through each header's `next` link) holds
//! exactly the live objects; the sweeper walks it, unlinking unmarked
//! objects and recycling their slots through a free list. Nothing moves.
//!
//! The heap also owns the string intern table and the gray worklist. Root
//! marking is the VM's job (it knows its stack, frames, globals and
//! builtins); tracing, white-string removal and sweeping live here because
//! they only need the object graph.

use crate::object::{hash_string, Obj, ObjKind, ObjRef, ObjString, UpvalueLocation};
use crate::table::Table;
use crate::value::Value;

const GC_HEAP_GROW_FACTOR: usize = 2;
const FIRST_GC_AT: usize = 1024 * 1024;

#[derive(Debug)]
enum Slot {
    Occupied(Obj),
    Free { next: Option<u32> },
}

#[derive(Debug)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Option<u32>,
    /// Head of the allocation list.
    objects: Option<ObjRef>,
    /// Intern table: one entry per distinct string byte sequence.
    strings: Table,
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
    /// Collect on every allocation; for shaking out liveness bugs.
    pub stress: bool,
    live: usize,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            slots: Vec::new(),
            free: None,
            objects: None,
            strings: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_AT,
            stress: false,
            live: 0,
        }
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate an object, threading it onto the allocation list. Never
    /// collects; collection is driven by the VM's allocation wrappers,
    /// which can see the roots.
    pub fn alloc(&mut self, kind: ObjKind) -> ObjRef {
        self.bytes_allocated += Heap::footprint(&kind);
        let obj = Obj {
            kind,
            marked: false,
            next: self.objects,
        };
        let handle = match self.free {
            Some(index) => {
                let next_free = match self.slots[index as usize] {
                    Slot::Free { next } => next,
                    Slot::Occupied(_) => unreachable!("free list points at a live object"),
                };
                self.free = next_free;
                self.slots[index as usize] = Slot::Occupied(obj);
                ObjRef::new(index)
            }
            None => {
                self.slots.push(Slot::Occupied(obj));
                ObjRef::new(self.slots.len() as u32 - 1)
            }
        };
        self.objects = Some(handle);
        self.live += 1;
        handle
    }

    /// Copy a string into the heap, returning the interned handle. Two
    /// textually equal strings always share one object.
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        let hash = hash_string(chars);
        if let Some(existing) = self.find_interned(chars, hash) {
            return existing;
        }
        let handle = self.alloc(ObjKind::String(ObjString {
            chars: chars.into(),
            hash,
        }));
        self.strings.set(Value::object(handle), hash, Value::NIL);
        handle
    }

    /// Specialized intern-table lookup: compare by length, hash, then
    /// bytes. Only place where strings are compared by content.
    fn find_interned(&self, chars: &str, hash: u32) -> Option<ObjRef> {
        let entries = self.strings.entries();
        if entries.is_empty() {
            return None;
        }
        let mask = entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &entries[index];
            if entry.key.is_empty() {
                if entry.value.is_nil() {
                    return None;
                }
            } else {
                let string = self.string(entry.key.as_obj());
                if string.hash == hash && &*string.chars == chars {
                    return Some(entry.key.as_obj());
                }
            }
            index = (index + 1) & mask;
        }
    }

    // =========================================================================
    // Access
    // =========================================================================

    pub fn get(&self, handle: ObjRef) -> &Obj {
        match &self.slots[handle.index() as usize] {
            Slot::Occupied(obj) => obj,
            Slot::Free { .. } => unreachable!("dangling object handle"),
        }
    }

    pub fn get_mut(&mut self, handle: ObjRef) -> &mut Obj {
        match &mut self.slots[handle.index() as usize] {
            Slot::Occupied(obj) => obj,
            Slot::Free { .. } => unreachable!("dangling object handle"),
        }
    }

    pub fn string(&self, handle: ObjRef) -> &ObjString {
        match &self.get(handle).kind {
            ObjKind::String(s) => s,
            _ => unreachable!("expected string object"),
        }
    }

    /// Convenience for values already known to be strings.
    pub fn string_value(&self, value: Value) -> &str {
        &self.string(value.as_obj()).chars
    }

    pub fn kind_matches(&self, value: Value, pred: impl Fn(&ObjKind) -> bool) -> bool {
        value.is_obj() && pred(&self.get(value.as_obj()).kind)
    }

    pub fn is_string(&self, value: Value) -> bool {
        self.kind_matches(value, |k| matches!(k, ObjKind::String(_)))
    }

    // =========================================================================
    // Hashing
    // =========================================================================

    /// Hash a value for table keying, or `None` for unhashable kinds.
    /// Strings use their cached FNV-1a; numbers fold their bit pattern;
    /// booleans map to 1/0; nil and empty hash to 0.
    pub fn hash_value(&self, value: Value) -> Option<u32> {
        if value.is_nil() || value.is_empty() {
            Some(0)
        } else if value.is_bool() {
            Some(value.as_bool() as u32)
        } else if value.is_number() {
            // Fold the bit pattern; negative zero folds with positive so
            // equal keys always hash equal.
            let n = value.as_number();
            let bits = if n == 0.0 { 0 } else { n.to_bits() };
            Some((bits as u32) ^ ((bits >> 32) as u32))
        } else {
            match &self.get(value.as_obj()).kind {
                ObjKind::String(s) => Some(s.hash),
                _ => None,
            }
        }
    }

    // =========================================================================
    // Collection
    // =========================================================================

    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    pub fn mark_value(&mut self, value: Value) {
        if value.is_obj() {
            self.mark_object(value.as_obj());
        }
    }

    pub fn mark_object(&mut self, handle: ObjRef) {
        let obj = self.get_mut(handle);
        if obj.marked {
            return;
        }
        obj.marked = true;
        self.gray.push(handle);
    }

    pub fn mark_table(&mut self, table: &Table) {
        // Values are plain words; snapshot the live entries first so the
        // borrow of the table does not pin the heap.
        let pairs: Vec<(Value, Value)> = table.iter().collect();
        for (key, value) in pairs {
            self.mark_value(key);
            self.mark_value(value);
        }
    }

    /// Drain the gray worklist, marking each object's children.
    pub fn trace_references(&mut self) {
        while let Some(handle) = self.gray.pop() {
            let children = self.children_of(handle);
            for child in children {
                self.mark_value(child);
            }
        }
    }

    fn children_of(&self, handle: ObjRef) -> Vec<Value> {
        let obj = |r: ObjRef| Value::object(r);
        match &self.get(handle).kind {
            ObjKind::String(_) | ObjKind::Native(_) => Vec::new(),
            ObjKind::Function(f) => {
                let mut children = f.chunk.constants.clone();
                if let Some(name) = f.name {
                    children.push(obj(name));
                }
                children
            }
            ObjKind::Closure(c) => {
                let mut children = vec![obj(c.function)];
                children.extend(c.upvalues.iter().map(|&u| obj(u)));
                children
            }
            ObjKind::Upvalue(u) => match u.location {
                UpvalueLocation::Closed(value) => vec![value],
                // An open upvalue's variable is on the stack, which is a root.
                UpvalueLocation::Stack(_) => Vec::new(),
            },
            ObjKind::Class(c) => {
                let mut children = vec![obj(c.name)];
                children.extend(c.methods.iter().flat_map(|(k, v)| [k, v]));
                children
            }
            ObjKind::Instance(i) => {
                let mut children = vec![obj(i.class)];
                children.extend(i.fields.iter().flat_map(|(k, v)| [k, v]));
                children
            }
            ObjKind::BoundMethod(b) => vec![b.receiver, obj(b.method)],
            ObjKind::BoundNative(b) => vec![b.receiver],
            ObjKind::List(l) => l.values.clone(),
            ObjKind::Dict(d) => d.values.iter().flat_map(|(k, v)| [k, v]).collect(),
            ObjKind::Option(o) => o.value.into_iter().collect(),
        }
    }

    /// Drop intern-table entries whose string was not marked, so the table
    /// never holds a dangling handle across the sweep.
    pub fn remove_white_strings(&mut self) {
        let mut strings = std::mem::take(&mut self.strings);
        strings.retain_keys(|key| self.get(key.as_obj()).marked);
        self.strings = strings;
    }

    /// Walk the allocation list: free unmarked objects, clear the mark on
    /// survivors for the next cycle.
    pub fn sweep(&mut self) {
        let mut previous: Option<ObjRef> = None;
        let mut current = self.objects;
        while let Some(handle) = current {
            let obj = self.get(handle);
            let next = obj.next;
            if obj.marked {
                self.get_mut(handle).marked = false;
                previous = Some(handle);
            } else {
                match previous {
                    Some(prev) => self.get_mut(prev).next = next,
                    None => self.objects = next,
                }
                self.free_object(handle);
            }
            current = next;
        }
        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
    }

    fn free_object(&mut self, handle: ObjRef) {
        let index = handle.index() as usize;
        if let Slot::Occupied(obj) = &self.slots[index] {
            self.bytes_allocated = self
                .bytes_allocated
                .saturating_sub(Heap::footprint(&obj.kind));
        }
        self.slots[index] = Slot::Free { next: self.free };
        self.free = Some(handle.index());
        self.live -= 1;
    }

    /// Approximate footprint of an object: header plus owned buffers.
    /// Growth of inner buffers after allocation is not tracked; the
    /// trigger threshold only needs to be in the right ballpark.
    fn footprint(kind: &ObjKind) -> usize {
        let base = std::mem::size_of::<Obj>();
        base + match kind {
            ObjKind::String(s) => s.chars.len(),
            ObjKind::Function(f) => f.chunk.footprint(),
            ObjKind::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<ObjRef>(),
            ObjKind::Class(c) => c.methods.footprint(),
            ObjKind::Instance(i) => i.fields.footprint(),
            ObjKind::List(l) => l.values.capacity() * std::mem::size_of::<Value>(),
            ObjKind::Dict(d) => d.values.footprint(),
            ObjKind::Upvalue(_)
            | ObjKind::BoundMethod(_)
            | ObjKind::BoundNative(_)
            | ObjKind::Native(_)
            | ObjKind::Option(_) => 0,
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn live_object_count(&self) -> usize {
        self.live
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjList, ObjOption};

    #[test]
    fn test_interning_dedupes() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.live_object_count(), 2);
        assert_eq!(&*heap.string(a).chars, "hello");
    }

    #[test]
    fn test_interned_values_compare_equal() {
        let mut heap = Heap::new();
        let a = Value::object(heap.intern("abc"));
        let b = Value::object(heap.intern("abc"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_sweep_frees_unmarked_and_recycles_slots() {
        let mut heap = Heap::new();
        let keep = heap.alloc(ObjKind::List(ObjList { values: Vec::new() }));
        let drop1 = heap.alloc(ObjKind::Option(ObjOption { value: None }));
        let drop2 = heap.alloc(ObjKind::Option(ObjOption { value: None }));
        assert_eq!(heap.live_object_count(), 3);

        heap.mark_object(keep);
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();

        assert_eq!(heap.live_object_count(), 1);
        assert!(!heap.get(keep).marked);

        // Freed slots are recycled before the slab grows.
        let recycled = heap.alloc(ObjKind::Option(ObjOption { value: None }));
        assert!(recycled == drop1 || recycled == drop2);
    }

    #[test]
    fn test_trace_reaches_list_elements() {
        let mut heap = Heap::new();
        let s = heap.intern("element");
        let list = heap.alloc(ObjKind::List(ObjList {
            values: vec![Value::object(s)],
        }));

        heap.mark_object(list);
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();

        assert_eq!(heap.live_object_count(), 2);
        assert_eq!(&*heap.string(s).chars, "element");
    }

    #[test]
    fn test_white_strings_leave_intern_table() {
        let mut heap = Heap::new();
        heap.intern("garbage");
        let kept = heap.intern("kept");

        heap.mark_object(kept);
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();

        assert_eq!(heap.live_object_count(), 1);
        // A fresh intern of the collected text allocates a new object.
        let again = heap.intern("garbage");
        assert_eq!(heap.live_object_count(), 2);
        assert_eq!(&*heap.string(again).chars, "garbage");
        // The survivor is still interned.
        assert_eq!(heap.intern("kept"), kept);
    }

    #[test]
    fn test_hash_value_kinds() {
        let mut heap = Heap::new();
        assert_eq!(heap.hash_value(Value::NIL), Some(0));
        assert_eq!(heap.hash_value(Value::TRUE), Some(1));
        assert_eq!(heap.hash_value(Value::FALSE), Some(0));
        assert!(heap.hash_value(Value::number(12.5)).is_some());
        let s = heap.intern("key");
        assert_eq!(heap.hash_value(Value::object(s)), Some(hash_string("key")));
        let list = heap.alloc(ObjKind::List(ObjList { values: Vec::new() }));
        assert_eq!(heap.hash_value(Value::object(list)), None);
    }
}
