//! Collection driver
//!
//! The heap knows how to trace and sweep; only the VM knows the roots.
//! A cycle is: mark roots, drain the gray worklist, drop unmarked strings
//! from the intern table, sweep the allocation list.
//!
//! Collections are triggered exclusively from the VM's allocation wrappers
//! (`Vm::alloc` / `Vm::intern`), so compile-time allocations never collect
//! and the compiler needs no root registration.

use craven_core::object::ObjKind;

use crate::vm::Vm;

impl Vm {
    /// One full mark-and-sweep cycle over the documented root set.
    pub(crate) fn collect_garbage(&mut self) {
        let before = self.heap.bytes_allocated();

        self.mark_roots();
        self.heap.trace_references();
        self.heap.remove_white_strings();
        self.heap.sweep();

        tracing::debug!(
            collected = before.saturating_sub(self.heap.bytes_allocated()),
            bytes = self.heap.bytes_allocated(),
            live = self.heap.live_object_count(),
            "garbage collected"
        );
    }

    fn mark_roots(&mut self) {
        // The live stack region.
        for i in 0..self.stack.len() {
            let value = self.stack[i];
            self.heap.mark_value(value);
        }

        // Every closure in every live call frame.
        for i in 0..self.frames.len() {
            let closure = self.frames[i].closure;
            self.heap.mark_object(closure);
        }

        // The open-upvalue list.
        let mut upvalue = self.open_upvalues;
        while let Some(handle) = upvalue {
            self.heap.mark_object(handle);
            upvalue = match &self.heap.get(handle).kind {
                ObjKind::Upvalue(u) => u.next,
                _ => unreachable!("open list holds a non-upvalue"),
            };
        }

        // Globals, builtin member tables, the natives' shield slot, and
        // the interned "init" used for constructor dispatch.
        self.heap.mark_table(&self.globals);
        self.heap.mark_table(&self.builtins.string_members);
        self.heap.mark_table(&self.builtins.list_members);
        self.heap.mark_table(&self.builtins.dict_members);
        self.heap.mark_table(&self.builtins.option_members);
        self.heap.mark_value(self.reserve);
        self.heap.mark_object(self.init_string);
    }
}
