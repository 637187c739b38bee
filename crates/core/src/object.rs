//! Heap object model
//!
//! Every heap object is a header (mark bit + allocation-list link) plus one
//! of the payload variants below. Objects refer to each other through
//! [`ObjRef`] handles into the slab heap instead of owning pointers; the
//! collector alone decides lifetime, so reference cycles
//! (closure ↔ upvalue, class ↔ method, instance ↔ field) are harmless.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

/// Handle to a heap object: an index into the slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjRef(u32);

impl ObjRef {
    #[inline]
    pub fn new(index: u32) -> ObjRef {
        ObjRef(index)
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Handle into the VM's native-function registry. The object model never
/// names the VM type, so natives are carried by id rather than pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeId(pub u16);

/// Common object header. `next` threads the object into the heap's
/// allocation list, which the sweeper walks.
#[derive(Debug)]
pub struct Obj {
    pub kind: ObjKind,
    pub marked: bool,
    pub next: Option<ObjRef>,
}

#[derive(Debug)]
pub enum ObjKind {
    String(ObjString),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
    BoundNative(ObjBoundNative),
    List(ObjList),
    Dict(ObjDict),
    Native(ObjNative),
    Option(ObjOption),
}

/// An interned string. The hash is FNV-1a, computed once at creation so
/// table lookups never rescan the bytes.
#[derive(Debug)]
pub struct ObjString {
    pub chars: Box<str>,
    pub hash: u32,
}

impl ObjString {
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }
}

/// FNV-1a over the raw bytes.
pub fn hash_string(chars: &str) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for byte in chars.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// A compiled function. Never user-visible on its own; at runtime it is
/// always wrapped in an [`ObjClosure`].
#[derive(Debug)]
pub struct ObjFunction {
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// `None` for the top-level script.
    pub name: Option<ObjRef>,
}

impl ObjFunction {
    pub fn new() -> ObjFunction {
        ObjFunction {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name: None,
        }
    }
}

impl Default for ObjFunction {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime callable: a function plus the upvalues it captured.
#[derive(Debug)]
pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// Where an upvalue's variable currently lives.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueLocation {
    /// Still on the VM stack, at this absolute slot index.
    Stack(usize),
    /// Hoisted off the stack; the upvalue owns the value.
    Closed(Value),
}

/// Indirection cell through which a closure reads and writes a captured
/// variable. While open it sits on the VM's open-upvalue list, sorted by
/// descending stack slot.
#[derive(Debug)]
pub struct ObjUpvalue {
    pub location: UpvalueLocation,
    pub next: Option<ObjRef>,
}

#[derive(Debug)]
pub struct ObjClass {
    pub name: ObjRef,
    /// method name string -> closure. Populated by `METHOD`, copied from
    /// the superclass by `INHERIT`.
    pub methods: Table,
}

#[derive(Debug)]
pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

/// A method pulled off an instance, remembering its receiver so `this`
/// resolves when it is eventually called.
#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

/// Same idea as [`ObjBoundMethod`] for native methods on built-in types;
/// the native sees the receiver at `args[-1]`.
#[derive(Debug)]
pub struct ObjBoundNative {
    pub receiver: Value,
    pub method: NativeId,
}

#[derive(Debug)]
pub struct ObjList {
    pub values: Vec<Value>,
}

#[derive(Debug)]
pub struct ObjDict {
    pub values: Table,
}

#[derive(Debug)]
pub struct ObjNative {
    pub function: NativeId,
}

/// `some(v)` / `none`.
#[derive(Debug)]
pub struct ObjOption {
    pub value: Option<Value>,
}

impl ObjOption {
    pub fn is_none(&self) -> bool {
        self.value.is_none()
    }
}
