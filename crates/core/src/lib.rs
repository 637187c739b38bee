//! Craven core: the data model shared by the compiler and the VM
//!
//! - `value`: NaN-boxed 64-bit `Value` (nil, bool, number, object handle)
//! - `object`: heap object header and payload variants
//! - `heap`: slab heap, allocation list, string interning, trace/sweep
//! - `table`: open-addressing hash map with tombstones
//! - `chunk`: bytecode instructions, line table, constant pool
//! - `debug`: chunk disassembler

pub mod chunk;
pub mod debug;
pub mod heap;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use heap::Heap;
pub use object::{NativeId, Obj, ObjKind, ObjRef};
pub use table::Table;
pub use value::Value;
