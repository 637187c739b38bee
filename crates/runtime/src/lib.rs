//! Craven runtime: the bytecode virtual machine
//!
//! - `vm`: VM state and the dispatch loop
//! - `ops`: call, property, index and upvalue helpers
//! - `gc`: root marking and the collection driver
//! - `builtins`: native globals (`clock`, `import`) and the per-type
//!   member tables
//!
//! ```rust
//! use craven_runtime::{InterpretResult, Vm};
//!
//! let mut vm = Vm::new();
//! assert_eq!(vm.interpret("print 1 + 2;"), InterpretResult::Ok);
//! ```

pub mod builtins;
mod gc;
mod ops;
pub mod vm;

pub use builtins::{Builtins, NativeFn};
pub use vm::{InterpretResult, Vm, VmOptions, FRAMES_MAX, STACK_MAX};
