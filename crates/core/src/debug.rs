//! Chunk disassembler
//!
//! Renders bytecode for inspection: offset, source line (or `|` when the
//! line is unchanged), mnemonic and operands, with constant operands
//! resolved against the pool.

use crate::chunk::{Chunk, OpCode};
use crate::heap::Heap;
use crate::object::ObjKind;
use crate::value::{format_number, Value};

/// Disassemble a whole chunk under a header.
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("== {name} ==\n"));
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (line, next) = disassemble_instruction(heap, chunk, offset);
        out.push_str(&line);
        out.push('\n');
        offset = next;
    }
    out
}

/// Render one instruction; returns the rendered line and the offset of the
/// next instruction.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut line = format!("{offset:04} ");
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        line.push_str("   | ");
    } else {
        line.push_str(&format!("{:4} ", chunk.lines[offset]));
    }

    let op = match OpCode::try_from(chunk.code[offset]) {
        Ok(op) => op,
        Err(_) => {
            line.push_str(&format!("Unknown opcode {}", chunk.code[offset]));
            return (line, offset + 1);
        }
    };

    use OpCode::*;
    let next = match op {
        Constant | GetGlobal | DefineGlobal | SetGlobal | GetProperty | SetProperty | GetSuper
        | Class | Method => constant_instruction(heap, chunk, op, offset, &mut line),
        Int | List | Dict | GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call => {
            byte_instruction(chunk, op, offset, &mut line)
        }
        Jump | JumpIfFalse | NextJump => jump_instruction(chunk, op, offset, 1, &mut line),
        Loop => jump_instruction(chunk, op, offset, -1, &mut line),
        Invoke | SuperInvoke => invoke_instruction(heap, chunk, op, offset, &mut line),
        Closure => closure_instruction(heap, chunk, offset, &mut line),
        Nil | True | False | Pop | GetIndex | SetIndex | Equal | Greater | Less | Add
        | Subtract | Multiply | Divide | Not | Negate | Print | CloseUpvalue | PopUnder
        | CloseUnder | Return | Inherit | Some | None => {
            line.push_str(&format!("{op:?}"));
            offset + 1
        }
    };
    (line, next)
}

fn constant_instruction(
    heap: &Heap,
    chunk: &Chunk,
    op: OpCode,
    offset: usize,
    line: &mut String,
) -> usize {
    let index = chunk.code[offset + 1];
    let value = chunk.constants[index as usize];
    line.push_str(&format!(
        "{:<16} {:4} '{}'",
        format!("{op:?}"),
        index,
        render_value(heap, value)
    ));
    offset + 2
}

fn byte_instruction(chunk: &Chunk, op: OpCode, offset: usize, line: &mut String) -> usize {
    let operand = chunk.code[offset + 1];
    line.push_str(&format!("{:<16} {operand:4}", format!("{op:?}")));
    offset + 2
}

fn jump_instruction(
    chunk: &Chunk,
    op: OpCode,
    offset: usize,
    sign: i64,
    line: &mut String,
) -> usize {
    let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]);
    let target = offset as i64 + 3 + sign * i64::from(jump);
    line.push_str(&format!("{:<16} {offset:4} -> {target}", format!("{op:?}")));
    offset + 3
}

fn invoke_instruction(
    heap: &Heap,
    chunk: &Chunk,
    op: OpCode,
    offset: usize,
    line: &mut String,
) -> usize {
    let index = chunk.code[offset + 1];
    let arg_count = chunk.code[offset + 2];
    let name = render_value(heap, chunk.constants[index as usize]);
    line.push_str(&format!(
        "{:<16} ({arg_count} args) {index:4} '{name}'",
        format!("{op:?}")
    ));
    offset + 3
}

fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize, line: &mut String) -> usize {
    let index = chunk.code[offset + 1];
    let value = chunk.constants[index as usize];
    line.push_str(&format!(
        "{:<16} {index:4} {}",
        "Closure",
        render_value(heap, value)
    ));
    let upvalue_count = match &heap.get(value.as_obj()).kind {
        ObjKind::Function(f) => f.upvalue_count,
        _ => 0,
    };
    let mut next = offset + 2;
    for _ in 0..upvalue_count {
        let is_local = chunk.code[next];
        let slot = chunk.code[next + 1];
        line.push_str(&format!(
            "\n{:04}    |   {} {}",
            next,
            if is_local == 1 { "local" } else { "upvalue" },
            slot
        ));
        next += 2;
    }
    next
}

/// Compact one-line rendering of a constant value.
pub fn render_value(heap: &Heap, value: Value) -> String {
    if value.is_nil() {
        "nil".to_string()
    } else if value.is_bool() {
        value.as_bool().to_string()
    } else if value.is_number() {
        format_number(value.as_number())
    } else if value.is_empty() {
        "<empty value>".to_string()
    } else {
        match &heap.get(value.as_obj()).kind {
            ObjKind::String(s) => s.chars.to_string(),
            ObjKind::Function(f) => match f.name {
                Some(name) => format!("<func {}>", heap.string(name).chars),
                None => "<script>".to_string(),
            },
            _ => "<object>".to_string(),
        }
    }
}
