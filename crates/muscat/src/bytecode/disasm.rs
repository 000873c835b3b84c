//! Bytecode disassembly for diagnostics and tests.

use std::fmt::Write as _;

use crate::{
    heap::{Heap, HeapData, PrintStyle},
    value::Value,
};

use super::{Chunk, Opcode};

/// Renders a whole chunk, one instruction per line.
#[must_use]
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(heap, chunk, offset, &mut out);
    }
    out
}

/// Renders the instruction at `offset`, returning the next offset.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let _ = write!(out, "{offset:04} ");
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.line_at(offset));
    }

    let Some(op) = Opcode::decode(chunk.code[offset]) else {
        let _ = writeln!(out, "UNKNOWN {:#04x}", chunk.code[offset]);
        return offset + 1;
    };

    match op {
        Opcode::Constant
        | Opcode::ReadGlobal
        | Opcode::DefineGlobal
        | Opcode::SetGlobal
        | Opcode::ExportSymbol => {
            let index = chunk.code[offset + 1];
            let constant = chunk.constants[index as usize];
            let rendered = render_constant(heap, constant);
            let _ = writeln!(out, "{:<16} {index:3} '{rendered}'", op.name());
            offset + 2
        }
        Opcode::ReadLocal
        | Opcode::SetLocal
        | Opcode::ReadUpvalue
        | Opcode::SetUpvalue
        | Opcode::List
        | Opcode::PopScope
        | Opcode::DefineRecord => {
            let slot = chunk.code[offset + 1];
            let _ = writeln!(out, "{:<16} {slot:3}", op.name());
            offset + 2
        }
        Opcode::Call | Opcode::TailCall => {
            let argc = chunk.code[offset + 1];
            let kwc = chunk.code[offset + 2];
            let _ = writeln!(out, "{:<16} {argc:3} {kwc:3}", op.name());
            offset + 3
        }
        Opcode::Jump | Opcode::JumpIfFalse => {
            let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]);
            let target = offset + 3 + jump as usize;
            let _ = writeln!(out, "{:<16} {jump:3} -> {target:04}", op.name());
            offset + 3
        }
        Opcode::Closure => {
            let index = chunk.code[offset + 1];
            let constant = chunk.constants[index as usize];
            let rendered = render_constant(heap, constant);
            let _ = write!(out, "{:<16} {index:3} {rendered}", op.name());

            // The closure's capture descriptors follow inline.
            let mut next = offset + 2;
            if let Value::Object(id) = constant {
                if let HeapData::Function(function) = heap.get(id) {
                    for _ in 0..function.upvalue_count {
                        let is_local = chunk.code[next];
                        let slot = chunk.code[next + 1];
                        let kind = if is_local == 1 { "local" } else { "upvalue" };
                        let _ = write!(out, " [{kind} {slot}]");
                        next += 2;
                    }
                }
            }
            let _ = writeln!(out);
            next
        }
        _ => {
            let _ = writeln!(out, "{}", op.name());
            offset + 1
        }
    }
}

fn render_constant(heap: &Heap, constant: Value) -> String {
    heap.format_value(constant, PrintStyle::Write)
}
