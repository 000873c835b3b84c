//! Muscat: a bytecode interpreter for a small Scheme dialect.
//!
//! Source text flows through the scanner and reader into syntax objects,
//! the single-pass compiler turns each top-level form into bytecode, and
//! a stack VM executes it. Distinguishing features: first-class modules
//! with explicit imports and exports, lexical closures with upvalue
//! capture, proper tail calls, one-shot delimited continuations via
//! `reset`/`shift`, and user-defined record types. A precise
//! mark-and-sweep collector manages every heap object.
//!
//! # Embedding
//!
//! ```
//! use muscat::Vm;
//!
//! let mut vm = Vm::new(Vec::new());
//! vm.register_core_modules().unwrap();
//! let value = vm.eval_string("(+ 1 2)").unwrap();
//! assert_eq!(vm.format_value(value), "3");
//! ```

#![allow(clippy::cast_possible_truncation)] // counts are range-checked before narrowing
#![allow(clippy::cast_sign_loss)] // numeric casts mirror the f64 value model

pub mod bytecode;
pub mod modules;

mod compiler;
mod error;
mod function;
mod heap;
mod intern;
mod native;
mod port;
mod reader;
mod scanner;
mod value;
mod vm;

pub use crate::{
    compiler::{compile_module, compile_source},
    error::{CompileError, Diagnostic, InterpretError, RuntimeError},
    function::{Closure, Function, FunctionType, KeywordParam, Upvalue, UpvalueSlot},
    heap::{Cons, ForeignPtr, Heap, HeapData, HeapId, PrintStyle, Symbol, Syntax},
    native::{NativeError, NativeFn, NativeFuncEntry},
    port::{Port, PortBackend, PortKind},
    reader::Reader,
    scanner::{Scanner, Token, TokenKind, TokenSubKind},
    value::Value,
    vm::{
        cont::{Continuation, MarkerKind, StackMarker},
        modules::Module,
        record::{Record, RecordAccessor, RecordField, RecordInstance, RecordPredicate, RecordSetter},
        CallFrame, Vm, FRAMES_MAX, STACK_MAX,
    },
};
