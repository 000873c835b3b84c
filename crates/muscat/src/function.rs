//! Callable objects: compiled functions, closures, and upvalues.

use smallvec::SmallVec;

use crate::{bytecode::chunk::Chunk, heap::HeapId, value::Value};

/// Whether a function is a compiled top-level script or an ordinary
/// function. Only ordinary functions get their tail sites patched to
/// `TAIL_CALL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionType {
    Script,
    Function,
}

/// A keyword parameter declared in a lambda list after `:keys`.
///
/// `default_index` points into the function's constant pool; `None` means
/// the parameter defaults to `#f` when the caller omits it.
#[derive(Debug, Clone, Copy)]
pub struct KeywordParam {
    pub name: HeapId,
    pub default_index: Option<u8>,
}

/// A compiled function: bytecode plus the shape of its parameter list.
pub struct Function {
    pub function_type: FunctionType,
    /// Number of declared parameters, including the rest parameter.
    pub arity: usize,
    /// 1-based slot of the rest parameter; 0 means no rest parameter.
    pub rest_arg_index: usize,
    pub upvalue_count: usize,
    pub keyword_params: SmallVec<[KeywordParam; 2]>,
    pub chunk: Chunk,
    pub name: Option<HeapId>,
}

impl Function {
    #[must_use]
    pub fn new(function_type: FunctionType) -> Self {
        Self {
            function_type,
            arity: 0,
            rest_arg_index: 0,
            upvalue_count: 0,
            keyword_params: SmallVec::new(),
            chunk: Chunk::new(),
            name: None,
        }
    }

    #[must_use]
    pub fn has_rest(&self) -> bool {
        self.rest_arg_index > 0
    }
}

/// A function paired with its captured environment and defining module.
pub struct Closure {
    pub function: HeapId,
    pub module: Option<HeapId>,
    pub upvalues: Vec<HeapId>,
}

/// Where an upvalue's storage currently lives.
///
/// While the captured local's frame is alive the upvalue is *open* and
/// points at a value-stack slot; when that slot is about to be popped the
/// VM *closes* the upvalue by moving the value inline.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueSlot {
    Open(usize),
    Closed(Value),
}

pub struct Upvalue {
    pub slot: UpvalueSlot,
}

impl Upvalue {
    /// The stack index of an open upvalue; `None` once closed.
    #[must_use]
    pub fn open_slot(&self) -> Option<usize> {
        match self.slot {
            UpvalueSlot::Open(index) => Some(index),
            UpvalueSlot::Closed(_) => None,
        }
    }
}
