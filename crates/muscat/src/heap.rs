//! The garbage-collected heap.
//!
//! Every Muscat object lives in a slot arena owned by [`Heap`] and is
//! referenced by a typed index, [`HeapId`]. Collection is a precise,
//! stop-the-world mark-and-sweep: the VM marks its roots, `trace` darkens
//! reachable objects through an explicit gray stack, the intern tables are
//! scrubbed of dead keys, and `sweep` returns unmarked slots to a free
//! list.
//!
//! The heap itself never decides *when* to collect; the VM's allocation
//! wrapper consults [`Heap::should_collect`] before each allocation so
//! that roots are always in a consistent state when a collection runs.

use std::fmt::Write as _;

use crate::{
    function::{Closure, Function, Upvalue, UpvalueSlot},
    native::NativeFn,
    port::Port,
    scanner::TokenSubKind,
    value::Value,
    vm::{
        cont::{Continuation, StackMarker},
        modules::Module,
        record::{Record, RecordAccessor, RecordField, RecordInstance, RecordPredicate, RecordSetter},
    },
};

/// Index of an object in the heap's slot arena.
///
/// `u32` keeps `Value` at 16 bytes; four billion live objects is far more
/// than the interpreter can otherwise sustain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u32);

impl HeapId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How a value should be rendered: `Display` is user-facing output
/// (strings print raw), `Write` is read-compatible output (strings print
/// quoted with escapes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintStyle {
    Display,
    Write,
}

/// A pair cell. Lists are chains of these terminated by `Value::Empty`.
#[derive(Debug, Clone, Copy)]
pub struct Cons {
    pub car: Value,
    pub cdr: Value,
}

/// An interned symbol: a reference to its interned name string plus the
/// token sub-kind the scanner assigned, which lets the compiler recognize
/// special forms by identity without re-examining the text.
#[derive(Debug, Clone, Copy)]
pub struct Symbol {
    pub name: HeapId,
    pub sub_kind: TokenSubKind,
}

/// A value paired with its source position. The reader wraps every node
/// it produces in one of these; the compiler unwraps them to reach the
/// datums while keeping lines for diagnostics and the chunk line table.
#[derive(Debug, Clone, Copy)]
pub struct Syntax {
    pub value: Value,
    pub file_name: Option<HeapId>,
    pub line: u32,
    pub column: u32,
    pub position: u32,
    pub span: u32,
}

/// Opaque host data attached to the heap.
///
/// The `trace` hook reports any heap values the payload holds so that
/// collections keep them alive; payload cleanup happens through `Drop`.
pub trait ForeignPtr: std::any::Any {
    fn trace(&self, _mark: &mut dyn FnMut(Value)) {}
}

/// Payload of one heap slot.
pub enum HeapData {
    String(Box<str>),
    Symbol(Symbol),
    Keyword(Box<str>),
    Syntax(Syntax),
    Cons(Cons),
    Array(Vec<Value>),
    Function(Function),
    Closure(Closure),
    Upvalue(Upvalue),
    StackMarker(StackMarker),
    Continuation(Continuation),
    NativeFunction(NativeFn),
    Pointer(Box<dyn ForeignPtr>),
    Module(Module),
    Record(Record),
    RecordField(RecordField),
    RecordAccessor(RecordAccessor),
    RecordSetter(RecordSetter),
    RecordPredicate(RecordPredicate),
    RecordInstance(RecordInstance),
    Port(Port),
}

impl HeapData {
    /// Short name of the object kind, used in runtime error messages.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Symbol(_) => "symbol",
            Self::Keyword(_) => "keyword",
            Self::Syntax(_) => "syntax",
            Self::Cons(_) => "pair",
            Self::Array(_) => "array",
            Self::Function(_) => "function",
            Self::Closure(_) => "function",
            Self::Upvalue(_) => "upvalue",
            Self::StackMarker(_) => "stack marker",
            Self::Continuation(_) => "continuation",
            Self::NativeFunction(_) => "native function",
            Self::Pointer(_) => "pointer",
            Self::Module(_) => "module",
            Self::Record(_) => "record type",
            Self::RecordField(_) => "record field",
            Self::RecordAccessor(_) => "record accessor",
            Self::RecordSetter(_) => "record setter",
            Self::RecordPredicate(_) => "record predicate",
            Self::RecordInstance(_) => "record",
            Self::Port(_) => "port",
        }
    }
}

enum Slot {
    Vacant,
    Occupied { data: HeapData, marked: bool },
}

/// Collection triggers once this many bytes are estimated live, and the
/// threshold doubles after every collection without dropping below this
/// floor again.
const HEAP_GROW_FLOOR: usize = 1024 * 1024;

/// The slot arena plus the bookkeeping the collector needs.
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    gray: Vec<HeapId>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            bytes_allocated: 0,
            next_gc: HEAP_GROW_FLOOR,
            gray: Vec::new(),
        }
    }

    /// Allocates a slot for `data`, recycling a free slot when one exists.
    ///
    /// This never collects; callers that can tolerate a collection go
    /// through the VM's allocation wrapper, which checks
    /// [`Self::should_collect`] first.
    pub fn alloc(&mut self, data: HeapData) -> HeapId {
        self.bytes_allocated += estimate_size(&data);
        if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Slot::Occupied { data, marked: false };
            HeapId(index)
        } else {
            let index = u32::try_from(self.slots.len()).expect("heap exceeded u32 slot indices");
            self.slots.push(Slot::Occupied { data, marked: false });
            HeapId(index)
        }
    }

    #[inline]
    #[must_use]
    pub fn should_collect(&self) -> bool {
        self.bytes_allocated >= self.next_gc
    }

    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[must_use]
    pub fn contains(&self, id: HeapId) -> bool {
        matches!(self.slots.get(id.index()), Some(Slot::Occupied { .. }))
    }

    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        match &self.slots[id.index()] {
            Slot::Occupied { data, .. } => data,
            Slot::Vacant => panic!("access to freed heap slot {}", id.0),
        }
    }

    #[must_use]
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        match &mut self.slots[id.index()] {
            Slot::Occupied { data, .. } => data,
            Slot::Vacant => panic!("access to freed heap slot {}", id.0),
        }
    }

    #[must_use]
    pub fn kind_name(&self, id: HeapId) -> &'static str {
        self.get(id).kind_name()
    }

    // ------------------------------------------------------------------
    // Typed accessors. These panic on a kind mismatch, which indicates a
    // compiler or VM bug rather than a user error; user-reachable type
    // checks go through the `as_*` probes below instead.
    // ------------------------------------------------------------------

    #[must_use]
    pub fn string(&self, id: HeapId) -> &str {
        match self.get(id) {
            HeapData::String(s) => s,
            other => panic!("expected string, found {}", other.kind_name()),
        }
    }

    #[must_use]
    pub fn keyword_text(&self, id: HeapId) -> &str {
        match self.get(id) {
            HeapData::Keyword(s) => s,
            other => panic!("expected keyword, found {}", other.kind_name()),
        }
    }

    /// Text of a string *or* keyword object. Keywords are byte-compatible
    /// with strings so that keyword-argument matching can compare them
    /// against parameter name strings.
    #[must_use]
    pub fn text(&self, id: HeapId) -> &str {
        match self.get(id) {
            HeapData::String(s) | HeapData::Keyword(s) => s,
            other => panic!("expected string-like, found {}", other.kind_name()),
        }
    }

    #[must_use]
    pub fn symbol(&self, id: HeapId) -> &Symbol {
        match self.get(id) {
            HeapData::Symbol(s) => s,
            other => panic!("expected symbol, found {}", other.kind_name()),
        }
    }

    #[must_use]
    pub fn syntax(&self, id: HeapId) -> &Syntax {
        match self.get(id) {
            HeapData::Syntax(s) => s,
            other => panic!("expected syntax, found {}", other.kind_name()),
        }
    }

    #[must_use]
    pub fn array(&self, id: HeapId) -> &Vec<Value> {
        match self.get(id) {
            HeapData::Array(items) => items,
            other => panic!("expected array, found {}", other.kind_name()),
        }
    }

    pub fn array_mut(&mut self, id: HeapId) -> &mut Vec<Value> {
        match self.get_mut(id) {
            HeapData::Array(items) => items,
            other => panic!("expected array, found {}", other.kind_name()),
        }
    }

    #[must_use]
    pub fn cons(&self, id: HeapId) -> &Cons {
        match self.get(id) {
            HeapData::Cons(c) => c,
            other => panic!("expected pair, found {}", other.kind_name()),
        }
    }

    pub fn cons_mut(&mut self, id: HeapId) -> &mut Cons {
        match self.get_mut(id) {
            HeapData::Cons(c) => c,
            other => panic!("expected pair, found {}", other.kind_name()),
        }
    }

    #[must_use]
    pub fn function(&self, id: HeapId) -> &Function {
        match self.get(id) {
            HeapData::Function(f) => f,
            other => panic!("expected function, found {}", other.kind_name()),
        }
    }

    pub fn function_mut(&mut self, id: HeapId) -> &mut Function {
        match self.get_mut(id) {
            HeapData::Function(f) => f,
            other => panic!("expected function, found {}", other.kind_name()),
        }
    }

    #[must_use]
    pub fn closure(&self, id: HeapId) -> &Closure {
        match self.get(id) {
            HeapData::Closure(c) => c,
            other => panic!("expected closure, found {}", other.kind_name()),
        }
    }

    pub fn closure_mut(&mut self, id: HeapId) -> &mut Closure {
        match self.get_mut(id) {
            HeapData::Closure(c) => c,
            other => panic!("expected closure, found {}", other.kind_name()),
        }
    }

    #[must_use]
    pub fn upvalue(&self, id: HeapId) -> &Upvalue {
        match self.get(id) {
            HeapData::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.kind_name()),
        }
    }

    pub fn upvalue_mut(&mut self, id: HeapId) -> &mut Upvalue {
        match self.get_mut(id) {
            HeapData::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.kind_name()),
        }
    }

    #[must_use]
    pub fn marker(&self, id: HeapId) -> &StackMarker {
        match self.get(id) {
            HeapData::StackMarker(m) => m,
            other => panic!("expected stack marker, found {}", other.kind_name()),
        }
    }

    #[must_use]
    pub fn continuation(&self, id: HeapId) -> &Continuation {
        match self.get(id) {
            HeapData::Continuation(c) => c,
            other => panic!("expected continuation, found {}", other.kind_name()),
        }
    }

    #[must_use]
    pub fn module(&self, id: HeapId) -> &Module {
        match self.get(id) {
            HeapData::Module(m) => m,
            other => panic!("expected module, found {}", other.kind_name()),
        }
    }

    pub fn module_mut(&mut self, id: HeapId) -> &mut Module {
        match self.get_mut(id) {
            HeapData::Module(m) => m,
            other => panic!("expected module, found {}", other.kind_name()),
        }
    }

    #[must_use]
    pub fn record(&self, id: HeapId) -> &Record {
        match self.get(id) {
            HeapData::Record(r) => r,
            other => panic!("expected record type, found {}", other.kind_name()),
        }
    }

    pub fn record_mut(&mut self, id: HeapId) -> &mut Record {
        match self.get_mut(id) {
            HeapData::Record(r) => r,
            other => panic!("expected record type, found {}", other.kind_name()),
        }
    }

    #[must_use]
    pub fn record_field(&self, id: HeapId) -> &RecordField {
        match self.get(id) {
            HeapData::RecordField(f) => f,
            other => panic!("expected record field, found {}", other.kind_name()),
        }
    }

    #[must_use]
    pub fn record_instance(&self, id: HeapId) -> &RecordInstance {
        match self.get(id) {
            HeapData::RecordInstance(i) => i,
            other => panic!("expected record instance, found {}", other.kind_name()),
        }
    }

    pub fn record_instance_mut(&mut self, id: HeapId) -> &mut RecordInstance {
        match self.get_mut(id) {
            HeapData::RecordInstance(i) => i,
            other => panic!("expected record instance, found {}", other.kind_name()),
        }
    }

    #[must_use]
    pub fn native_function(&self, id: HeapId) -> NativeFn {
        match self.get(id) {
            HeapData::NativeFunction(f) => *f,
            other => panic!("expected native function, found {}", other.kind_name()),
        }
    }

    #[must_use]
    pub fn port(&self, id: HeapId) -> &Port {
        match self.get(id) {
            HeapData::Port(p) => p,
            other => panic!("expected port, found {}", other.kind_name()),
        }
    }

    pub fn port_mut(&mut self, id: HeapId) -> &mut Port {
        match self.get_mut(id) {
            HeapData::Port(p) => p,
            other => panic!("expected port, found {}", other.kind_name()),
        }
    }

    // ------------------------------------------------------------------
    // Kind probes over `Value`.
    // ------------------------------------------------------------------

    #[must_use]
    pub fn as_cons_id(&self, value: Value) -> Option<HeapId> {
        match value {
            Value::Object(id) => match self.get(id) {
                HeapData::Cons(_) => Some(id),
                _ => None,
            },
            _ => None,
        }
    }

    #[must_use]
    pub fn as_string_id(&self, value: Value) -> Option<HeapId> {
        match value {
            Value::Object(id) => match self.get(id) {
                HeapData::String(_) => Some(id),
                _ => None,
            },
            _ => None,
        }
    }

    #[must_use]
    pub fn as_symbol_id(&self, value: Value) -> Option<HeapId> {
        match value {
            Value::Object(id) => match self.get(id) {
                HeapData::Symbol(_) => Some(id),
                _ => None,
            },
            _ => None,
        }
    }

    #[must_use]
    pub fn as_keyword_id(&self, value: Value) -> Option<HeapId> {
        match value {
            Value::Object(id) => match self.get(id) {
                HeapData::Keyword(_) => Some(id),
                _ => None,
            },
            _ => None,
        }
    }

    #[must_use]
    pub fn as_array_id(&self, value: Value) -> Option<HeapId> {
        match value {
            Value::Object(id) => match self.get(id) {
                HeapData::Array(_) => Some(id),
                _ => None,
            },
            _ => None,
        }
    }

    #[must_use]
    pub fn as_syntax_id(&self, value: Value) -> Option<HeapId> {
        match value {
            Value::Object(id) => match self.get(id) {
                HeapData::Syntax(_) => Some(id),
                _ => None,
            },
            _ => None,
        }
    }

    #[must_use]
    pub fn as_closure_id(&self, value: Value) -> Option<HeapId> {
        match value {
            Value::Object(id) => match self.get(id) {
                HeapData::Closure(_) => Some(id),
                _ => None,
            },
            _ => None,
        }
    }

    #[must_use]
    pub fn as_module_id(&self, value: Value) -> Option<HeapId> {
        match value {
            Value::Object(id) => match self.get(id) {
                HeapData::Module(_) => Some(id),
                _ => None,
            },
            _ => None,
        }
    }

    #[must_use]
    pub fn is_reset_marker(&self, value: Value) -> bool {
        match value {
            Value::Object(id) => matches!(self.get(id), HeapData::StackMarker(m) if m.is_reset()),
            _ => false,
        }
    }

    /// Unwraps one layer of syntax; non-syntax values pass through.
    #[must_use]
    pub fn strip_syntax(&self, value: Value) -> Value {
        match value {
            Value::Object(id) => match self.get(id) {
                HeapData::Syntax(s) => s.value,
                _ => value,
            },
            _ => value,
        }
    }

    // ------------------------------------------------------------------
    // Equality.
    // ------------------------------------------------------------------

    /// Structural equality: recurses through pairs and arrays; everything
    /// else falls back to `eqv` identity (which interning makes exact for
    /// strings, symbols, and keywords).
    #[must_use]
    pub fn equal(&self, a: Value, b: Value) -> bool {
        if a.eqv(b) {
            return true;
        }
        match (a, b) {
            (Value::Object(ia), Value::Object(ib)) => match (self.get(ia), self.get(ib)) {
                (HeapData::Cons(ca), HeapData::Cons(cb)) => {
                    self.equal(ca.car, cb.car) && self.equal(ca.cdr, cb.cdr)
                }
                (HeapData::Array(xs), HeapData::Array(ys)) => {
                    xs.len() == ys.len() && xs.iter().zip(ys).all(|(&x, &y)| self.equal(x, y))
                }
                _ => false,
            },
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Collection.
    // ------------------------------------------------------------------

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Object(id) = value {
            self.mark_object(id);
        }
    }

    /// Sets the mark bit and queues the object for darkening if it can
    /// hold references to other objects.
    pub fn mark_object(&mut self, id: HeapId) {
        let Slot::Occupied { data, marked } = &mut self.slots[id.index()] else {
            panic!("marking freed heap slot {}", id.0);
        };
        if *marked {
            return;
        }
        *marked = true;

        let has_children = !matches!(
            data,
            HeapData::String(_)
                | HeapData::Keyword(_)
                | HeapData::NativeFunction(_)
                | HeapData::StackMarker(_)
                | HeapData::Port(_)
        );
        if has_children {
            self.gray.push(id);
        }
    }

    /// Drains the gray stack, darkening every queued object.
    pub fn trace(&mut self) {
        while let Some(id) = self.gray.pop() {
            self.darken(id);
        }
    }

    /// Marks everything `id` references. Children are gathered first so
    /// the borrow of `id`'s data ends before the marks mutate the arena.
    fn darken(&mut self, id: HeapId) {
        let mut pending: Vec<Value> = Vec::new();
        match self.get(id) {
            HeapData::Cons(c) => {
                pending.push(c.car);
                pending.push(c.cdr);
            }
            HeapData::Symbol(s) => pending.push(Value::Object(s.name)),
            HeapData::Syntax(s) => {
                pending.push(s.value);
                if let Some(file) = s.file_name {
                    pending.push(Value::Object(file));
                }
            }
            HeapData::Array(items) => pending.extend_from_slice(items),
            HeapData::Closure(c) => {
                pending.push(Value::Object(c.function));
                if let Some(module) = c.module {
                    pending.push(Value::Object(module));
                }
                pending.extend(c.upvalues.iter().map(|&u| Value::Object(u)));
            }
            HeapData::Function(f) => {
                if let Some(name) = f.name {
                    pending.push(Value::Object(name));
                }
                if let Some(file) = f.chunk.file_name {
                    pending.push(Value::Object(file));
                }
                pending.extend_from_slice(&f.chunk.constants);
                pending.extend(f.keyword_params.iter().map(|p| Value::Object(p.name)));
            }
            HeapData::Upvalue(u) => {
                if let UpvalueSlot::Closed(value) = u.slot {
                    pending.push(value);
                }
            }
            HeapData::Continuation(c) => {
                pending.extend(c.frames.iter().map(|f| Value::Object(f.closure)));
                pending.extend_from_slice(&c.stack);
            }
            HeapData::Module(m) => {
                pending.push(Value::Object(m.name));
                for (&name, &value) in &m.locals {
                    pending.push(Value::Object(name));
                    pending.push(value);
                }
                pending.extend(m.imports.iter().map(|&i| Value::Object(i)));
                pending.extend(m.exports.iter().map(|&e| Value::Object(e)));
                if let Some(init) = m.init_function {
                    pending.push(Value::Object(init));
                }
            }
            HeapData::Record(r) => {
                pending.push(Value::Object(r.name));
                pending.extend(r.fields.iter().map(|&f| Value::Object(f)));
            }
            HeapData::RecordField(f) => {
                pending.push(Value::Object(f.name));
                pending.push(f.default_value);
            }
            HeapData::RecordAccessor(a) => pending.push(Value::Object(a.record_type)),
            HeapData::RecordSetter(s) => pending.push(Value::Object(s.record_type)),
            HeapData::RecordPredicate(p) => pending.push(Value::Object(p.record_type)),
            HeapData::RecordInstance(i) => {
                pending.push(Value::Object(i.record_type));
                pending.extend_from_slice(&i.field_values);
            }
            HeapData::Pointer(p) => {
                let mut mark = |value: Value| pending.push(value);
                p.trace(&mut mark);
            }
            HeapData::String(_)
            | HeapData::Keyword(_)
            | HeapData::NativeFunction(_)
            | HeapData::StackMarker(_)
            | HeapData::Port(_) => {}
        }
        for value in pending {
            self.mark_value(value);
        }
    }

    /// Returns whether the object survived the mark phase. Used by the
    /// intern tables to scrub entries whose key object is about to die.
    #[must_use]
    pub fn is_marked(&self, id: HeapId) -> bool {
        matches!(self.slots.get(id.index()), Some(Slot::Occupied { marked: true, .. }))
    }

    /// Frees every unmarked slot and clears the marks on survivors.
    pub fn sweep(&mut self) {
        let mut freed_bytes = 0usize;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Slot::Occupied { data, marked } = slot else {
                continue;
            };
            if *marked {
                *marked = false;
            } else {
                freed_bytes += estimate_size(data);
                *slot = Slot::Vacant;
                self.free
                    .push(u32::try_from(index).expect("heap exceeded u32 slot indices"));
            }
        }
        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed_bytes);
        self.next_gc = (self.bytes_allocated * 2).max(HEAP_GROW_FLOOR);
    }

    // ------------------------------------------------------------------
    // Rendering.
    // ------------------------------------------------------------------

    /// Renders a value to a string in the given style.
    #[must_use]
    pub fn format_value(&self, value: Value, style: PrintStyle) -> String {
        let mut out = String::new();
        self.write_value(&mut out, value, style);
        out
    }

    fn write_value(&self, out: &mut String, value: Value, style: PrintStyle) {
        match value {
            Value::Unspecified => {}
            Value::Bool(true) => out.push_str("#t"),
            Value::Bool(false) => out.push_str("#f"),
            Value::Number(n) => write_number(out, n),
            Value::Char(c) => match style {
                PrintStyle::Display => out.push(c as char),
                PrintStyle::Write => {
                    let _ = match c {
                        b' ' => write!(out, "#\\space"),
                        b'\n' => write!(out, "#\\newline"),
                        b'\t' => write!(out, "#\\tab"),
                        _ => write!(out, "#\\{}", c as char),
                    };
                }
            },
            Value::Empty => out.push_str("()"),
            Value::Eof => out.push_str("#<eof>"),
            Value::Object(id) => self.write_object(out, id, style),
        }
    }

    fn write_object(&self, out: &mut String, id: HeapId, style: PrintStyle) {
        match self.get(id) {
            HeapData::String(s) => match style {
                PrintStyle::Display => out.push_str(s),
                PrintStyle::Write => {
                    out.push('"');
                    for c in s.chars() {
                        match c {
                            '"' => out.push_str("\\\""),
                            '\\' => out.push_str("\\\\"),
                            '\n' => out.push_str("\\n"),
                            '\t' => out.push_str("\\t"),
                            _ => out.push(c),
                        }
                    }
                    out.push('"');
                }
            },
            HeapData::Symbol(s) => out.push_str(self.string(s.name)),
            HeapData::Keyword(k) => {
                out.push(':');
                out.push_str(k);
            }
            HeapData::Syntax(s) => {
                // Syntax prints transparently as its datum.
                self.write_value(out, s.value, style);
            }
            HeapData::Cons(_) => self.write_list(out, id, style),
            HeapData::Array(items) => {
                out.push_str("#(");
                for (i, &item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    self.write_value(out, item, style);
                }
                out.push(')');
            }
            HeapData::Function(f) => self.write_function_name(out, f),
            HeapData::Closure(c) => self.write_function_name(out, self.function(c.function)),
            HeapData::Upvalue(_) => out.push_str("#<upvalue>"),
            HeapData::StackMarker(_) => out.push_str("#<stack marker>"),
            HeapData::Continuation(_) => out.push_str("#<continuation>"),
            HeapData::NativeFunction(_) => out.push_str("#<native function>"),
            HeapData::Pointer(_) => out.push_str("#<pointer>"),
            HeapData::Module(m) => {
                let _ = write!(out, "#<module ({})>", self.string(m.name));
            }
            HeapData::Record(r) => {
                let _ = write!(out, "#<record-type {}>", self.string(r.name));
            }
            HeapData::RecordField(f) => {
                let _ = write!(out, "#<record-field {}>", self.string(f.name));
            }
            HeapData::RecordAccessor(a) => {
                let _ = write!(out, "#<record-accessor {}>", self.string(self.record(a.record_type).name));
            }
            HeapData::RecordSetter(s) => {
                let _ = write!(out, "#<record-setter {}>", self.string(self.record(s.record_type).name));
            }
            HeapData::RecordPredicate(p) => {
                let _ = write!(out, "#<record-predicate {}>", self.string(self.record(p.record_type).name));
            }
            HeapData::RecordInstance(i) => {
                let _ = write!(out, "#<record {}>", self.string(self.record(i.record_type).name));
            }
            HeapData::Port(_) => out.push_str("#<port>"),
        }
    }

    fn write_function_name(&self, out: &mut String, function: &Function) {
        match function.name {
            Some(name) => {
                let _ = write!(out, "#<function {}>", self.string(name));
            }
            None => out.push_str("#<function>"),
        }
    }

    fn write_list(&self, out: &mut String, head: HeapId, style: PrintStyle) {
        out.push('(');
        let mut current = head;
        loop {
            let cons = self.cons(current);
            self.write_value(out, self.strip_syntax(cons.car), style);
            match self.strip_syntax(cons.cdr) {
                Value::Empty => break,
                Value::Object(next) if matches!(self.get(next), HeapData::Cons(_)) => {
                    out.push(' ');
                    current = next;
                }
                tail => {
                    out.push_str(" . ");
                    self.write_value(out, tail, style);
                    break;
                }
            }
        }
        out.push(')');
    }
}

/// Numbers with no fractional part print as integers; everything else
/// goes through ryu's shortest representation.
fn write_number(out: &mut String, n: f64) {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        let _ = write!(out, "{}", n as i64);
    } else {
        let mut buffer = ryu::Buffer::new();
        out.push_str(buffer.format(n));
    }
}

/// Rough per-object footprint for the collection trigger. Exactness does
/// not matter; the doubling threshold absorbs estimation error.
fn estimate_size(data: &HeapData) -> usize {
    let base = std::mem::size_of::<HeapData>();
    base + match data {
        HeapData::String(s) | HeapData::Keyword(s) => s.len(),
        HeapData::Array(items) => items.capacity() * std::mem::size_of::<Value>(),
        HeapData::Function(f) => {
            f.chunk.code.capacity()
                + f.chunk.lines.capacity() * 4
                + f.chunk.constants.capacity() * std::mem::size_of::<Value>()
        }
        HeapData::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<HeapId>(),
        HeapData::Continuation(c) => {
            c.stack.capacity() * std::mem::size_of::<Value>() + c.frames.capacity() * 32
        }
        HeapData::Module(m) => m.locals.len() * 24,
        HeapData::RecordInstance(i) => i.field_values.capacity() * std::mem::size_of::<Value>(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_reuses_swept_slots() {
        let mut heap = Heap::new();
        let a = heap.alloc(HeapData::Cons(Cons {
            car: Value::Number(1.0),
            cdr: Value::Empty,
        }));
        let b = heap.alloc(HeapData::Cons(Cons {
            car: Value::Number(2.0),
            cdr: Value::Empty,
        }));
        assert_eq!(heap.live_objects(), 2);

        // Mark only `b`; `a`'s slot should be recycled by the next alloc.
        heap.mark_object(b);
        heap.trace();
        heap.sweep();
        assert_eq!(heap.live_objects(), 1);

        let c = heap.alloc(HeapData::Cons(Cons {
            car: Value::Number(3.0),
            cdr: Value::Empty,
        }));
        assert_eq!(c, a);
        assert_eq!(heap.live_objects(), 2);
    }

    #[test]
    fn marking_traces_through_cons_chains() {
        let mut heap = Heap::new();
        let tail = heap.alloc(HeapData::Cons(Cons {
            car: Value::Number(2.0),
            cdr: Value::Empty,
        }));
        let head = heap.alloc(HeapData::Cons(Cons {
            car: Value::Number(1.0),
            cdr: Value::Object(tail),
        }));

        heap.mark_object(head);
        heap.trace();
        assert!(heap.is_marked(tail));
        heap.sweep();
        assert_eq!(heap.live_objects(), 2);
    }

    #[test]
    fn structural_equality_recurses_into_pairs() {
        let mut heap = Heap::new();
        let a = heap.alloc(HeapData::Cons(Cons {
            car: Value::Number(1.0),
            cdr: Value::Empty,
        }));
        let b = heap.alloc(HeapData::Cons(Cons {
            car: Value::Number(1.0),
            cdr: Value::Empty,
        }));
        assert!(heap.equal(Value::Object(a), Value::Object(b)));
        assert!(!Value::Object(a).eqv(Value::Object(b)));
    }

    #[test]
    fn numbers_render_like_integers_when_whole() {
        let mut out = String::new();
        write_number(&mut out, 4.0);
        assert_eq!(out, "4");
        out.clear();
        write_number(&mut out, 2.5);
        assert_eq!(out, "2.5");
    }
}
