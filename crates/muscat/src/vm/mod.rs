//! The virtual machine: call-frame stack, value stack, and the opcode
//! dispatch loop.
//!
//! One `Vm` owns everything: the heap, the intern tables, the module
//! registry, the open-upvalue list, and the standard ports. Multiple VMs
//! may coexist in a process; they share nothing.
//!
//! Allocation goes through [`Vm::alloc`], which runs a collection first
//! when the heap asks for one. Because a collection can therefore happen
//! at *any* allocation, code that holds freshly allocated objects in Rust
//! locals across another allocation must root them on the value stack
//! first. The reader, compiler, and the VM's own opcode handlers all
//! follow that discipline.

pub mod cont;
pub mod modules;
pub mod record;

mod call;

use std::path::PathBuf;

use ahash::AHashMap;

use crate::{
    bytecode::{disasm, Opcode},
    compiler::compile_source,
    error::{InterpretError, RuntimeError},
    function::{Closure, Upvalue, UpvalueSlot},
    heap::{Cons, Heap, HeapData, HeapId, PrintStyle, Symbol},
    intern::Interner,
    port::{Port, PortBackend},
    scanner::TokenSubKind,
    value::Value,
    vm::{
        cont::{MarkerKind, StackMarker},
        modules::Module,
    },
};

/// Maximum depth of the call-frame stack.
pub const FRAMES_MAX: usize = 64;
/// Maximum depth of the value stack.
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// One active function invocation.
///
/// `slots` indexes the callee closure's position on the value stack;
/// local slot 0 is the closure itself and slots 1.. are the arguments.
#[derive(Debug, Clone, Copy)]
pub struct CallFrame {
    pub closure: HeapId,
    pub ip: usize,
    pub slots: usize,
    pub total_arg_count: usize,
}

pub struct Vm {
    heap: Heap,
    interner: Interner,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Open upvalues ordered by descending stack slot.
    open_upvalues: Vec<HeapId>,
    modules: AHashMap<Box<str>, HeapId>,
    root_module: HeapId,
    core_module: Option<HeapId>,
    current_module: HeapId,
    current_reset_marker: HeapId,
    quote_symbol: HeapId,
    input_port: HeapId,
    output_port: HeapId,
    error_port: HeapId,
    load_paths: Vec<PathBuf>,
    program_args: Vec<String>,
    is_running: bool,
}

impl Vm {
    /// Creates a VM with the given program arguments (exposed to native
    /// functions) and the standard ports attached to the host streams.
    #[must_use]
    pub fn new(program_args: Vec<String>) -> Self {
        let mut heap = Heap::new();
        let mut interner = Interner::new();

        // None of these allocations can trigger a collection; the heap
        // only reports `should_collect` to the VM's wrapper.
        let quote_name = heap.alloc(HeapData::String("quote".into()));
        interner.insert_string("quote", quote_name);
        let quote_symbol = heap.alloc(HeapData::Symbol(Symbol {
            name: quote_name,
            sub_kind: TokenSubKind::Quote,
        }));
        interner.insert_symbol("quote", quote_symbol);

        let input_port = heap.alloc(HeapData::Port(Port::stdin()));
        let output_port = heap.alloc(HeapData::Port(Port::stdout()));
        let error_port = heap.alloc(HeapData::Port(Port::stderr()));

        let root_name = heap.alloc(HeapData::String("muscat-user".into()));
        interner.insert_string("muscat-user", root_name);
        let root_module = heap.alloc(HeapData::Module(Module::new(root_name)));

        let current_reset_marker = heap.alloc(HeapData::StackMarker(StackMarker {
            kind: MarkerKind::Reset,
            frame_index: 0,
        }));

        let mut modules = AHashMap::new();
        modules.insert("muscat-user".into(), root_module);

        Self {
            heap,
            interner,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: Vec::new(),
            modules,
            root_module,
            core_module: None,
            current_module: root_module,
            current_reset_marker,
            quote_symbol,
            input_port,
            output_port,
            error_port,
            load_paths: Vec::new(),
            program_args,
            is_running: false,
        }
    }

    // ------------------------------------------------------------------
    // Accessors.
    // ------------------------------------------------------------------

    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub(crate) fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    #[must_use]
    pub fn quote_symbol(&self) -> HeapId {
        self.quote_symbol
    }

    #[must_use]
    pub fn program_args(&self) -> &[String] {
        &self.program_args
    }

    #[must_use]
    pub fn current_module(&self) -> HeapId {
        self.current_module
    }

    pub fn set_current_module(&mut self, module: HeapId) {
        self.current_module = module;
    }

    pub(crate) fn set_core_module(&mut self, module: HeapId) {
        self.core_module = Some(module);
    }

    pub(crate) fn module_registry(&mut self) -> &mut AHashMap<Box<str>, HeapId> {
        &mut self.modules
    }

    pub(crate) fn load_path_roots(&self) -> &[PathBuf] {
        &self.load_paths
    }

    /// Adds a directory to the front-to-back module search path.
    pub fn add_load_path(&mut self, path: impl Into<PathBuf>) {
        self.load_paths.push(path.into());
    }

    /// Renders a value as `display` would print it.
    #[must_use]
    pub fn format_value(&self, value: Value) -> String {
        self.heap.format_value(value, PrintStyle::Display)
    }

    /// Redirects `display` output into an in-memory buffer; pair with
    /// [`Self::take_output`].
    pub fn use_string_output(&mut self) {
        let port = self.heap.port_mut(self.output_port);
        port.backend = PortBackend::StringOutput(String::new());
    }

    /// Takes everything written to a string output port since the last
    /// call. Returns an empty string when output is not redirected.
    pub fn take_output(&mut self) -> String {
        match &mut self.heap.port_mut(self.output_port).backend {
            PortBackend::StringOutput(buffer) => std::mem::take(buffer),
            _ => String::new(),
        }
    }

    pub(crate) fn write_output(&mut self, text: &str) {
        let port = self.output_port;
        self.heap.port_mut(port).write_str(text);
    }

    pub(crate) fn write_error(&mut self, text: &str) {
        let port = self.error_port;
        self.heap.port_mut(port).write_str(text);
    }

    // ------------------------------------------------------------------
    // Stack discipline.
    // ------------------------------------------------------------------

    #[inline]
    pub fn push(&mut self, value: Value) {
        debug_assert!(self.stack.len() < STACK_MAX, "value stack overflow");
        self.stack.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack popped below its base")
    }

    #[inline]
    #[must_use]
    pub fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    #[must_use]
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.current_reset_marker = self.alloc(HeapData::StackMarker(StackMarker {
            kind: MarkerKind::Reset,
            frame_index: 0,
        }));
    }

    // ------------------------------------------------------------------
    // Allocation and collection.
    // ------------------------------------------------------------------

    /// Allocates a heap object, running a collection first if the heap
    /// has grown past its threshold.
    pub fn alloc(&mut self, data: HeapData) -> HeapId {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc(data)
    }

    /// Runs a full mark-and-sweep collection immediately.
    pub fn collect_garbage(&mut self) {
        for &value in &self.stack {
            self.heap.mark_value(value);
        }
        for i in 0..self.frames.len() {
            let closure = self.frames[i].closure;
            self.heap.mark_object(closure);
        }
        for i in 0..self.open_upvalues.len() {
            let upvalue = self.open_upvalues[i];
            self.heap.mark_object(upvalue);
        }
        for &module in self.modules.values() {
            self.heap.mark_object(module);
        }
        self.heap.mark_object(self.root_module);
        self.heap.mark_object(self.current_module);
        if let Some(core) = self.core_module {
            self.heap.mark_object(core);
        }
        self.heap.mark_object(self.current_reset_marker);
        self.heap.mark_object(self.quote_symbol);
        self.heap.mark_object(self.input_port);
        self.heap.mark_object(self.output_port);
        self.heap.mark_object(self.error_port);

        self.heap.trace();
        self.interner.scrub_unmarked(&self.heap);
        self.heap.sweep();
    }

    // ------------------------------------------------------------------
    // Interning.
    // ------------------------------------------------------------------

    pub fn intern_string(&mut self, text: &str) -> HeapId {
        if let Some(id) = self.interner.lookup_string(text) {
            return id;
        }
        let id = self.alloc(HeapData::String(text.into()));
        self.interner.insert_string(text, id);
        id
    }

    pub fn intern_symbol(&mut self, name: &str, sub_kind: TokenSubKind) -> HeapId {
        if let Some(id) = self.interner.lookup_symbol(name) {
            return id;
        }
        let name_id = self.intern_string(name);
        self.push(Value::Object(name_id));
        let id = self.alloc(HeapData::Symbol(Symbol {
            name: name_id,
            sub_kind,
        }));
        self.pop();
        self.interner.insert_symbol(name, id);
        id
    }

    pub fn intern_keyword(&mut self, name: &str) -> HeapId {
        if let Some(id) = self.interner.lookup_keyword(name) {
            return id;
        }
        let id = self.alloc(HeapData::Keyword(name.into()));
        self.interner.insert_keyword(name, id);
        id
    }

    /// Recursively strips syntax wrappers, rebuilding cons chains as
    /// plain datums. The compiler uses this when emitting constants.
    pub fn syntax_to_datum(&mut self, value: Value) -> Value {
        let value = self.heap.strip_syntax(value);
        let Value::Object(id) = value else {
            return value;
        };
        let HeapData::Cons(cons) = self.heap.get(id) else {
            return value;
        };
        let (car, cdr) = (cons.car, cons.cdr);

        let car_datum = self.syntax_to_datum(car);
        self.push(car_datum);
        let cdr_datum = self.syntax_to_datum(cdr);
        self.push(cdr_datum);
        let rebuilt = self.alloc(HeapData::Cons(Cons {
            car: car_datum,
            cdr: cdr_datum,
        }));
        self.pop();
        self.pop();
        Value::Object(rebuilt)
    }

    // ------------------------------------------------------------------
    // Errors.
    // ------------------------------------------------------------------

    /// Builds a runtime error at the current frame's source position and
    /// unwinds the VM: the stack is reset and the run loop returns the
    /// error to its caller.
    pub(crate) fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let (line, file) = self.current_source_position();
        let error = RuntimeError {
            message: message.into(),
            line,
            file,
        };
        self.reset_stack();
        error
    }

    fn current_source_position(&self) -> (u32, Option<String>) {
        let Some(frame) = self.frames.last() else {
            return (0, None);
        };
        let function = self.heap.closure(frame.closure).function;
        let chunk = &self.heap.function(function).chunk;
        let line = chunk.line_at(frame.ip.saturating_sub(1));
        let file = chunk.file_name.map(|id| self.heap.string(id).to_string());
        (line, file)
    }

    // ------------------------------------------------------------------
    // Upvalues.
    // ------------------------------------------------------------------

    /// Finds or creates an open upvalue for the given stack slot, keeping
    /// the open list ordered by descending slot.
    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> HeapId {
        let mut insert_at = self.open_upvalues.len();
        for (i, &upvalue) in self.open_upvalues.iter().enumerate() {
            let open = self
                .heap
                .upvalue(upvalue)
                .open_slot()
                .expect("closed upvalue in the open list");
            if open > slot {
                continue;
            }
            if open == slot {
                return upvalue;
            }
            insert_at = i;
            break;
        }

        let created = self.alloc(HeapData::Upvalue(Upvalue {
            slot: UpvalueSlot::Open(slot),
        }));
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Closes every open upvalue at or above `threshold`, moving the
    /// captured value inline.
    pub(crate) fn close_upvalues(&mut self, threshold: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let slot = self
                .heap
                .upvalue(upvalue)
                .open_slot()
                .expect("closed upvalue in the open list");
            if slot < threshold {
                break;
            }
            let value = self.stack[slot];
            self.heap.upvalue_mut(upvalue).slot = UpvalueSlot::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // ------------------------------------------------------------------
    // Frame and instruction helpers.
    // ------------------------------------------------------------------

    pub(crate) fn current_closure(&self) -> HeapId {
        self.frames.last().expect("no active call frame").closure
    }

    /// The module bindings resolve against: the current closure's module,
    /// falling back to the VM-wide current module.
    pub(crate) fn frame_module(&self) -> HeapId {
        self.heap
            .closure(self.current_closure())
            .module
            .unwrap_or(self.current_module)
    }

    fn fetch_byte(&mut self) -> u8 {
        let frame = self.frames.last().expect("no active call frame");
        let function = self.heap.closure(frame.closure).function;
        let byte = self.heap.function(function).chunk.code[frame.ip];
        self.frames.last_mut().expect("no active call frame").ip += 1;
        byte
    }

    fn fetch_u16(&mut self) -> u16 {
        let hi = self.fetch_byte();
        let lo = self.fetch_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self) -> Value {
        let index = self.fetch_byte() as usize;
        let frame = self.frames.last().expect("no active call frame");
        let function = self.heap.closure(frame.closure).function;
        self.heap.function(function).chunk.constants[index]
    }

    fn read_string_constant(&mut self) -> Result<HeapId, RuntimeError> {
        let constant = self.read_constant();
        self.heap
            .as_string_id(constant)
            .ok_or_else(|| RuntimeError {
                message: "Corrupt chunk: expected a string constant.".to_string(),
                line: 0,
                file: None,
            })
    }

    // ------------------------------------------------------------------
    // Entry points.
    // ------------------------------------------------------------------

    /// Compiles and runs a source string, returning its final value.
    pub fn eval_string(&mut self, source: &str) -> Result<Value, InterpretError> {
        self.eval_source(source, None)
    }

    /// Reads, compiles, and runs a source file.
    pub fn eval_file(&mut self, path: &str) -> Result<Value, InterpretError> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            InterpretError::Compile(crate::error::CompileError::single(
                format!("Could not read {path}: {e}"),
                0,
            ))
        })?;
        self.eval_source(&source, Some(path))
    }

    fn eval_source(&mut self, source: &str, file_name: Option<&str>) -> Result<Value, InterpretError> {
        let file_id = file_name.map(|name| self.intern_string(name));
        if let Some(id) = file_id {
            self.push(Value::Object(id));
        }
        let compiled = compile_source(self, source, file_id);
        if file_id.is_some() {
            self.pop();
        }
        let function = compiled?;

        self.push(Value::Object(function));
        let closure = self.alloc(HeapData::Closure(Closure {
            function,
            module: None,
            upvalues: Vec::new(),
        }));
        self.pop();

        self.push(Value::Object(closure));
        self.call_value(Value::Object(closure), 0, 0, false)?;
        let value = self.run()?;
        self.pop();
        Ok(value)
    }

    /// Calls a callable value with a pre-built argument array, running
    /// the VM until the call returns.
    pub fn call_closure(&mut self, callee: Value, args: &[Value]) -> Result<Value, InterpretError> {
        self.push(callee);
        for &arg in args {
            self.push(arg);
        }
        let frames_before = self.frames.len();
        self.call_value(callee, args.len(), 0, false)?;
        if self.frames.len() == frames_before {
            // Native or record callable: completed synchronously.
            return Ok(self.pop());
        }
        let value = self.run()?;
        self.pop();
        Ok(value)
    }

    /// Registers the builtin native modules and installs `(muscat core)`
    /// as the global fallback scope.
    pub fn register_core_modules(&mut self) -> Result<(), RuntimeError> {
        crate::modules::core::register(self)?;
        crate::modules::list::register(self)?;
        crate::modules::string::register(self)?;
        crate::modules::math::register(self)?;
        crate::modules::array::register(self)?;
        let core = self.resolve_module("muscat core", false)?;
        self.set_core_module(core);
        Ok(())
    }

    /// Disassembles the compiled top level of a source string without
    /// running it.
    pub fn disassemble_source(&mut self, source: &str, file_name: Option<&str>) -> Result<String, InterpretError> {
        let file_id = file_name.map(|name| self.intern_string(name));
        if let Some(id) = file_id {
            self.push(Value::Object(id));
        }
        let compiled = compile_source(self, source, file_id);
        if file_id.is_some() {
            self.pop();
        }
        let function = compiled?;
        let chunk = &self.heap.function(function).chunk;
        Ok(disasm::disassemble_chunk(&self.heap, chunk, "script"))
    }

    // ------------------------------------------------------------------
    // The dispatch loop.
    // ------------------------------------------------------------------

    /// Runs until the frame that was on top at entry returns. Nested runs
    /// (module initialization, native re-entry) each get their own entry
    /// frame, so the loops unwind independently.
    pub(crate) fn run(&mut self) -> Result<Value, RuntimeError> {
        let entry_frame = self.frames.len() - 1;
        let was_running = self.is_running;
        self.is_running = true;
        let result = self.run_loop(entry_frame);
        self.is_running = was_running;
        result
    }

    fn run_loop(&mut self, entry_frame: usize) -> Result<Value, RuntimeError> {
        loop {
            let byte = self.fetch_byte();
            let Some(op) = Opcode::decode(byte) else {
                return Err(self.runtime_error(format!("Unknown opcode {byte:#04x}.")));
            };

            match op {
                Opcode::Nop => {}
                Opcode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                Opcode::True => self.push(Value::TRUE),
                Opcode::False => self.push(Value::FALSE),
                Opcode::Empty => self.push(Value::Empty),
                Opcode::Pop => {
                    self.pop();
                }
                Opcode::PopScope => {
                    let count = self.fetch_byte() as usize;
                    if count > 0 {
                        let result = self.pop();
                        for _ in 0..count {
                            self.pop();
                        }
                        self.push(result);
                    }
                }
                Opcode::Cons => {
                    let car = self.peek(1);
                    let cdr = self.peek(0);
                    let cons = self.alloc(HeapData::Cons(Cons { car, cdr }));
                    self.pop();
                    self.pop();
                    self.push(Value::Object(cons));
                }
                Opcode::List => {
                    let count = self.fetch_byte() as usize;
                    self.op_list(count);
                }
                Opcode::Add => self.binary_number_op(op)?,
                Opcode::Subtract => self.binary_number_op(op)?,
                Opcode::Multiply => self.binary_number_op(op)?,
                Opcode::Divide => self.binary_number_op(op)?,
                Opcode::Modulo => {
                    let (a, b) = self.binary_number_operands()?;
                    if b == 0.0 {
                        return Err(self.runtime_error("Modulo by zero."));
                    }
                    self.push(Value::Number(((a as i64) % (b as i64)) as f64));
                }
                Opcode::Not => {
                    let value = self.pop();
                    self.push(Value::truth(value.is_falsey()));
                }
                Opcode::GreaterThan
                | Opcode::GreaterEqual
                | Opcode::LessThan
                | Opcode::LessEqual => self.binary_number_op(op)?,
                Opcode::Eqv => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::truth(a.eqv(b)));
                }
                Opcode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    let result = self.heap.equal(a, b);
                    self.push(Value::truth(result));
                }
                Opcode::Jump => {
                    let offset = self.fetch_u16() as usize;
                    self.frames.last_mut().expect("no active call frame").ip += offset;
                }
                Opcode::JumpIfFalse => {
                    let offset = self.fetch_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().expect("no active call frame").ip += offset;
                    }
                }
                Opcode::Return => {
                    let value = self.pop();
                    let frame = *self.frames.last().expect("no active call frame");
                    self.close_upvalues(frame.slots);

                    // Rewind to the frame base (leaving the callee on
                    // top) rather than counting arguments, so stray body
                    // values such as inner-define locals cannot misalign
                    // the caller's stack.
                    self.stack.truncate(frame.slots + 1);
                    self.frames.pop();

                    if self.frames.len() == entry_frame {
                        // Pop the entry callee and surface the result.
                        self.pop();
                        self.push(value);
                        return Ok(value);
                    }

                    self.pop(); // the callee closure

                    // Restore a reset marker pushed below this frame.
                    if self.heap.is_reset_marker(self.peek(0)) {
                        let marker = self.pop();
                        self.current_reset_marker =
                            marker.as_object().expect("reset marker must be an object");
                    }

                    self.push(value);
                }
                Opcode::Call => {
                    let arg_count = self.fetch_byte() as usize;
                    let keyword_count = self.fetch_byte() as usize;
                    let callee = self.peek(arg_count + keyword_count * 2);
                    self.call_value(callee, arg_count, keyword_count, false)?;
                }
                Opcode::TailCall => {
                    let arg_count = self.fetch_byte() as usize;
                    let keyword_count = self.fetch_byte() as usize;
                    let callee = self.peek(arg_count + keyword_count * 2);
                    self.call_value(callee, arg_count, keyword_count, true)?;
                }
                Opcode::Apply => self.op_apply()?,
                Opcode::Closure => self.op_closure(),
                Opcode::CloseUpvalue => {
                    // A scope block is ending: the last expression result
                    // sits above the local being closed.
                    self.close_upvalues(self.stack.len() - 2);
                    let result = self.pop();
                    self.pop();
                    self.push(result);
                }
                Opcode::ReadUpvalue => {
                    let slot = self.fetch_byte() as usize;
                    let upvalue = self.heap.closure(self.current_closure()).upvalues[slot];
                    let value = match self.heap.upvalue(upvalue).slot {
                        UpvalueSlot::Open(index) => self.stack[index],
                        UpvalueSlot::Closed(value) => value,
                    };
                    self.push(value);
                }
                Opcode::SetUpvalue => {
                    let slot = self.fetch_byte() as usize;
                    let upvalue = self.heap.closure(self.current_closure()).upvalues[slot];
                    let value = self.peek(0);
                    match self.heap.upvalue(upvalue).slot {
                        UpvalueSlot::Open(index) => self.stack[index] = value,
                        UpvalueSlot::Closed(_) => {
                            self.heap.upvalue_mut(upvalue).slot = UpvalueSlot::Closed(value);
                        }
                    }
                }
                Opcode::ReadLocal => {
                    let slot = self.fetch_byte() as usize;
                    let base = self.frames.last().expect("no active call frame").slots;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                Opcode::SetLocal => {
                    let slot = self.fetch_byte() as usize;
                    let base = self.frames.last().expect("no active call frame").slots;
                    let value = self.peek(0);
                    self.stack[base + slot] = value;
                }
                Opcode::ReadGlobal => {
                    let name = self.read_string_constant()?;
                    let module = self.frame_module();
                    let mut value = self.heap.module(module).locals.get(&name).copied();
                    if value.is_none() {
                        if let Some(core) = self.core_module {
                            value = self.heap.module(core).locals.get(&name).copied();
                        }
                    }
                    match value {
                        Some(value) => self.push(value),
                        None => {
                            let text = self.heap.string(name).to_string();
                            return Err(self.runtime_error(format!("Undefined variable '{text}'.")));
                        }
                    }
                }
                Opcode::DefineGlobal => {
                    let name = self.read_string_constant()?;
                    let module = self.frame_module();
                    let value = self.peek(0);
                    self.heap.module_mut(module).locals.insert(name, value);
                }
                Opcode::SetGlobal => {
                    let name = self.read_string_constant()?;
                    let module = self.frame_module();
                    if !self.heap.module(module).locals.contains_key(&name) {
                        let text = self.heap.string(name).to_string();
                        return Err(self.runtime_error(format!("Undefined variable '{text}'.")));
                    }
                    let value = self.peek(0);
                    self.heap.module_mut(module).locals.insert(name, value);
                }
                Opcode::DefineModule => self.op_define_module()?,
                Opcode::ImportModule => self.op_import_module()?,
                Opcode::EnterModule => self.op_enter_module()?,
                Opcode::ExportSymbol => {
                    let name = self.read_string_constant()?;
                    let module = self.frame_module();
                    self.heap.module_mut(module).exports.push(name);
                }
                Opcode::LoadFile => self.op_load_file()?,
                Opcode::DefineRecord => {
                    let field_count = self.fetch_byte() as usize;
                    self.op_define_record(field_count)?;
                }
                Opcode::Reset => self.op_reset(),
                Opcode::Shift => self.op_shift()?,
                Opcode::Reify => self.op_reify()?,
                Opcode::Display => {
                    let value = self.pop();
                    let text = self.heap.format_value(value, PrintStyle::Display);
                    self.write_output(&text);
                    self.push(Value::Unspecified);
                }
                Opcode::Break => {
                    let report = self.break_report();
                    self.write_error(&report);
                    return Err(self.runtime_error("Exiting due to `break`."));
                }
            }
        }
    }

    /// Builds `n` stacked values into a list, back to front.
    fn op_list(&mut self, count: usize) {
        if count == 0 {
            self.push(Value::Empty);
            return;
        }
        // Keep the list-in-progress on the stack so a collection during
        // cons allocation cannot reclaim it.
        self.push(Value::Empty);
        for _ in 0..count {
            let car = self.peek(1);
            let cdr = self.peek(0);
            let cons = self.alloc(HeapData::Cons(Cons { car, cdr }));
            self.pop(); // the previous list
            self.pop(); // the consumed value
            self.push(Value::Object(cons));
        }
    }

    fn op_closure(&mut self) {
        let constant = self.read_constant();
        let function_id = constant
            .as_object()
            .expect("CLOSURE constant must be a function");
        let module = self.frame_module();
        let upvalue_count = self.heap.function(function_id).upvalue_count;

        let closure = self.alloc(HeapData::Closure(Closure {
            function: function_id,
            module: Some(module),
            upvalues: Vec::with_capacity(upvalue_count),
        }));
        self.push(Value::Object(closure));

        for _ in 0..upvalue_count {
            let is_local = self.fetch_byte() == 1;
            let index = self.fetch_byte() as usize;
            let upvalue = if is_local {
                let base = self.frames.last().expect("no active call frame").slots;
                self.capture_upvalue(base + index)
            } else {
                self.heap.closure(self.current_closure()).upvalues[index]
            };
            self.heap.closure_mut(closure).upvalues.push(upvalue);
        }
    }

    fn op_load_file(&mut self) -> Result<(), RuntimeError> {
        let Some(path_id) = self.heap.as_string_id(self.peek(0)) else {
            return Err(self.runtime_error("load-file: expected a path string."));
        };
        let path = self.heap.string(path_id).to_string();
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(e) => return Err(self.runtime_error(format!("Could not load file {path}: {e}"))),
        };

        let file_id = self.intern_string(&path);
        self.push(Value::Object(file_id));
        let compiled = compile_source(self, &source, Some(file_id));
        self.pop();
        let function = match compiled {
            Ok(function) => function,
            Err(e) => {
                return Err(self.runtime_error(format!(
                    "Could not load file due to compilation error: {e}"
                )))
            }
        };

        self.push(Value::Object(function));
        let closure = self.alloc(HeapData::Closure(Closure {
            function,
            module: None,
            upvalues: Vec::new(),
        }));
        self.pop();

        // Replace the path argument with the callee so the script's
        // RETURN leaves its result where the path was.
        let top = self.stack.len() - 1;
        self.stack[top] = Value::Object(closure);
        self.call_value(Value::Object(closure), 0, 0, false)
    }

    fn binary_number_operands(&mut self) -> Result<(f64, f64), RuntimeError> {
        if self.peek(0).as_number().is_none() || self.peek(1).as_number().is_none() {
            return Err(self.runtime_error("Operands must be numbers."));
        }
        let b = self.pop().as_number().expect("checked above");
        let a = self.pop().as_number().expect("checked above");
        Ok((a, b))
    }

    fn binary_number_op(&mut self, op: Opcode) -> Result<(), RuntimeError> {
        let (a, b) = self.binary_number_operands()?;
        let result = match op {
            Opcode::Add => Value::Number(a + b),
            Opcode::Subtract => Value::Number(a - b),
            Opcode::Multiply => Value::Number(a * b),
            Opcode::Divide => Value::Number(a / b),
            Opcode::GreaterThan => Value::truth(a > b),
            Opcode::GreaterEqual => Value::truth(a >= b),
            Opcode::LessThan => Value::truth(a < b),
            Opcode::LessEqual => Value::truth(a <= b),
            _ => unreachable!("not a binary numeric opcode"),
        };
        self.push(result);
        Ok(())
    }

    /// Diagnostic dump for the `break` form: both stacks plus the
    /// current function's disassembly.
    fn break_report(&mut self) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        let _ = writeln!(out, "Value stack:");
        for (i, &value) in self.stack.iter().enumerate().rev() {
            let _ = writeln!(out, "  {i:3}: {}", self.heap.format_value(value, PrintStyle::Write));
        }
        let _ = writeln!(out, "Call stack:");
        for (i, frame) in self.frames.iter().enumerate() {
            let marker = self.heap.marker(self.current_reset_marker);
            let tag = if marker.frame_index == i { " [reset]" } else { "" };
            let _ = writeln!(
                out,
                "  {i:3}: {}{tag}",
                self.heap
                    .format_value(Value::Object(frame.closure), PrintStyle::Write)
            );
        }
        let function = self.heap.closure(self.current_closure()).function;
        let chunk = &self.heap.function(function).chunk;
        out.push_str(&disasm::disassemble_chunk(&self.heap, chunk, "current function"));
        out
    }
}
