//! The compiler: syntax trees to bytecode, in a single recursive pass
//! that also performs all lexical analysis.
//!
//! Each function being compiled gets a context holding its locals,
//! scope depth, upvalue descriptors, and recorded tail sites. Contexts
//! form a stack; upvalue resolution walks it outward. Every context's
//! in-progress function object is pushed onto the VM value stack for the
//! context's lifetime, so the collector can run at any allocation point
//! during compilation without reclaiming half-built functions.
//!
//! Tail calls are discovered, not predicted: forms with a tail position
//! (`begin`, `let`, `lambda` bodies, `if` branches, the last clause of
//! `and`/`or`) log the offset of a just-emitted `CALL`; sequential forms
//! reset the log around every non-final sub-expression. When a function
//! is finalized, each surviving offset is rewritten to `TAIL_CALL`.

use smallvec::SmallVec;

use crate::{
    bytecode::Opcode,
    error::{CompileError, Diagnostic},
    function::{FunctionType, KeywordParam},
    heap::{Cons, HeapData, HeapId},
    reader::Reader,
    scanner::TokenSubKind,
    value::Value,
    vm::Vm,
};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Sentinel for a recorded compile error; the diagnostics live on the
/// compiler, this just unwinds to the nearest top-level form.
struct CompileFail;

type CResult<T> = Result<T, CompileFail>;

#[derive(Clone, Copy)]
struct Local {
    name: Option<HeapId>,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

struct Context {
    function: HeapId,
    function_type: FunctionType,
    /// Lexically enclosing context. This is *not* always the previous
    /// stack entry: a lambda appearing in a `let` binding value is
    /// compiled while the let-body context is open, but its parent is
    /// the context the binding value belongs to.
    parent: Option<usize>,
    /// Set only on the top-level context of a module file; `:export`
    /// attributes record names here at compile time.
    module: Option<HeapId>,
    locals: Vec<Local>,
    scope_depth: u32,
    upvalues: Vec<UpvalueRef>,
    tail_sites: SmallVec<[usize; 8]>,
    /// Offset of the most recently emitted instruction, used to verify a
    /// tail-site candidate really is a `CALL` opcode and not an operand.
    last_instruction: Option<usize>,
}

#[derive(Default)]
struct DefineAttributes {
    is_export: bool,
}

/// Compiles a source string into a top-level script function.
pub fn compile_source(
    vm: &mut Vm,
    source: &str,
    file_name: Option<HeapId>,
) -> Result<HeapId, CompileError> {
    compile_top(vm, source, file_name, None)
}

/// Compiles a module source file; the file must contain a
/// `define-module` form.
pub fn compile_module(
    vm: &mut Vm,
    source: &str,
    file_name: Option<HeapId>,
    module: HeapId,
) -> Result<HeapId, CompileError> {
    compile_top(vm, source, file_name, Some(module))
}

fn compile_top(
    vm: &mut Vm,
    source: &str,
    file_name: Option<HeapId>,
    module: Option<HeapId>,
) -> Result<HeapId, CompileError> {
    let file_text = file_name.map(|id| vm.heap().string(id).to_string());
    let mut reader = Reader::new(source, file_name);
    let mut compiler = Compiler {
        vm,
        contexts: Vec::new(),
        diagnostics: Vec::new(),
        panic_mode: false,
        file_name,
        current_line: 1,
        saw_module_define: false,
    };
    compiler.begin_context(None, FunctionType::Script, module, None);

    let mut pop_previous = false;
    loop {
        let syntax = match reader.read_next(compiler.vm) {
            Ok(syntax) => syntax,
            Err(mut e) => {
                compiler.end_context();
                e.file = file_text.clone();
                return Err(e);
            }
        };
        if compiler.vm.heap().syntax(syntax).value.is_eof() {
            break;
        }

        compiler.vm.push(Value::Object(syntax));
        if pop_previous {
            compiler.emit_op(0, Opcode::Pop);
        }
        // Errors are recorded on the compiler; resynchronize at the next
        // top-level form.
        let _ = compiler.compile_expr(0, Value::Object(syntax));
        compiler.panic_mode = false;
        pop_previous = true;
        compiler.vm.pop();
    }

    if module.is_some() && !compiler.saw_module_define {
        compiler.diagnostics.push(Diagnostic {
            message: "A valid module definition was not found in the source file.".to_string(),
            line: compiler.current_line,
            lexeme: None,
        });
    }

    let (function, _) = compiler.end_context();
    if compiler.diagnostics.is_empty() {
        Ok(function)
    } else {
        Err(CompileError {
            diagnostics: compiler.diagnostics,
            file: file_text,
        })
    }
}

struct Compiler<'vm> {
    vm: &'vm mut Vm,
    contexts: Vec<Context>,
    diagnostics: Vec<Diagnostic>,
    panic_mode: bool,
    file_name: Option<HeapId>,
    current_line: u32,
    saw_module_define: bool,
}

impl Compiler<'_> {
    // ------------------------------------------------------------------
    // Contexts and scopes.
    // ------------------------------------------------------------------

    fn begin_context(
        &mut self,
        parent: Option<usize>,
        function_type: FunctionType,
        module: Option<HeapId>,
        name: Option<HeapId>,
    ) -> usize {
        let mut function = crate::function::Function::new(function_type);
        function.name = name;
        let function_id = self.vm.alloc(HeapData::Function(function));
        // Root the in-progress function for the context's lifetime.
        self.vm.push(Value::Object(function_id));

        self.contexts.push(Context {
            function: function_id,
            function_type,
            parent,
            module,
            // Slot 0 is reserved for the callee closure.
            locals: vec![Local {
                name: None,
                depth: 0,
                is_captured: false,
            }],
            scope_depth: 0,
            upvalues: Vec::new(),
            tail_sites: SmallVec::new(),
            last_instruction: None,
        });
        self.contexts.len() - 1
    }

    /// Finalizes the innermost context: patches recorded tail sites,
    /// emits the trailing `RETURN`, and unroots the function.
    fn end_context(&mut self) -> (HeapId, Vec<UpvalueRef>) {
        let ctx = self.contexts.pop().expect("unbalanced compiler contexts");
        if ctx.function_type == FunctionType::Function {
            let function = self.vm.heap_mut().function_mut(ctx.function);
            for &offset in &ctx.tail_sites {
                function.chunk.patch(offset, Opcode::TailCall as u8);
            }
        }
        {
            let line = self.current_line;
            let function = self.vm.heap_mut().function_mut(ctx.function);
            function.chunk.write(Opcode::Return as u8, line);
        }
        self.vm.pop();
        (ctx.function, ctx.upvalues)
    }

    fn begin_scope(&mut self, ctx: usize) {
        self.contexts[ctx].scope_depth += 1;
    }

    // ------------------------------------------------------------------
    // Emission.
    // ------------------------------------------------------------------

    fn chunk_len(&self, ctx: usize) -> usize {
        let function = self.contexts[ctx].function;
        self.vm.heap().function(function).chunk.len()
    }

    fn write_byte(&mut self, ctx: usize, byte: u8) {
        let function = self.contexts[ctx].function;
        let line = self.current_line;
        let file = self.file_name;
        let data = self.vm.heap_mut().function_mut(function);
        data.chunk.file_name = file;
        data.chunk.write(byte, line);
    }

    fn emit_op(&mut self, ctx: usize, op: Opcode) {
        self.contexts[ctx].last_instruction = Some(self.chunk_len(ctx));
        self.write_byte(ctx, op as u8);
    }

    fn emit_pair(&mut self, ctx: usize, op: Opcode, operand: u8) {
        self.emit_op(ctx, op);
        self.write_byte(ctx, operand);
    }

    fn emit_call(&mut self, ctx: usize, arg_count: u8, keyword_count: u8) {
        self.emit_op(ctx, Opcode::Call);
        self.write_byte(ctx, arg_count);
        self.write_byte(ctx, keyword_count);
    }

    fn patch_byte(&mut self, ctx: usize, offset: usize, byte: u8) {
        let function = self.contexts[ctx].function;
        self.vm.heap_mut().function_mut(function).chunk.patch(offset, byte);
    }

    /// Emits a jump with a placeholder offset, returning the offset of
    /// the operand bytes for later patching.
    fn emit_jump(&mut self, ctx: usize, op: Opcode) -> usize {
        self.emit_op(ctx, op);
        self.write_byte(ctx, 0xff);
        self.write_byte(ctx, 0xff);
        self.chunk_len(ctx) - 2
    }

    fn patch_jump(&mut self, ctx: usize, operand_offset: usize) -> CResult<()> {
        let jump = self.chunk_len(ctx) - operand_offset - 2;
        if jump > u16::MAX as usize {
            return Err(self.error("Jump target is too far away."));
        }
        let bytes = (jump as u16).to_be_bytes();
        self.patch_byte(ctx, operand_offset, bytes[0]);
        self.patch_byte(ctx, operand_offset + 1, bytes[1]);
        Ok(())
    }

    fn make_constant(&mut self, ctx: usize, value: Value) -> CResult<u8> {
        let function = self.contexts[ctx].function;
        let index = self.vm.heap_mut().function_mut(function).chunk.add_constant(value);
        u8::try_from(index).map_err(|_| self.error("Too many constants in one function."))
    }

    /// Constant index for a name string, reusing an existing entry for
    /// the same interned string when possible.
    fn name_constant(&mut self, ctx: usize, name: HeapId) -> CResult<u8> {
        let function = self.contexts[ctx].function;
        let value = Value::Object(name);
        let existing = self
            .vm
            .heap()
            .function(function)
            .chunk
            .constants
            .iter()
            .position(|&constant| constant == value);
        match existing {
            Some(index) => Ok(index as u8),
            None => self.make_constant(ctx, value),
        }
    }

    /// Emits the (syntax-stripped) datum of a syntax node as a constant.
    fn emit_constant_datum(&mut self, ctx: usize, syntax_value: Value) -> CResult<()> {
        let datum = self.vm.syntax_to_datum(syntax_value);
        let index = self.make_constant(ctx, datum)?;
        self.emit_pair(ctx, Opcode::Constant, index);
        Ok(())
    }

    /// Records the offset of a trailing `CALL` as a tail site. Callers
    /// invoke this at every tail position; sequential forms reset the
    /// recorded count around non-final sub-expressions so only the true
    /// final call survives to be patched.
    fn log_tail_site(&mut self, ctx: usize) {
        let Some(offset) = self.contexts[ctx].last_instruction else {
            return;
        };
        let function = self.contexts[ctx].function;
        let chunk = &self.vm.heap().function(function).chunk;
        if chunk.len() != offset + 3 || chunk.code[offset] != Opcode::Call as u8 {
            return;
        }
        let sites = &mut self.contexts[ctx].tail_sites;
        if sites.last() != Some(&offset) {
            sites.push(offset);
        }
    }

    // ------------------------------------------------------------------
    // Diagnostics.
    // ------------------------------------------------------------------

    fn error(&mut self, message: impl Into<String>) -> CompileFail {
        if !self.panic_mode {
            self.panic_mode = true;
            self.diagnostics.push(Diagnostic {
                message: message.into(),
                line: self.current_line,
                lexeme: None,
            });
        }
        CompileFail
    }

    // ------------------------------------------------------------------
    // Syntax probing.
    // ------------------------------------------------------------------

    /// Updates the current line when the value carries a position.
    fn track_line(&mut self, value: Value) {
        if let Some(id) = self.vm.heap().as_syntax_id(value) {
            self.current_line = self.vm.heap().syntax(id).line;
        }
    }

    fn datum(&self, value: Value) -> Value {
        self.vm.heap().strip_syntax(value)
    }

    fn expect_cons(&mut self, value: Value) -> CResult<HeapId> {
        self.track_line(value);
        let datum = self.datum(value);
        match self.vm.heap().as_cons_id(datum) {
            Some(id) => Ok(id),
            None => Err(self.error("Expected a list.")),
        }
    }

    /// Like [`Self::expect_cons`] but returns the pair's fields by value,
    /// ending the heap borrow at the call site.
    fn expect_pair(&mut self, value: Value) -> CResult<Cons> {
        let id = self.expect_cons(value)?;
        Ok(*self.vm.heap().cons(id))
    }

    fn expect_symbol(&mut self, value: Value) -> CResult<HeapId> {
        self.track_line(value);
        let datum = self.datum(value);
        match self.vm.heap().as_symbol_id(datum) {
            Some(id) => Ok(id),
            None => Err(self.error("Expected a symbol.")),
        }
    }

    fn maybe_symbol(&self, value: Value) -> Option<HeapId> {
        self.vm.heap().as_symbol_id(self.datum(value))
    }

    fn maybe_keyword(&self, value: Value) -> Option<HeapId> {
        self.vm.heap().as_keyword_id(self.datum(value))
    }

    fn maybe_string(&self, value: Value) -> Option<HeapId> {
        self.vm.heap().as_string_id(self.datum(value))
    }

    fn symbol_name(&self, symbol: HeapId) -> HeapId {
        self.vm.heap().symbol(symbol).name
    }

    fn symbol_sub_kind(&self, symbol: HeapId) -> TokenSubKind {
        self.vm.heap().symbol(symbol).sub_kind
    }

    // ------------------------------------------------------------------
    // Variable resolution.
    // ------------------------------------------------------------------

    fn resolve_local(&mut self, ctx: usize, name: HeapId) -> CResult<Option<u8>> {
        for i in (0..self.contexts[ctx].locals.len()).rev() {
            if self.contexts[ctx].locals[i].name == Some(name) {
                if self.contexts[ctx].locals[i].depth == -1 {
                    return Err(self.error("Referenced a variable before it was bound."));
                }
                return Ok(Some(i as u8));
            }
        }

        // A function can refer to itself by name through slot 0.
        let function = self.contexts[ctx].function;
        if self.vm.heap().function(function).name == Some(name) {
            return Ok(Some(0));
        }
        Ok(None)
    }

    fn resolve_upvalue(&mut self, ctx: usize, name: HeapId) -> CResult<Option<u8>> {
        let Some(parent) = self.contexts[ctx].parent else {
            return Ok(None);
        };

        if let Some(local) = self.resolve_local(parent, name)? {
            self.contexts[parent].locals[local as usize].is_captured = true;
            return Ok(Some(self.add_upvalue(ctx, local, true)?));
        }
        if let Some(upvalue) = self.resolve_upvalue(parent, name)? {
            return Ok(Some(self.add_upvalue(ctx, upvalue, false)?));
        }
        Ok(None)
    }

    fn add_upvalue(&mut self, ctx: usize, index: u8, is_local: bool) -> CResult<u8> {
        let reference = UpvalueRef { index, is_local };
        if let Some(existing) = self.contexts[ctx].upvalues.iter().position(|&u| u == reference) {
            return Ok(existing as u8);
        }
        if self.contexts[ctx].upvalues.len() == MAX_UPVALUES {
            return Err(self.error("Reached the limit of captures in one function."));
        }
        self.contexts[ctx].upvalues.push(reference);
        let function = self.contexts[ctx].function;
        self.vm.heap_mut().function_mut(function).upvalue_count += 1;
        Ok((self.contexts[ctx].upvalues.len() - 1) as u8)
    }

    fn declare_variable(&mut self, ctx: usize, name: HeapId) -> CResult<()> {
        if self.contexts[ctx].scope_depth == 0 {
            return Ok(());
        }
        // Reject duplicates within the same scope depth.
        let depth = self.contexts[ctx].scope_depth as i32;
        for i in (0..self.contexts[ctx].locals.len()).rev() {
            let local = self.contexts[ctx].locals[i];
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == Some(name) {
                return Err(self.error("Duplicate variable binding in the same scope."));
            }
        }
        if self.contexts[ctx].locals.len() == MAX_LOCALS {
            return Err(self.error("Too many local variables defined in one function."));
        }
        self.contexts[ctx].locals.push(Local {
            name: Some(name),
            depth: -1,
            is_captured: false,
        });
        Ok(())
    }

    fn mark_initialized(&mut self, ctx: usize) {
        if self.contexts[ctx].scope_depth == 0 {
            return;
        }
        let depth = self.contexts[ctx].scope_depth as i32;
        self.contexts[ctx]
            .locals
            .last_mut()
            .expect("mark_initialized with no locals")
            .depth = depth;
    }

    // ------------------------------------------------------------------
    // Expressions.
    // ------------------------------------------------------------------

    fn compile_expr(&mut self, ctx: usize, expr: Value) -> CResult<()> {
        let Some(syntax_id) = self.vm.heap().as_syntax_id(expr) else {
            return Err(self.error("Compiler expected a syntax object."));
        };
        let syntax = *self.vm.heap().syntax(syntax_id);
        self.current_line = syntax.line;

        match syntax.value {
            Value::Number(_) | Value::Char(_) => {
                let index = self.make_constant(ctx, syntax.value)?;
                self.emit_pair(ctx, Opcode::Constant, index);
                Ok(())
            }
            Value::Bool(true) => {
                self.emit_op(ctx, Opcode::True);
                Ok(())
            }
            Value::Bool(false) => {
                self.emit_op(ctx, Opcode::False);
                Ok(())
            }
            Value::Empty => {
                self.emit_op(ctx, Opcode::Empty);
                Ok(())
            }
            Value::Object(id) => {
                enum ExprKind {
                    Literal,
                    Symbol,
                    List,
                    Other,
                }
                let kind = match self.vm.heap().get(id) {
                    HeapData::String(_) | HeapData::Keyword(_) => ExprKind::Literal,
                    HeapData::Symbol(_) => ExprKind::Symbol,
                    HeapData::Cons(_) => ExprKind::List,
                    _ => ExprKind::Other,
                };
                match kind {
                    ExprKind::Literal => {
                        let index = self.make_constant(ctx, syntax.value)?;
                        self.emit_pair(ctx, Opcode::Constant, index);
                        Ok(())
                    }
                    ExprKind::Symbol => self.compile_identifier(ctx, id),
                    ExprKind::List => self.compile_list(ctx, id),
                    ExprKind::Other => Err(self.error("Unexpected expression object.")),
                }
            }
            _ => Err(self.error("Unexpected expression value.")),
        }
    }

    fn compile_identifier(&mut self, ctx: usize, symbol: HeapId) -> CResult<()> {
        let name = self.symbol_name(symbol);
        if let Some(slot) = self.resolve_local(ctx, name)? {
            self.emit_pair(ctx, Opcode::ReadLocal, slot);
        } else if let Some(slot) = self.resolve_upvalue(ctx, name)? {
            self.emit_pair(ctx, Opcode::ReadUpvalue, slot);
        } else {
            let constant = self.name_constant(ctx, name)?;
            self.emit_pair(ctx, Opcode::ReadGlobal, constant);
        }
        Ok(())
    }

    fn compile_list(&mut self, ctx: usize, cons_id: HeapId) -> CResult<()> {
        let cons = *self.vm.heap().cons(cons_id);
        let callee = cons.car;
        let args = cons.cdr;

        let symbol = self.maybe_symbol(callee);
        if let Some(symbol) = symbol {
            match self.symbol_sub_kind(symbol) {
                TokenSubKind::Or => return self.compile_and_or(ctx, args, Opcode::Jump),
                TokenSubKind::And => return self.compile_and_or(ctx, args, Opcode::JumpIfFalse),
                TokenSubKind::Lambda => return self.compile_lambda(ctx, args),
                TokenSubKind::Let => return self.compile_let(ctx, args),
                TokenSubKind::Define => return self.compile_define(ctx, args),
                TokenSubKind::Set => return self.compile_set(ctx, args),
                TokenSubKind::If => return self.compile_if(ctx, args),
                TokenSubKind::Begin => return self.compile_block(ctx, args),
                TokenSubKind::Quote => {
                    let list = self.expect_cons(args)?;
                    let quoted = self.vm.heap().cons(list).car;
                    return self.emit_constant_datum(ctx, quoted);
                }
                TokenSubKind::Apply => return self.compile_apply(ctx, args),
                TokenSubKind::Shift => return self.compile_shift(ctx, args),
                TokenSubKind::Reset => return self.compile_reset(ctx, args),
                TokenSubKind::DefineModule => return self.compile_define_module(ctx, args),
                TokenSubKind::ModuleImport => {
                    self.compile_module_name(ctx, args)?;
                    self.emit_op(ctx, Opcode::ImportModule);
                    return Ok(());
                }
                TokenSubKind::ModuleEnter => {
                    self.compile_module_name(ctx, args)?;
                    self.emit_op(ctx, Opcode::EnterModule);
                    return Ok(());
                }
                TokenSubKind::DefineRecordType => return self.compile_define_record_type(ctx, args),
                TokenSubKind::LoadFile => {
                    let list = self.expect_cons(args)?;
                    let path = self.vm.heap().cons(list).car;
                    self.compile_expr(ctx, path)?;
                    self.emit_op(ctx, Opcode::LoadFile);
                    return Ok(());
                }
                TokenSubKind::Break => {
                    self.emit_op(ctx, Opcode::Break);
                    return Ok(());
                }
                _ => {}
            }
        }

        let operator = symbol.map(|s| self.symbol_sub_kind(s)).filter(|sub| is_operator(*sub));
        if operator.is_none() {
            self.compile_expr(ctx, callee)?;
        }

        // Positional arguments, then keyword/value pairs. Operators
        // never take keywords.
        let mut arg_count: usize = 0;
        let mut keyword_count: usize = 0;
        let mut rest = args;
        loop {
            if self.datum(rest).is_empty() {
                break;
            }
            let item = self.expect_cons(rest)?;
            let item_cons = *self.vm.heap().cons(item);

            if operator.is_none() && self.maybe_keyword(item_cons.car).is_some() {
                self.compile_expr(ctx, item_cons.car)?;
                let value_item = self.expect_cons(item_cons.cdr).map_err(|fail| {
                    // Re-tag the generic message with something useful.
                    let _ = fail;
                    self.error_override("A keyword argument is missing its value.")
                })?;
                let value_cons = *self.vm.heap().cons(value_item);
                self.compile_expr(ctx, value_cons.car)?;
                keyword_count += 1;
                rest = value_cons.cdr;
            } else {
                self.compile_expr(ctx, item_cons.car)?;
                arg_count += 1;
                rest = item_cons.cdr;
            }
            if arg_count + keyword_count * 2 >= 255 {
                return Err(self.error("Cannot pass more than 255 arguments in a function call."));
            }
        }

        match operator {
            Some(sub) => self.compile_operator(ctx, sub, arg_count),
            None => {
                self.emit_call(ctx, arg_count as u8, keyword_count as u8);
                Ok(())
            }
        }
    }

    /// Replaces the most recent diagnostic (recorded by a failed expect)
    /// with a more specific message.
    fn error_override(&mut self, message: &str) -> CompileFail {
        if let Some(last) = self.diagnostics.last_mut() {
            last.message = message.to_string();
        }
        CompileFail
    }

    fn compile_operator(&mut self, ctx: usize, sub: TokenSubKind, operand_count: usize) -> CResult<()> {
        match sub {
            TokenSubKind::Plus | TokenSubKind::Star => {
                if operand_count == 0 {
                    return Err(self.error("Operator requires at least one operand."));
                }
                let op = if sub == TokenSubKind::Plus {
                    Opcode::Add
                } else {
                    Opcode::Multiply
                };
                for _ in 1..operand_count {
                    self.emit_op(ctx, op);
                }
            }
            TokenSubKind::Minus
            | TokenSubKind::Slash
            | TokenSubKind::Percent
            | TokenSubKind::GreaterThan
            | TokenSubKind::GreaterEqual
            | TokenSubKind::LessThan
            | TokenSubKind::LessEqual
            | TokenSubKind::Eqv
            | TokenSubKind::Equal
            | TokenSubKind::Cons => {
                if operand_count != 2 {
                    return Err(self.error("Operator requires exactly two operands."));
                }
                let op = match sub {
                    TokenSubKind::Minus => Opcode::Subtract,
                    TokenSubKind::Slash => Opcode::Divide,
                    TokenSubKind::Percent => Opcode::Modulo,
                    TokenSubKind::GreaterThan => Opcode::GreaterThan,
                    TokenSubKind::GreaterEqual => Opcode::GreaterEqual,
                    TokenSubKind::LessThan => Opcode::LessThan,
                    TokenSubKind::LessEqual => Opcode::LessEqual,
                    TokenSubKind::Eqv => Opcode::Eqv,
                    TokenSubKind::Equal => Opcode::Equal,
                    TokenSubKind::Cons => Opcode::Cons,
                    _ => unreachable!("filtered above"),
                };
                self.emit_op(ctx, op);
            }
            TokenSubKind::Not | TokenSubKind::Display => {
                if operand_count != 1 {
                    return Err(self.error("Operator requires exactly one operand."));
                }
                let op = if sub == TokenSubKind::Not {
                    Opcode::Not
                } else {
                    Opcode::Display
                };
                self.emit_op(ctx, op);
            }
            TokenSubKind::List => {
                self.emit_pair(ctx, Opcode::List, operand_count as u8);
            }
            _ => unreachable!("not an operator sub-kind"),
        }
        Ok(())
    }

    /// `begin` and every body sequence: sub-expressions separated by
    /// `POP`, with only the final expression's call logged as a tail
    /// site.
    fn compile_block(&mut self, ctx: usize, body: Value) -> CResult<()> {
        let previous_tail = self.contexts[ctx].tail_sites.len();
        let mut list = self.expect_cons(body)?;
        loop {
            self.contexts[ctx].tail_sites.truncate(previous_tail);
            let cons = *self.vm.heap().cons(list);
            self.compile_expr(ctx, cons.car)?;
            if self.datum(cons.cdr).is_empty() {
                self.log_tail_site(ctx);
                return Ok(());
            }
            self.emit_op(ctx, Opcode::Pop);
            list = self.expect_cons(cons.cdr)?;
        }
    }

    fn compile_if(&mut self, ctx: usize, args: Value) -> CResult<()> {
        let previous_tail = self.contexts[ctx].tail_sites.len();
        let cons = self.expect_pair(args)?;

        // Predicate; never a tail position.
        self.compile_expr(ctx, cons.car)?;
        let false_jump = self.emit_jump(ctx, Opcode::JumpIfFalse);
        self.contexts[ctx].tail_sites.truncate(previous_tail);

        // Truth path: drop the predicate value, evaluate, skip the else.
        self.emit_op(ctx, Opcode::Pop);
        let branch = self.expect_pair(cons.cdr)?;
        self.compile_expr(ctx, branch.car)?;
        self.log_tail_site(ctx);
        let end_jump = self.emit_jump(ctx, Opcode::Jump);

        // False path.
        self.patch_jump(ctx, false_jump)?;
        self.emit_op(ctx, Opcode::Pop);
        if self.datum(branch.cdr).is_empty() {
            self.emit_op(ctx, Opcode::False);
        } else {
            let else_branch = self.expect_pair(branch.cdr)?;
            self.compile_expr(ctx, else_branch.car)?;
            self.log_tail_site(ctx);
        }
        self.patch_jump(ctx, end_jump)
    }

    /// `and` and `or` share one shape: between expressions, `or` jumps
    /// to the end on truth (via an inverted `JUMP_IF_FALSE` pair) while
    /// `and` jumps to the end on falsehood.
    fn compile_and_or(&mut self, ctx: usize, args: Value, mode: Opcode) -> CResult<()> {
        let previous_tail = self.contexts[ctx].tail_sites.len();
        let is_or = mode == Opcode::Jump;
        let mut end_jumps: Vec<usize> = Vec::new();
        let mut exprs = args;
        let mut count = 0usize;

        while !self.datum(exprs).is_empty() {
            if count > 0 {
                if is_or {
                    // Falsey: fall through to the next expression.
                    // Truthy: keep the value and jump to the end.
                    let next_jump = self.emit_jump(ctx, Opcode::JumpIfFalse);
                    end_jumps.push(self.emit_jump(ctx, Opcode::Jump));
                    self.patch_jump(ctx, next_jump)?;
                } else {
                    end_jumps.push(self.emit_jump(ctx, Opcode::JumpIfFalse));
                }
                self.emit_op(ctx, Opcode::Pop);
            }
            self.contexts[ctx].tail_sites.truncate(previous_tail);
            let cons = self.expect_pair(exprs)?;
            self.compile_expr(ctx, cons.car)?;
            count += 1;
            exprs = cons.cdr;
        }

        if count == 0 {
            self.emit_op(ctx, if is_or { Opcode::False } else { Opcode::True });
        }
        self.log_tail_site(ctx);

        for jump in end_jumps {
            self.patch_jump(ctx, jump)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lambda and let.
    // ------------------------------------------------------------------

    fn compile_lambda(&mut self, ctx: usize, args: Value) -> CResult<()> {
        let cons = self.expect_pair(args)?;
        self.compile_lambda_inner(ctx, cons.car, cons.cdr, None)
    }

    /// Compiles a function body in a fresh context and emits the
    /// `CLOSURE` instruction (with its capture descriptors) in the
    /// parent.
    fn compile_lambda_inner(
        &mut self,
        ctx: usize,
        formals: Value,
        body: Value,
        name: Option<HeapId>,
    ) -> CResult<()> {
        let child = self.begin_context(Some(ctx), FunctionType::Function, None, name);
        self.begin_scope(child);
        let result = self
            .compile_formals(child, formals)
            .and_then(|()| self.compile_block(child, body));
        let (function, upvalues) = self.end_context();
        result?;

        let constant = self.make_constant(ctx, Value::Object(function))?;
        self.emit_pair(ctx, Opcode::Closure, constant);
        for upvalue in &upvalues {
            self.write_byte(ctx, u8::from(upvalue.is_local));
            self.write_byte(ctx, upvalue.index);
        }
        Ok(())
    }

    /// Parses a lambda list: positional symbols, an improper tail or
    /// `:rest` marker for the rest parameter, and `:keys` introducing
    /// keyword parameters (`sym` or `(sym default)`).
    fn compile_formals(&mut self, child: usize, formals: Value) -> CResult<()> {
        #[derive(PartialEq)]
        enum Mode {
            Positional,
            Rest,
            Keys,
        }
        let mut mode = Mode::Positional;
        let mut current = formals;

        loop {
            let datum = self.datum(current);
            if datum.is_empty() {
                break;
            }

            // A bare symbol is the whole-rest parameter (or the tail of
            // an improper formal list).
            if let Some(symbol) = self.maybe_symbol(current) {
                self.declare_param(child, symbol)?;
                let function = self.contexts[child].function;
                let data = self.vm.heap_mut().function_mut(function);
                data.arity += 1;
                data.rest_arg_index = data.arity;
                break;
            }

            let cons = self.expect_pair(current)?;
            if let Some(keyword) = self.maybe_keyword(cons.car) {
                match self.vm.heap().keyword_text(keyword) {
                    "rest" => mode = Mode::Rest,
                    "keys" => mode = Mode::Keys,
                    _ => return Err(self.error("Unexpected keyword in a lambda list.")),
                }
                current = cons.cdr;
                continue;
            }

            match mode {
                Mode::Positional | Mode::Rest => {
                    let symbol = self.expect_symbol(cons.car)?;
                    self.declare_param(child, symbol)?;
                    let function = self.contexts[child].function;
                    let (arity, rest_index) = {
                        let data = self.vm.heap_mut().function_mut(function);
                        data.arity += 1;
                        (data.arity, data.rest_arg_index)
                    };
                    if arity > 255 {
                        return Err(self.error("A function cannot have more than 255 parameters."));
                    }
                    if mode == Mode::Rest {
                        if rest_index > 0 {
                            return Err(self.error("A function cannot have more than one :rest parameter."));
                        }
                        self.vm.heap_mut().function_mut(function).rest_arg_index = arity;
                    }
                }
                Mode::Keys => {
                    let (symbol, default_index) = if let Some(symbol) = self.maybe_symbol(cons.car) {
                        (symbol, None)
                    } else {
                        let pair = self.expect_pair(cons.car)?;
                        let symbol = self.expect_symbol(pair.car)?;
                        let default_cons = self.expect_pair(pair.cdr)?;
                        let default = self.vm.syntax_to_datum(default_cons.car);
                        let index = self.make_constant(child, default)?;
                        (symbol, Some(index))
                    };
                    self.declare_param(child, symbol)?;
                    let name = self.symbol_name(symbol);
                    let function = self.contexts[child].function;
                    self.vm
                        .heap_mut()
                        .function_mut(function)
                        .keyword_params
                        .push(KeywordParam {
                            name,
                            default_index,
                        });
                }
            }
            current = cons.cdr;
        }
        Ok(())
    }

    fn declare_param(&mut self, ctx: usize, symbol: HeapId) -> CResult<()> {
        let name = self.symbol_name(symbol);
        self.declare_variable(ctx, name)?;
        self.mark_initialized(ctx);
        Ok(())
    }

    /// `let` desugars into an immediately invoked lambda: binding values
    /// are compiled in the *parent* context so they become the call's
    /// arguments. The `CLOSURE` instruction must precede those argument
    /// loads, so two bytes are reserved up front and backfilled (with
    /// inserted space for capture descriptors) once the body function is
    /// finalized.
    fn compile_let(&mut self, ctx: usize, args: Value) -> CResult<()> {
        let previous_tail = self.contexts[ctx].tail_sites.len();
        let mut list = self.expect_pair(args)?;

        // A named let binds the lambda's own name for recursion.
        let mut let_name = None;
        if let Some(symbol) = self.maybe_symbol(list.car) {
            let_name = Some(self.symbol_name(symbol));
            list = self.expect_pair(list.cdr)?;
        }

        let child = self.begin_context(Some(ctx), FunctionType::Function, None, let_name);
        self.begin_scope(child);

        let func_offset = self.chunk_len(ctx);
        self.write_byte(ctx, 0);
        self.write_byte(ctx, 0);

        let bindings_result = self.compile_let_bindings(ctx, child, list.car, previous_tail);
        let body_result = match bindings_result {
            Ok(arity) => self.compile_block(child, list.cdr).map(|()| arity),
            Err(fail) => Err(fail),
        };
        let (function, upvalues) = self.end_context();
        let arity = body_result?;

        // Backfill the reserved bytes, widening the gap for capture
        // descriptors when the body captured anything.
        if !upvalues.is_empty() {
            let line = self.current_line;
            let parent_function = self.contexts[ctx].function;
            self.vm
                .heap_mut()
                .function_mut(parent_function)
                .chunk
                .insert_space(func_offset + 2, upvalues.len() * 2, line);
        }
        let constant = self.make_constant(ctx, Value::Object(function))?;
        self.patch_byte(ctx, func_offset, Opcode::Closure as u8);
        self.patch_byte(ctx, func_offset + 1, constant);
        for (i, upvalue) in upvalues.iter().enumerate() {
            self.patch_byte(ctx, func_offset + 2 + i * 2, u8::from(upvalue.is_local));
            self.patch_byte(ctx, func_offset + 3 + i * 2, upvalue.index);
        }

        self.emit_call(ctx, arity as u8, 0);
        self.log_tail_site(ctx);
        Ok(())
    }

    /// Declares each binding name in the child context and compiles each
    /// binding value in the parent. Returns the binding count.
    fn compile_let_bindings(
        &mut self,
        ctx: usize,
        child: usize,
        bindings: Value,
        previous_tail: usize,
    ) -> CResult<usize> {
        let mut arity = 0usize;
        let mut current = bindings;
        while !self.datum(current).is_empty() {
            let entry = self.expect_pair(current)?;
            let binding = self.expect_pair(entry.car)?;

            let symbol = self.expect_symbol(binding.car)?;
            self.declare_param(child, symbol)?;
            arity += 1;
            if arity > 255 {
                return Err(self.error("A let cannot have more than 255 bindings."));
            }
            {
                let function = self.contexts[child].function;
                self.vm.heap_mut().function_mut(function).arity = arity;
            }

            let value = self.expect_pair(binding.cdr)?;
            self.compile_expr(ctx, value.car)?;
            // Binding values are call arguments, never tail sites.
            self.contexts[ctx].tail_sites.truncate(previous_tail);

            current = entry.cdr;
        }
        Ok(arity)
    }

    // ------------------------------------------------------------------
    // Definitions and assignment.
    // ------------------------------------------------------------------

    fn compile_define(&mut self, ctx: usize, args: Value) -> CResult<()> {
        let list = self.expect_pair(args)?;
        let mut attributes = DefineAttributes::default();

        if let Some(symbol) = self.maybe_symbol(list.car) {
            // (define name value attrs?)
            let name = self.symbol_name(symbol);
            let constant = self.variable_constant(ctx, name)?;
            let body = self.expect_pair(list.cdr)?;
            self.compile_expr(ctx, body.car)?;
            if !self.datum(body.cdr).is_empty() {
                self.parse_define_attributes(body.cdr, &mut attributes)?;
            }
            self.define_variable(ctx, constant, &attributes)
        } else {
            // (define (name formals...) attrs? body...)
            let signature = self.expect_pair(list.car)?;
            let symbol = self.expect_symbol(signature.car)?;
            let name = self.symbol_name(symbol);
            let constant = self.variable_constant(ctx, name)?;
            let body = self.parse_define_attributes(list.cdr, &mut attributes)?;
            self.compile_lambda_inner(ctx, signature.cdr, body, Some(name))?;
            self.define_variable(ctx, constant, &attributes)
        }
    }

    /// At script scope the name becomes a chunk constant for
    /// `DEFINE_GLOBAL`; at inner scopes it is declared as a local.
    fn variable_constant(&mut self, ctx: usize, name: HeapId) -> CResult<u8> {
        if self.contexts[ctx].scope_depth > 0 {
            self.declare_variable(ctx, name)?;
            Ok(0)
        } else {
            self.name_constant(ctx, name)
        }
    }

    fn define_variable(&mut self, ctx: usize, constant: u8, attributes: &DefineAttributes) -> CResult<()> {
        if self.contexts[ctx].scope_depth > 0 {
            self.mark_initialized(ctx);
            // The compiled value stays on the stack as the local's slot;
            // a separate result keeps body sequencing from popping it.
            let index = self.make_constant(ctx, Value::Unspecified)?;
            self.emit_pair(ctx, Opcode::Constant, index);
            return Ok(());
        }

        self.emit_pair(ctx, Opcode::DefineGlobal, constant);
        if attributes.is_export {
            if let Some(module) = self.contexts[ctx].module {
                let function = self.contexts[ctx].function;
                let name = self.vm.heap().function(function).chunk.constants[constant as usize];
                if let Value::Object(name_id) = name {
                    self.vm.heap_mut().module_mut(module).exports.push(name_id);
                }
            }
        }
        Ok(())
    }

    /// Consumes leading `:export`-style keywords and an optional
    /// docstring, returning the remaining body.
    fn parse_define_attributes(&mut self, mut body: Value, attributes: &mut DefineAttributes) -> CResult<Value> {
        loop {
            if self.datum(body).is_empty() {
                return Ok(body);
            }
            let cons = self.expect_pair(body)?;
            let Some(keyword) = self.maybe_keyword(cons.car) else {
                break;
            };
            if self.vm.heap().keyword_text(keyword) == "export" {
                attributes.is_export = true;
            }
            body = cons.cdr;
        }

        // A string counts as a docstring only when more body follows;
        // otherwise it is the value of the definition.
        let cons = self.expect_pair(body)?;
        if self.maybe_string(cons.car).is_some() && !self.datum(cons.cdr).is_empty() {
            body = cons.cdr;
        }
        Ok(body)
    }

    fn compile_set(&mut self, ctx: usize, args: Value) -> CResult<()> {
        let list = self.expect_pair(args)?;
        let symbol = self.expect_symbol(list.car)?;
        let name = self.symbol_name(symbol);

        let (op, operand) = if let Some(slot) = self.resolve_local(ctx, name)? {
            (Opcode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(ctx, name)? {
            (Opcode::SetUpvalue, slot)
        } else {
            (Opcode::SetGlobal, self.name_constant(ctx, name)?)
        };

        let value = self.expect_pair(list.cdr)?;
        self.compile_expr(ctx, value.car)?;
        self.emit_pair(ctx, op, operand);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Control operators.
    // ------------------------------------------------------------------

    fn compile_apply(&mut self, ctx: usize, args: Value) -> CResult<()> {
        let list = self.expect_pair(args)?;
        let rest = self.expect_pair(list.cdr)?;
        self.compile_expr(ctx, list.car)?;
        self.compile_expr(ctx, rest.car)?;
        self.emit_op(ctx, Opcode::Apply);
        Ok(())
    }

    /// `(reset (lambda () body))`: install the delimiter, then call the
    /// thunk. The trailing `NOP` keeps the call out of tail position so
    /// the delimiter's frame survives.
    fn compile_reset(&mut self, ctx: usize, args: Value) -> CResult<()> {
        let list = self.expect_pair(args)?;
        let lambda_form = self.expect_pair(list.car)?;
        let head = self.expect_symbol(lambda_form.car)?;
        if self.symbol_sub_kind(head) != TokenSubKind::Lambda {
            return Err(self.error("Expected a lambda expression after 'reset'."));
        }

        self.emit_op(ctx, Opcode::Reset);
        self.compile_lambda(ctx, lambda_form.cdr)?;
        self.emit_call(ctx, 0, 0);
        self.emit_op(ctx, Opcode::Nop);
        Ok(())
    }

    /// `(shift (lambda (k) body))`: the body closure is built first,
    /// `SHIFT` replaces the delimited context with the continuation, and
    /// the call hands it to the body as `k`.
    fn compile_shift(&mut self, ctx: usize, args: Value) -> CResult<()> {
        let list = self.expect_pair(args)?;
        let lambda_form = self.expect_pair(list.car)?;
        let head = self.expect_symbol(lambda_form.car)?;
        if self.symbol_sub_kind(head) != TokenSubKind::Lambda {
            return Err(self.error("Expected a lambda expression after 'shift'."));
        }

        self.compile_lambda(ctx, lambda_form.cdr)?;
        self.emit_op(ctx, Opcode::Shift);
        self.emit_call(ctx, 1, 0);
        self.emit_op(ctx, Opcode::Nop);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Modules and records.
    // ------------------------------------------------------------------

    /// Emits the dotted module name list as a single space-joined string
    /// constant.
    fn compile_module_name(&mut self, ctx: usize, syntax: Value) -> CResult<()> {
        let outer = self.expect_pair(syntax)?;
        let mut part = outer.car;
        let mut name = String::new();
        let mut count = 0usize;

        while !self.datum(part).is_empty() {
            let cons = self.expect_pair(part)?;
            let Some(symbol) = self.maybe_symbol(cons.car) else {
                return Err(self.error("Module names can only be comprised of symbols."));
            };
            if count > 0 {
                name.push(' ');
            }
            name.push_str(self.vm.heap().string(self.symbol_name(symbol)));
            count += 1;
            part = cons.cdr;
        }
        if count == 0 {
            return Err(self.error("No symbols were found where a module name was expected."));
        }

        let string = self.vm.intern_string(&name);
        let index = self.make_constant(ctx, Value::Object(string))?;
        self.emit_pair(ctx, Opcode::Constant, index);
        Ok(())
    }

    fn compile_define_module(&mut self, ctx: usize, args: Value) -> CResult<()> {
        let list = self.expect_pair(args)?;
        self.compile_module_name(ctx, args)?;
        self.emit_op(ctx, Opcode::DefineModule);
        self.saw_module_define = true;

        // Optional `(import (a b) ...)` clause.
        if self.datum(list.cdr).is_empty() {
            return Ok(());
        }
        let clause_item = self.expect_pair(list.cdr)?;
        let clause = self.expect_pair(clause_item.car)?;
        let head = self.expect_symbol(clause.car)?;
        if self.symbol_sub_kind(head) != TokenSubKind::Import {
            return Err(self.error("Expected 'import' inside of 'define-module'."));
        }

        let mut imports = clause.cdr;
        while !self.datum(imports).is_empty() {
            let item = self.expect_pair(imports)?;
            self.compile_module_name(ctx, imports)?;
            self.emit_op(ctx, Opcode::ImportModule);
            self.emit_op(ctx, Opcode::Pop);
            imports = item.cdr;
        }
        Ok(())
    }

    /// `(define-record-type name (fields f ...))` pushes the type name
    /// and each field's name and default, then `DEFINE_RECORD` builds
    /// the type and its generated bindings at runtime.
    fn compile_define_record_type(&mut self, ctx: usize, args: Value) -> CResult<()> {
        let list = self.expect_pair(args)?;
        self.expect_symbol(list.car)?;
        self.emit_constant_datum(ctx, list.car)?;

        let fields_item = self.expect_pair(list.cdr)?;
        let fields_form = self.expect_pair(fields_item.car)?;
        let head = self.expect_symbol(fields_form.car)?;
        if self.vm.heap().string(self.symbol_name(head)) != "fields" {
            return Err(self.error("Expected 'fields' after 'define-record-type'."));
        }

        let mut field_count = 0usize;
        let mut fields = fields_form.cdr;
        while !self.datum(fields).is_empty() {
            let item = self.expect_pair(fields)?;
            self.expect_symbol(item.car)?;
            self.emit_constant_datum(ctx, item.car)?;
            let default = self.make_constant(ctx, Value::FALSE)?;
            self.emit_pair(ctx, Opcode::Constant, default);
            field_count += 1;
            if field_count > 255 {
                return Err(self.error("A record cannot have more than 255 fields."));
            }
            fields = item.cdr;
        }

        self.emit_pair(ctx, Opcode::DefineRecord, field_count as u8);
        Ok(())
    }
}

fn is_operator(sub: TokenSubKind) -> bool {
    matches!(
        sub,
        TokenSubKind::Plus
            | TokenSubKind::Minus
            | TokenSubKind::Star
            | TokenSubKind::Slash
            | TokenSubKind::Percent
            | TokenSubKind::Not
            | TokenSubKind::GreaterThan
            | TokenSubKind::GreaterEqual
            | TokenSubKind::LessThan
            | TokenSubKind::LessEqual
            | TokenSubKind::Eqv
            | TokenSubKind::Equal
            | TokenSubKind::List
            | TokenSubKind::Cons
            | TokenSubKind::Display
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Opcode;

    fn compile(source: &str) -> (Vm, HeapId) {
        let mut vm = Vm::new(Vec::new());
        let function = compile_source(&mut vm, source, None).expect("compile failed");
        (vm, function)
    }

    fn code(vm: &Vm, function: HeapId) -> Vec<u8> {
        vm.heap().function(function).chunk.code.clone()
    }

    #[test]
    fn compiles_if_with_both_branches() {
        let (vm, function) = compile("(if #t (+ 3 1) 2)");
        let bytecode = code(&vm, function);
        let expected = [
            Opcode::True as u8,
            Opcode::JumpIfFalse as u8,
            0,
            9, // skip pop + two constants + add + jump
            Opcode::Pop as u8,
            Opcode::Constant as u8,
            0,
            Opcode::Constant as u8,
            1,
            Opcode::Add as u8,
            Opcode::Jump as u8,
            0,
            3,
            Opcode::Pop as u8,
            Opcode::Constant as u8,
            2,
            Opcode::Return as u8,
        ];
        assert_eq!(bytecode, expected);
    }

    #[test]
    fn or_chains_jumps_and_keeps_last_value() {
        let (vm, function) = compile("(or #f 2 3)");
        let bytecode = code(&vm, function);
        let jumps = bytecode
            .iter()
            .filter(|&&b| b == Opcode::JumpIfFalse as u8 || b == Opcode::Jump as u8)
            .count();
        assert!(jumps >= 4, "expected a jump chain, got {bytecode:?}");
        assert_eq!(*bytecode.last().unwrap(), Opcode::Return as u8);
    }

    #[test]
    fn only_the_final_call_becomes_a_tail_call() {
        let (vm, function) = compile("(define (f x) (g x) (g x))");
        // The defined function is the first constant of the script.
        let inner = vm.heap().function(function).chunk.constants[1];
        let inner_id = inner.as_object().expect("expected the compiled lambda");
        let inner_code = vm.heap().function(inner_id).chunk.code.clone();

        let calls = inner_code.iter().filter(|&&b| b == Opcode::Call as u8).count();
        let tail_calls = inner_code
            .iter()
            .filter(|&&b| b == Opcode::TailCall as u8)
            .count();
        assert_eq!(calls, 1);
        assert_eq!(tail_calls, 1);
    }

    #[test]
    fn let_compiles_to_an_immediate_closure_call() {
        let (vm, function) = compile("(let ((x 3) (y 4)) (+ x y))");
        let bytecode = code(&vm, function);
        assert_eq!(bytecode[0], Opcode::Closure as u8);
        // Two argument loads, then the call with two arguments.
        let call_at = bytecode
            .iter()
            .position(|&b| b == Opcode::Call as u8)
            .expect("let must end in a call");
        assert_eq!(bytecode[call_at + 1], 2);

        let body = vm.heap().function(function).chunk.constants
            [bytecode[1] as usize]
            .as_object()
            .expect("closure constant");
        let body_code = vm.heap().function(body).chunk.code.clone();
        let expected = [
            Opcode::ReadLocal as u8,
            1,
            Opcode::ReadLocal as u8,
            2,
            Opcode::Add as u8,
            Opcode::Return as u8,
        ];
        assert_eq!(body_code, expected);
    }

    #[test]
    fn named_let_sets_the_function_name() {
        let (vm, function) = compile("(let loop ((x 1)) x)");
        // Constant 0 is the binding value; the body closure follows it.
        let constants = &vm.heap().function(function).chunk.constants;
        let body = constants[1].as_object().expect("closure constant");
        let name = vm.heap().function(body).name.expect("named let function name");
        assert_eq!(vm.heap().string(name), "loop");
    }

    #[test]
    fn quote_emits_the_datum_as_a_constant() {
        let (vm, function) = compile("'(1 2)");
        let bytecode = code(&vm, function);
        assert_eq!(bytecode[0], Opcode::Constant as u8);
        let constant = vm.heap().function(function).chunk.constants[0];
        let rendered = vm.heap().format_value(constant, crate::heap::PrintStyle::Write);
        assert_eq!(rendered, "(1 2)");
    }

    #[test]
    fn compile_errors_report_the_line() {
        let mut vm = Vm::new(Vec::new());
        let error = compile_source(&mut vm, "(set! 3 4)", None).unwrap_err();
        assert_eq!(error.diagnostics.len(), 1);
        assert!(error.diagnostics[0].message.contains("symbol"));
    }

    #[test]
    fn panic_mode_recovers_at_the_next_top_level_form() {
        let mut vm = Vm::new(Vec::new());
        let error = compile_source(&mut vm, "(set! 3 4)\n(set! 5 6)", None).unwrap_err();
        assert_eq!(error.diagnostics.len(), 2);
    }
}
