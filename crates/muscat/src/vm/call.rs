//! Callable dispatch and the calling convention.
//!
//! A call site pushes the callee, the positional arguments, and then any
//! keyword/value pairs. `call_value` dispatches on the callee's kind:
//! closures get a frame (or reuse the current one for tail calls),
//! native functions run synchronously, and record types/accessors/
//! setters/predicates are handled by the record module.
//!
//! Closure calls normalize the stack into the callee's canonical slot
//! layout: positional arguments, the rest list (or `#f`), then one slot
//! per declared keyword parameter in declaration order.

use smallvec::SmallVec;

use crate::{
    error::RuntimeError,
    function::{Closure, KeywordParam},
    heap::{Cons, HeapData, HeapId},
    native::NativeFn,
    value::Value,
    vm::{CallFrame, FRAMES_MAX},
};

use super::Vm;

enum CalleeKind {
    Closure,
    Function,
    Native(NativeFn),
    Record,
    RecordAccessor,
    RecordSetter,
    RecordPredicate,
    NotCallable(&'static str),
}

impl Vm {
    /// Dispatches a call. `arg_count` counts positional arguments and
    /// `keyword_count` counts keyword/value *pairs* sitting above them.
    pub(crate) fn call_value(
        &mut self,
        callee: Value,
        arg_count: usize,
        keyword_count: usize,
        is_tail: bool,
    ) -> Result<(), RuntimeError> {
        let kind = match callee {
            Value::Object(id) => match self.heap.get(id) {
                HeapData::Closure(_) => CalleeKind::Closure,
                HeapData::Function(_) => CalleeKind::Function,
                HeapData::NativeFunction(f) => CalleeKind::Native(*f),
                HeapData::Record(_) => CalleeKind::Record,
                HeapData::RecordAccessor(_) => CalleeKind::RecordAccessor,
                HeapData::RecordSetter(_) => CalleeKind::RecordSetter,
                HeapData::RecordPredicate(_) => CalleeKind::RecordPredicate,
                other => CalleeKind::NotCallable(other.kind_name()),
            },
            other => CalleeKind::NotCallable(other.kind_name()),
        };
        let id = callee.as_object();

        match kind {
            CalleeKind::Closure => self.call_closure_object(
                id.expect("closure callee"),
                arg_count,
                keyword_count,
                is_tail,
            ),
            CalleeKind::Function => {
                // A bare function reaches a call site only through the
                // embedding API; wrap it in a closure for the current
                // module and call that instead.
                let function = id.expect("function callee");
                let module = self.current_module;
                let closure = self.alloc(HeapData::Closure(Closure {
                    function,
                    module: Some(module),
                    upvalues: Vec::new(),
                }));
                let base = self.stack.len() - (arg_count + keyword_count * 2);
                self.stack[base - 1] = Value::Object(closure);
                self.call_closure_object(closure, arg_count, keyword_count, false)
            }
            CalleeKind::Native(function) => self.call_native(function, arg_count, keyword_count),
            CalleeKind::Record => {
                self.construct_record(id.expect("record callee"), arg_count, keyword_count)
            }
            CalleeKind::RecordAccessor => {
                self.call_record_accessor(id.expect("accessor callee"), arg_count + keyword_count * 2)
            }
            CalleeKind::RecordSetter => {
                self.call_record_setter(id.expect("setter callee"), arg_count + keyword_count * 2)
            }
            CalleeKind::RecordPredicate => {
                self.call_record_predicate(id.expect("predicate callee"), arg_count + keyword_count * 2)
            }
            CalleeKind::NotCallable(kind_name) => {
                Err(self.runtime_error(format!("Can only call functions (received {kind_name}).")))
            }
        }
    }

    fn call_closure_object(
        &mut self,
        closure_id: HeapId,
        arg_count: usize,
        keyword_count: usize,
        is_tail: bool,
    ) -> Result<(), RuntimeError> {
        let function_id = self.heap.closure(closure_id).function;
        let (arity, rest_index, keyword_params) = {
            let function = self.heap.function(function_id);
            (
                function.arity,
                function.rest_arg_index,
                function.keyword_params.clone(),
            )
        };

        // Arity checks differ when a rest parameter is present.
        if rest_index == 0 && arg_count != arity {
            return Err(self.runtime_error(format!(
                "Expected {arity} arguments but got {arg_count}."
            )));
        }
        if rest_index > 0 && arg_count + 1 < arity {
            return Err(self.runtime_error(format!(
                "Expected at least {} arguments but got {arg_count}.",
                arity - 1
            )));
        }

        let base = self.stack.len() - (arg_count + keyword_count * 2);
        let num_keyword_args = keyword_params.len();

        if keyword_count > 0 {
            self.bind_keyword_args(function_id, base, arg_count, keyword_count, &keyword_params)?;
        } else if num_keyword_args > 0 {
            // The callee declares keyword parameters but the caller
            // passed none: push each default in declared order.
            for param in &keyword_params {
                let value = self.keyword_default(function_id, param);
                self.push(value);
            }
        }

        if rest_index > 0 {
            self.bind_rest_arg(base, arg_count, arity, rest_index, num_keyword_args);
        }

        let effective_args = if rest_index > 0 { arity } else { arg_count };
        let total_arg_count = effective_args + num_keyword_args;

        if is_tail {
            // Reuse the current frame: close captured locals, slide the
            // callee and its arguments down over the old ones.
            let frame_slots = self.frames.last().expect("no active call frame").slots;
            self.close_upvalues(frame_slots);
            self.stack.copy_within(base - 1..base + total_arg_count, frame_slots);
            self.stack.truncate(frame_slots + 1 + total_arg_count);

            let frame = self.frames.last_mut().expect("no active call frame");
            frame.closure = closure_id;
            frame.ip = 0;
            frame.total_arg_count = total_arg_count;
        } else {
            if self.frames.len() >= FRAMES_MAX {
                return Err(self.runtime_error("Stack overflow."));
            }
            self.frames.push(CallFrame {
                closure: closure_id,
                ip: 0,
                slots: base - 1,
                total_arg_count,
            });
        }
        Ok(())
    }

    /// Lifts the caller's keyword pairs off the stack and pushes exactly
    /// one value per declared keyword parameter, in declaration order.
    fn bind_keyword_args(
        &mut self,
        function_id: HeapId,
        base: usize,
        arg_count: usize,
        keyword_count: usize,
        keyword_params: &[KeywordParam],
    ) -> Result<(), RuntimeError> {
        if keyword_params.is_empty() {
            return Err(self.runtime_error("Function does not accept keyword arguments."));
        }

        let keyword_start = base + arg_count;
        let pairs: SmallVec<[Value; 16]> = SmallVec::from_slice(&self.stack[keyword_start..]);
        self.stack.truncate(keyword_start);

        let mut matched: SmallVec<[bool; 8]> = SmallVec::from_elem(false, keyword_count);
        for param in keyword_params {
            let mut found = false;
            for pair in 0..keyword_count {
                let Some(keyword) = self.heap.as_keyword_id(pairs[pair * 2]) else {
                    return Err(self.runtime_error("Expected a keyword before a keyword argument value."));
                };
                if self.heap.keyword_text(keyword) == self.heap.string(param.name) {
                    self.push(pairs[pair * 2 + 1]);
                    matched[pair] = true;
                    found = true;
                    break;
                }
            }
            if !found {
                let value = self.keyword_default(function_id, param);
                self.push(value);
            }
        }

        // Anything the caller passed that no parameter consumed is an
        // error, not a silent drop.
        for (pair, was_matched) in matched.iter().enumerate() {
            if !was_matched {
                let name = match self.heap.as_keyword_id(pairs[pair * 2]) {
                    Some(keyword) => self.heap.keyword_text(keyword).to_string(),
                    None => "?".to_string(),
                };
                return Err(self.runtime_error(format!("Unknown keyword argument :{name}.")));
            }
        }
        Ok(())
    }

    fn keyword_default(&self, function_id: HeapId, param: &KeywordParam) -> Value {
        match param.default_index {
            Some(index) => self.heap.function(function_id).chunk.constants[index as usize],
            None => Value::FALSE,
        }
    }

    /// Folds trailing positional arguments into the rest-parameter list,
    /// or fills the rest slot with `#f` when nothing was passed for it.
    /// Keyword values shift to stay directly above the positional slots.
    fn bind_rest_arg(
        &mut self,
        base: usize,
        arg_count: usize,
        arity: usize,
        rest_index: usize,
        num_keyword_args: usize,
    ) {
        if arg_count >= arity {
            // Build the list right to left, keeping the partial list on
            // the stack so cons allocation cannot lose it.
            self.push(Value::Empty);
            let mut next = base + arg_count;
            while next > base + rest_index - 1 {
                next -= 1;
                let car = self.stack[next];
                let cdr = self.peek(0);
                let cons = self.alloc(HeapData::Cons(Cons { car, cdr }));
                let top = self.stack.len() - 1;
                self.stack[top] = Value::Object(cons);
            }
            let list = self.pop();
            self.stack[base + rest_index - 1] = list;

            // Slide keyword values down over the folded arguments.
            for k in 0..num_keyword_args {
                self.stack[base + arity + k] = self.stack[base + arg_count + k];
            }
            self.stack.truncate(base + arity + num_keyword_args);
        } else {
            // arg_count == arity - 1: nothing for the rest parameter.
            self.stack.insert(base + arity - 1, Value::FALSE);
        }
    }

    /// Runs a native synchronously: the arguments stay on the stack
    /// (rooted) for the duration of the call, then callee and arguments
    /// are replaced by the result.
    fn call_native(
        &mut self,
        function: NativeFn,
        arg_count: usize,
        keyword_count: usize,
    ) -> Result<(), RuntimeError> {
        let total = arg_count + keyword_count * 2;
        let base = self.stack.len() - total;
        let args: SmallVec<[Value; 8]> = SmallVec::from_slice(&self.stack[base..]);

        let result = match function(self, &args) {
            Ok(value) => value,
            Err(e) => return Err(self.runtime_error(e.message)),
        };

        self.stack.truncate(base - 1);
        self.push(result);
        Ok(())
    }

    /// `apply`: unrolls the argument list onto the stack and calls the
    /// function with the resulting positional count.
    pub(crate) fn op_apply(&mut self) -> Result<(), RuntimeError> {
        let callee = self.peek(1);
        let list = self.peek(0);

        let callable = matches!(
            callee,
            Value::Object(id) if matches!(
                self.heap.get(id),
                HeapData::Closure(_) | HeapData::NativeFunction(_) | HeapData::Function(_)
            )
        );
        if !callable {
            return Err(self.runtime_error("Cannot apply a non-function value."));
        }
        if !list.is_empty() && self.heap.as_cons_id(list).is_none() {
            return Err(self.runtime_error("Cannot apply a function to a non-list value."));
        }

        // The original list stays in its slot while we unroll, so the
        // cars remain rooted; it is sliced out afterwards.
        let list_slot = self.stack.len() - 1;
        let mut arg_count = 0usize;
        let mut current = list;
        while let Some(cons_id) = self.heap.as_cons_id(current) {
            let cons = *self.heap.cons(cons_id);
            self.push(cons.car);
            arg_count += 1;
            current = cons.cdr;
        }
        self.stack.remove(list_slot);

        self.call_value(callee, arg_count, 0, false)
    }
}
