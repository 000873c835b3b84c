//! Delimited one-shot continuations: `reset`, `shift`, and reification.
//!
//! `reset` installs a stack marker delimiting the context; `shift`
//! captures the frames and stack region above the nearest marker into a
//! [`Continuation`] and replaces them with a call to the shift body,
//! passing a one-argument reifier closure as `k`. Calling `k` splices
//! the captured frames and values back onto the live stacks, offsetting
//! each reified frame's slot base to its new position.

use crate::{
    bytecode::Opcode,
    error::RuntimeError,
    function::{Closure, Function, FunctionType},
    heap::HeapData,
    value::Value,
    vm::{CallFrame, FRAMES_MAX},
};

use super::Vm;

/// Which delimiter a stack marker represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Reset,
    Shift,
}

/// Tags a call-frame index as a delimiter boundary.
#[derive(Debug, Clone, Copy)]
pub struct StackMarker {
    pub kind: MarkerKind,
    pub frame_index: usize,
}

impl StackMarker {
    #[must_use]
    pub fn is_reset(&self) -> bool {
        self.kind == MarkerKind::Reset
    }
}

/// Owned copies of a contiguous frame slice and value-stack slice,
/// captured at a `shift` point. The frames' `slots` indices still refer
/// to the original stack positions; reification fixes them up with a
/// uniform offset.
pub struct Continuation {
    pub frames: Vec<CallFrame>,
    pub stack: Vec<Value>,
}

impl Vm {
    /// `RESET`: stash the previous marker on the value stack (the
    /// matching `RETURN` restores it) and delimit at the current frame.
    pub(crate) fn op_reset(&mut self) {
        let previous = self.current_reset_marker;
        self.push(Value::Object(previous));
        let marker = self.alloc(HeapData::StackMarker(StackMarker {
            kind: MarkerKind::Reset,
            frame_index: self.frames.len() - 1,
        }));
        self.current_reset_marker = marker;
    }

    /// `SHIFT`: capture everything above the nearest reset marker, cut
    /// the live stacks back to the delimiter, and leave the shift body
    /// plus its continuation argument set up for the following `CALL`.
    pub(crate) fn op_shift(&mut self) -> Result<(), RuntimeError> {
        let marker = *self.heap.marker(self.current_reset_marker);
        let start = marker.frame_index + 1;
        if start >= self.frames.len() {
            return Err(self.runtime_error("No reset point found for shift."));
        }

        // Close captured locals of the frames being captured so the
        // continuation sees them through their upvalues.
        let reset_slots = self.frames[start].slots;
        self.close_upvalues(reset_slots);

        // Copy frames and stack from the delimiter up to here, excluding
        // the shift body closure sitting on top.
        let captured_frames = self.frames[start..].to_vec();
        let captured_stack = self.stack[reset_slots..self.stack.len() - 1].to_vec();
        let continuation = self.alloc(HeapData::Continuation(Continuation {
            frames: captured_frames,
            stack: captured_stack,
        }));

        let shift_body = self.pop();
        self.frames.truncate(start);
        self.stack.truncate(reset_slots);
        self.push(shift_body);
        self.push(Value::Object(continuation));

        // Build the one-shot reifier: a unary function whose body
        // re-delimits, loads the continuation, and splices it in.
        let mut function = Function::new(FunctionType::Function);
        function.arity = 1;
        function.chunk.write(Opcode::Reset as u8, 0);
        function.chunk.write(Opcode::Constant as u8, 0);
        function.chunk.write(0, 0);
        function.chunk.write(Opcode::Reify as u8, 0);
        function.chunk.write(Opcode::Return as u8, 0);
        function.chunk.add_constant(Value::Object(continuation));

        let function_id = self.alloc(HeapData::Function(function));
        // The continuation is now reachable through the function's
        // constants; swap the rooted continuation for the function.
        let top = self.stack.len() - 1;
        self.stack[top] = Value::Object(function_id);

        let closure = self.alloc(HeapData::Closure(Closure {
            function: function_id,
            module: None,
            upvalues: Vec::new(),
        }));
        let top = self.stack.len() - 1;
        self.stack[top] = Value::Object(closure);

        // The compiler emitted `CALL 1 0` right after `SHIFT`, which now
        // calls the shift body with the reifier as its argument.
        Ok(())
    }

    /// `REIFY`: splice the captured frames and values onto the current
    /// stacks and resume just past the call site captured by `shift`.
    pub(crate) fn op_reify(&mut self) -> Result<(), RuntimeError> {
        let continuation_value = self.pop();
        let Some(cont_id) = continuation_value.as_object() else {
            return Err(self.runtime_error("REIFY expects a continuation."));
        };
        let marker = self.pop();
        let param = self.pop();
        self.push(param);
        self.push(marker);

        let (frames, stack) = {
            let continuation = self.heap.continuation(cont_id);
            (continuation.frames.clone(), continuation.stack.clone())
        };
        if self.frames.len() + frames.len() > FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }

        let target = self.frames.len();
        let original_slots = frames[0].slots;
        self.frames.extend(frames.iter().copied());

        // Skip the `CALL` following `SHIFT` in the captured frame so
        // execution resumes at the next instruction.
        self.frames
            .last_mut()
            .expect("reified continuation has at least one frame")
            .ip += 3;

        if !stack.is_empty() {
            let offset = self.stack.len() as isize - original_slots as isize;
            self.stack.extend(stack.iter().copied());
            for frame in &mut self.frames[target..] {
                let slots = frame.slots as isize + offset;
                frame.slots = usize::try_from(slots).expect("reified frame slots out of range");
            }
        }

        // The continuation's value: consumed by the resumed call site.
        self.push(param);
        Ok(())
    }
}
