//! `(muscat array)`: growable vectors with index access.

use crate::{
    error::RuntimeError,
    heap::{HeapData, HeapId},
    native::{expect_arg_count, expect_number, NativeError},
    value::Value,
    vm::Vm,
};

pub fn register(vm: &mut Vm) -> Result<(), RuntimeError> {
    vm.define_native_funcs(
        "muscat array",
        &[
            ("make-array", make_array, true),
            ("array-push", array_push, true),
            ("array-length", array_length, true),
            ("array-nth", array_nth, true),
            ("array-nth-set!", array_nth_set, true),
        ],
    )
}

/// `(make-array)` creates an empty array; `(make-array n)` creates one
/// with `n` slots initialized to `#f`.
fn make_array(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let length = match args.len() {
        0 => 0,
        1 => {
            let length = expect_number("make-array", args, 0)?;
            if length < 0.0 {
                return Err(NativeError::new("make-array: expected a non-negative length"));
            }
            length as usize
        }
        _ => {
            return Err(NativeError::new(format!(
                "make-array: expected 0 or 1 arguments but got {}",
                args.len()
            )))
        }
    };
    let id = vm.alloc(HeapData::Array(vec![Value::FALSE; length]));
    Ok(Value::Object(id))
}

fn array_push(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("array-push", args, 2)?;
    let array = expect_array(vm, "array-push", args[0])?;
    vm.heap_mut().array_mut(array).push(args[1]);
    Ok(args[1])
}

fn array_length(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("array-length", args, 1)?;
    let array = expect_array(vm, "array-length", args[0])?;
    Ok(Value::Number(vm.heap().array(array).len() as f64))
}

fn array_nth(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("array-nth", args, 2)?;
    let array = expect_array(vm, "array-nth", args[0])?;
    let index = expect_number("array-nth", args, 1)? as usize;
    vm.heap()
        .array(array)
        .get(index)
        .copied()
        .ok_or_else(|| NativeError::new(format!("array-nth: index {index} is out of bounds")))
}

fn array_nth_set(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("array-nth-set!", args, 3)?;
    let array = expect_array(vm, "array-nth-set!", args[0])?;
    let index = expect_number("array-nth-set!", args, 1)? as usize;
    let items = vm.heap_mut().array_mut(array);
    if index >= items.len() {
        return Err(NativeError::new(format!(
            "array-nth-set!: index {index} is out of bounds"
        )));
    }
    items[index] = args[2];
    Ok(args[2])
}

fn expect_array(vm: &Vm, name: &str, value: Value) -> Result<HeapId, NativeError> {
    vm.heap()
        .as_array_id(value)
        .ok_or_else(|| NativeError::new(format!("{name}: expected an array")))
}
