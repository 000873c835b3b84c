//! `(muscat list)`: list helpers beyond the core pair primitives.

use crate::{
    error::RuntimeError,
    native::{expect_arg_count, expect_number, NativeError},
    value::Value,
    vm::Vm,
};

use super::core::{build_list, list_elements};

pub fn register(vm: &mut Vm) -> Result<(), RuntimeError> {
    vm.define_native_funcs(
        "muscat list",
        &[
            ("length", length, true),
            ("list-ref", list_ref, true),
            ("nth", list_ref, true),
            ("reverse", reverse, true),
        ],
    )
}

fn length(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("length", args, 1)?;
    let elements = list_elements(vm, "length", args[0])?;
    Ok(Value::Number(elements.len() as f64))
}

fn list_ref(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("list-ref", args, 2)?;
    let elements = list_elements(vm, "list-ref", args[0])?;
    let index = expect_number("list-ref", args, 1)? as usize;
    elements
        .get(index)
        .copied()
        .ok_or_else(|| NativeError::new(format!("list-ref: index {index} is out of bounds")))
}

fn reverse(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("reverse", args, 1)?;
    let mut elements = list_elements(vm, "reverse", args[0])?;
    elements.reverse();
    Ok(build_list(vm, &elements))
}
