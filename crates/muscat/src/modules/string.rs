//! `(muscat string)`: string construction and number conversion.

use crate::{
    error::RuntimeError,
    heap::PrintStyle,
    native::{expect_arg_count, NativeError},
    value::Value,
    vm::Vm,
};

pub fn register(vm: &mut Vm) -> Result<(), RuntimeError> {
    vm.define_native_funcs(
        "muscat string",
        &[
            ("string-append", string_append, true),
            ("string-length", string_length, true),
            ("number->string", number_to_string, true),
            ("string->number", string_to_number, true),
        ],
    )
}

fn string_append(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let mut combined = String::new();
    for &arg in args {
        let Some(id) = vm.heap().as_string_id(arg) else {
            return Err(NativeError::new("string-append: expected string arguments"));
        };
        combined.push_str(vm.heap().string(id));
    }
    Ok(Value::Object(vm.intern_string(&combined)))
}

fn string_length(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("string-length", args, 1)?;
    match vm.heap().as_string_id(args[0]) {
        Some(id) => Ok(Value::Number(vm.heap().string(id).len() as f64)),
        None => Err(NativeError::new("string-length: expected a string")),
    }
}

fn number_to_string(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("number->string", args, 1)?;
    if !matches!(args[0], Value::Number(_)) {
        return Err(NativeError::new("number->string: expected a number"));
    }
    let text = vm.heap().format_value(args[0], PrintStyle::Display);
    Ok(Value::Object(vm.intern_string(&text)))
}

fn string_to_number(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("string->number", args, 1)?;
    let Some(id) = vm.heap().as_string_id(args[0]) else {
        return Err(NativeError::new("string->number: expected a string"));
    };
    match vm.heap().string(id).trim().parse::<f64>() {
        Ok(number) => Ok(Value::Number(number)),
        Err(_) => Ok(Value::FALSE),
    }
}
