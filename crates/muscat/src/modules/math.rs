//! `(muscat math)`: numeric helpers over the f64 value model.

use crate::{
    error::RuntimeError,
    native::{expect_arg_count, expect_number, NativeError},
    value::Value,
    vm::Vm,
};

pub fn register(vm: &mut Vm) -> Result<(), RuntimeError> {
    vm.define_native_funcs(
        "muscat math",
        &[
            ("abs", abs, true),
            ("floor", floor, true),
            ("ceiling", ceiling, true),
            ("min", min, true),
            ("max", max, true),
            ("sqrt", sqrt, true),
            ("expt", expt, true),
        ],
    )
}

fn abs(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("abs", args, 1)?;
    Ok(Value::Number(expect_number("abs", args, 0)?.abs()))
}

fn floor(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("floor", args, 1)?;
    Ok(Value::Number(expect_number("floor", args, 0)?.floor()))
}

fn ceiling(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("ceiling", args, 1)?;
    Ok(Value::Number(expect_number("ceiling", args, 0)?.ceil()))
}

fn min(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    if args.is_empty() {
        return Err(NativeError::new("min: expected at least 1 argument"));
    }
    let mut best = expect_number("min", args, 0)?;
    for index in 1..args.len() {
        best = best.min(expect_number("min", args, index)?);
    }
    Ok(Value::Number(best))
}

fn max(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    if args.is_empty() {
        return Err(NativeError::new("max: expected at least 1 argument"));
    }
    let mut best = expect_number("max", args, 0)?;
    for index in 1..args.len() {
        best = best.max(expect_number("max", args, index)?);
    }
    Ok(Value::Number(best))
}

fn sqrt(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("sqrt", args, 1)?;
    Ok(Value::Number(expect_number("sqrt", args, 0)?.sqrt()))
}

fn expt(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("expt", args, 2)?;
    let base = expect_number("expt", args, 0)?;
    let exponent = expect_number("expt", args, 1)?;
    Ok(Value::Number(base.powf(exponent)))
}
