//! `(muscat core)`: predicates, pair primitives, variadic arithmetic,
//! and the handful of conversions everything else leans on.

use crate::{
    error::RuntimeError,
    heap::{Cons, HeapData, PrintStyle},
    native::{expect_arg_count, expect_number, NativeError},
    scanner::TokenSubKind,
    value::Value,
    vm::Vm,
};

pub fn register(vm: &mut Vm) -> Result<(), RuntimeError> {
    vm.define_native_funcs(
        "muscat core",
        &[
            ("number?", number_p, true),
            ("boolean?", boolean_p, true),
            ("pair?", pair_p, true),
            ("string?", string_p, true),
            ("symbol?", symbol_p, true),
            ("keyword?", keyword_p, true),
            ("array?", array_p, true),
            ("function?", function_p, true),
            ("equal?", equal_p, true),
            ("eqv?", eqv_p, true),
            ("not", not, true),
            ("cons", cons, true),
            ("list", list, true),
            ("car", car, true),
            ("cdr", cdr, true),
            ("cadr", cadr, true),
            ("append", append, true),
            ("+", add, true),
            ("-", subtract, true),
            ("*", multiply, true),
            ("/", divide, true),
            ("symbol->string", symbol_to_string, true),
            ("string->symbol", string_to_symbol, true),
            ("display", display, true),
            ("add-to-load-path", add_to_load_path, true),
        ],
    )
}

fn number_p(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("number?", args, 1)?;
    Ok(Value::truth(matches!(args[0], Value::Number(_))))
}

fn boolean_p(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("boolean?", args, 1)?;
    Ok(Value::truth(matches!(args[0], Value::Bool(_))))
}

fn pair_p(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("pair?", args, 1)?;
    Ok(Value::truth(vm.heap().as_cons_id(args[0]).is_some()))
}

fn string_p(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("string?", args, 1)?;
    Ok(Value::truth(vm.heap().as_string_id(args[0]).is_some()))
}

fn symbol_p(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("symbol?", args, 1)?;
    Ok(Value::truth(vm.heap().as_symbol_id(args[0]).is_some()))
}

fn keyword_p(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("keyword?", args, 1)?;
    Ok(Value::truth(vm.heap().as_keyword_id(args[0]).is_some()))
}

fn array_p(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("array?", args, 1)?;
    Ok(Value::truth(vm.heap().as_array_id(args[0]).is_some()))
}

fn function_p(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("function?", args, 1)?;
    let is_function = matches!(
        args[0],
        Value::Object(id) if matches!(
            vm.heap().get(id),
            HeapData::Closure(_) | HeapData::Function(_) | HeapData::NativeFunction(_)
        )
    );
    Ok(Value::truth(is_function))
}

fn equal_p(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("equal?", args, 2)?;
    Ok(Value::truth(vm.heap().equal(args[0], args[1])))
}

fn eqv_p(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("eqv?", args, 2)?;
    Ok(Value::truth(args[0].eqv(args[1])))
}

fn not(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("not", args, 1)?;
    Ok(Value::truth(args[0].is_falsey()))
}

fn cons(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("cons", args, 2)?;
    let id = vm.alloc(HeapData::Cons(Cons {
        car: args[0],
        cdr: args[1],
    }));
    Ok(Value::Object(id))
}

/// Builds a proper list from the arguments. Constructed back to front
/// with the partial list rooted on the stack.
pub(crate) fn build_list(vm: &mut Vm, values: &[Value]) -> Value {
    vm.push(Value::Empty);
    for &value in values.iter().rev() {
        let cdr = vm.peek(0);
        let id = vm.alloc(HeapData::Cons(Cons { car: value, cdr }));
        vm.pop();
        vm.push(Value::Object(id));
    }
    vm.pop()
}

fn list(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    Ok(build_list(vm, args))
}

fn car(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("car", args, 1)?;
    match vm.heap().as_cons_id(args[0]) {
        Some(id) => Ok(vm.heap().cons(id).car),
        None => Err(NativeError::new("car: expected a pair")),
    }
}

fn cdr(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("cdr", args, 1)?;
    match vm.heap().as_cons_id(args[0]) {
        Some(id) => Ok(vm.heap().cons(id).cdr),
        None => Err(NativeError::new("cdr: expected a pair")),
    }
}

fn cadr(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("cadr", args, 1)?;
    let first = vm
        .heap()
        .as_cons_id(args[0])
        .ok_or_else(|| NativeError::new("cadr: expected a pair"))?;
    let rest = vm.heap().cons(first).cdr;
    let second = vm
        .heap()
        .as_cons_id(rest)
        .ok_or_else(|| NativeError::new("cadr: list has fewer than two elements"))?;
    Ok(vm.heap().cons(second).car)
}

/// Collects a proper list's elements; errors on an improper tail.
pub(crate) fn list_elements(vm: &Vm, name: &str, list: Value) -> Result<Vec<Value>, NativeError> {
    let mut elements = Vec::new();
    let mut current = list;
    loop {
        if current.is_empty() {
            return Ok(elements);
        }
        let Some(id) = vm.heap().as_cons_id(current) else {
            return Err(NativeError::new(format!("{name}: expected a proper list")));
        };
        let cons = vm.heap().cons(id);
        elements.push(cons.car);
        current = cons.cdr;
    }
}

fn append(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let mut combined = Vec::new();
    for &arg in args {
        combined.extend(list_elements(vm, "append", arg)?);
    }
    Ok(build_list(vm, &combined))
}

fn add(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let mut total = 0.0;
    for index in 0..args.len() {
        total += expect_number("+", args, index)?;
    }
    Ok(Value::Number(total))
}

fn subtract(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    if args.is_empty() {
        return Err(NativeError::new("-: expected at least 1 argument"));
    }
    let first = expect_number("-", args, 0)?;
    if args.len() == 1 {
        return Ok(Value::Number(-first));
    }
    let mut total = first;
    for index in 1..args.len() {
        total -= expect_number("-", args, index)?;
    }
    Ok(Value::Number(total))
}

fn multiply(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let mut total = 1.0;
    for index in 0..args.len() {
        total *= expect_number("*", args, index)?;
    }
    Ok(Value::Number(total))
}

fn divide(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    if args.is_empty() {
        return Err(NativeError::new("/: expected at least 1 argument"));
    }
    let first = expect_number("/", args, 0)?;
    if args.len() == 1 {
        return Ok(Value::Number(1.0 / first));
    }
    let mut total = first;
    for index in 1..args.len() {
        total /= expect_number("/", args, index)?;
    }
    Ok(Value::Number(total))
}

fn symbol_to_string(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("symbol->string", args, 1)?;
    match vm.heap().as_symbol_id(args[0]) {
        Some(id) => Ok(Value::Object(vm.heap().symbol(id).name)),
        None => Err(NativeError::new("symbol->string: expected a symbol")),
    }
}

fn string_to_symbol(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("string->symbol", args, 1)?;
    let Some(id) = vm.heap().as_string_id(args[0]) else {
        return Err(NativeError::new("string->symbol: expected a string"));
    };
    let text = vm.heap().string(id).to_string();
    Ok(Value::Object(vm.intern_symbol(&text, TokenSubKind::None)))
}

fn display(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("display", args, 1)?;
    let text = vm.heap().format_value(args[0], PrintStyle::Display);
    vm.write_output(&text);
    Ok(Value::Unspecified)
}

fn add_to_load_path(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    expect_arg_count("add-to-load-path", args, 1)?;
    let Some(id) = vm.heap().as_string_id(args[0]) else {
        return Err(NativeError::new("add-to-load-path: expected a path string"));
    };
    let path = vm.heap().string(id).to_string();
    vm.add_load_path(path);
    Ok(Value::TRUE)
}
