//! The native-function glue: how host Rust functions become callable
//! Muscat values.
//!
//! A native receives the VM and its argument values (positional arguments
//! in order, followed by keyword/value pairs if the caller passed any) and
//! returns either a result value or a [`NativeError`], which the VM turns
//! into a runtime error at the current call site. The argument slice is a
//! copy of the stack region, so natives are free to push, pop, and even
//! re-enter the VM without invalidating it; the originals stay on the
//! stack (and thus rooted) until the call returns.

use std::fmt;

use crate::{value::Value, vm::Vm};

/// The foreign callable ABI.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, NativeError>;

/// A failure signaled by a native function. The VM attaches the source
/// position of the calling bytecode before reporting it.
#[derive(Debug, Clone)]
pub struct NativeError {
    pub message: String,
}

impl NativeError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for NativeError {}

impl From<String> for NativeError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for NativeError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// One entry of a native-module registration table: name, function, and
/// whether the binding is exported from its module.
pub type NativeFuncEntry = (&'static str, NativeFn, bool);

/// Requires exactly `count` arguments.
pub fn expect_arg_count(name: &str, args: &[Value], count: usize) -> Result<(), NativeError> {
    if args.len() == count {
        Ok(())
    } else {
        Err(NativeError::new(format!(
            "{name}: expected {count} argument{} but got {}",
            if count == 1 { "" } else { "s" },
            args.len()
        )))
    }
}

/// Requires a numeric argument at `index`.
pub fn expect_number(name: &str, args: &[Value], index: usize) -> Result<f64, NativeError> {
    args[index].as_number().ok_or_else(|| {
        NativeError::new(format!(
            "{name}: expected a number as argument {}",
            index + 1
        ))
    })
}
