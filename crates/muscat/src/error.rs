//! Error types for the three failure stages: reading/compiling source,
//! and executing bytecode.
//!
//! Runtime errors are not catchable from the language; they unwind the VM
//! loop back to the entry frame. Keeping them as ordinary values (rather
//! than panics) leaves the door open for a future error-value kind that
//! propagates like any other value.

use std::fmt;

/// One compile-stage diagnostic, tagged with its source position.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub message: String,
    pub line: u32,
    pub lexeme: Option<String>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.lexeme {
            Some(lexeme) => write!(f, "[line {}] Error at '{}': {}", self.line, lexeme, self.message),
            None => write!(f, "[line {}] Error: {}", self.line, self.message),
        }
    }
}

/// Compilation failed. Carries every diagnostic reported before the
/// compiler gave up; panic mode guarantees at most one per top-level form.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub diagnostics: Vec<Diagnostic>,
    pub file: Option<String>,
}

impl CompileError {
    #[must_use]
    pub fn single(message: impl Into<String>, line: u32) -> Self {
        Self {
            diagnostics: vec![Diagnostic {
                message: message.into(),
                line,
                lexeme: None,
            }],
            file: None,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, diagnostic) in self.diagnostics.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            if let Some(file) = &self.file {
                write!(f, "{file}: ")?;
            }
            write!(f, "{diagnostic}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// A runtime failure: arity mismatch, undefined variable, non-callable
/// callee, operand type mismatch, continuation misuse, stack overflow.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub line: u32,
    pub file: Option<String>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        match &self.file {
            Some(file) => write!(f, "[line {}] in {}", self.line, file),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Either stage of failure, as returned by the public entry points.
#[derive(Debug)]
pub enum InterpretError {
    Compile(CompileError),
    Runtime(RuntimeError),
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile(e) => write!(f, "{e}"),
            Self::Runtime(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for InterpretError {}

impl From<CompileError> for InterpretError {
    fn from(e: CompileError) -> Self {
        Self::Compile(e)
    }
}

impl From<RuntimeError> for InterpretError {
    fn from(e: RuntimeError) -> Self {
        Self::Runtime(e)
    }
}
