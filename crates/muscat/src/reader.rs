//! The reader: token stream to syntax-wrapped datums.
//!
//! Loosely follows R7RS section 7.1.2 ("External representations") with
//! keywords as an extra atom kind. Every node the reader produces is
//! wrapped in a Syntax object carrying its source position; lists wrap
//! each cons cell individually so the compiler can report positions for
//! any sub-form.
//!
//! The reader allocates intermediate objects while sub-expressions are
//! still being parsed, so it pushes the partial structure onto the VM
//! value stack around every allocation. Skipping that discipline would
//! let a collection triggered mid-list reclaim the list being built.

use crate::{
    error::CompileError,
    heap::{HeapData, HeapId, Syntax},
    scanner::{Scanner, Token, TokenKind, TokenSubKind},
    value::Value,
    vm::Vm,
};

pub struct Reader<'src> {
    scanner: Scanner<'src>,
    file_name: Option<HeapId>,
}

impl<'src> Reader<'src> {
    #[must_use]
    pub fn new(source: &'src str, file_name: Option<HeapId>) -> Self {
        Self {
            scanner: Scanner::new(source),
            file_name,
        }
    }

    /// Reads the next top-level form. At end of input, returns a syntax
    /// object wrapping `Value::Eof`.
    pub fn read_next(&mut self, vm: &mut Vm) -> Result<HeapId, CompileError> {
        let token = self.scanner.next_token();
        if token.kind == TokenKind::Eof {
            return Ok(self.make_syntax(vm, Value::Eof, token.line));
        }
        self.read_form(vm, &token)
    }

    fn read_form(&mut self, vm: &mut Vm, token: &Token<'src>) -> Result<HeapId, CompileError> {
        match token.kind {
            TokenKind::Number => {
                let number: f64 = token
                    .lexeme
                    .parse()
                    .map_err(|_| CompileError::single("Invalid number literal.", token.line))?;
                Ok(self.make_syntax(vm, Value::Number(number), token.line))
            }
            TokenKind::True => Ok(self.make_syntax(vm, Value::TRUE, token.line)),
            TokenKind::False => Ok(self.make_syntax(vm, Value::FALSE, token.line)),
            TokenKind::String => {
                let inner = &token.lexeme[1..token.lexeme.len() - 1];
                let text = unescape_string(inner);
                let string = vm.intern_string(&text);
                Ok(self.wrap_object(vm, string, token.line))
            }
            TokenKind::Keyword => {
                let keyword = vm.intern_keyword(&token.lexeme[1..]);
                Ok(self.wrap_object(vm, keyword, token.line))
            }
            TokenKind::Character => {
                let value = char_value(token.lexeme)
                    .ok_or_else(|| CompileError::single("Invalid character literal.", token.line))?;
                Ok(self.make_syntax(vm, Value::Char(value), token.line))
            }
            TokenKind::Symbol => {
                if token.sub_kind == TokenSubKind::Dot {
                    return Err(CompileError::single("Unexpected '.' outside a list.", token.line));
                }
                let symbol = vm.intern_symbol(token.lexeme, token.sub_kind);
                Ok(self.wrap_object(vm, symbol, token.line))
            }
            TokenKind::QuoteChar => self.read_quoted(vm, token.line),
            TokenKind::LeftParen => self.read_list(vm, token.line),
            TokenKind::RightParen => Err(CompileError::single("Unexpected ')'.", token.line)),
            TokenKind::Error => Err(CompileError::single(token.lexeme, token.line)),
            TokenKind::Eof => Err(CompileError::single("Unexpected end of input.", token.line)),
        }
    }

    /// `'x` reads as `(quote x)` with every node syntax-wrapped.
    fn read_quoted(&mut self, vm: &mut Vm, line: u32) -> Result<HeapId, CompileError> {
        let token = self.scanner.next_token();
        if token.kind == TokenKind::Eof {
            return Err(CompileError::single("Expected a datum after quote.", line));
        }
        let inner = self.read_form(vm, &token)?;

        vm.push(Value::Object(inner));
        let inner_cons = vm.alloc(HeapData::Cons(crate::heap::Cons {
            car: Value::Object(inner),
            cdr: Value::Empty,
        }));
        vm.pop();
        vm.push(Value::Object(inner_cons));
        let inner_syntax = self.wrap_object(vm, inner_cons, line);
        vm.pop();
        vm.push(Value::Object(inner_syntax));

        let quote_symbol = vm.quote_symbol();
        let quote_syntax = self.wrap_object(vm, quote_symbol, line);
        vm.push(Value::Object(quote_syntax));

        let outer_cons = vm.alloc(HeapData::Cons(crate::heap::Cons {
            car: Value::Object(quote_syntax),
            cdr: Value::Object(inner_syntax),
        }));
        vm.pop();
        vm.pop();
        vm.push(Value::Object(outer_cons));
        let outer_syntax = self.wrap_object(vm, outer_cons, line);
        vm.pop();

        Ok(outer_syntax)
    }

    fn read_list(&mut self, vm: &mut Vm, open_line: u32) -> Result<HeapId, CompileError> {
        // `head_syntax` is pushed onto the VM stack while the list is
        // under construction; it roots the whole chain.
        let mut head_syntax: Option<HeapId> = None;
        let mut tail_cons: Option<HeapId> = None;

        let result = loop {
            let token = self.scanner.next_token();
            match token.kind {
                TokenKind::Eof => {
                    break Err(CompileError::single("Unterminated list.", token.line));
                }
                TokenKind::RightParen => {
                    break Ok(match head_syntax {
                        Some(head) => head,
                        None => self.make_syntax(vm, Value::Empty, open_line),
                    });
                }
                TokenKind::Symbol if token.sub_kind == TokenSubKind::Dot && tail_cons.is_some() => {
                    let datum_token = self.scanner.next_token();
                    let datum = match self.read_form(vm, &datum_token) {
                        Ok(datum) => datum,
                        Err(e) => break Err(e),
                    };
                    let tail = tail_cons.expect("dotted pair requires a preceding element");
                    vm.heap_mut().cons_mut(tail).cdr = Value::Object(datum);

                    let close = self.scanner.next_token();
                    if close.kind != TokenKind::RightParen {
                        break Err(CompileError::single("Expected ')' after dotted pair.", close.line));
                    }
                    break Ok(head_syntax.expect("dotted pair requires a preceding element"));
                }
                _ => {
                    let element = match self.read_form(vm, &token) {
                        Ok(element) => element,
                        Err(e) => break Err(e),
                    };

                    // Allocate the cons and its syntax wrapper, keeping
                    // each intermediate rooted.
                    vm.push(Value::Object(element));
                    let cons = vm.alloc(HeapData::Cons(crate::heap::Cons {
                        car: Value::Object(element),
                        cdr: Value::Empty,
                    }));
                    vm.pop();
                    vm.push(Value::Object(cons));
                    let cons_syntax = self.wrap_object(vm, cons, token.line);
                    vm.pop();

                    match tail_cons {
                        Some(tail) => {
                            vm.heap_mut().cons_mut(tail).cdr = Value::Object(cons_syntax);
                        }
                        None => {
                            // First element: the head cons gets its own
                            // wrapper at the opening paren's line, and
                            // that wrapper roots the list from here on.
                            vm.push(Value::Object(cons_syntax));
                            let head = self.wrap_reposition(vm, cons_syntax, open_line);
                            vm.pop();
                            vm.push(Value::Object(head));
                            head_syntax = Some(head);
                        }
                    }
                    tail_cons = Some(cons);
                }
            }
        };

        if head_syntax.is_some() {
            vm.pop();
        }
        result
    }

    /// Wraps a heap object in a syntax node, rooting it across the
    /// allocation.
    fn wrap_object(&self, vm: &mut Vm, object: HeapId, line: u32) -> HeapId {
        vm.push(Value::Object(object));
        let syntax = self.make_syntax(vm, Value::Object(object), line);
        vm.pop();
        syntax
    }

    /// Re-wraps the datum of an existing syntax node at a new position.
    /// Used to give a list's head the opening paren's location.
    fn wrap_reposition(&self, vm: &mut Vm, syntax: HeapId, line: u32) -> HeapId {
        let value = vm.heap().syntax(syntax).value;
        self.make_syntax(vm, value, line)
    }

    fn make_syntax(&self, vm: &mut Vm, value: Value, line: u32) -> HeapId {
        vm.push(value);
        let syntax = vm.alloc(HeapData::Syntax(Syntax {
            value,
            file_name: self.file_name,
            line,
            column: 0,
            position: 0,
            span: 0,
        }));
        vm.pop();
        syntax
    }
}

/// Resolves `\\`, `\n`, `\t`, `\e`, and `\"` escapes; any other escaped
/// character is kept as-is.
#[must_use]
pub fn unescape_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('e') => out.push('\u{1b}'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Decodes a character literal lexeme (`#\a`, `#\space`, ...).
#[must_use]
pub fn char_value(lexeme: &str) -> Option<u8> {
    let body = lexeme.strip_prefix("#\\")?;
    match body {
        "space" => Some(b' '),
        "newline" => Some(b'\n'),
        "tab" => Some(b'\t'),
        _ => body.bytes().next(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::PrintStyle;

    fn read_one(source: &str) -> (Vm, HeapId) {
        let mut vm = Vm::new(Vec::new());
        let mut reader = Reader::new(source, None);
        let syntax = reader.read_next(&mut vm).expect("read failed");
        (vm, syntax)
    }

    fn datum_text(source: &str) -> String {
        let (vm, syntax) = read_one(source);
        let value = vm.heap().syntax(syntax).value;
        vm.heap().format_value(value, PrintStyle::Write)
    }

    #[test]
    fn reads_atoms() {
        assert_eq!(datum_text("311"), "311");
        assert_eq!(datum_text("#t"), "#t");
        assert_eq!(datum_text("foo"), "foo");
        assert_eq!(datum_text(":key"), ":key");
    }

    #[test]
    fn reads_dotted_pairs() {
        let (vm, syntax) = read_one("(1 . 2)");
        let value = vm.heap().syntax(syntax).value;
        let cons_id = vm.heap().as_cons_id(value).expect("expected a pair");
        let cons = *vm.heap().cons(cons_id);
        let car = vm.heap().strip_syntax(cons.car);
        let cdr = vm.heap().strip_syntax(cons.cdr);
        assert_eq!(car, Value::Number(1.0));
        assert_eq!(cdr, Value::Number(2.0));
    }

    #[test]
    fn quote_prefix_wraps_the_next_datum() {
        let (vm, syntax) = read_one("'(a b)");
        let heap = vm.heap();
        let value = heap.syntax(syntax).value;
        let outer = heap.as_cons_id(value).expect("expected a pair");

        // Car must be the `quote` symbol.
        let car = heap.strip_syntax(heap.cons(outer).car);
        let symbol_id = heap.as_symbol_id(car).expect("expected quote symbol");
        assert_eq!(heap.string(heap.symbol(symbol_id).name), "quote");

        // Cdr is a one-element list holding (a b).
        let cdr = heap.strip_syntax(heap.cons(outer).cdr);
        let second = heap.as_cons_id(cdr).expect("expected a pair");
        assert!(heap.cons(second).cdr.is_empty() || heap.strip_syntax(heap.cons(second).cdr).is_empty());
    }

    #[test]
    fn string_escapes_resolve_on_read() {
        let (vm, syntax) = read_one("\"a\\nb\"");
        let value = vm.heap().syntax(syntax).value;
        let id = vm.heap().as_string_id(value).expect("expected a string");
        let text = vm.heap().string(id);
        assert_eq!(text.as_bytes()[1], b'\n');
        assert_eq!(text, "a\nb");
    }

    #[test]
    fn empty_parens_read_as_empty() {
        let (vm, syntax) = read_one("()");
        assert!(vm.heap().syntax(syntax).value.is_empty());
    }

    #[test]
    fn unterminated_list_is_an_error() {
        let mut vm = Vm::new(Vec::new());
        let mut reader = Reader::new("(1 2", None);
        assert!(reader.read_next(&mut vm).is_err());
    }

    #[test]
    fn eof_reads_as_eof_value() {
        let (vm, syntax) = read_one("   ");
        assert!(vm.heap().syntax(syntax).value.is_eof());
    }
}
