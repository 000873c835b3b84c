//! The scanner: source text to tokens.
//!
//! Tokens carry their lexeme as a slice of the source, the line they start
//! on, and a sub-kind for symbols. The sub-kind is how the compiler
//! recognizes special forms and primitive operators: `let` scans as a
//! Symbol token with sub-kind `Let`, while `letter` scans as a plain
//! Symbol. Comments run from `;` to end of line.

use strum::IntoStaticStr;

/// The lexical category of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    LeftParen,
    RightParen,
    /// The `'` read-time quote prefix.
    QuoteChar,
    Number,
    String,
    Character,
    Keyword,
    Symbol,
    True,
    False,
    Error,
    Eof,
}

/// Fine-grained identity of a symbol token. The compiler dispatches on
/// this instead of re-comparing lexeme text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoStaticStr)]
pub enum TokenSubKind {
    #[default]
    None,
    // Special forms
    Let,
    Lambda,
    Define,
    DefineModule,
    DefineRecordType,
    If,
    And,
    Or,
    Begin,
    Quote,
    Set,
    Apply,
    Reset,
    Shift,
    ModuleImport,
    ModuleEnter,
    LoadFile,
    Break,
    Import,
    Dot,
    // Primitive operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Not,
    GreaterThan,
    GreaterEqual,
    LessThan,
    LessEqual,
    Eqv,
    Equal,
    List,
    Cons,
    Display,
}

#[derive(Debug, Clone, Copy)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub sub_kind: TokenSubKind,
    pub lexeme: &'src str,
    pub line: u32,
}

pub struct Scanner<'src> {
    source: &'src str,
    start: usize,
    current: usize,
    line: u32,
}

impl<'src> Scanner<'src> {
    #[must_use]
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    pub fn next_token(&mut self) -> Token<'src> {
        self.skip_whitespace();
        self.start = self.current;

        let Some(c) = self.advance() else {
            return self.make_token(TokenKind::Eof);
        };

        if is_symbol_start(c) {
            return self.read_identifier();
        }
        if c.is_ascii_digit() {
            return self.read_number();
        }

        match c {
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'\'' => self.make_token(TokenKind::QuoteChar),
            b'"' => self.read_string(),
            b'-' => {
                if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.read_number()
                } else {
                    self.read_identifier()
                }
            }
            b'#' => match self.peek() {
                Some(b'\\') => self.read_char_literal(),
                _ => self.read_hash_literal(),
            },
            _ => self.error_token("Unexpected character."),
        }
    }

    fn read_identifier(&mut self) -> Token<'src> {
        while self.peek().is_some_and(is_symbol_continue) {
            self.advance();
        }

        let lexeme = self.lexeme();
        if lexeme.starts_with(':') {
            return self.make_token(TokenKind::Keyword);
        }

        let sub_kind = symbol_sub_kind(lexeme);
        let mut token = self.make_token(TokenKind::Symbol);
        token.sub_kind = sub_kind;
        token
    }

    fn read_number(&mut self) -> Token<'src> {
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        if self.peek() == Some(b'.') && self.peek_next().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        self.make_token(TokenKind::Number)
    }

    fn read_string(&mut self) -> Token<'src> {
        loop {
            match self.peek() {
                None => return self.error_token("Unterminated string literal."),
                Some(b'"') => break,
                Some(b'\n') => {
                    self.line += 1;
                    self.advance();
                }
                Some(b'\\') => {
                    // Keep the escape pair in the lexeme; the interner
                    // resolves escapes when the string object is created.
                    self.advance();
                    if self.peek().is_some() {
                        self.advance();
                    }
                }
                Some(_) => {
                    self.advance();
                }
            }
        }
        self.advance();
        self.make_token(TokenKind::String)
    }

    /// `#\a`, `#\space`, `#\newline`, `#\tab`. The first character after
    /// the backslash may be anything; named characters continue with
    /// alphabetic characters only.
    fn read_char_literal(&mut self) -> Token<'src> {
        self.advance();
        let Some(first) = self.advance() else {
            return self.error_token("Unterminated character literal.");
        };
        if first.is_ascii_alphabetic() {
            while self.peek().is_some_and(|c| c.is_ascii_alphanumeric()) {
                self.advance();
            }
        }
        self.make_token(TokenKind::Character)
    }

    fn read_hash_literal(&mut self) -> Token<'src> {
        while self.peek().is_some_and(is_symbol_continue) {
            self.advance();
        }
        match self.lexeme() {
            "#t" => self.make_token(TokenKind::True),
            "#f" => self.make_token(TokenKind::False),
            _ => self.error_token("Unexpected '#' literal."),
        }
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                Some(b';') => {
                    while self.peek().is_some_and(|c| c != b'\n') {
                        self.advance();
                    }
                }
                Some(b'\n') => {
                    self.line += 1;
                    self.advance();
                }
                Some(b' ' | b'\r' | b'\t') => {
                    self.advance();
                }
                _ => return,
            }
        }
    }

    fn advance(&mut self) -> Option<u8> {
        let byte = self.source.as_bytes().get(self.current).copied()?;
        self.current += 1;
        Some(byte)
    }

    fn peek(&self) -> Option<u8> {
        self.source.as_bytes().get(self.current).copied()
    }

    fn peek_next(&self) -> Option<u8> {
        self.source.as_bytes().get(self.current + 1).copied()
    }

    fn lexeme(&self) -> &'src str {
        &self.source[self.start..self.current]
    }

    fn make_token(&self, kind: TokenKind) -> Token<'src> {
        Token {
            kind,
            sub_kind: TokenSubKind::None,
            lexeme: self.lexeme(),
            line: self.line,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Error,
            sub_kind: TokenSubKind::None,
            lexeme: message,
            line: self.line,
        }
    }
}

fn is_symbol_start(c: u8) -> bool {
    c.is_ascii_alphabetic()
        || matches!(
            c,
            b'!' | b'$' | b'%' | b'&' | b'*' | b'+' | b'.' | b':' | b'/' | b'<' | b'=' | b'>' | b'?'
                | b'^' | b'_' | b'~'
        )
}

fn is_symbol_continue(c: u8) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            b'-' | b'?' | b'<' | b'>' | b'=' | b'!' | b':' | b'%' | b'/' | b'*' | b'+' | b'_'
        )
}

/// Maps a full symbol lexeme to its sub-kind; anything unlisted is a
/// plain symbol.
fn symbol_sub_kind(lexeme: &str) -> TokenSubKind {
    match lexeme {
        "let" => TokenSubKind::Let,
        "lambda" => TokenSubKind::Lambda,
        "define" => TokenSubKind::Define,
        "define-module" => TokenSubKind::DefineModule,
        "define-record-type" => TokenSubKind::DefineRecordType,
        "if" => TokenSubKind::If,
        "and" => TokenSubKind::And,
        "or" => TokenSubKind::Or,
        "begin" => TokenSubKind::Begin,
        "quote" => TokenSubKind::Quote,
        "set!" => TokenSubKind::Set,
        "apply" => TokenSubKind::Apply,
        "reset" => TokenSubKind::Reset,
        "shift" => TokenSubKind::Shift,
        "module-import" => TokenSubKind::ModuleImport,
        "module-enter" => TokenSubKind::ModuleEnter,
        "load-file" => TokenSubKind::LoadFile,
        "break" => TokenSubKind::Break,
        "import" => TokenSubKind::Import,
        "." => TokenSubKind::Dot,
        "+" => TokenSubKind::Plus,
        "-" => TokenSubKind::Minus,
        "*" => TokenSubKind::Star,
        "/" => TokenSubKind::Slash,
        "%" => TokenSubKind::Percent,
        "not" => TokenSubKind::Not,
        ">" => TokenSubKind::GreaterThan,
        ">=" => TokenSubKind::GreaterEqual,
        "<" => TokenSubKind::LessThan,
        "<=" => TokenSubKind::LessEqual,
        "eqv?" => TokenSubKind::Eqv,
        "equal?" => TokenSubKind::Equal,
        "list" => TokenSubKind::List,
        "cons" => TokenSubKind::Cons,
        "display" => TokenSubKind::Display,
        _ => TokenSubKind::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<(TokenKind, TokenSubKind)> {
        let mut scanner = Scanner::new(source);
        let mut out = Vec::new();
        loop {
            let token = scanner.next_token();
            let done = token.kind == TokenKind::Eof;
            out.push((token.kind, token.sub_kind));
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn scans_operator_symbols() {
        let tokens = kinds("+ - / * and or eqv? equal?");
        let expected_subs = [
            TokenSubKind::Plus,
            TokenSubKind::Minus,
            TokenSubKind::Slash,
            TokenSubKind::Star,
            TokenSubKind::And,
            TokenSubKind::Or,
            TokenSubKind::Eqv,
            TokenSubKind::Equal,
        ];
        assert_eq!(tokens.len(), expected_subs.len() + 1);
        for (i, sub) in expected_subs.iter().enumerate() {
            assert_eq!(tokens[i], (TokenKind::Symbol, *sub));
        }
        assert_eq!(tokens.last().unwrap().0, TokenKind::Eof);
    }

    #[test]
    fn keyword_lookup_requires_full_match() {
        assert_eq!(kinds("let")[0], (TokenKind::Symbol, TokenSubKind::Let));
        assert_eq!(kinds("letter")[0], (TokenKind::Symbol, TokenSubKind::None));
        assert_eq!(kinds("lets")[0], (TokenKind::Symbol, TokenSubKind::None));
    }

    #[test]
    fn scans_numbers_and_negatives() {
        let mut scanner = Scanner::new("42 -3 2.5 -0.25");
        for expected in ["42", "-3", "2.5", "-0.25"] {
            let token = scanner.next_token();
            assert_eq!(token.kind, TokenKind::Number);
            assert_eq!(token.lexeme, expected);
        }
    }

    #[test]
    fn scans_booleans_keywords_and_chars() {
        assert_eq!(kinds("#t")[0].0, TokenKind::True);
        assert_eq!(kinds("#f")[0].0, TokenKind::False);
        assert_eq!(kinds(":export")[0].0, TokenKind::Keyword);

        let mut scanner = Scanner::new("#\\a #\\space");
        let a = scanner.next_token();
        assert_eq!(a.kind, TokenKind::Character);
        assert_eq!(a.lexeme, "#\\a");
        let space = scanner.next_token();
        assert_eq!(space.kind, TokenKind::Character);
        assert_eq!(space.lexeme, "#\\space");
    }

    #[test]
    fn string_lexeme_keeps_raw_escapes() {
        let mut scanner = Scanner::new("\"a\\nb\"");
        let token = scanner.next_token();
        assert_eq!(token.kind, TokenKind::String);
        assert_eq!(token.lexeme, "\"a\\nb\"");
    }

    #[test]
    fn comments_run_to_end_of_line() {
        let mut scanner = Scanner::new("; a comment\n42");
        let token = scanner.next_token();
        assert_eq!(token.kind, TokenKind::Number);
        assert_eq!(token.line, 2);
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let mut scanner = Scanner::new("\"oops");
        assert_eq!(scanner.next_token().kind, TokenKind::Error);
    }
}
