//! Literal syntax for mapping files.
//!
//! A mapping file is a sequence of `name = value` assignments. Values are
//! strings, numbers, identifiers, tuples, lists, dictionaries and single-name
//! calls such as `UseAfter({...})`. Dictionaries keep their source order and
//! their duplicate keys so that later stages can reject duplicates instead of
//! silently keeping the last one.

use std::fmt::{Display, Formatter, Write as _};

const INDENT: &str = "    ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    /// Numeric literal, kept as written so re-serialization is exact.
    Num(String),
    Ident(String),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Call { name: String, args: Vec<Value> },
}

impl Value {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Text of a string or numeric literal.
    #[must_use]
    pub fn as_scalar_text(&self) -> Option<&str> {
        match self {
            Self::Str(value) | Self::Num(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Num(_) => "number",
            Self::Ident(_) => "identifier",
            Self::Tuple(_) => "tuple",
            Self::List(_) => "list",
            Self::Dict(_) => "dictionary",
            Self::Call { .. } => "call",
        }
    }

    /// Render on a single line; dictionaries are still rendered multi-line.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        write_value(&mut out, self, 0);
        out
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}, column {column}: {message}")]
pub struct SyntaxError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Num(String),
    Ident(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Colon,
    Comma,
    Equals,
    Eof,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Str(value) => format!("string {value:?}"),
            Self::Num(value) => format!("number {value}"),
            Self::Ident(value) => format!("identifier {value}"),
            Self::LParen => "'('".to_string(),
            Self::RParen => "')'".to_string(),
            Self::LBrace => "'{'".to_string(),
            Self::RBrace => "'}'".to_string(),
            Self::LBracket => "'['".to_string(),
            Self::RBracket => "']'".to_string(),
            Self::Colon => "':'".to_string(),
            Self::Comma => "','".to_string(),
            Self::Equals => "'='".to_string(),
            Self::Eof => "end of input".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    line: usize,
    column: usize,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self { chars: input.chars().peekable(), line: 1, column: 1 }
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.next()?;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError { line: self.line, column: self.column, message: message.into() }
    }

    fn tokenize(mut self) -> Result<Vec<Spanned>, SyntaxError> {
        let mut tokens = Vec::new();
        loop {
            while let Some(&ch) = self.chars.peek() {
                if ch.is_whitespace() {
                    self.bump();
                } else if ch == '#' {
                    while let Some(&next) = self.chars.peek() {
                        if next == '\n' {
                            break;
                        }
                        self.bump();
                    }
                } else {
                    break;
                }
            }

            let (line, column) = (self.line, self.column);
            let Some(&ch) = self.chars.peek() else {
                tokens.push(Spanned { token: Token::Eof, line, column });
                return Ok(tokens);
            };

            let token = match ch {
                '(' | ')' | '{' | '}' | '[' | ']' | ':' | ',' | '=' => {
                    self.bump();
                    match ch {
                        '(' => Token::LParen,
                        ')' => Token::RParen,
                        '{' => Token::LBrace,
                        '}' => Token::RBrace,
                        '[' => Token::LBracket,
                        ']' => Token::RBracket,
                        ':' => Token::Colon,
                        ',' => Token::Comma,
                        _ => Token::Equals,
                    }
                }
                '\'' | '"' => self.string(ch)?,
                '-' | '+' | '.' | '0'..='9' => self.number()?,
                ch if ch.is_ascii_alphabetic() || ch == '_' => {
                    let mut ident = String::new();
                    while let Some(&next) = self.chars.peek() {
                        if next.is_ascii_alphanumeric() || next == '_' {
                            ident.push(next);
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    Token::Ident(ident)
                }
                other => return Err(self.error(format!("unexpected character {other:?}"))),
            };
            tokens.push(Spanned { token, line, column });
        }
    }

    fn string(&mut self, quote: char) -> Result<Token, SyntaxError> {
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(self.error("unterminated string literal")),
                Some('\\') => match self.bump() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some(escaped @ ('\\' | '\'' | '"')) => value.push(escaped),
                    Some(other) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => return Err(self.error("unterminated string literal")),
                },
                Some(ch) if ch == quote => return Ok(Token::Str(value)),
                Some(ch) => value.push(ch),
            }
        }
    }

    fn number(&mut self) -> Result<Token, SyntaxError> {
        let mut text = String::new();
        while let Some(&ch) = self.chars.peek() {
            let sign_after_exponent =
                (ch == '-' || ch == '+') && (text.is_empty() || text.ends_with(['e', 'E']));
            if ch.is_ascii_digit() || ch == '.' || ch == 'e' || ch == 'E' || sign_after_exponent {
                text.push(ch);
                self.bump();
            } else {
                break;
            }
        }
        if text.parse::<f64>().is_err() {
            return Err(self.error(format!("malformed number {text:?}")));
        }
        Ok(Token::Num(text))
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> &Spanned {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.position.min(last)]
    }

    fn next(&mut self) -> Spanned {
        let token = self.peek().clone();
        if self.position < self.tokens.len() {
            self.position += 1;
        }
        token
    }

    fn error_at(spanned: &Spanned, message: impl Into<String>) -> SyntaxError {
        SyntaxError { line: spanned.line, column: spanned.column, message: message.into() }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), SyntaxError> {
        let spanned = self.next();
        if &spanned.token == expected {
            Ok(())
        } else {
            Err(Self::error_at(
                &spanned,
                format!("expected {}, found {}", expected.describe(), spanned.token.describe()),
            ))
        }
    }

    fn module(&mut self) -> Result<Vec<(String, Value)>, SyntaxError> {
        let mut assignments = Vec::new();
        loop {
            let spanned = self.next();
            match spanned.token {
                Token::Eof => return Ok(assignments),
                Token::Ident(name) => {
                    self.expect(&Token::Equals)?;
                    let value = self.value()?;
                    assignments.push((name, value));
                }
                ref other => {
                    return Err(Self::error_at(
                        &spanned,
                        format!("expected an assignment, found {}", other.describe()),
                    ))
                }
            }
        }
    }

    fn value(&mut self) -> Result<Value, SyntaxError> {
        let spanned = self.next();
        match spanned.token {
            Token::Str(value) => Ok(Value::Str(value)),
            Token::Num(value) => Ok(Value::Num(value)),
            Token::Ident(name) => {
                if self.peek().token == Token::LParen {
                    self.next();
                    let args = self.sequence(&Token::RParen)?.0;
                    Ok(Value::Call { name, args })
                } else {
                    Ok(Value::Ident(name))
                }
            }
            Token::LParen => {
                let (items, trailing_comma) = self.sequence(&Token::RParen)?;
                if items.len() == 1 && !trailing_comma {
                    Ok(items.into_iter().next().unwrap_or(Value::Tuple(Vec::new())))
                } else {
                    Ok(Value::Tuple(items))
                }
            }
            Token::LBracket => Ok(Value::List(self.sequence(&Token::RBracket)?.0)),
            Token::LBrace => self.dict(),
            ref other => Err(Self::error_at(
                &spanned,
                format!("expected a value, found {}", other.describe()),
            )),
        }
    }

    fn sequence(&mut self, close: &Token) -> Result<(Vec<Value>, bool), SyntaxError> {
        let mut items = Vec::new();
        let mut trailing_comma = false;
        loop {
            if &self.peek().token == close {
                self.next();
                return Ok((items, trailing_comma));
            }
            items.push(self.value()?);
            let spanned = self.next();
            match &spanned.token {
                Token::Comma => trailing_comma = true,
                token if token == close => return Ok((items, false)),
                other => {
                    return Err(Self::error_at(
                        &spanned,
                        format!("expected ',' or {}, found {}", close.describe(), other.describe()),
                    ))
                }
            }
        }
    }

    fn dict(&mut self) -> Result<Value, SyntaxError> {
        let mut entries = Vec::new();
        loop {
            if self.peek().token == Token::RBrace {
                self.next();
                return Ok(Value::Dict(entries));
            }
            let key = self.value()?;
            self.expect(&Token::Colon)?;
            let value = self.value()?;
            entries.push((key, value));
            let spanned = self.next();
            match spanned.token {
                Token::Comma => {}
                Token::RBrace => return Ok(Value::Dict(entries)),
                ref other => {
                    return Err(Self::error_at(
                        &spanned,
                        format!("expected ',' or '}}', found {}", other.describe()),
                    ))
                }
            }
        }
    }
}

/// Parse a mapping source into its ordered top-level assignments.
///
/// # Errors
/// Returns [`SyntaxError`] with the line and column of the first offending token.
pub fn parse_module(input: &str) -> Result<Vec<(String, Value)>, SyntaxError> {
    let tokens = Lexer::new(input).tokenize()?;
    Parser { tokens, position: 0 }.module()
}

/// Canonical rendering of top-level assignments, separated by blank lines.
#[must_use]
pub fn render_module(assignments: &[(&str, &Value)]) -> String {
    let mut out = String::new();
    for (index, (name, value)) in assignments.iter().enumerate() {
        if index > 0 {
            out.push('\n');
        }
        out.push_str(name);
        out.push_str(" = ");
        write_value(&mut out, value, 0);
        out.push('\n');
    }
    out
}

fn write_string(out: &mut String, value: &str) {
    out.push('\'');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            ch => out.push(ch),
        }
    }
    out.push('\'');
}

fn write_items(out: &mut String, items: &[Value], depth: usize) {
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            out.push_str(", ");
        }
        write_value(out, item, depth);
    }
}

fn write_value(out: &mut String, value: &Value, depth: usize) {
    match value {
        Value::Str(text) => write_string(out, text),
        Value::Num(text) | Value::Ident(text) => out.push_str(text),
        Value::Tuple(items) => {
            out.push('(');
            write_items(out, items, depth);
            if items.len() == 1 {
                out.push(',');
            }
            out.push(')');
        }
        Value::List(items) => {
            out.push('[');
            write_items(out, items, depth);
            out.push(']');
        }
        Value::Dict(entries) => {
            if entries.is_empty() {
                out.push_str("{}");
                return;
            }
            out.push_str("{\n");
            for (key, item) in entries {
                out.push_str(&INDENT.repeat(depth + 1));
                write_value(out, key, depth + 1);
                out.push_str(" : ");
                write_value(out, item, depth + 1);
                out.push_str(",\n");
            }
            out.push_str(&INDENT.repeat(depth));
            out.push('}');
        }
        Value::Call { name, args } => {
            let _ = write!(out, "{name}(");
            write_items(out, args, depth);
            out.push(')');
        }
    }
}
