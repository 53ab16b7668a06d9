//! Applicability expressions used by `rmap_relevance` and `rmap_omit`.
//!
//! Grammar:
//!
//! ```text
//! expr    := and ("or" and)*
//! and     := unary ("and" unary)*
//! unary   := "not" unary | compare
//! compare := operand (("==" | "!=") operand | "in" "(" operand ("," operand)* ")")?
//! operand := IDENT | STRING | NUMBER | "true" | "false" | "(" expr ")"
//! ```
//!
//! Identifiers name header keywords (`DETECTOR`, `DATE-OBS`, `META.INSTRUMENT.NAME`).

use crate::header::Header;

const UNDEFINED: &str = "UNDEFINED";

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    Compare { lhs: Operand, negated: bool, rhs: Operand },
    In { needle: Operand, haystack: Vec<Operand> },
    Truthy(Operand),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Parameter(String),
    Literal(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Literal(String),
    LParen,
    RParen,
    Comma,
    Eq,
    Ne,
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars = source.chars().collect::<Vec<_>>();
    let mut index = 0;
    while index < chars.len() {
        let ch = chars[index];
        match ch {
            ch if ch.is_whitespace() => index += 1,
            '(' | ')' | ',' => {
                tokens.push(match ch {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    _ => Token::Comma,
                });
                index += 1;
            }
            '=' | '!' => {
                if chars.get(index + 1) != Some(&'=') {
                    return Err(format!("expected '{ch}=' at offset {index}"));
                }
                tokens.push(if ch == '=' { Token::Eq } else { Token::Ne });
                index += 2;
            }
            '\'' | '"' => {
                let start = index + 1;
                let Some(length) = chars[start..].iter().position(|next| *next == ch) else {
                    return Err(format!("unterminated string at offset {index}"));
                };
                tokens.push(Token::Literal(chars[start..start + length].iter().collect()));
                index = start + length + 1;
            }
            ch if ch.is_ascii_alphanumeric() || "_.-+".contains(ch) => {
                let start = index;
                while index < chars.len()
                    && (chars[index].is_ascii_alphanumeric() || "_.-+".contains(chars[index]))
                {
                    index += 1;
                }
                let word = chars[start..index].iter().collect::<String>();
                if word.parse::<f64>().is_ok() {
                    tokens.push(Token::Literal(word));
                } else {
                    tokens.push(Token::Word(word));
                }
            }
            other => return Err(format!("unexpected character {other:?} at offset {index}")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<(), String> {
        match self.next() {
            Some(token) if &token == expected => Ok(()),
            Some(token) => Err(format!("expected {expected:?}, found {token:?}")),
            None => Err(format!("expected {expected:?}, found end of expression")),
        }
    }

    fn or(&mut self) -> Result<Expr, String> {
        let mut terms = vec![self.and()?];
        while self.peek_keyword("or") {
            self.next();
            terms.push(self.and()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Expr::Or(terms) })
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut terms = vec![self.unary()?];
        while self.peek_keyword("and") {
            self.next();
            terms.push(self.unary()?);
        }
        Ok(if terms.len() == 1 { terms.remove(0) } else { Expr::And(terms) })
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.peek_keyword("not") {
            self.next();
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::LParen) {
            self.next();
            let inner = self.or()?;
            self.expect(&Token::RParen)?;
            return Ok(inner);
        }
        if self.peek_keyword("true") || self.peek_keyword("false") {
            let value = self.peek_keyword("true");
            self.next();
            return Ok(Expr::Bool(value));
        }

        let lhs = self.operand()?;
        match self.peek() {
            Some(Token::Eq | Token::Ne) => {
                let negated = self.next() == Some(Token::Ne);
                let rhs = self.operand()?;
                Ok(Expr::Compare { lhs, negated, rhs })
            }
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("in") => {
                self.next();
                self.expect(&Token::LParen)?;
                let mut haystack = vec![self.operand()?];
                while self.peek() == Some(&Token::Comma) {
                    self.next();
                    if self.peek() == Some(&Token::RParen) {
                        break;
                    }
                    haystack.push(self.operand()?);
                }
                self.expect(&Token::RParen)?;
                Ok(Expr::In { needle: lhs, haystack })
            }
            _ => Ok(Expr::Truthy(lhs)),
        }
    }

    fn operand(&mut self) -> Result<Operand, String> {
        match self.next() {
            Some(Token::Literal(value)) => Ok(Operand::Literal(value)),
            Some(Token::Word(word)) => {
                const RESERVED: [&str; 4] = ["and", "or", "not", "in"];
                if RESERVED.iter().any(|keyword| word.eq_ignore_ascii_case(keyword)) {
                    Err(format!("unexpected keyword '{word}'"))
                } else {
                    Ok(Operand::Parameter(word.to_ascii_uppercase()))
                }
            }
            Some(token) => Err(format!("expected a parameter or literal, found {token:?}")),
            None => Err("expected a parameter or literal, found end of expression".to_string()),
        }
    }
}

impl Operand {
    fn value<'a>(&'a self, header: &'a Header) -> &'a str {
        match self {
            Self::Parameter(name) => header.get(name).unwrap_or(UNDEFINED),
            Self::Literal(value) => value,
        }
    }
}

fn values_equal(lhs: &str, rhs: &str) -> bool {
    if Header::is_wildcard(lhs) || Header::is_wildcard(rhs) {
        return true;
    }
    match (lhs.trim().parse::<f64>(), rhs.trim().parse::<f64>()) {
        (Ok(lhs), Ok(rhs)) => (lhs - rhs).abs() < f64::EPSILON,
        _ => lhs.trim().eq_ignore_ascii_case(rhs.trim()),
    }
}

fn truthy(value: &str) -> bool {
    let value = value.trim();
    !(value.is_empty()
        || value == "0"
        || value.eq_ignore_ascii_case("F")
        || value.eq_ignore_ascii_case("FALSE")
        || value.eq_ignore_ascii_case(UNDEFINED))
}

impl Expr {
    /// Parse an applicability expression.
    ///
    /// # Errors
    /// Returns a description of the first syntax problem.
    pub fn parse(source: &str) -> Result<Self, String> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err("empty expression".to_string());
        }
        let mut parser = Parser { tokens, position: 0 };
        let expr = parser.or()?;
        if let Some(token) = parser.peek() {
            return Err(format!("unexpected trailing {token:?}"));
        }
        Ok(expr)
    }

    /// Header wildcards (`*`, `N/A`) compare equal to anything; keywords missing
    /// from the header read as `UNDEFINED`.
    #[must_use]
    pub fn evaluate(&self, header: &Header) -> bool {
        match self {
            Self::Or(terms) => terms.iter().any(|term| term.evaluate(header)),
            Self::And(terms) => terms.iter().all(|term| term.evaluate(header)),
            Self::Not(inner) => !inner.evaluate(header),
            Self::Compare { lhs, negated, rhs } => {
                values_equal(lhs.value(header), rhs.value(header)) != *negated
            }
            Self::In { needle, haystack } => {
                let value = needle.value(header);
                haystack.iter().any(|candidate| values_equal(value, candidate.value(header)))
            }
            Self::Truthy(operand) => truthy(operand.value(header)),
            Self::Bool(value) => *value,
        }
    }
}
