//! Filter expression language.
//!
//! A small, capability-free predicate language evaluated against a single
//! record. Grammar:
//!
//! ```text
//! expr       := or
//! or         := and (("or" | "||") and)*
//! and        := unary (("and" | "&&") unary)*
//! unary      := ("not" | "!") unary | comparison
//! comparison := primary (("==" | "!=" | ">" | ">=" | "<" | "<=") primary)?
//! primary    := literal | path | "(" expr ")"
//! literal    := number | 'string' | "string" | true | false | null
//! path       := ident ("." ident)*
//! ```
//!
//! Expressions are parsed once into an AST and then walked per record; they
//! can only read record fields.

use crate::error::TransformError;
use crate::transform::types::Record;
use serde_json::Value;
use std::cmp::Ordering;
use std::str::FromStr;

/// A parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Value),
    Field(Vec<String>),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Compare(Box<Node>, CompareOp, Box<Node>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Dot,
    LParen,
    RParen,
    Op(CompareOp),
    And,
    Or,
    Not,
}

impl Expression {
    /// Parse an expression, reporting the byte offset of the first problem.
    pub fn parse(source: &str) -> Result<Self, TransformError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.parse_or()?;
        if let Some((offset, token)) = parser.tokens.get(parser.pos) {
            return Err(invalid(
                source,
                *offset,
                format!("unexpected token {:?}", token),
            ));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate the predicate against a record.
    pub fn matches(&self, record: &Record) -> bool {
        truthy(&eval(&self.root, record))
    }
}

impl FromStr for Expression {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Expression::parse(s)
    }
}

fn invalid(source: &str, position: usize, message: impl Into<String>) -> TransformError {
    TransformError::InvalidExpression {
        expression: source.to_string(),
        position,
        message: message.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, TransformError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '(' => {
                tokens.push((offset, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((offset, Token::RParen));
                i += 1;
            }
            '.' if !chars.get(i + 1).is_some_and(|(_, n)| n.is_ascii_digit()) => {
                tokens.push((offset, Token::Dot));
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).map(|(_, n)| *n);
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Op(CompareOp::Eq), 2),
                    ('!', Some('=')) => (Token::Op(CompareOp::Ne), 2),
                    ('>', Some('=')) => (Token::Op(CompareOp::Ge), 2),
                    ('<', Some('=')) => (Token::Op(CompareOp::Le), 2),
                    ('>', _) => (Token::Op(CompareOp::Gt), 1),
                    ('<', _) => (Token::Op(CompareOp::Lt), 1),
                    ('!', _) => (Token::Not, 1),
                    _ => return Err(invalid(source, offset, "expected '=='")),
                };
                tokens.push((offset, token));
                i += width;
            }
            '&' | '|' => {
                if chars.get(i + 1).map(|(_, n)| *n) != Some(c) {
                    return Err(invalid(source, offset, format!("expected '{c}{c}'")));
                }
                let token = if c == '&' { Token::And } else { Token::Or };
                tokens.push((offset, token));
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < chars.len() {
                    let ch = chars[j].1;
                    if ch == '\\' {
                        if let Some((_, escaped)) = chars.get(j + 1) {
                            value.push(*escaped);
                            j += 2;
                            continue;
                        }
                    }
                    if ch == quote {
                        closed = true;
                        break;
                    }
                    value.push(ch);
                    j += 1;
                }
                if !closed {
                    return Err(invalid(source, offset, "unterminated string literal"));
                }
                tokens.push((offset, Token::Str(value)));
                i = j + 1;
            }
            c if c.is_ascii_digit() || c == '.' || c == '-' => {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].1.is_ascii_digit() || chars[j].1 == '.') {
                    j += 1;
                }
                let end = chars.get(j).map(|(o, _)| *o).unwrap_or(source.len());
                let text = &source[offset..end];
                let number = text
                    .parse::<f64>()
                    .map_err(|_| invalid(source, offset, format!("invalid number '{text}'")))?;
                tokens.push((offset, Token::Number(number)));
                i = j;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut j = i + 1;
                while j < chars.len()
                    && (chars[j].1.is_alphanumeric() || chars[j].1 == '_' || chars[j].1 == '$')
                {
                    j += 1;
                }
                let end = chars.get(j).map(|(o, _)| *o).unwrap_or(source.len());
                let word = &source[offset..end];
                let token = match word {
                    "and" | "AND" => Token::And,
                    "or" | "OR" => Token::Or,
                    "not" | "NOT" => Token::Not,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push((offset, token));
                i = j;
            }
            other => {
                return Err(invalid(
                    source,
                    offset,
                    format!("unexpected character '{other}'"),
                ));
            }
        }
    }

    Ok(tokens)
}

/// Deepest tree the parser will build. Parsing, evaluation and drop all
/// recurse over the tree.
const MAX_DEPTH: usize = 128;

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn descend(&mut self) -> Result<(), TransformError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(invalid(
                self.source,
                self.offset(),
                format!("expression nests deeper than {MAX_DEPTH} levels"),
            ));
        }
        Ok(())
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(o, _)| *o)
            .unwrap_or(self.source.len())
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    // Each connective in a chain nests the tree one level deeper on the left.
    fn parse_or(&mut self) -> Result<Node, TransformError> {
        let depth = self.depth;
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            self.descend()?;
            let right = self.parse_and()?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Node, TransformError> {
        let depth = self.depth;
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            self.descend()?;
            let right = self.parse_unary()?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Node, TransformError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Node::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Node, TransformError> {
        let left = self.parse_primary()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Node::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Node, TransformError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Number(n)) => Ok(Node::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Node::Literal(Value::String(s))),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(invalid(self.source, self.offset(), "expected ')'")),
                }
            }
            Some(Token::Ident(word)) => {
                let keyword = match word.as_str() {
                    "true" => Some(Value::Bool(true)),
                    "false" => Some(Value::Bool(false)),
                    "null" => Some(Value::Null),
                    _ => None,
                };
                if let Some(value) = keyword {
                    return Ok(Node::Literal(value));
                }
                let mut path = vec![word];
                while self.peek() == Some(&Token::Dot) {
                    self.pos += 1;
                    let offset = self.offset();
                    match self.next() {
                        Some(Token::Ident(segment)) => path.push(segment),
                        _ => {
                            return Err(invalid(
                                self.source,
                                offset,
                                "expected field name after '.'",
                            ));
                        }
                    }
                }
                Ok(Node::Field(path))
            }
            Some(token) => Err(invalid(
                self.source,
                offset,
                format!("unexpected token {:?}", token),
            )),
            None => Err(invalid(self.source, offset, "unexpected end of expression")),
        }
    }
}

fn eval(node: &Node, record: &Record) -> Value {
    match node {
        Node::Literal(value) => value.clone(),
        Node::Field(path) => lookup(record, path).cloned().unwrap_or(Value::Null),
        Node::Not(inner) => Value::Bool(!truthy(&eval(inner, record))),
        Node::And(left, right) => {
            Value::Bool(truthy(&eval(left, record)) && truthy(&eval(right, record)))
        }
        Node::Or(left, right) => {
            Value::Bool(truthy(&eval(left, record)) || truthy(&eval(right, record)))
        }
        Node::Compare(left, op, right) => {
            let left = eval(left, record);
            let right = eval(right, record);
            Value::Bool(compare(&left, *op, &right))
        }
    }
}

fn lookup<'r>(record: &'r Record, path: &[String]) -> Option<&'r Value> {
    let (first, rest) = path.split_first()?;
    let mut current = record.get(first)?;
    for segment in rest {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    let ordering = || match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b))
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };
    match op {
        CompareOp::Eq => loosely_equal(left, right),
        CompareOp::Ne => !loosely_equal(left, right),
        CompareOp::Gt => ordering() == Some(Ordering::Greater),
        CompareOp::Ge => matches!(ordering(), Some(Ordering::Greater | Ordering::Equal)),
        CompareOp::Lt => ordering() == Some(Ordering::Less),
        CompareOp::Le => matches!(ordering(), Some(Ordering::Less | Ordering::Equal)),
    }
}

/// Numbers compare by value so `1 == 1.0` holds; everything else is structural.
fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
