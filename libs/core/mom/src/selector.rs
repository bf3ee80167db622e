//! Message selectors: boolean filters over message properties.
//!
//! Supported grammar (keywords are case-insensitive):
//!
//! ```text
//! expr       := and ( OR and )*
//! and        := unary ( AND unary )*
//! unary      := NOT unary | '(' expr ')' | predicate
//! predicate  := operand ( cmp operand
//!                       | [NOT] IN '(' literal ( ',' literal )* ')'
//!                       | [NOT] LIKE 'pattern' [ ESCAPE 'c' ]
//!                       | [NOT] BETWEEN operand AND operand
//!                       | IS [NOT] NULL )?
//! cmp        := = | <> | < | <= | > | >=
//! operand    := identifier | 'string' | number | TRUE | FALSE
//! ```
//!
//! Evaluation follows SQL three-valued logic: comparing against a missing
//! property is unknown, and a message is selected only if the whole
//! expression is true.

use crate::error::TransportError;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Message properties as seen by selectors.
pub type Properties = BTreeMap<String, Value>;

/// A parsed selector.
#[derive(Clone)]
pub struct Selector {
    source: String,
    expr: Expr,
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self, TransportError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if let Some(token) = parser.peek() {
            return Err(invalid(format!("unexpected {token} at end of selector")));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether a message with these properties is selected.
    pub fn matches(&self, properties: &Properties) -> bool {
        self.expr.eval(properties).as_bool() == Some(true)
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Selector").field(&self.source).finish()
    }
}

fn invalid(message: impl Into<String>) -> TransportError {
    TransportError::InvalidSelector(message.into())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "'{name}'"),
            Token::Str(s) => write!(f, "string '{s}'"),
            Token::Num(n) => write!(f, "number {n}"),
            Token::Op(op) => write!(f, "'{op}'"),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::Comma => write!(f, "','"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, TransportError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op("="));
                i += 1;
            }
            '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let op = match (c, next) {
                    ('<', Some('>')) => "<>",
                    ('<', Some('=')) => "<=",
                    ('>', Some('=')) => ">=",
                    ('<', _) => "<",
                    _ => ">",
                };
                i += op.len();
                tokens.push(Token::Op(op));
            }
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(invalid("unterminated string literal")),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || c == '.' || (c == '-' && starts_number(&chars, i)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| invalid(format!("invalid number '{text}'")))?;
                tokens.push(Token::Num(number));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$' | '.')) {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(invalid(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

fn starts_number(chars: &[char], i: usize) -> bool {
    chars.get(i + 1).is_some_and(|c| c.is_ascii_digit())
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
}

impl Literal {
    fn from_json(value: &Value) -> Self {
        match value {
            Value::Bool(b) => Literal::Bool(*b),
            Value::Number(n) => n.as_f64().map(Literal::Num).unwrap_or(Literal::Null),
            Value::String(s) => Literal::Str(s.clone()),
            _ => Literal::Null,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            Literal::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// SQL comparison; `None` if unknown or incomparable.
    fn compare(&self, other: &Literal) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Literal::Num(a), Literal::Num(b)) => a.partial_cmp(b),
            (Literal::Str(a), Literal::Str(b)) => Some(a.cmp(b)),
            (Literal::Bool(a), Literal::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Operand {
    Property(String),
    Literal(Literal),
}

impl Operand {
    fn eval(&self, properties: &Properties) -> Literal {
        match self {
            Operand::Property(name) => properties.get(name).map(Literal::from_json).unwrap_or(Literal::Null),
            Operand::Literal(literal) => literal.clone(),
        }
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Operand, &'static str, Operand),
    In(Operand, Vec<Literal>, bool),
    Like(Operand, LikePattern, bool),
    Between(Operand, Operand, Operand, bool),
    IsNull(Operand, bool),
    Value(Operand),
}

#[derive(Debug, Clone)]
struct LikePattern(Regex);

impl LikePattern {
    fn new(pattern: &str, escape: Option<char>) -> Result<Self, TransportError> {
        let mut regex = String::from("^");
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            match c {
                c if Some(c) == escape => match chars.next() {
                    Some(escaped) => regex.push_str(&regex::escape(&escaped.to_string())),
                    None => return Err(invalid("LIKE pattern ends with escape character")),
                },
                '%' => regex.push_str(".*"),
                '_' => regex.push('.'),
                c => regex.push_str(&regex::escape(&c.to_string())),
            }
        }
        regex.push('$');
        Regex::new(&regex)
            .map(LikePattern)
            .map_err(|e| invalid(format!("invalid LIKE pattern '{pattern}': {e}")))
    }
}

/// Three-valued AND/OR/NOT over `Option<bool>` (`None` = unknown).
impl Expr {
    fn eval(&self, properties: &Properties) -> Literal {
        let truth = match self {
            Expr::Value(operand) => return operand.eval(properties),
            Expr::Or(a, b) => {
                match (a.eval(properties).as_bool(), b.eval(properties).as_bool()) {
                    (Some(true), _) | (_, Some(true)) => Some(true),
                    (Some(false), Some(false)) => Some(false),
                    _ => None,
                }
            }
            Expr::And(a, b) => {
                match (a.eval(properties).as_bool(), b.eval(properties).as_bool()) {
                    (Some(false), _) | (_, Some(false)) => Some(false),
                    (Some(true), Some(true)) => Some(true),
                    _ => None,
                }
            }
            Expr::Not(inner) => inner.eval(properties).as_bool().map(|b| !b),
            Expr::Compare(left, op, right) => {
                let (left, right) = (left.eval(properties), right.eval(properties));
                left.compare(&right).map(|ordering| match *op {
                    "=" => ordering.is_eq(),
                    "<>" => ordering.is_ne(),
                    "<" => ordering.is_lt(),
                    "<=" => ordering.is_le(),
                    ">" => ordering.is_gt(),
                    _ => ordering.is_ge(),
                })
            }
            Expr::In(operand, values, negated) => {
                let value = operand.eval(properties);
                if value == Literal::Null {
                    None
                } else {
                    let found = values.iter().any(|v| value.compare(v).is_some_and(|o| o.is_eq()));
                    Some(found != *negated)
                }
            }
            Expr::Like(operand, pattern, negated) => match operand.eval(properties) {
                Literal::Str(s) => Some(pattern.0.is_match(&s) != *negated),
                _ => None,
            },
            Expr::Between(operand, low, high, negated) => {
                let value = operand.eval(properties);
                let above = value.compare(&low.eval(properties)).map(|o| o.is_ge());
                let below = value.compare(&high.eval(properties)).map(|o| o.is_le());
                match (above, below) {
                    (Some(a), Some(b)) => Some((a && b) != *negated),
                    _ => None,
                }
            }
            Expr::IsNull(operand, negated) => {
                Some((operand.eval(properties) == Literal::Null) != *negated)
            }
        };
        truth.map(Literal::Bool).unwrap_or(Literal::Null)
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), TransportError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(invalid(format!("expected {keyword}")))
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), TransportError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(invalid(format!("expected {expected}, found {token}"))),
            None => Err(invalid(format!("expected {expected}, found end of selector"))),
        }
    }

    fn expr(&mut self) -> Result<Expr, TransportError> {
        let mut left = self.and()?;
        while self.eat_keyword("OR") {
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, TransportError> {
        let mut left = self.unary()?;
        while self.eat_keyword("AND") {
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, TransportError> {
        if self.eat_keyword("NOT") {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.expr()?;
            self.expect(Token::RParen)?;
            return Ok(inner);
        }
        self.predicate()
    }

    fn predicate(&mut self) -> Result<Expr, TransportError> {
        let left = self.operand()?;

        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.operand()?;
            return Ok(Expr::Compare(left, op, right));
        }

        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            self.expect_keyword("NULL")?;
            return Ok(Expr::IsNull(left, negated));
        }

        let negated = self.eat_keyword("NOT");
        if self.eat_keyword("IN") {
            self.expect(Token::LParen)?;
            let mut values = vec![self.literal()?];
            while self.peek() == Some(&Token::Comma) {
                self.pos += 1;
                values.push(self.literal()?);
            }
            self.expect(Token::RParen)?;
            return Ok(Expr::In(left, values, negated));
        }
        if self.eat_keyword("LIKE") {
            let pattern = self.string()?;
            let escape = if self.eat_keyword("ESCAPE") {
                let escape = self.string()?;
                let mut chars = escape.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Some(c),
                    _ => return Err(invalid("ESCAPE must be a single character")),
                }
            } else {
                None
            };
            return Ok(Expr::Like(left, LikePattern::new(&pattern, escape)?, negated));
        }
        if self.eat_keyword("BETWEEN") {
            let low = self.operand()?;
            self.expect_keyword("AND")?;
            let high = self.operand()?;
            return Ok(Expr::Between(left, low, high, negated));
        }
        if negated {
            return Err(invalid("expected IN, LIKE or BETWEEN after NOT"));
        }
        Ok(Expr::Value(left))
    }

    fn operand(&mut self) -> Result<Operand, TransportError> {
        match self.peek().cloned() {
            Some(Token::Ident(word)) if is_reserved(&word) => match word.to_ascii_uppercase().as_str() {
                "TRUE" | "FALSE" | "NULL" => self.literal().map(Operand::Literal),
                _ => Err(invalid(format!("unexpected keyword {word}"))),
            },
            Some(Token::Ident(name)) => {
                self.pos += 1;
                Ok(Operand::Property(name))
            }
            Some(_) => self.literal().map(Operand::Literal),
            None => Err(invalid("unexpected end of selector")),
        }
    }

    fn literal(&mut self) -> Result<Literal, TransportError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Literal::Str(s)),
            Some(Token::Num(n)) => Ok(Literal::Num(n)),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("TRUE") => Ok(Literal::Bool(true)),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("FALSE") => Ok(Literal::Bool(false)),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("NULL") => Ok(Literal::Null),
            Some(token) => Err(invalid(format!("expected a literal, found {token}"))),
            None => Err(invalid("expected a literal, found end of selector")),
        }
    }

    fn string(&mut self) -> Result<String, TransportError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(s),
            Some(token) => Err(invalid(format!("expected a string, found {token}"))),
            None => Err(invalid("expected a string, found end of selector")),
        }
    }
}

fn is_reserved(word: &str) -> bool {
    const RESERVED: [&str; 11] = [
        "AND", "OR", "NOT", "IN", "LIKE", "ESCAPE", "BETWEEN", "IS", "NULL", "TRUE", "FALSE",
    ];
    RESERVED.iter().any(|r| r.eq_ignore_ascii_case(word))
}
