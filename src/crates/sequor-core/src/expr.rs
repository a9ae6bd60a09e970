//! The restricted expression language used by transition conditions,
//! argument bindings, and variable-node assignments.
//!
//! Expressions are evaluated against an immutable [`Env`] snapshot and can
//! never mutate anything, so evaluation is deterministic and safe to run from
//! the scheduler. The grammar is fixed:
//!
//! ```text
//! or_expr    := and_expr ("or" and_expr)*
//! and_expr   := not_expr ("and" not_expr)*
//! not_expr   := "not" not_expr | comparison
//! comparison := sum (("==" | "!=" | "<" | "<=" | ">" | ">=") sum)?
//! sum        := term (("+" | "-") term)*
//! term       := unary (("*" | "/" | "%") unary)*
//! unary      := "-" unary | postfix
//! postfix    := primary ("." IDENT | "[" or_expr "]" | "(" args ")")*
//! primary    := INT | FLOAT | STRING | "true" | "false" | "none"
//!             | IDENT | "[" args "]" | "(" or_expr ")"
//! ```
//!
//! Semantics in brief:
//!
//! - `and` / `or` short-circuit and require boolean operands.
//! - `+` adds numbers or concatenates strings; `/` always yields a float;
//!   the other arithmetic operators keep integers integral.
//! - Indexing reads arrays by integer and objects by string; an integer
//!   index on an object is coerced to its decimal string, which is how
//!   `results[3]` reads the result record of node 3.
//! - Attribute access (`record.field`) works on objects only; a missing
//!   field is an error, so absence checks go through explicit nulls
//!   (`results[3].exception == none`).
//! - Calls are restricted to a safelist: `len`, `str`, `int`, `float`,
//!   `bool`.

use crate::vars::Env;
use serde_json::Value;
use thiserror::Error;

/// Errors produced while parsing or evaluating an expression.
///
/// Byte offsets refer to the expression source string.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("parse error at byte {pos}: {message}")]
    Parse { pos: usize, message: String },

    #[error("undefined name '{name}'")]
    Undefined { name: String },

    #[error("type error at byte {pos}: {message}")]
    Type { pos: usize, message: String },

    #[error("'{name}' is not a callable builtin")]
    UnknownCall { name: String },

    #[error("condition must yield a boolean, got {got}")]
    NotBoolean { got: &'static str },
}

impl EvalError {
    fn type_err(pos: usize, message: impl Into<String>) -> Self {
        Self::Type {
            pos,
            message: message.into(),
        }
    }
}

/// Evaluate an expression against an environment snapshot.
pub fn evaluate(source: &str, env: &Env) -> Result<Value, EvalError> {
    let tokens = lex(source)?;
    let expr = Parser::new(&tokens, source.len()).parse()?;
    eval(&expr, env)
}

/// Evaluate a transition condition: like [`evaluate`], but the result must be
/// a boolean.
pub fn evaluate_condition(source: &str, env: &Env) -> Result<bool, EvalError> {
    match evaluate(source, env)? {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::NotBoolean {
            got: type_name(&other),
        }),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "none",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
}

#[derive(Debug, Clone)]
struct Spanned {
    tok: Tok,
    pos: usize,
}

fn lex(source: &str) -> Result<Vec<Spanned>, EvalError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '0'..='9' => {
                let mut text = String::new();
                let mut is_float = false;
                while let Some(&(_, d)) = chars.peek() {
                    if d.is_ascii_digit() {
                        text.push(d);
                        chars.next();
                    } else if d == '.' {
                        // A digit must follow for this to be a float; '3.x'
                        // is number then attribute access.
                        let mut ahead = chars.clone();
                        ahead.next();
                        match ahead.peek() {
                            Some(&(_, n)) if n.is_ascii_digit() => {
                                is_float = true;
                                text.push('.');
                                chars.next();
                            }
                            _ => break,
                        }
                    } else {
                        break;
                    }
                }
                let tok = if is_float {
                    Tok::Float(text.parse().map_err(|_| EvalError::Parse {
                        pos,
                        message: format!("invalid float literal '{text}'"),
                    })?)
                } else {
                    Tok::Int(text.parse().map_err(|_| EvalError::Parse {
                        pos,
                        message: format!("integer literal '{text}' out of range"),
                    })?)
                };
                tokens.push(Spanned { tok, pos });
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let mut text = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Spanned {
                    tok: Tok::Ident(text),
                    pos,
                });
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                while let Some((_, d)) = chars.next() {
                    if d == quote {
                        closed = true;
                        break;
                    }
                    if d == '\\' {
                        match chars.next() {
                            Some((_, 'n')) => text.push('\n'),
                            Some((_, 't')) => text.push('\t'),
                            Some((_, e)) => text.push(e),
                            None => break,
                        }
                    } else {
                        text.push(d);
                    }
                }
                if !closed {
                    return Err(EvalError::Parse {
                        pos,
                        message: "unterminated string literal".to_string(),
                    });
                }
                tokens.push(Spanned {
                    tok: Tok::Str(text),
                    pos,
                });
            }
            _ => {
                chars.next();
                let tok = match c {
                    '+' => Tok::Plus,
                    '-' => Tok::Minus,
                    '*' => Tok::Star,
                    '/' => Tok::Slash,
                    '%' => Tok::Percent,
                    '(' => Tok::LParen,
                    ')' => Tok::RParen,
                    '[' => Tok::LBracket,
                    ']' => Tok::RBracket,
                    '.' => Tok::Dot,
                    ',' => Tok::Comma,
                    '=' => match chars.peek() {
                        Some(&(_, '=')) => {
                            chars.next();
                            Tok::EqEq
                        }
                        _ => {
                            return Err(EvalError::Parse {
                                pos,
                                message: "'=' is not an operator; use '=='".to_string(),
                            })
                        }
                    },
                    '!' => match chars.peek() {
                        Some(&(_, '=')) => {
                            chars.next();
                            Tok::NotEq
                        }
                        _ => {
                            return Err(EvalError::Parse {
                                pos,
                                message: "'!' is not an operator; use 'not'".to_string(),
                            })
                        }
                    },
                    '<' => match chars.peek() {
                        Some(&(_, '=')) => {
                            chars.next();
                            Tok::Le
                        }
                        _ => Tok::Lt,
                    },
                    '>' => match chars.peek() {
                        Some(&(_, '=')) => {
                            chars.next();
                            Tok::Ge
                        }
                        _ => Tok::Gt,
                    },
                    other => {
                        return Err(EvalError::Parse {
                            pos,
                            message: format!("unexpected character '{other}'"),
                        })
                    }
                };
                tokens.push(Spanned { tok, pos });
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Name { name: String, pos: usize },
    List { items: Vec<Expr> },
    Negate { operand: Box<Expr>, pos: usize },
    Not { operand: Box<Expr>, pos: usize },
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr>, pos: usize },
    Attr { base: Box<Expr>, attr: String, pos: usize },
    Index { base: Box<Expr>, index: Box<Expr>, pos: usize },
    Call { name: String, args: Vec<Expr>, pos: usize },
}

struct Parser<'a> {
    tokens: &'a [Spanned],
    cursor: usize,
    end: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Spanned], end: usize) -> Self {
        Self {
            tokens,
            cursor: 0,
            end,
        }
    }

    fn parse(mut self) -> Result<Expr, EvalError> {
        let expr = self.or_expr()?;
        if let Some(sp) = self.peek() {
            return Err(EvalError::Parse {
                pos: sp.pos,
                message: format!("unexpected trailing token {:?}", sp.tok),
            });
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.cursor)
    }

    fn pos(&self) -> usize {
        self.peek().map_or(self.end, |sp| sp.pos)
    }

    fn advance(&mut self) -> Option<Spanned> {
        let sp = self.tokens.get(self.cursor).cloned();
        if sp.is_some() {
            self.cursor += 1;
        }
        sp
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek().map(|sp| &sp.tok) == Some(tok) {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        match self.peek() {
            Some(Spanned {
                tok: Tok::Ident(name),
                ..
            }) if name == word => {
                self.cursor += 1;
                true
            }
            _ => false,
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<usize, EvalError> {
        let pos = self.pos();
        match self.advance() {
            Some(sp) if sp.tok == tok => Ok(sp.pos),
            _ => Err(EvalError::Parse {
                pos,
                message: format!("expected {what}"),
            }),
        }
    }

    fn or_expr(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.and_expr()?;
        loop {
            let pos = self.pos();
            if !self.eat_keyword("or") {
                break;
            }
            let rhs = self.and_expr()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.not_expr()?;
        loop {
            let pos = self.pos();
            if !self.eat_keyword("and") {
                break;
            }
            let rhs = self.not_expr()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr, EvalError> {
        let pos = self.pos();
        if self.eat_keyword("not") {
            let operand = self.not_expr()?;
            return Ok(Expr::Not {
                operand: Box::new(operand),
                pos,
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, EvalError> {
        let lhs = self.sum()?;
        let op = match self.peek().map(|sp| &sp.tok) {
            Some(Tok::EqEq) => BinOp::Eq,
            Some(Tok::NotEq) => BinOp::Ne,
            Some(Tok::Lt) => BinOp::Lt,
            Some(Tok::Le) => BinOp::Le,
            Some(Tok::Gt) => BinOp::Gt,
            Some(Tok::Ge) => BinOp::Ge,
            _ => return Ok(lhs),
        };
        let pos = self.pos();
        self.cursor += 1;
        let rhs = self.sum()?;
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            pos,
        })
    }

    fn sum(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek().map(|sp| &sp.tok) {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            let pos = self.pos();
            self.cursor += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek().map(|sp| &sp.tok) {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                Some(Tok::Percent) => BinOp::Rem,
                _ => break,
            };
            let pos = self.pos();
            self.cursor += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        let pos = self.pos();
        if self.eat(&Tok::Minus) {
            let operand = self.unary()?;
            return Ok(Expr::Negate {
                operand: Box::new(operand),
                pos,
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Tok::Dot) {
                let pos = self.pos();
                match self.advance() {
                    Some(Spanned {
                        tok: Tok::Ident(attr),
                        ..
                    }) => {
                        expr = Expr::Attr {
                            base: Box::new(expr),
                            attr,
                            pos,
                        };
                    }
                    _ => {
                        return Err(EvalError::Parse {
                            pos,
                            message: "expected attribute name after '.'".to_string(),
                        })
                    }
                }
            } else if self.peek().map(|sp| &sp.tok) == Some(&Tok::LBracket) {
                let pos = self.pos();
                self.cursor += 1;
                let index = self.or_expr()?;
                self.expect(Tok::RBracket, "']'")?;
                expr = Expr::Index {
                    base: Box::new(expr),
                    index: Box::new(index),
                    pos,
                };
            } else if self.peek().map(|sp| &sp.tok) == Some(&Tok::LParen) {
                let pos = self.pos();
                // Only bare identifiers are callable, and only safelisted
                // ones survive evaluation.
                let name = match &expr {
                    Expr::Name { name, .. } => name.clone(),
                    _ => {
                        return Err(EvalError::Parse {
                            pos,
                            message: "only builtin names can be called".to_string(),
                        })
                    }
                };
                self.cursor += 1;
                let args = self.call_args()?;
                expr = Expr::Call { name, args, pos };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, EvalError> {
        let mut args = Vec::new();
        if self.eat(&Tok::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.or_expr()?);
            if self.eat(&Tok::Comma) {
                continue;
            }
            self.expect(Tok::RParen, "')'")?;
            break;
        }
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr, EvalError> {
        let pos = self.pos();
        match self.advance() {
            Some(Spanned { tok: Tok::Int(i), .. }) => Ok(Expr::Literal(Value::from(i))),
            Some(Spanned {
                tok: Tok::Float(f), ..
            }) => Ok(Expr::Literal(Value::from(f))),
            Some(Spanned { tok: Tok::Str(s), .. }) => Ok(Expr::Literal(Value::from(s))),
            Some(Spanned {
                tok: Tok::Ident(name),
                pos,
            }) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "none" => Ok(Expr::Literal(Value::Null)),
                _ => Ok(Expr::Name { name, pos }),
            },
            Some(Spanned {
                tok: Tok::LParen, ..
            }) => {
                let inner = self.or_expr()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            Some(Spanned {
                tok: Tok::LBracket, ..
            }) => {
                let mut items = Vec::new();
                if self.eat(&Tok::RBracket) {
                    return Ok(Expr::List { items });
                }
                loop {
                    items.push(self.or_expr()?);
                    if self.eat(&Tok::Comma) {
                        continue;
                    }
                    self.expect(Tok::RBracket, "']'")?;
                    break;
                }
                Ok(Expr::List { items })
            }
            _ => Err(EvalError::Parse {
                pos,
                message: "expected a value".to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

fn eval(expr: &Expr, env: &Env) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Name { name, .. } => env
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::Undefined { name: name.clone() }),
        Expr::List { items } => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, env)?);
            }
            Ok(Value::Array(out))
        }
        Expr::Negate { operand, pos } => match eval(operand, env)? {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::from(-i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::from(-f))
                } else {
                    Err(EvalError::type_err(*pos, "cannot negate this number"))
                }
            }
            other => Err(EvalError::type_err(
                *pos,
                format!("cannot negate {}", type_name(&other)),
            )),
        },
        Expr::Not { operand, pos } => match eval(operand, env)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(EvalError::type_err(
                *pos,
                format!("'not' needs a boolean, got {}", type_name(&other)),
            )),
        },
        Expr::Binary { op, lhs, rhs, pos } => eval_binary(*op, lhs, rhs, *pos, env),
        Expr::Attr { base, attr, pos } => match eval(base, env)? {
            Value::Object(map) => map.get(attr).cloned().ok_or_else(|| {
                EvalError::type_err(*pos, format!("no attribute '{attr}' on object"))
            }),
            other => Err(EvalError::type_err(
                *pos,
                format!("cannot access '.{attr}' on {}", type_name(&other)),
            )),
        },
        Expr::Index { base, index, pos } => {
            let base = eval(base, env)?;
            let index = eval(index, env)?;
            eval_index(&base, &index, *pos)
        }
        Expr::Call { name, args, pos } => eval_call(name, args, *pos, env),
    }
}

fn eval_binary(
    op: BinOp,
    lhs: &Expr,
    rhs: &Expr,
    pos: usize,
    env: &Env,
) -> Result<Value, EvalError> {
    // Short-circuit forms first; their right side must not be evaluated
    // when the left side decides the outcome.
    match op {
        BinOp::And | BinOp::Or => {
            let left = match eval(lhs, env)? {
                Value::Bool(b) => b,
                other => {
                    return Err(EvalError::type_err(
                        pos,
                        format!("boolean operator needs booleans, got {}", type_name(&other)),
                    ))
                }
            };
            if (op == BinOp::And && !left) || (op == BinOp::Or && left) {
                return Ok(Value::Bool(left));
            }
            return match eval(rhs, env)? {
                Value::Bool(b) => Ok(Value::Bool(b)),
                other => Err(EvalError::type_err(
                    pos,
                    format!("boolean operator needs booleans, got {}", type_name(&other)),
                )),
            };
        }
        _ => {}
    }

    let left = eval(lhs, env)?;
    let right = eval(rhs, env)?;

    match op {
        BinOp::Eq => Ok(Value::Bool(values_equal(&left, &right))),
        BinOp::Ne => Ok(Value::Bool(!values_equal(&left, &right))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = compare(&left, &right).ok_or_else(|| {
                EvalError::type_err(
                    pos,
                    format!(
                        "cannot order {} and {}",
                        type_name(&left),
                        type_name(&right)
                    ),
                )
            })?;
            let holds = match op {
                BinOp::Lt => ordering == std::cmp::Ordering::Less,
                BinOp::Le => ordering != std::cmp::Ordering::Greater,
                BinOp::Gt => ordering == std::cmp::Ordering::Greater,
                BinOp::Ge => ordering != std::cmp::Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Bool(holds))
        }
        BinOp::Add => match (&left, &right) {
            (Value::String(a), Value::String(b)) => Ok(Value::from(format!("{a}{b}"))),
            _ => arith(&left, &right, pos, "+", |a, b| a.checked_add(b), |a, b| a + b),
        },
        BinOp::Sub => arith(&left, &right, pos, "-", |a, b| a.checked_sub(b), |a, b| a - b),
        BinOp::Mul => arith(&left, &right, pos, "*", |a, b| a.checked_mul(b), |a, b| a * b),
        BinOp::Div => {
            let (a, b) = as_floats(&left, &right)
                .ok_or_else(|| EvalError::type_err(pos, "'/' needs numbers"))?;
            if b == 0.0 {
                return Err(EvalError::type_err(pos, "division by zero"));
            }
            Ok(Value::from(a / b))
        }
        BinOp::Rem => match (left.as_i64(), right.as_i64()) {
            (Some(_), Some(0)) => Err(EvalError::type_err(pos, "modulo by zero")),
            (Some(a), Some(b)) => Ok(Value::from(a.rem_euclid(b))),
            _ => {
                let (a, b) = as_floats(&left, &right)
                    .ok_or_else(|| EvalError::type_err(pos, "'%' needs numbers"))?;
                if b == 0.0 {
                    return Err(EvalError::type_err(pos, "modulo by zero"));
                }
                Ok(Value::from(a.rem_euclid(b)))
            }
        },
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn arith(
    left: &Value,
    right: &Value,
    pos: usize,
    op: &str,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        return int_op(a, b)
            .map(Value::from)
            .ok_or_else(|| EvalError::type_err(pos, "integer overflow"));
    }
    let (a, b) = as_floats(left, right)
        .ok_or_else(|| EvalError::type_err(pos, format!("'{op}' needs numbers")))?;
    Ok(Value::from(float_op(a, b)))
}

fn as_floats(left: &Value, right: &Value) -> Option<(f64, f64)> {
    Some((left.as_f64()?, right.as_f64()?))
}

/// Equality with cross-type numeric comparison, so `1 == 1.0` holds.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => a.as_f64() == b.as_f64(),
        },
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn eval_call(name: &str, args: &[Expr], pos: usize, env: &Env) -> Result<Value, EvalError> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        values.push(eval(arg, env)?);
    }
    let arity = values.len();
    let value = match values.pop() {
        Some(value) if values.is_empty() => value,
        _ => {
            return Err(EvalError::type_err(
                pos,
                format!("{name}() takes exactly one argument, got {arity}"),
            ))
        }
    };

    match name {
        "len" => match &value {
            Value::String(s) => Ok(Value::from(s.chars().count() as i64)),
            Value::Array(items) => Ok(Value::from(items.len() as i64)),
            Value::Object(map) => Ok(Value::from(map.len() as i64)),
            other => Err(EvalError::type_err(
                pos,
                format!("len() of {}", type_name(other)),
            )),
        },
        "str" => Ok(Value::from(stringify(&value))),
        "int" => match &value {
            Value::Number(n) if n.as_i64().is_some() => Ok(value.clone()),
            Value::Number(n) => Ok(Value::from(n.as_f64().unwrap_or(0.0) as i64)),
            Value::Bool(b) => Ok(Value::from(*b as i64)),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| EvalError::type_err(pos, format!("int() of '{s}'"))),
            other => Err(EvalError::type_err(
                pos,
                format!("int() of {}", type_name(other)),
            )),
        },
        "float" => match &value {
            Value::Number(n) => Ok(Value::from(n.as_f64().unwrap_or(0.0))),
            Value::Bool(b) => Ok(Value::from(*b as i64 as f64)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| EvalError::type_err(pos, format!("float() of '{s}'"))),
            other => Err(EvalError::type_err(
                pos,
                format!("float() of {}", type_name(other)),
            )),
        },
        "bool" => match &value {
            Value::Bool(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::Bool(n.as_f64() != Some(0.0))),
            other => Err(EvalError::type_err(
                pos,
                format!("bool() of {}", type_name(other)),
            )),
        },
        _ => Err(EvalError::UnknownCall {
            name: name.to_string(),
        }),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => "none".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn eval_index(base: &Value, index: &Value, pos: usize) -> Result<Value, EvalError> {
    match (base, index) {
        (Value::Array(items), Value::Number(n)) => {
            let i = n
                .as_i64()
                .ok_or_else(|| EvalError::type_err(pos, "list index must be an integer"))?;
            if i < 0 || i as usize >= items.len() {
                return Err(EvalError::type_err(
                    pos,
                    format!("list index {i} out of range (len {})", items.len()),
                ));
            }
            Ok(items[i as usize].clone())
        }
        (Value::Object(map), Value::String(key)) => map
            .get(key)
            .cloned()
            .ok_or_else(|| EvalError::type_err(pos, format!("no key '{key}' in object"))),
        (Value::Object(map), Value::Number(n)) => {
            // Integer keys read objects keyed by decimal strings; this is
            // what makes `results[3]` resolve.
            let key = n.to_string();
            map.get(&key)
                .cloned()
                .ok_or_else(|| EvalError::type_err(pos, format!("no key '{key}' in object")))
        }
        (other, _) => Err(EvalError::type_err(
            pos,
            format!("cannot index {}", type_name(other)),
        )),
    }
}
