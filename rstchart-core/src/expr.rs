//! Reference evaluator over JSON values.
//!
//! The expression language supports:
//!
//! - literals: numbers, `"strings"` or `'strings'`, `true`, `false`, `null`,
//!   arrays `[1, 2]` and objects `{"k": v}`
//! - variables and paths: `count`, `order.items[0].price`, `_event.data.x`
//! - system variables: `_event`, `_sessionid`, `_name`, `_ioprocessors`
//! - arithmetic `+ - * / %` (`+` concatenates when either side is a string)
//! - comparisons `== != < <= > >=`
//! - logic `&& || !` and grouping with `( )`
//! - `In('state')`
//!
//! Scripts are `;`-separated statements, each either an assignment
//! (`x = x + 1`), a declaration (`var y = 2`) or an expression.

use crate::error::EvalError;
use crate::evaluator::{EvalContext, Evaluator, EvaluatorFactory};
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::sync::Arc;

const SYSTEM_VARIABLES: &[&str] = &["_event", "_sessionid", "_name", "_ioprocessors"];

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// A parsed expression.
#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Variable(String),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    In(Box<Expr>),
}

/// Evaluator keeping variables as a JSON object.
#[derive(Debug, Default)]
pub struct JsonEvaluator {
    vars: Map<String, Value>,
    cache: HashMap<String, Arc<Expr>>,
}

impl JsonEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory producing a fresh evaluator per session.
    pub fn factory() -> EvaluatorFactory {
        Arc::new(|| Box::new(JsonEvaluator::new()) as Box<dyn Evaluator>)
    }

    fn parsed(&mut self, src: &str) -> Result<Arc<Expr>, EvalError> {
        if let Some(expr) = self.cache.get(src) {
            return Ok(Arc::clone(expr));
        }
        let expr = Arc::new(Parser::new(src).parse()?);
        self.cache.insert(src.to_string(), Arc::clone(&expr));
        Ok(expr)
    }

    fn eval(&mut self, src: &str, ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
        let expr = self.parsed(src)?;
        eval_expr(&expr, &self.vars, ctx)
    }
}

impl Evaluator for JsonEvaluator {
    fn declare(&mut self, id: &str, value: Value) {
        self.vars.insert(id.to_string(), value);
    }

    fn evaluate_guard(&mut self, expr: &str, ctx: &EvalContext<'_>) -> Result<bool, EvalError> {
        self.eval(expr, ctx).map(|v| is_truthy(&v))
    }

    fn evaluate_expr(&mut self, expr: &str, ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
        self.eval(expr, ctx)
    }

    fn assign(&mut self, location: &str, value: Value, ctx: &EvalContext<'_>) -> Result<(), EvalError> {
        let target = self.parsed(location)?;
        let path = location_path(&target, &self.vars, ctx).ok_or_else(|| {
            EvalError::InvalidLocation {
                location: location.to_string(),
                reason: "not an assignable path".to_string(),
            }
        })?;
        let (root, rest) = path
            .split_first()
            .ok_or_else(|| EvalError::InvalidLocation {
                location: location.to_string(),
                reason: "empty location".to_string(),
            })?;
        let PathSegment::Key(root) = root else {
            return Err(EvalError::InvalidLocation {
                location: location.to_string(),
                reason: "location must start with a variable".to_string(),
            });
        };
        if SYSTEM_VARIABLES.contains(&root.as_str()) {
            return Err(EvalError::InvalidLocation {
                location: location.to_string(),
                reason: "system variables are read-only".to_string(),
            });
        }
        let slot = self.vars.get_mut(root).ok_or_else(|| EvalError::Undeclared {
            location: root.clone(),
        })?;
        store(slot, rest, value).map_err(|reason| EvalError::InvalidLocation {
            location: location.to_string(),
            reason,
        })
    }

    fn execute_script(&mut self, source: &str, ctx: &EvalContext<'_>) -> Result<(), EvalError> {
        for statement in split_statements(source) {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            if let Some(decl) = statement.strip_prefix("var ") {
                let (name, init) = match find_assignment(decl) {
                    Some(pos) => (decl[..pos].trim(), Some(decl[pos + 1..].trim())),
                    None => (decl.trim(), None),
                };
                if !is_identifier(name) {
                    return Err(EvalError::Syntax {
                        expr: statement.to_string(),
                        reason: format!("invalid variable name '{}'", name),
                    });
                }
                let value = match init {
                    Some(init) => self.eval(init, ctx)?,
                    None => Value::Null,
                };
                self.declare(name, value);
            } else if let Some(pos) = find_assignment(statement) {
                let value = self.eval(statement[pos + 1..].trim(), ctx)?;
                self.assign(statement[..pos].trim(), value, ctx)?;
            } else {
                self.eval(statement, ctx)?;
            }
        }
        Ok(())
    }

    fn has_location(&self, location: &str) -> bool {
        let root = location
            .split(|c| c == '.' || c == '[')
            .next()
            .unwrap_or_default()
            .trim();
        self.vars.contains_key(root)
    }

    fn variables(&self) -> Value {
        Value::Object(self.vars.clone())
    }
}

// =========================================================================
// Evaluation
// =========================================================================

fn eval_expr(expr: &Expr, vars: &Map<String, Value>, ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Array(items) => items
            .iter()
            .map(|e| eval_expr(e, vars, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Object(fields) => {
            let mut map = Map::new();
            for (k, e) in fields {
                map.insert(k.clone(), eval_expr(e, vars, ctx)?);
            }
            Ok(Value::Object(map))
        }
        Expr::Variable(name) => lookup_variable(name, vars, ctx),
        Expr::Field(base, field) => {
            let base = eval_expr(base, vars, ctx)?;
            Ok(match (&base, field.as_str()) {
                (Value::Array(items), "length") => Value::from(items.len()),
                (Value::String(s), "length") => Value::from(s.chars().count()),
                _ => base.get(field.as_str()).cloned().unwrap_or(Value::Null),
            })
        }
        Expr::Index(base, index) => {
            let base = eval_expr(base, vars, ctx)?;
            let index = eval_expr(index, vars, ctx)?;
            Ok(match (&base, &index) {
                (Value::Array(items), Value::Number(n)) => n
                    .as_u64()
                    .and_then(|i| items.get(i as usize).cloned())
                    .unwrap_or(Value::Null),
                (Value::Object(map), Value::String(k)) => map.get(k).cloned().unwrap_or(Value::Null),
                _ => Value::Null,
            })
        }
        Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&eval_expr(inner, vars, ctx)?))),
        Expr::Neg(inner) => {
            let v = eval_expr(inner, vars, ctx)?;
            let n = as_f64(&v).ok_or_else(|| EvalError::Type {
                reason: format!("cannot negate {}", v),
            })?;
            number(-n)
        }
        Expr::In(arg) => match eval_expr(arg, vars, ctx)? {
            Value::String(id) => Ok(Value::Bool(ctx.in_state(&id))),
            other => Err(EvalError::Type {
                reason: format!("In() expects a state id, got {}", other),
            }),
        },
        Expr::Binary(BinaryOp::And, l, r) => {
            let left = eval_expr(l, vars, ctx)?;
            if !is_truthy(&left) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(is_truthy(&eval_expr(r, vars, ctx)?)))
        }
        Expr::Binary(BinaryOp::Or, l, r) => {
            let left = eval_expr(l, vars, ctx)?;
            if is_truthy(&left) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(is_truthy(&eval_expr(r, vars, ctx)?)))
        }
        Expr::Binary(op, l, r) => {
            let left = eval_expr(l, vars, ctx)?;
            let right = eval_expr(r, vars, ctx)?;
            binary(*op, &left, &right)
        }
    }
}

fn lookup_variable(name: &str, vars: &Map<String, Value>, ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
    match name {
        "_event" => Ok(ctx.system.event_value()),
        "_sessionid" => Ok(Value::String(ctx.system.session_id.clone())),
        "_name" => Ok(Value::String(ctx.system.name.clone())),
        "_ioprocessors" => Ok(ctx.system.ioprocessors_value()),
        _ => vars.get(name).cloned().ok_or_else(|| EvalError::Undeclared {
            location: name.to_string(),
        }),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (left, right) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => as_f64(left)
                    .zip(as_f64(right))
                    .and_then(|(a, b)| a.partial_cmp(&b)),
            };
            let result = ordering.map(|o| match op {
                BinaryOp::Lt => o.is_lt(),
                BinaryOp::Le => o.is_le(),
                BinaryOp::Gt => o.is_gt(),
                _ => o.is_ge(),
            });
            Ok(Value::Bool(result.unwrap_or(false)))
        }
        BinaryOp::Add => match (left, right) {
            (Value::String(a), b) => Ok(Value::String(format!("{}{}", a, display(b)))),
            (a, Value::String(b)) => Ok(Value::String(format!("{}{}", display(a), b))),
            (Value::Array(a), Value::Array(b)) => {
                Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
            }
            _ => arithmetic(op, left, right),
        },
        _ => arithmetic(op, left, right),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    let (a, b) = as_f64(left).zip(as_f64(right)).ok_or_else(|| EvalError::Type {
        reason: format!("arithmetic on non-numbers: {} and {}", left, right),
    })?;
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => {
            return Err(EvalError::Type {
                reason: "division by zero".to_string(),
            })
        }
        BinaryOp::Div => a / b,
        _ => a % b,
    };
    number(result)
}

fn number(n: f64) -> Result<Value, EvalError> {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        return Ok(Value::Number(Number::from(n as i64)));
    }
    Number::from_f64(n).map(Value::Number).ok_or_else(|| EvalError::Type {
        reason: format!("not a finite number: {}", n),
    })
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Truthiness of a JSON value. Empty containers are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        _ => a == b,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

// =========================================================================
// Assignment
// =========================================================================

enum PathSegment {
    Key(String),
    Index(usize),
}

/// Flattens an lvalue expression into path segments. Index expressions are
/// evaluated against the current variables.
fn location_path(expr: &Expr, vars: &Map<String, Value>, ctx: &EvalContext<'_>) -> Option<Vec<PathSegment>> {
    match expr {
        Expr::Variable(name) => Some(vec![PathSegment::Key(name.clone())]),
        Expr::Field(base, field) => {
            let mut path = location_path(base, vars, ctx)?;
            path.push(PathSegment::Key(field.clone()));
            Some(path)
        }
        Expr::Index(base, index) => {
            let mut path = location_path(base, vars, ctx)?;
            match eval_expr(index, vars, ctx).ok()? {
                Value::Number(n) => path.push(PathSegment::Index(n.as_u64()? as usize)),
                Value::String(k) => path.push(PathSegment::Key(k)),
                _ => return None,
            }
            Some(path)
        }
        _ => None,
    }
}

fn store(slot: &mut Value, path: &[PathSegment], value: Value) -> Result<(), String> {
    let Some((head, rest)) = path.split_first() else {
        *slot = value;
        return Ok(());
    };
    match (head, slot) {
        (PathSegment::Key(k), Value::Object(map)) => {
            let next = map.entry(k.clone()).or_insert(Value::Null);
            if !rest.is_empty() && next.is_null() {
                *next = Value::Object(Map::new());
            }
            store(next, rest, value)
        }
        (PathSegment::Index(i), Value::Array(items)) => {
            if *i < items.len() {
                store(&mut items[*i], rest, value)
            } else if *i == items.len() && rest.is_empty() {
                items.push(value);
                Ok(())
            } else {
                Err(format!("index {} out of bounds", i))
            }
        }
        (_, other) => Err(format!("cannot index into {}", other)),
    }
}

/// Splits a script on `;` outside of string literals.
fn split_statements(source: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in source.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            ';' | '\n' => {
                out.push(&source[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&source[start..]);
    out
}

/// Position of a top-level `=` that is not part of `==`, `!=`, `<=`, `>=`.
fn find_assignment(statement: &str) -> Option<usize> {
    let bytes = statement.as_bytes();
    let mut quote: Option<u8> = None;
    for i in 0..bytes.len() {
        let c = bytes[i];
        if let Some(q) = quote {
            if c == q && (i == 0 || bytes[i - 1] != b'\\') {
                quote = None;
            }
            continue;
        }
        match c {
            b'"' | b'\'' => quote = Some(c),
            b'=' => {
                let prev = if i > 0 { bytes[i - 1] } else { b' ' };
                let next = bytes.get(i + 1).copied().unwrap_or(b' ');
                if !matches!(prev, b'=' | b'!' | b'<' | b'>') && next != b'=' {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => chars.all(|c| c.is_alphanumeric() || c == '_'),
        _ => false,
    }
}

// =========================================================================
// Parser
// =========================================================================

/// Recursive descent parser.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn error(&self, reason: impl Into<String>) -> EvalError {
        EvalError::Syntax {
            expr: self.input.to_string(),
            reason: reason.into(),
        }
    }

    fn parse(mut self) -> Result<Expr, EvalError> {
        self.skip_whitespace();
        if self.pos >= self.input.len() {
            return Err(self.error("empty expression"));
        }
        let expr = self.parse_or()?;
        self.skip_whitespace();
        if self.pos < self.input.len() {
            return Err(self.error(format!("unexpected input at offset {}", self.pos)));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_equality()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_equality()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_comparison()?;
        loop {
            self.skip_whitespace();
            let op = if self.peek_str("==") {
                BinaryOp::Eq
            } else if self.peek_str("!=") {
                BinaryOp::Ne
            } else {
                return Ok(left);
            };
            self.pos += 2;
            let right = self.parse_comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_additive()?;
        loop {
            self.skip_whitespace();
            let (op, len) = if self.peek_str(">=") {
                (BinaryOp::Ge, 2)
            } else if self.peek_str("<=") {
                (BinaryOp::Le, 2)
            } else if self.peek_char() == Some('>') {
                (BinaryOp::Gt, 1)
            } else if self.peek_char() == Some('<') {
                (BinaryOp::Lt, 1)
            } else {
                return Ok(left);
            };
            self.pos += len;
            let right = self.parse_additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            self.skip_whitespace();
            let op = match self.peek_char() {
                Some('+') => BinaryOp::Add,
                Some('-') => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_unary()?;
        loop {
            self.skip_whitespace();
            let op = match self.peek_char() {
                Some('*') => BinaryOp::Mul,
                Some('/') => BinaryOp::Div,
                Some('%') => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('!') => {
                self.pos += 1;
                let inner = self.parse_unary()?;
                Ok(Expr::Not(Box::new(inner)))
            }
            Some('-') => {
                self.pos += 1;
                let inner = self.parse_unary()?;
                Ok(Expr::Neg(Box::new(inner)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek_char() {
                Some('.') => {
                    self.pos += 1;
                    let field = self.parse_identifier()?;
                    expr = Expr::Field(Box::new(expr), field);
                }
                Some('[') => {
                    self.pos += 1;
                    let index = self.parse_or()?;
                    self.expect(']')?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('(') => {
                self.pos += 1;
                let expr = self.parse_or()?;
                self.expect(')')?;
                Ok(expr)
            }
            Some('[') => {
                self.pos += 1;
                let items = self.parse_list(']')?;
                Ok(Expr::Array(items))
            }
            Some('{') => {
                self.pos += 1;
                self.parse_object()
            }
            Some('"') | Some('\'') => Ok(Expr::Literal(Value::String(self.parse_string()?))),
            Some(c) if c.is_ascii_digit() => Ok(Expr::Literal(self.parse_number()?)),
            Some(c) if c.is_alphabetic() || c == '_' => {
                let name = self.parse_identifier()?;
                match name.as_str() {
                    "true" => Ok(Expr::Literal(Value::Bool(true))),
                    "false" => Ok(Expr::Literal(Value::Bool(false))),
                    "null" => Ok(Expr::Literal(Value::Null)),
                    "In" => {
                        self.skip_whitespace();
                        self.expect('(')?;
                        let arg = self.parse_or()?;
                        self.expect(')')?;
                        Ok(Expr::In(Box::new(arg)))
                    }
                    _ => Ok(Expr::Variable(name)),
                }
            }
            Some(c) => Err(self.error(format!("unexpected character '{}'", c))),
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn parse_list(&mut self, close: char) -> Result<Vec<Expr>, EvalError> {
        let mut items = Vec::new();
        self.skip_whitespace();
        if self.peek_char() == Some(close) {
            self.pos += 1;
            return Ok(items);
        }
        loop {
            items.push(self.parse_or()?);
            self.skip_whitespace();
            match self.peek_char() {
                Some(',') => self.pos += 1,
                Some(c) if c == close => {
                    self.pos += 1;
                    return Ok(items);
                }
                _ => return Err(self.error(format!("expected ',' or '{}'", close))),
            }
        }
    }

    fn parse_object(&mut self) -> Result<Expr, EvalError> {
        let mut fields = Vec::new();
        self.skip_whitespace();
        if self.peek_char() == Some('}') {
            self.pos += 1;
            return Ok(Expr::Object(fields));
        }
        loop {
            self.skip_whitespace();
            let key = match self.peek_char() {
                Some('"') | Some('\'') => self.parse_string()?,
                _ => self.parse_identifier()?,
            };
            self.expect(':')?;
            fields.push((key, self.parse_or()?));
            self.skip_whitespace();
            match self.peek_char() {
                Some(',') => self.pos += 1,
                Some('}') => {
                    self.pos += 1;
                    return Ok(Expr::Object(fields));
                }
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }
    }

    fn parse_identifier(&mut self) -> Result<String, EvalError> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(self.error("expected identifier"));
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn parse_string(&mut self) -> Result<String, EvalError> {
        let quote = self.peek_char().ok_or_else(|| self.error("expected string"))?;
        self.pos += 1;

        let mut out = String::new();
        let mut chars = self.input[self.pos..].char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    let (_, escaped) = chars.next().ok_or_else(|| self.error("unterminated string"))?;
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        other => other,
                    });
                }
                c if c == quote => {
                    self.pos += i + 1;
                    return Ok(out);
                }
                c => out.push(c),
            }
        }

        Err(self.error("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<Value, EvalError> {
        let start = self.pos;
        let mut fractional = false;

        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == '.' && !fractional {
                fractional = true;
                self.pos += 1;
            } else {
                break;
            }
        }

        let num_str = &self.input[start..self.pos];
        if !fractional {
            if let Ok(n) = num_str.parse::<i64>() {
                return Ok(Value::Number(Number::from(n)));
            }
        }
        let n = num_str
            .parse::<f64>()
            .map_err(|_| self.error(format!("invalid number: '{}'", num_str)))?;
        Number::from_f64(n)
            .map(Value::Number)
            .ok_or_else(|| self.error(format!("invalid number: '{}'", num_str)))
    }

    fn expect(&mut self, c: char) -> Result<(), EvalError> {
        self.skip_whitespace();
        if self.peek_char() != Some(c) {
            return Err(self.error(format!("expected '{}'", c)));
        }
        self.pos += 1;
        Ok(())
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}
