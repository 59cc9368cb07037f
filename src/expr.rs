//! A small, safe expression sublanguage for sensor derivations:
//! arithmetic, comparison, logical ops, and a handful of builtins
//! (`re_match`, `len`, `abs`), deliberately short of a full scripting
//! VM. This module is a hand-written recursive-descent
//! tokenizer/parser/evaluator over that grammar — small enough that
//! pulling in a parser-combinator crate for it would be overkill.
//!
//! Grammar (highest to lowest precedence):
//!   primary    := number | string | "true" | "false" | "null"
//!              |  ident | ident "(" args ")" | "(" expr ")"
//!   unary      := "!" unary | "-" unary | primary
//!   mul        := unary (("*" | "/" | "%") unary)*
//!   add        := mul (("+" | "-") mul)*
//!   compare    := add (("==" | "!=" | "<" | "<=" | ">" | ">=") add)?
//!   and        := compare ("&&" compare)*
//!   or         := and ("||" and)*
//!   expr       := or

use crate::value::Value;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;

/// A value inside an expression's symbol table: supports the scalar
/// `Value` kinds plus lists, used for the `origin` ancestry chain.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Number(f64),
    Bool(bool),
    Text(String),
    Null,
    List(Vec<ExprValue>),
}

impl From<Value> for ExprValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Number(n) => ExprValue::Number(n),
            Value::Bool(b) => ExprValue::Bool(b),
            Value::Text(s) => ExprValue::Text(s),
        }
    }
}

impl From<&Value> for ExprValue {
    fn from(v: &Value) -> Self {
        ExprValue::from(v.clone())
    }
}

impl ExprValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            ExprValue::Number(n) => Some(*n),
            ExprValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            ExprValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn as_bool(&self) -> bool {
        match self {
            ExprValue::Bool(b) => *b,
            ExprValue::Number(n) => *n != 0.0,
            ExprValue::Text(s) => !s.is_empty(),
            ExprValue::Null => false,
            ExprValue::List(l) => !l.is_empty(),
        }
    }

    fn to_value(&self) -> Option<Value> {
        match self {
            ExprValue::Number(n) => Some(Value::Number(*n)),
            ExprValue::Bool(b) => Some(Value::Bool(*b)),
            ExprValue::Text(s) => Some(Value::Text(s.clone())),
            ExprValue::Null => None,
            ExprValue::List(_) => None,
        }
    }
}

pub type SymbolTable = HashMap<String, ExprValue>;

#[derive(Debug)]
pub struct ExprError(pub String);

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ExprError {}

/// Evaluate `code` against `symbols`, returning `Ok(None)` for a `null`
/// result (no assignment) and `Err` on a parse or runtime error. Never
/// panics on malformed input — bad expressions are a caller-visible
/// `Err`, which the caller logs and treats as a no-op write.
pub fn evaluate(code: &str, symbols: &SymbolTable) -> Result<Option<Value>, ExprError> {
    let tokens = tokenize(code)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        symbols,
    };
    let result = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError(format!(
            "unexpected trailing input at token {}",
            parser.pos
        )));
    }
    Ok(result.to_value())
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

fn tokenize(src: &str) -> Result<Vec<Tok>, ExprError> {
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    let mut out = Vec::new();

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '(' {
            out.push(Tok::LParen);
            i += 1;
        } else if c == ')' {
            out.push(Tok::RParen);
            i += 1;
        } else if c == ',' {
            out.push(Tok::Comma);
            i += 1;
        } else if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            let start = i;
            while i < chars.len() && chars[i] != quote {
                i += 1;
            }
            if i >= chars.len() {
                return Err(ExprError("unterminated string literal".into()));
            }
            out.push(Tok::Str(chars[start..i].iter().collect()));
            i += 1;
        } else if c.is_ascii_digit() || (c == '.' && i + 1 < chars.len() && chars[i + 1].is_ascii_digit()) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let n: f64 = text
                .parse()
                .map_err(|_| ExprError(format!("bad number literal `{text}`")))?;
            out.push(Tok::Num(n));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            out.push(Tok::Ident(chars[start..i].iter().collect()));
        } else {
            let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
            let op: &'static str = match two.as_str() {
                "==" => "==",
                "!=" => "!=",
                "<=" => "<=",
                ">=" => ">=",
                "&&" => "&&",
                "||" => "||",
                _ => match c {
                    '+' => "+",
                    '-' => "-",
                    '*' => "*",
                    '/' => "/",
                    '%' => "%",
                    '<' => "<",
                    '>' => ">",
                    '!' => "!",
                    other => return Err(ExprError(format!("unexpected character `{other}`"))),
                },
            };
            i += op.len();
            out.push(Tok::Op(op));
        }
    }
    Ok(out)
}

struct Parser<'a> {
    tokens: Vec<Tok>,
    pos: usize,
    symbols: &'a SymbolTable,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect_op(&mut self, op: &str) -> Result<(), ExprError> {
        match self.bump() {
            Some(Tok::Op(o)) if o == op => Ok(()),
            other => Err(ExprError(format!("expected `{op}`, got {other:?}"))),
        }
    }

    fn parse_or(&mut self) -> Result<ExprValue, ExprError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Tok::Op("||"))) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = ExprValue::Bool(lhs.as_bool() || rhs.as_bool());
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<ExprValue, ExprError> {
        let mut lhs = self.parse_compare()?;
        while matches!(self.peek(), Some(Tok::Op("&&"))) {
            self.bump();
            let rhs = self.parse_compare()?;
            lhs = ExprValue::Bool(lhs.as_bool() && rhs.as_bool());
        }
        Ok(lhs)
    }

    fn parse_compare(&mut self) -> Result<ExprValue, ExprError> {
        let lhs = self.parse_add()?;
        if let Some(Tok::Op(op)) = self.peek().cloned() {
            if matches!(op, "==" | "!=" | "<" | "<=" | ">" | ">=") {
                self.bump();
                let rhs = self.parse_add()?;
                return Ok(ExprValue::Bool(compare(op, &lhs, &rhs)));
            }
        }
        Ok(lhs)
    }

    fn parse_add(&mut self) -> Result<ExprValue, ExprError> {
        let mut lhs = self.parse_mul()?;
        loop {
            match self.peek() {
                Some(Tok::Op("+")) => {
                    self.bump();
                    let rhs = self.parse_mul()?;
                    lhs = arith(&lhs, &rhs, |a, b| a + b)?;
                }
                Some(Tok::Op("-")) => {
                    self.bump();
                    let rhs = self.parse_mul()?;
                    lhs = arith(&lhs, &rhs, |a, b| a - b)?;
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<ExprValue, ExprError> {
        let mut lhs = self.parse_unary()?;
        loop {
            match self.peek() {
                Some(Tok::Op("*")) => {
                    self.bump();
                    let rhs = self.parse_unary()?;
                    lhs = arith(&lhs, &rhs, |a, b| a * b)?;
                }
                Some(Tok::Op("/")) => {
                    self.bump();
                    let rhs = self.parse_unary()?;
                    lhs = arith(&lhs, &rhs, |a, b| a / b)?;
                }
                Some(Tok::Op("%")) => {
                    self.bump();
                    let rhs = self.parse_unary()?;
                    lhs = arith(&lhs, &rhs, |a, b| a % b)?;
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<ExprValue, ExprError> {
        match self.peek() {
            Some(Tok::Op("!")) => {
                self.bump();
                let v = self.parse_unary()?;
                Ok(ExprValue::Bool(!v.as_bool()))
            }
            Some(Tok::Op("-")) => {
                self.bump();
                let v = self.parse_unary()?;
                let n = v
                    .as_f64()
                    .ok_or_else(|| ExprError("unary `-` on non-numeric value".into()))?;
                Ok(ExprValue::Number(-n))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<ExprValue, ExprError> {
        match self.bump() {
            Some(Tok::Num(n)) => Ok(ExprValue::Number(n)),
            Some(Tok::Str(s)) => Ok(ExprValue::Text(s)),
            Some(Tok::LParen) => {
                let v = self.parse_or()?;
                match self.bump() {
                    Some(Tok::RParen) => Ok(v),
                    other => Err(ExprError(format!("expected `)`, got {other:?}"))),
                }
            }
            Some(Tok::Ident(name)) => {
                if matches!(self.peek(), Some(Tok::LParen)) {
                    self.bump();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Tok::RParen)) {
                        args.push(self.parse_or()?);
                        while matches!(self.peek(), Some(Tok::Comma)) {
                            self.bump();
                            args.push(self.parse_or()?);
                        }
                    }
                    match self.bump() {
                        Some(Tok::RParen) => {}
                        other => return Err(ExprError(format!("expected `)`, got {other:?}"))),
                    }
                    call_builtin(&name, args)
                } else {
                    Ok(self.lookup(&name))
                }
            }
            other => Err(ExprError(format!("unexpected token {other:?}"))),
        }
    }

    fn lookup(&self, name: &str) -> ExprValue {
        match name {
            "true" => return ExprValue::Bool(true),
            "false" => return ExprValue::Bool(false),
            "null" => return ExprValue::Null,
            _ => {}
        }
        self.symbols.get(name).cloned().unwrap_or(ExprValue::Null)
    }
}

fn arith(
    lhs: &ExprValue,
    rhs: &ExprValue,
    f: impl Fn(f64, f64) -> f64,
) -> Result<ExprValue, ExprError> {
    let a = lhs
        .as_f64()
        .ok_or_else(|| ExprError("arithmetic on non-numeric value".into()))?;
    let b = rhs
        .as_f64()
        .ok_or_else(|| ExprError("arithmetic on non-numeric value".into()))?;
    Ok(ExprValue::Number(f(a, b)))
}

fn compare(op: &str, lhs: &ExprValue, rhs: &ExprValue) -> bool {
    if let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) {
        return match op {
            "==" => a == b,
            "!=" => a != b,
            "<" => a < b,
            "<=" => a <= b,
            ">" => a > b,
            ">=" => a >= b,
            _ => false,
        };
    }
    let (a, b) = (text_of(lhs), text_of(rhs));
    match op {
        "==" => a == b,
        "!=" => a != b,
        "<" => a < b,
        "<=" => a <= b,
        ">" => a > b,
        ">=" => a >= b,
        _ => false,
    }
}

fn text_of(v: &ExprValue) -> String {
    match v {
        ExprValue::Text(s) => s.clone(),
        ExprValue::Number(n) => n.to_string(),
        ExprValue::Bool(b) => b.to_string(),
        ExprValue::Null => String::new(),
        ExprValue::List(_) => String::new(),
    }
}

fn call_builtin(name: &str, args: Vec<ExprValue>) -> Result<ExprValue, ExprError> {
    match name {
        "re_match" => {
            if args.len() != 2 {
                return Err(ExprError("re_match(value, pattern) takes 2 arguments".into()));
            }
            let value = text_of(&args[0]);
            let pattern = text_of(&args[1]);
            let re = Regex::new(&pattern)
                .map_err(|e| ExprError(format!("bad regex `{pattern}`: {e}")))?;
            Ok(ExprValue::Bool(re.is_match(&value)))
        }
        "len" => {
            if args.len() != 1 {
                return Err(ExprError("len(x) takes 1 argument".into()));
            }
            match &args[0] {
                ExprValue::List(l) => Ok(ExprValue::Number(l.len() as f64)),
                ExprValue::Text(s) => Ok(ExprValue::Number(s.chars().count() as f64)),
                _ => Err(ExprError("len() requires a list or string".into())),
            }
        }
        "abs" => {
            if args.len() != 1 {
                return Err(ExprError("abs(x) takes 1 argument".into()));
            }
            let n = args[0]
                .as_f64()
                .ok_or_else(|| ExprError("abs() requires a number".into()))?;
            Ok(ExprValue::Number(n.abs()))
        }
        other => Err(ExprError(format!("unknown function `{other}`"))),
    }
}

/// Build the list-valued `origin` symbol from a propagation chain.
pub fn origin_to_expr_value(origin: &[(String, String)]) -> ExprValue {
    ExprValue::List(
        origin
            .iter()
            .map(|(node, sensor)| {
                ExprValue::List(vec![
                    ExprValue::Text(node.clone()),
                    ExprValue::Text(sensor.clone()),
                ])
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syms() -> SymbolTable {
        HashMap::new()
    }

    #[test]
    fn arithmetic() {
        assert_eq!(
            evaluate("x * 2", &{
                let mut s = syms();
                s.insert("x".into(), ExprValue::Number(3.0));
                s
            })
            .unwrap(),
            Some(Value::Number(6.0))
        );
    }

    #[test]
    fn comparison_and_logic() {
        let mut s = syms();
        s.insert("x".into(), ExprValue::Number(5.0));
        assert_eq!(
            evaluate("x > 3 && x < 10", &s).unwrap(),
            Some(Value::Bool(true))
        );
    }

    #[test]
    fn null_literal_means_no_assignment() {
        assert_eq!(evaluate("null", &syms()).unwrap(), None);
    }

    #[test]
    fn regex_membership() {
        let mut s = syms();
        s.insert("msg".into(), ExprValue::Text("error: disk full".into()));
        assert_eq!(
            evaluate("re_match(msg, \"^error\")", &s).unwrap(),
            Some(Value::Bool(true))
        );
    }

    #[test]
    fn bad_syntax_is_an_error_not_a_panic() {
        assert!(evaluate("1 +", &syms()).is_err());
        assert!(evaluate("1 + + 2", &syms()).is_err());
    }

    #[test]
    fn origin_ancestry_is_a_list() {
        let origin = vec![("n1".to_string(), "x".to_string())];
        match origin_to_expr_value(&origin) {
            ExprValue::List(l) => assert_eq!(l.len(), 1),
            _ => panic!("expected list"),
        }
    }
}
