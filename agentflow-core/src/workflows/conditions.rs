use serde_json::{Number, Value};
use thiserror::Error;

use super::paths::resolve_scoped;

#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("condition parse error: {0}")]
    Parse(String),
    #[error("condition evaluation error: {0}")]
    Evaluation(String),
}

/// Evaluates a step gate against the run scope.
///
/// Every `${path}` token is replaced by the JSON encoding of the resolved
/// value; an absent path substitutes the bare word `undefined`, which the
/// grammar rejects. Any failure logs a warning and lets the step run, so a
/// broken gate is visible in logs but never silently drops work.
pub fn evaluate_condition(expression: &str, root: &Value) -> bool {
    let substituted = substitute(expression, root);
    match evaluate(&substituted) {
        Ok(value) => is_truthy(&value),
        Err(err) => {
            tracing::warn!(
                condition = expression,
                rewritten = %substituted,
                error = %err,
                "condition evaluation failed, running step"
            );
            true
        }
    }
}

fn substitute(expression: &str, root: &Value) -> String {
    let mut out = String::with_capacity(expression.len());
    let mut rest = expression;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        match resolve_scoped(root, &after[..end]) {
            Some(value) => out.push_str(&value.to_string()),
            None => out.push_str("undefined"),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(v) => *v,
        Value::Number(v) => v.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(v) => !v.is_empty(),
        Value::Array(v) => !v.is_empty(),
        Value::Object(v) => !v.is_empty(),
        Value::Null => false,
    }
}

fn evaluate(expression: &str) -> Result<Value, ConditionError> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expression()?;
    parser.expect_end()?;
    eval(&expr)
}

#[derive(Debug, Clone)]
enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy)]
enum BinaryOp {
    Or,
    And,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone)]
enum Token {
    LParen,
    RParen,
    Not,
    Minus,
    EqEq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    AndAnd,
    OrOr,
    Number(f64),
    String(String),
    True,
    False,
    Null,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut chars = input.char_indices().peekable();
    let mut tokens = Vec::new();

    while let Some((idx, ch)) = chars.peek().copied() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }

        if ch.is_ascii_digit() {
            let start = idx;
            chars.next();
            while let Some((_, c)) = chars.peek().copied() {
                if c.is_ascii_digit() || c == '.' {
                    chars.next();
                } else {
                    break;
                }
            }
            let end = chars.peek().map(|(i, _)| *i).unwrap_or(input.len());
            let text = &input[start..end];
            let number = text
                .parse::<f64>()
                .map_err(|err| ConditionError::Parse(format!("invalid number '{text}': {err}")))?;
            tokens.push(Token::Number(number));
            continue;
        }

        if ch == '\'' || ch == '"' {
            let quote = ch;
            chars.next();
            let mut value = String::new();
            let mut escaped = false;
            let mut terminated = false;

            for (_, c) in chars.by_ref() {
                if escaped {
                    let translated = match c {
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        '\\' => '\\',
                        '\'' => '\'',
                        '"' => '"',
                        other => other,
                    };
                    value.push(translated);
                    escaped = false;
                    continue;
                }

                if c == '\\' {
                    escaped = true;
                    continue;
                }
                if c == quote {
                    terminated = true;
                    break;
                }
                value.push(c);
            }

            if !terminated {
                return Err(ConditionError::Parse(
                    "unterminated string literal".to_owned(),
                ));
            }
            tokens.push(Token::String(value));
            continue;
        }

        if ch.is_ascii_alphabetic() || ch == '_' {
            let start = idx;
            chars.next();
            while let Some((_, c)) = chars.peek().copied() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    chars.next();
                } else {
                    break;
                }
            }
            let end = chars.peek().map(|(i, _)| *i).unwrap_or(input.len());
            let ident = &input[start..end];
            let token = match ident {
                "true" => Token::True,
                "false" => Token::False,
                "null" => Token::Null,
                // No identifiers, calls, or host access in condition gates.
                other => {
                    return Err(ConditionError::Parse(format!(
                        "unexpected identifier '{other}'"
                    )));
                }
            };
            tokens.push(token);
            continue;
        }

        let token = match ch {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '-' => Token::Minus,
            '!' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Not);
                }
                continue;
            }
            '=' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    tokens.push(Token::EqEq);
                    continue;
                }
                return Err(ConditionError::Parse(
                    "unexpected '='; use '==' for comparison".to_owned(),
                ));
            }
            '>' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    tokens.push(Token::Gte);
                } else {
                    tokens.push(Token::Gt);
                }
                continue;
            }
            '<' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    tokens.push(Token::Lte);
                } else {
                    tokens.push(Token::Lt);
                }
                continue;
            }
            '&' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '&'))) {
                    chars.next();
                    tokens.push(Token::AndAnd);
                    continue;
                }
                return Err(ConditionError::Parse("unexpected '&'; use '&&'".to_owned()));
            }
            '|' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '|'))) {
                    chars.next();
                    tokens.push(Token::OrOr);
                    continue;
                }
                return Err(ConditionError::Parse("unexpected '|'; use '||'".to_owned()));
            }
            other => {
                return Err(ConditionError::Parse(format!(
                    "unexpected character '{}'",
                    other
                )));
            }
        };

        chars.next();
        tokens.push(token);
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    index: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, index: 0 }
    }

    fn parse_expression(&mut self) -> Result<Expr, ConditionError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_and()?;
        while self.match_token(|t| matches!(t, Token::OrOr)) {
            let right = self.parse_and()?;
            left = Expr::Binary {
                left: Box::new(left),
                op: BinaryOp::Or,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_comparison()?;
        while self.match_token(|t| matches!(t, Token::AndAnd)) {
            let right = self.parse_comparison()?;
            left = Expr::Binary {
                left: Box::new(left),
                op: BinaryOp::And,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_unary()?;
        while let Some(op) = self.match_comparison_op() {
            let right = self.parse_unary()?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if self.match_token(|t| matches!(t, Token::Not)) {
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(self.parse_unary()?),
            });
        }
        if self.match_token(|t| matches!(t, Token::Minus)) {
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(self.parse_unary()?),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        let Some(token) = self.peek().cloned() else {
            return Err(ConditionError::Parse(
                "unexpected end of expression".to_owned(),
            ));
        };

        match token {
            Token::True => {
                self.index += 1;
                Ok(Expr::Literal(Value::Bool(true)))
            }
            Token::False => {
                self.index += 1;
                Ok(Expr::Literal(Value::Bool(false)))
            }
            Token::Null => {
                self.index += 1;
                Ok(Expr::Literal(Value::Null))
            }
            Token::Number(v) => {
                self.index += 1;
                let number = Number::from_f64(v).ok_or_else(|| {
                    ConditionError::Parse(format!("invalid finite number literal '{v}'"))
                })?;
                Ok(Expr::Literal(Value::Number(number)))
            }
            Token::String(v) => {
                self.index += 1;
                Ok(Expr::Literal(Value::String(v)))
            }
            Token::LParen => {
                self.index += 1;
                let expr = self.parse_expression()?;
                self.consume(
                    |t| matches!(t, Token::RParen),
                    "expected ')' after expression",
                )?;
                Ok(expr)
            }
            _ => Err(ConditionError::Parse(format!(
                "unexpected token '{token:?}'"
            ))),
        }
    }

    fn match_comparison_op(&mut self) -> Option<BinaryOp> {
        let op = match self.peek()? {
            Token::EqEq => BinaryOp::Eq,
            Token::NotEq => BinaryOp::Neq,
            Token::Gt => BinaryOp::Gt,
            Token::Gte => BinaryOp::Gte,
            Token::Lt => BinaryOp::Lt,
            Token::Lte => BinaryOp::Lte,
            _ => return None,
        };
        self.index += 1;
        Some(op)
    }

    fn consume<F>(&mut self, predicate: F, msg: &str) -> Result<(), ConditionError>
    where
        F: FnOnce(&Token) -> bool,
    {
        let token = self
            .peek()
            .ok_or_else(|| ConditionError::Parse(msg.to_owned()))?;
        if predicate(token) {
            self.index += 1;
            Ok(())
        } else {
            Err(ConditionError::Parse(msg.to_owned()))
        }
    }

    fn match_token<F>(&mut self, predicate: F) -> bool
    where
        F: FnOnce(&Token) -> bool,
    {
        if let Some(token) = self.peek() {
            if predicate(token) {
                self.index += 1;
                return true;
            }
        }
        false
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index)
    }

    fn expect_end(&self) -> Result<(), ConditionError> {
        if self.peek().is_some() {
            return Err(ConditionError::Parse(
                "unexpected trailing tokens".to_owned(),
            ));
        }
        Ok(())
    }
}

fn eval(expr: &Expr) -> Result<Value, ConditionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Unary { op, expr } => {
            let value = eval(expr)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!is_truthy(&value))),
                UnaryOp::Neg => {
                    let number = to_number(&value).ok_or_else(|| {
                        ConditionError::Evaluation(format!(
                            "cannot negate non-number value: {value}"
                        ))
                    })?;
                    Ok(Number::from_f64(-number)
                        .map(Value::Number)
                        .unwrap_or(Value::Null))
                }
            }
        }
        Expr::Binary { left, op, right } => {
            let left = eval(left)?;
            let right = eval(right)?;
            eval_binary(left, *op, right)
        }
    }
}

fn eval_binary(left: Value, op: BinaryOp, right: Value) -> Result<Value, ConditionError> {
    match op {
        BinaryOp::Or => Ok(Value::Bool(is_truthy(&left) || is_truthy(&right))),
        BinaryOp::And => Ok(Value::Bool(is_truthy(&left) && is_truthy(&right))),
        BinaryOp::Eq => Ok(Value::Bool(left == right)),
        BinaryOp::Neq => Ok(Value::Bool(left != right)),
        BinaryOp::Gt | BinaryOp::Gte | BinaryOp::Lt | BinaryOp::Lte => {
            compare_values(&left, &right, op)
        }
    }
}

fn compare_values(left: &Value, right: &Value, op: BinaryOp) -> Result<Value, ConditionError> {
    if let (Some(a), Some(b)) = (to_number(left), to_number(right)) {
        let result = match op {
            BinaryOp::Gt => a > b,
            BinaryOp::Gte => a >= b,
            BinaryOp::Lt => a < b,
            BinaryOp::Lte => a <= b,
            _ => false,
        };
        return Ok(Value::Bool(result));
    }

    if let (Value::String(a), Value::String(b)) = (left, right) {
        let result = match op {
            BinaryOp::Gt => a > b,
            BinaryOp::Gte => a >= b,
            BinaryOp::Lt => a < b,
            BinaryOp::Lte => a <= b,
            _ => false,
        };
        return Ok(Value::Bool(result));
    }

    Err(ConditionError::Evaluation(format!(
        "cannot compare {left} and {right}"
    )))
}

fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(v) => v.as_f64(),
        Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn root() -> Value {
        json!({
            "input": {"count": 5, "mode": "fast"},
            "variables": {"crisis_detected": false, "score": 0.85},
        })
    }

    #[test]
    fn literal_comparisons() {
        let root = root();
        assert!(evaluate_condition("1 < 2", &root));
        assert!(evaluate_condition("2 >= 2", &root));
        assert!(!evaluate_condition("'a' == 'b'", &root));
        assert!(evaluate_condition("'a' != 'b'", &root));
        assert!(evaluate_condition("null == null", &root));
    }

    #[test]
    fn boolean_connectives_and_parens() {
        let root = root();
        assert!(evaluate_condition("true && (1 < 2)", &root));
        assert!(!evaluate_condition("true && false", &root));
        assert!(evaluate_condition("false || true", &root));
        assert!(evaluate_condition("!(1 > 2)", &root));
        assert!(evaluate_condition("-1 < 0", &root));
    }

    #[test]
    fn substitutes_paths_with_json_encoding() {
        let root = root();
        assert!(evaluate_condition("${input.count} > 3", &root));
        assert!(evaluate_condition("${input.mode} == 'fast'", &root));
        assert!(evaluate_condition("${variables.score} >= 0.5", &root));
    }

    #[test]
    fn bare_variable_names_resolve() {
        let root = root();
        assert!(!evaluate_condition("${crisis_detected}", &root));
        assert!(evaluate_condition("${crisis_detected} == false", &root));
    }

    #[test]
    fn legitimate_false_is_respected() {
        let root = root();
        assert!(!evaluate_condition("${input.count} > 100", &root));
        assert!(!evaluate_condition("false", &root));
    }

    #[test]
    fn missing_path_fails_open() {
        let root = root();
        assert!(evaluate_condition("${missing.flag} == true", &root));
        assert!(evaluate_condition("${missing.flag}", &root));
    }

    #[test]
    fn malformed_expression_fails_open() {
        let root = root();
        assert!(evaluate_condition("1 ==", &root));
        assert!(evaluate_condition("(true", &root));
        assert!(evaluate_condition("1 = 1", &root));
    }

    #[test]
    fn identifiers_and_calls_are_rejected() {
        // Rejection surfaces as fail-open, but the grammar itself must
        // refuse anything that is not a literal expression.
        assert!(matches!(
            evaluate("process == 1"),
            Err(ConditionError::Parse(_))
        ));
        assert!(matches!(
            evaluate("length('x') > 0"),
            Err(ConditionError::Parse(_))
        ));
        assert!(matches!(evaluate("undefined"), Err(ConditionError::Parse(_))));
    }

    #[test]
    fn mixed_type_comparison_fails_open() {
        let root = root();
        // '5 < "fast"' has no ordering; the step must still run.
        assert!(evaluate_condition("${input.count} < ${input.mode}", &root));
    }

    #[test]
    fn substitution_result_is_valid_json_literal() {
        assert_eq!(
            substitute("${input.mode} == 'fast'", &root()),
            "\"fast\" == 'fast'"
        );
        assert_eq!(substitute("${missing}", &root()), "undefined");
    }

    #[test]
    fn truthiness_matches_value_kinds() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("x")));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(null)));
    }
}
