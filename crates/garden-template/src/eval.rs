//! Expression evaluator.
//!
//! Evaluation is a pure map from `(expression, context)` to a value. Missing
//! keys are a first-class outcome rather than an error so that callers can
//! decide between failing, keeping source text (partial resolution), or
//! substituting null (`}?`).

use serde_json::Value;

use crate::context::{display_path, ConfigContext, Lookup};
use crate::error::TemplateError;
use crate::parser::{BinaryOp, Expr, UnaryOp};

/// Outcome of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluated {
    Value(Value),
    /// A referenced key was not found; carries the first missing path.
    Missing {
        path: String,
        partial: bool,
        message: Option<String>,
    },
}

impl Evaluated {
    pub fn into_missing_error(self) -> TemplateError {
        match self {
            Self::Missing { path, message, .. } => TemplateError::MissingKey { path, message },
            Self::Value(_) => TemplateError::TypeMismatch("value is not missing".into()),
        }
    }
}

/// JS-like truthiness: null, false, 0 and "" are falsy; collections are
/// truthy even when empty.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Evaluate an expression against a context.
pub fn evaluate(expr: &Expr, ctx: &dyn ConfigContext) -> Result<Evaluated, TemplateError> {
    match expr {
        Expr::Literal(v) => Ok(Evaluated::Value(v.clone())),
        Expr::Ref(path) => match ctx.lookup(path)? {
            Lookup::Found(v) => Ok(Evaluated::Value(v)),
            Lookup::Missing { partial, message } => Ok(Evaluated::Missing {
                path: display_path(path),
                partial,
                message,
            }),
        },
        Expr::Unary { op, expr } => {
            let operand = match evaluate(expr, ctx)? {
                Evaluated::Value(v) => v,
                missing => return Ok(missing),
            };
            match op {
                UnaryOp::Not => Ok(Evaluated::Value(Value::Bool(!truthy(&operand)))),
                UnaryOp::Neg => match as_number(&operand) {
                    Some(n) => Ok(Evaluated::Value(number_value(-n))),
                    None => Err(TemplateError::TypeMismatch(format!(
                        "cannot negate {}",
                        type_name(&operand)
                    ))),
                },
            }
        }
        Expr::Binary { op, lhs, rhs } => evaluate_binary(*op, lhs, rhs, ctx),
    }
}

fn evaluate_binary(
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    ctx: &dyn ConfigContext,
) -> Result<Evaluated, TemplateError> {
    // Short-circuit operators return the raw operand value, not a coerced
    // boolean, so `a || default` supplies the fallback.
    if matches!(op, BinaryOp::And | BinaryOp::Or) {
        let left = match evaluate(lhs, ctx)? {
            Evaluated::Value(v) => v,
            missing => return Ok(missing),
        };
        let take_left = match op {
            BinaryOp::And => !truthy(&left),
            _ => truthy(&left),
        };
        if take_left {
            return Ok(Evaluated::Value(left));
        }
        return evaluate(rhs, ctx);
    }

    let left = match evaluate(lhs, ctx)? {
        Evaluated::Value(v) => v,
        missing => return Ok(missing),
    };
    let right = match evaluate(rhs, ctx)? {
        Evaluated::Value(v) => v,
        missing => return Ok(missing),
    };

    let value = match op {
        BinaryOp::Add => add(&left, &right)?,
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, &left, &right)?
        }
        BinaryOp::Eq => Value::Bool(primitive_eq(op, &left, &right)?),
        BinaryOp::Ne => Value::Bool(!primitive_eq(op, &left, &right)?),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let (a, b) = numeric_pair(op, &left, &right)?;
            Value::Bool(match op {
                BinaryOp::Lt => a < b,
                BinaryOp::Le => a <= b,
                BinaryOp::Gt => a > b,
                _ => a >= b,
            })
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    };
    Ok(Evaluated::Value(value))
}

/// `+` adds numbers and concatenates sequences (strings and arrays).
fn add(left: &Value, right: &Value) -> Result<Value, TemplateError> {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => arithmetic(BinaryOp::Add, left, right),
        (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
        (Value::Array(a), Value::Array(b)) => {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            Ok(Value::Array(out))
        }
        _ => Err(TemplateError::TypeMismatch(format!(
            "cannot apply '+' to {} and {}",
            type_name(left),
            type_name(right)
        ))),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, TemplateError> {
    // Integer arithmetic stays integral except for division.
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        if op != BinaryOp::Div {
            let result = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::Mod => {
                    if b == 0 {
                        return Err(TemplateError::TypeMismatch("modulo by zero".into()));
                    }
                    a.checked_rem(b)
                }
                _ => None,
            };
            if let Some(n) = result {
                return Ok(Value::from(n));
            }
        }
    }

    let (a, b) = numeric_pair(op, left, right)?;
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(TemplateError::TypeMismatch("division by zero".into()));
            }
            a / b
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Err(TemplateError::TypeMismatch("modulo by zero".into()));
            }
            a % b
        }
        _ => {
            return Err(TemplateError::TypeMismatch(format!(
                "'{}' is not an arithmetic operator",
                op.symbol()
            )))
        }
    };
    Ok(number_value(result))
}

/// Structural equality on primitives only.
fn primitive_eq(op: BinaryOp, left: &Value, right: &Value) -> Result<bool, TemplateError> {
    let primitive = |v: &Value| {
        matches!(
            v,
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
        )
    };
    if !primitive(left) || !primitive(right) {
        return Err(TemplateError::TypeMismatch(format!(
            "cannot apply '{}' to {} and {}",
            op.symbol(),
            type_name(left),
            type_name(right)
        )));
    }
    if let (Value::Number(a), Value::Number(b)) = (left, right) {
        return Ok(a.as_f64() == b.as_f64());
    }
    Ok(left == right)
}

fn numeric_pair(op: BinaryOp, left: &Value, right: &Value) -> Result<(f64, f64), TemplateError> {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(TemplateError::TypeMismatch(format!(
            "operator '{}' requires numbers, got {} and {}",
            op.symbol(),
            type_name(left),
            type_name(right)
        ))),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
