// Runtime module - expression evaluation

mod builtins;

pub use builtins::call_builtin;

use crate::executor::ExecutionContext;
use crate::output::errors::ConductorError;
use crate::parser::ast::{BinaryOperator, Condition, Expression, UnaryOperator, Value};

/// Evaluate a parsed condition and reduce it to its truthiness
pub fn evaluate_condition(
    cond: &Condition,
    ctx: &ExecutionContext,
) -> Result<bool, ConductorError> {
    evaluate_expression(&cond.expr, ctx)
        .map(|v| v.is_truthy())
        .map_err(|e| match e {
            // attach the source text so the ledger message names the clause
            ConductorError::Runtime { message, .. } => ConductorError::Evaluation {
                expression: cond.source.clone(),
                message,
                suggestion: None,
            },
            ConductorError::Evaluation {
                message,
                suggestion,
                ..
            } => ConductorError::Evaluation {
                expression: cond.source.clone(),
                message,
                suggestion,
            },
            other => other,
        })
}

/// Evaluate an expression in a given context
pub fn evaluate_expression(
    expr: &Expression,
    ctx: &ExecutionContext,
) -> Result<Value, ConductorError> {
    match expr {
        Expression::String(s) => Ok(Value::String(s.clone())),
        Expression::Integer(i) => Ok(Value::Int(*i)),
        Expression::Float(f) => Ok(Value::Float(*f)),
        Expression::Boolean(b) => Ok(Value::Bool(*b)),
        Expression::Null => Ok(Value::Null),

        Expression::Variable(path) => {
            ctx.get_nested_var(path)
                .ok_or_else(|| ConductorError::Evaluation {
                    expression: path.join("."),
                    message: format!("Variable not found: {}", path.join(".")),
                    suggestion: Some(
                        "Check the variable name, or guard it with defined(...)".to_string(),
                    ),
                })
        }

        // short-circuit so `defined(x) and x > 1` never touches an unbound x
        Expression::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            if !evaluate_expression(left, ctx)?.is_truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(evaluate_expression(right, ctx)?.is_truthy()))
        }
        Expression::BinaryOp {
            left,
            op: BinaryOperator::Or,
            right,
        } => {
            if evaluate_expression(left, ctx)?.is_truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(evaluate_expression(right, ctx)?.is_truthy()))
        }

        Expression::BinaryOp { left, op, right } => {
            let left_val = evaluate_expression(left, ctx)?;
            let right_val = evaluate_expression(right, ctx)?;
            evaluate_binary_op(&left_val, op, &right_val)
        }

        Expression::UnaryOp { op, operand } => {
            let val = evaluate_expression(operand, ctx)?;
            evaluate_unary_op(op, &val)
        }

        Expression::FunctionCall { name, args } => match (name.as_str(), args.as_slice()) {
            // lazy builtins: their arguments may legitimately be unbound
            ("defined", [Expression::Variable(path)]) => {
                Ok(Value::Bool(ctx.get_nested_var(path).is_some()))
            }
            ("default", [Expression::Variable(path), fallback]) => match ctx.get_nested_var(path) {
                Some(v) => Ok(v),
                None => evaluate_expression(fallback, ctx),
            },
            _ => {
                let evaluated: Result<Vec<_>, _> =
                    args.iter().map(|a| evaluate_expression(a, ctx)).collect();
                call_builtin(name, evaluated?)
            }
        },

        Expression::Index { object, index } => {
            let obj_val = evaluate_expression(object, ctx)?;
            let idx_val = evaluate_expression(index, ctx)?;
            index_value(&obj_val, &idx_val)
        }

        Expression::Attribute { object, attr } => {
            let obj_val = evaluate_expression(object, ctx)?;

            match &obj_val {
                Value::Dict(map) => map
                    .get(attr)
                    .cloned()
                    .ok_or_else(|| {
                        ConductorError::runtime(format!("Attribute '{}' not found", attr))
                    }),
                _ => Err(ConductorError::runtime(format!(
                    "Cannot access attribute '{}' on {}",
                    attr,
                    obj_val.type_name()
                ))),
            }
        }

        Expression::List(items) => {
            let values: Result<Vec<_>, _> =
                items.iter().map(|i| evaluate_expression(i, ctx)).collect();
            Ok(Value::List(values?))
        }
    }
}

fn index_value(obj: &Value, idx: &Value) -> Result<Value, ConductorError> {
    match (obj, idx) {
        (Value::List(list), Value::Int(i)) => {
            // negative indices count from the end
            let resolved = if *i < 0 { list.len() as i64 + i } else { *i };
            usize::try_from(resolved)
                .ok()
                .and_then(|i| list.get(i))
                .cloned()
                .ok_or_else(|| {
                    ConductorError::runtime(format!(
                        "Index {} out of bounds for list of length {}",
                        i,
                        list.len()
                    ))
                })
        }
        (Value::Dict(map), Value::String(key)) => map
            .get(key)
            .cloned()
            .ok_or_else(|| ConductorError::runtime(format!("Key '{}' not found in dict", key))),
        (Value::String(s), Value::Int(i)) => {
            let char_count = s.chars().count();
            let resolved = if *i < 0 { char_count as i64 + i } else { *i };
            usize::try_from(resolved)
                .ok()
                .and_then(|i| s.chars().nth(i))
                .map(|c| Value::String(c.to_string()))
                .ok_or_else(|| {
                    ConductorError::runtime(format!(
                        "Index {} out of bounds for string of length {}",
                        i, char_count
                    ))
                })
        }
        _ => Err(ConductorError::runtime(format!(
            "Cannot index {} with {}",
            obj.type_name(),
            idx.type_name()
        ))),
    }
}

fn evaluate_binary_op(
    left: &Value,
    op: &BinaryOperator,
    right: &Value,
) -> Result<Value, ConductorError> {
    match op {
        BinaryOperator::Add => match (left, right) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(*b))),
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            (Value::List(a), Value::List(b)) => {
                let mut result = a.clone();
                result.extend(b.iter().cloned());
                Ok(Value::List(result))
            }
            _ => float_op(left, right, "add", |a, b| a + b),
        },
        BinaryOperator::Sub => match (left, right) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_sub(*b))),
            _ => float_op(left, right, "subtract", |a, b| a - b),
        },
        BinaryOperator::Mul => match (left, right) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_mul(*b))),
            _ => float_op(left, right, "multiply", |a, b| a * b),
        },
        BinaryOperator::Div => {
            let divisor = as_f64(right).ok_or_else(|| type_error("divide", left, right))?;
            if divisor == 0.0 {
                return Err(ConductorError::runtime("Division by zero"));
            }
            match (left, right) {
                (Value::Int(a), Value::Int(b)) => a
                    .checked_div(*b)
                    .map(Value::Int)
                    .ok_or_else(|| ConductorError::runtime(format!("{} / {} overflows", a, b))),
                _ => float_op(left, right, "divide", |a, b| a / b),
            }
        }
        BinaryOperator::Mod => match (left, right) {
            (Value::Int(_), Value::Int(0)) => Err(ConductorError::runtime("Modulo by zero")),
            (Value::Int(a), Value::Int(b)) => a
                .checked_rem(*b)
                .map(Value::Int)
                .ok_or_else(|| ConductorError::runtime(format!("{} % {} overflows", a, b))),
            _ => Err(type_error("modulo", left, right)),
        },

        BinaryOperator::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinaryOperator::Ne => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOperator::Lt => compare_values(left, right, |ord| ord == std::cmp::Ordering::Less),
        BinaryOperator::Le => compare_values(left, right, |ord| ord != std::cmp::Ordering::Greater),
        BinaryOperator::Gt => compare_values(left, right, |ord| ord == std::cmp::Ordering::Greater),
        BinaryOperator::Ge => compare_values(left, right, |ord| ord != std::cmp::Ordering::Less),

        BinaryOperator::And => Ok(Value::Bool(left.is_truthy() && right.is_truthy())),
        BinaryOperator::Or => Ok(Value::Bool(left.is_truthy() || right.is_truthy())),

        BinaryOperator::In => Ok(Value::Bool(contains(right, left))),
        BinaryOperator::NotIn => Ok(Value::Bool(!contains(right, left))),
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::List(list) => list.iter().any(|v| values_equal(needle, v)),
        Value::String(s) => match needle {
            Value::String(sub) => s.contains(sub.as_str()),
            _ => false,
        },
        Value::Dict(map) => match needle {
            Value::String(key) => map.contains_key(key),
            _ => false,
        },
        _ => false,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn float_op(
    left: &Value,
    right: &Value,
    name: &str,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Value, ConductorError> {
    match (as_f64(left), as_f64(right)) {
        (Some(a), Some(b)) => Ok(Value::Float(f(a, b))),
        _ => Err(type_error(name, left, right)),
    }
}

fn evaluate_unary_op(op: &UnaryOperator, val: &Value) -> Result<Value, ConductorError> {
    match op {
        UnaryOperator::Not => Ok(Value::Bool(!val.is_truthy())),
        UnaryOperator::Neg => match val {
            Value::Int(i) => Ok(Value::Int(-i)),
            Value::Float(f) => Ok(Value::Float(-f)),
            _ => Err(ConductorError::runtime(format!(
                "Cannot negate {}",
                val.type_name()
            ))),
        },
    }
}

pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Float(_), _) | (_, Value::Float(_)) => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
            _ => false,
        },
        (Value::List(a), Value::List(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| values_equal(x, y))
        }
        (Value::Dict(a), Value::Dict(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, av)| b.get(k).is_some_and(|bv| values_equal(av, bv)))
        }
        _ => a == b,
    }
}

fn compare_values<F>(left: &Value, right: &Value, f: F) -> Result<Value, ConductorError>
where
    F: Fn(std::cmp::Ordering) -> bool,
{
    let ord = match (left, right) {
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => match (as_f64(left), as_f64(right)) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
            _ => return Err(type_error("compare", left, right)),
        },
    };

    Ok(Value::Bool(f(ord)))
}

fn type_error(op: &str, left: &Value, right: &Value) -> ConductorError {
    ConductorError::runtime(format!(
        "Cannot {} {} and {}",
        op,
        left.type_name(),
        right.type_name()
    ))
}
