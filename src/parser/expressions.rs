// Expression parser for conditionals and loop sources

use pest::iterators::{Pair, Pairs};
use pest::Parser;
use pest_derive::Parser;

use super::ast::{BinaryOperator, Expression, UnaryOperator};
use crate::output::errors::{ConductorError, ParseError, ParseErrorKind};

#[derive(Parser)]
#[grammar = "parser/expressions.pest"]
pub struct ExpressionParser;

/// Parse a conditional expression such as `result.rc != 0 and 'ERROR' in output`
pub fn parse_expression(input: &str) -> Result<Expression, ConductorError> {
    let mut pairs = ExpressionParser::parse(Rule::expression, input).map_err(|e| {
        let (line, column) = match e.line_col {
            pest::error::LineColLocation::Pos((l, c)) => (l, c),
            pest::error::LineColLocation::Span((l, c), _) => (l, c),
        };
        ConductorError::Parse(Box::new(ParseError {
            kind: ParseErrorKind::InvalidExpression,
            message: format!("Failed to parse expression '{}': {}", input, e.variant.message()),
            file: None,
            line: Some(line),
            column: Some(column),
            suggestion: Some("Check expression syntax".to_string()),
        }))
    })?;

    let expression = next_pair(&mut pairs, "expression")?;
    parse_or_expr(next_pair(&mut expression.into_inner(), "or_expr")?)
}

fn next_pair<'a>(
    pairs: &mut Pairs<'a, Rule>,
    what: &str,
) -> Result<Pair<'a, Rule>, ConductorError> {
    pairs
        .next()
        .ok_or_else(|| {
            ConductorError::invalid_expression(format!("Expected {} in expression", what))
        })
}

/// Fold `operand (op operand)*` into a left-associative chain
fn fold_binary(
    pair: Pair<Rule>,
    operand: fn(Pair<Rule>) -> Result<Expression, ConductorError>,
    operator: fn(&str) -> Option<BinaryOperator>,
) -> Result<Expression, ConductorError> {
    let mut inner = pair.into_inner();
    let mut left = operand(next_pair(&mut inner, "operand")?)?;

    while let Some(op_pair) = inner.next() {
        let op = operator(op_pair.as_str()).ok_or_else(|| {
            ConductorError::invalid_expression(format!("Unknown operator '{}'", op_pair.as_str()))
        })?;
        let right = operand(next_pair(&mut inner, "right operand")?)?;
        left = Expression::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        };
    }

    Ok(left)
}

fn parse_or_expr(pair: Pair<Rule>) -> Result<Expression, ConductorError> {
    fold_binary(pair, parse_and_expr, |_| Some(BinaryOperator::Or))
}

fn parse_and_expr(pair: Pair<Rule>) -> Result<Expression, ConductorError> {
    fold_binary(pair, parse_not_expr, |_| Some(BinaryOperator::And))
}

fn parse_not_expr(pair: Pair<Rule>) -> Result<Expression, ConductorError> {
    let mut inner = pair.into_inner();
    let first = next_pair(&mut inner, "not_expr")?;

    match first.as_rule() {
        Rule::not_op => {
            let operand = parse_not_expr(next_pair(&mut inner, "negated expression")?)?;
            Ok(Expression::UnaryOp {
                op: UnaryOperator::Not,
                operand: Box::new(operand),
            })
        }
        Rule::comparison => parse_comparison(first),
        rule => Err(unexpected(rule, "not_expr")),
    }
}

fn parse_comparison(pair: Pair<Rule>) -> Result<Expression, ConductorError> {
    fold_binary(pair, parse_additive, |op| match op {
        "==" => Some(BinaryOperator::Eq),
        "!=" => Some(BinaryOperator::Ne),
        "<" => Some(BinaryOperator::Lt),
        "<=" => Some(BinaryOperator::Le),
        ">" => Some(BinaryOperator::Gt),
        ">=" => Some(BinaryOperator::Ge),
        "in" => Some(BinaryOperator::In),
        s if s.starts_with("not") => Some(BinaryOperator::NotIn),
        _ => None,
    })
}

fn parse_additive(pair: Pair<Rule>) -> Result<Expression, ConductorError> {
    fold_binary(pair, parse_multiplicative, |op| match op {
        "+" => Some(BinaryOperator::Add),
        "-" => Some(BinaryOperator::Sub),
        _ => None,
    })
}

fn parse_multiplicative(pair: Pair<Rule>) -> Result<Expression, ConductorError> {
    fold_binary(pair, parse_unary, |op| match op {
        "*" => Some(BinaryOperator::Mul),
        "/" => Some(BinaryOperator::Div),
        "%" => Some(BinaryOperator::Mod),
        _ => None,
    })
}

fn parse_unary(pair: Pair<Rule>) -> Result<Expression, ConductorError> {
    let mut inner = pair.into_inner();
    let first = next_pair(&mut inner, "unary")?;

    match first.as_rule() {
        Rule::unary_op => {
            let op = if first.as_str() == "-" {
                UnaryOperator::Neg
            } else {
                UnaryOperator::Not
            };
            let operand = parse_unary(next_pair(&mut inner, "unary operand")?)?;
            Ok(Expression::UnaryOp {
                op,
                operand: Box::new(operand),
            })
        }
        Rule::postfix => parse_postfix(first),
        rule => Err(unexpected(rule, "unary")),
    }
}

fn parse_postfix(pair: Pair<Rule>) -> Result<Expression, ConductorError> {
    let mut inner = pair.into_inner();
    let mut expr = parse_primary(next_pair(&mut inner, "primary")?)?;

    for op in inner {
        expr = match op.as_rule() {
            Rule::call => {
                let args = parse_args(op)?;
                match expr {
                    Expression::Variable(mut path) if path.len() == 1 => Expression::FunctionCall {
                        name: path.remove(0),
                        args,
                    },
                    other => {
                        return Err(ConductorError::invalid_expression(format!(
                            "Cannot call non-function expression {:?}",
                            other
                        )))
                    }
                }
            }
            Rule::index => {
                let index_expr = parse_or_expr(next_pair(&mut op.into_inner(), "index")?)?;
                Expression::Index {
                    object: Box::new(expr),
                    index: Box::new(index_expr),
                }
            }
            Rule::attribute => {
                let attr = next_pair(&mut op.into_inner(), "attribute")?
                    .as_str()
                    .to_string();
                Expression::Attribute {
                    object: Box::new(expr),
                    attr,
                }
            }
            rule => return Err(unexpected(rule, "postfix")),
        };
    }

    Ok(expr)
}

fn parse_args(pair: Pair<Rule>) -> Result<Vec<Expression>, ConductorError> {
    let mut args = Vec::new();
    for group in pair.into_inner() {
        for arg in group.into_inner() {
            args.push(parse_or_expr(arg)?);
        }
    }
    Ok(args)
}

fn parse_primary(pair: Pair<Rule>) -> Result<Expression, ConductorError> {
    let inner = next_pair(&mut pair.into_inner(), "literal or variable")?;

    match inner.as_rule() {
        Rule::or_expr => parse_or_expr(inner),
        Rule::list_literal => {
            let items: Result<Vec<_>, _> = inner.into_inner().map(parse_or_expr).collect();
            Ok(Expression::List(items?))
        }
        Rule::float_literal => inner
            .as_str()
            .parse()
            .map(Expression::Float)
            .map_err(|e| ConductorError::invalid_expression(format!("Invalid float: {}", e))),
        Rule::int_literal => inner
            .as_str()
            .parse()
            .map(Expression::Integer)
            .map_err(|e| ConductorError::invalid_expression(format!("Invalid integer: {}", e))),
        Rule::bool_literal => Ok(Expression::Boolean(inner.as_str().eq_ignore_ascii_case("true"))),
        Rule::null_literal => Ok(Expression::Null),
        Rule::string_literal => {
            let raw = next_pair(&mut inner.into_inner(), "string body")?;
            Ok(Expression::String(unescape(raw.as_str())))
        }
        Rule::variable => {
            let parts: Vec<String> = inner.into_inner().map(|p| p.as_str().to_string()).collect();
            Ok(Expression::Variable(parts))
        }
        rule => Err(unexpected(rule, "primary")),
    }
}

fn unescape(raw: &str) -> String {
    let mut result = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('r') => result.push('\r'),
            Some('t') => result.push('\t'),
            Some('\\') => result.push('\\'),
            Some('"') => result.push('"'),
            Some('\'') => result.push('\''),
            Some(other) => {
                result.push('\\');
                result.push(other);
            }
            None => result.push('\\'),
        }
    }

    result
}

fn unexpected(rule: Rule, context: &str) -> ConductorError {
    ConductorError::invalid_expression(format!("Unexpected {:?} in {}", rule, context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_simple_expressions() {
        assert_eq!(parse_expression("42").unwrap(), Expression::Integer(42));
        assert_eq!(parse_expression("true").unwrap(), Expression::Boolean(true));
        assert_eq!(parse_expression("None").unwrap(), Expression::Null);
        assert_eq!(parse_expression("2.5").unwrap(), Expression::Float(2.5));
    }

    #[test]
    fn test_variables() {
        // dotted paths stay a single variable
        let expr = parse_expression("result.stdout").unwrap();
        assert_eq!(
            expr,
            Expression::Variable(vec!["result".to_string(), "stdout".to_string()])
        );

        // keyword prefixes are still identifiers
        assert_eq!(parse_expression("notify_me").unwrap(), Expression::var("notify_me"));
        assert_eq!(parse_expression("truely").unwrap(), Expression::var("truely"));
    }

    #[test]
    fn test_membership() {
        let expr = parse_expression("'ERROR' in output").unwrap();
        assert_eq!(
            expr,
            Expression::BinaryOp {
                left: Box::new(Expression::string("ERROR")),
                op: BinaryOperator::In,
                right: Box::new(Expression::var("output")),
            }
        );

        match parse_expression("x not in items").unwrap() {
            Expression::BinaryOp { op, .. } => assert_eq!(op, BinaryOperator::NotIn),
            other => panic!("Expected BinaryOp, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence() {
        // and binds tighter than or
        match parse_expression("a or b and c").unwrap() {
            Expression::BinaryOp { op, right, .. } => {
                assert_eq!(op, BinaryOperator::Or);
                assert!(matches!(
                    *right,
                    Expression::BinaryOp {
                        op: BinaryOperator::And,
                        ..
                    }
                ));
            }
            other => panic!("Expected BinaryOp, got {:?}", other),
        }

        match parse_expression("not x == 1").unwrap() {
            Expression::UnaryOp { op, operand } => {
                assert_eq!(op, UnaryOperator::Not);
                assert!(matches!(*operand, Expression::BinaryOp { .. }));
            }
            other => panic!("Expected UnaryOp, got {:?}", other),
        }
    }

    #[test]
    fn test_calls_and_postfix() {
        assert_eq!(
            parse_expression("len(items) > 2").unwrap(),
            Expression::BinaryOp {
                left: Box::new(Expression::FunctionCall {
                    name: "len".to_string(),
                    args: vec![Expression::var("items")],
                }),
                op: BinaryOperator::Gt,
                right: Box::new(Expression::Integer(2)),
            }
        );

        match parse_expression("users[0].name").unwrap() {
            Expression::Attribute { object, attr } => {
                assert_eq!(attr, "name");
                assert!(matches!(*object, Expression::Index { .. }));
            }
            other => panic!("Expected Attribute, got {:?}", other),
        }
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            parse_expression(r#""a\"b\n""#).unwrap(),
            Expression::string("a\"b\n")
        );
    }

    #[test]
    fn test_invalid_expression() {
        assert!(parse_expression("x ==").is_err());
        assert!(parse_expression("(a").is_err());
        assert!(parse_expression("result.stdout(1)").is_err());
    }
}
