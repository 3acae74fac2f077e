// Built-in functions available in conditionals

use regex::Regex;

use crate::output::errors::ConductorError;
use crate::parser::ast::Value;

/// Call a built-in function with already-evaluated arguments.
///
/// `defined` and `default` are resolved lazily by the evaluator and only
/// reach this point when their argument is not a plain variable.
pub fn call_builtin(name: &str, args: Vec<Value>) -> Result<Value, ConductorError> {
    match name {
        "len" => builtin_len(args),
        "str" => builtin_str(args),
        "int" => builtin_int(args),
        "float" => builtin_float(args),
        "bool" => builtin_bool(args),
        "lower" => string_map(name, args, |s| s.to_lowercase()),
        "upper" => string_map(name, args, |s| s.to_uppercase()),
        "regex_search" => builtin_regex_search(args),
        "defined" => Ok(Value::Bool(true)),
        "default" => match args.into_iter().next() {
            Some(v) => Ok(v),
            None => Err(arity_error("default", 2, 0)),
        },
        _ => Err(ConductorError::Runtime {
            function: Some(name.to_string()),
            message: format!("Unknown function: {}", name),
            suggestion: Some(
                "Available: len, str, int, float, bool, lower, upper, regex_search, defined, default"
                    .to_string(),
            ),
        }),
    }
}

fn single(name: &str, args: Vec<Value>) -> Result<Value, ConductorError> {
    let count = args.len();
    let mut iter = args.into_iter();
    match (iter.next(), iter.next()) {
        (Some(v), None) => Ok(v),
        _ => Err(arity_error(name, 1, count)),
    }
}

fn builtin_len(args: Vec<Value>) -> Result<Value, ConductorError> {
    let len = match single("len", args)? {
        Value::String(s) => s.chars().count(),
        Value::List(l) => l.len(),
        Value::Dict(d) => d.len(),
        other => {
            return Err(ConductorError::Runtime {
                function: Some("len".to_string()),
                message: format!("len() not supported for {}", other.type_name()),
                suggestion: None,
            })
        }
    };
    Ok(Value::Int(len as i64))
}

fn builtin_str(args: Vec<Value>) -> Result<Value, ConductorError> {
    Ok(Value::String(single("str", args)?.to_string()))
}

fn builtin_int(args: Vec<Value>) -> Result<Value, ConductorError> {
    match single("int", args)? {
        Value::Int(i) => Ok(Value::Int(i)),
        Value::Float(f) => Ok(Value::Int(f as i64)),
        Value::Bool(b) => Ok(Value::Int(b as i64)),
        Value::String(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
            ConductorError::Runtime {
                function: Some("int".to_string()),
                message: format!("Cannot convert '{}' to int", s),
                suggestion: None,
            }
        }),
        other => Err(ConductorError::Runtime {
            function: Some("int".to_string()),
            message: format!("Cannot convert {} to int", other.type_name()),
            suggestion: None,
        }),
    }
}

fn builtin_float(args: Vec<Value>) -> Result<Value, ConductorError> {
    match single("float", args)? {
        Value::Int(i) => Ok(Value::Float(i as f64)),
        Value::Float(f) => Ok(Value::Float(f)),
        Value::String(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
            ConductorError::Runtime {
                function: Some("float".to_string()),
                message: format!("Cannot convert '{}' to float", s),
                suggestion: None,
            }
        }),
        other => Err(ConductorError::Runtime {
            function: Some("float".to_string()),
            message: format!("Cannot convert {} to float", other.type_name()),
            suggestion: None,
        }),
    }
}

fn builtin_bool(args: Vec<Value>) -> Result<Value, ConductorError> {
    let v = single("bool", args)?;
    // yaml-ish spellings count as false
    if let Value::String(s) = &v {
        let lowered = s.trim().to_lowercase();
        if matches!(lowered.as_str(), "false" | "no" | "off" | "0") {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(v.is_truthy()))
}

fn string_map(
    name: &str,
    args: Vec<Value>,
    f: impl Fn(&str) -> String,
) -> Result<Value, ConductorError> {
    match single(name, args)? {
        Value::String(s) => Ok(Value::String(f(&s))),
        other => Err(ConductorError::Runtime {
            function: Some(name.to_string()),
            message: format!("{}() expects a string, got {}", name, other.type_name()),
            suggestion: None,
        }),
    }
}

/// `regex_search(text, pattern)`: true when the pattern matches anywhere
fn builtin_regex_search(args: Vec<Value>) -> Result<Value, ConductorError> {
    let [text, pattern]: [Value; 2] = args
        .try_into()
        .map_err(|a: Vec<Value>| arity_error("regex_search", 2, a.len()))?;

    let (Value::String(text), Value::String(pattern)) = (text, pattern) else {
        return Err(ConductorError::Runtime {
            function: Some("regex_search".to_string()),
            message: "regex_search(text, pattern) expects two strings".to_string(),
            suggestion: None,
        });
    };

    let re = Regex::new(&pattern).map_err(|e| ConductorError::Runtime {
        function: Some("regex_search".to_string()),
        message: format!("Invalid regex '{}': {}", pattern, e),
        suggestion: None,
    })?;

    Ok(Value::Bool(re.is_match(&text)))
}

fn arity_error(name: &str, expected: usize, got: usize) -> ConductorError {
    ConductorError::Runtime {
        function: Some(name.to_string()),
        message: format!("{}() takes {} argument(s), got {}", name, expected, got),
        suggestion: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        assert_eq!(
            call_builtin("int", vec![Value::from(" 42 ")]).unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            call_builtin("str", vec![Value::Int(7)]).unwrap(),
            Value::from("7")
        );
        assert_eq!(
            call_builtin("bool", vec![Value::from("no")]).unwrap(),
            Value::Bool(false)
        );
        assert!(call_builtin("int", vec![Value::from("abc")]).is_err());
    }

    #[test]
    fn test_case_helpers() {
        assert_eq!(
            call_builtin("lower", vec![Value::from("ERROR")]).unwrap(),
            Value::from("error")
        );
        assert_eq!(
            call_builtin("upper", vec![Value::from("ok")]).unwrap(),
            Value::from("OK")
        );
    }

    #[test]
    fn test_regex_search() {
        let args = vec![Value::from("nginx/1.24.0"), Value::from(r"\d+\.\d+")];
        assert_eq!(call_builtin("regex_search", args).unwrap(), Value::Bool(true));

        let bad = vec![Value::from("x"), Value::from("(")];
        assert!(call_builtin("regex_search", bad).is_err());
        assert!(call_builtin("regex_search", vec![Value::from("x")]).is_err());
    }

    #[test]
    fn test_unknown_function() {
        assert!(call_builtin("explode", vec![]).is_err());
        assert!(call_builtin("len", vec![Value::Int(1)]).is_err());
    }
}
