// YAML play parser

use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use std::collections::HashMap;
use std::time::Duration;

use super::ast::*;
use crate::output::errors::{ConductorError, ParseError, ParseErrorKind};

/// Raw YAML play structure (before AST conversion)
#[derive(Debug, Deserialize)]
struct RawPlay {
    name: Option<String>,
    hosts: Option<String>,
    vars: Option<HashMap<String, YamlValue>>,
    tasks: Option<Vec<RawTask>>,
    handlers: Option<Vec<RawTask>>,
    #[serde(flatten)]
    policy: ExecutionPolicy,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    name: Option<String>,
    when: Option<YamlValue>,
    register: Option<String>,
    failed_when: Option<YamlValue>,
    changed_when: Option<YamlValue>,
    notify: Option<NotifyValue>,
    #[serde(rename = "loop")]
    loop_items: Option<RawLoop>,
    loop_var: Option<String>,
    ignore_errors: Option<bool>,
    ignore_unreachable: Option<bool>,
    /// Full retry configuration
    retry: Option<RawRetryConfig>,
    /// Simple task-level retry fields (alternative to full retry config)
    until: Option<YamlValue>,
    retries: Option<u32>,
    delay: Option<u64>,
    #[serde(flatten)]
    module: HashMap<String, YamlValue>,
}

/// Loop source: literal items or an expression yielding a list
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLoop {
    Items(Vec<YamlValue>),
    Expr(String),
}

/// Raw retry configuration from YAML
#[derive(Debug, Deserialize)]
struct RawRetryConfig {
    attempts: Option<u32>,
    /// Delay in seconds (simple) or strategy object
    delay: Option<RawDelayValue>,
    until: Option<YamlValue>,
    retry_unreachable: Option<bool>,
}

/// Delay can be a simple number (seconds) or a strategy object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDelayValue {
    Seconds(u64),
    Strategy(RawDelayStrategy),
}

#[derive(Debug, Deserialize)]
struct RawDelayStrategy {
    /// Strategy type: "fixed", "exponential", "linear"
    strategy: String,
    base: Option<u64>,
    max: Option<u64>,
    increment: Option<u64>,
    jitter: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NotifyValue {
    Single(String),
    Multiple(Vec<String>),
}

/// Parse a play definition from a YAML document
pub fn parse_play(content: &str, source: &str) -> Result<Play, ConductorError> {
    let raw: RawPlay = serde_yaml::from_str(content).map_err(|e| {
        let (line, column) = extract_yaml_error_location(&e);
        ConductorError::Parse(Box::new(ParseError {
            kind: ParseErrorKind::InvalidYaml,
            message: format!("Invalid YAML: {}", e),
            file: Some(source.to_string()),
            line,
            column,
            suggestion: Some(
                "Check YAML syntax - ensure proper indentation and valid YAML".to_string(),
            ),
        }))
    })?;

    convert_play(raw, source)
}

pub(crate) fn extract_yaml_error_location(
    e: &serde_yaml::Error,
) -> (Option<usize>, Option<usize>) {
    if let Some(loc) = e.location() {
        (Some(loc.line()), Some(loc.column()))
    } else {
        (None, None)
    }
}

fn convert_play(raw: RawPlay, source: &str) -> Result<Play, ConductorError> {
    let vars = raw
        .vars
        .map(convert_vars)
        .transpose()?
        .unwrap_or_default();

    let tasks = raw
        .tasks
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, t)| convert_task(t, source, format!("Task {}", i + 1)))
        .collect::<Result<Vec<_>, _>>()?;

    let handlers = raw
        .handlers
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, t)| convert_task(t, source, format!("Handler {}", i + 1)).map(Handler::new))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Play {
        name: raw.name.unwrap_or_else(|| source.to_string()),
        hosts: raw.hosts.unwrap_or_else(|| "all".to_string()),
        vars,
        tasks,
        handlers,
        policy: raw.policy,
    })
}

pub(crate) fn convert_vars(
    vars: HashMap<String, YamlValue>,
) -> Result<HashMap<String, Value>, ConductorError> {
    vars.into_iter()
        .map(|(k, v)| Ok((k, yaml_to_value(v)?)))
        .collect()
}

fn yaml_to_value(yaml: YamlValue) -> Result<Value, ConductorError> {
    match yaml {
        YamlValue::Null => Ok(Value::Null),
        YamlValue::Bool(b) => Ok(Value::Bool(b)),
        YamlValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Float(f))
            } else {
                Err(invalid_value(format!("Unsupported number {}", n), None))
            }
        }
        YamlValue::String(s) => Ok(Value::String(s)),
        YamlValue::Sequence(seq) => {
            let items: Result<Vec<_>, _> = seq.into_iter().map(yaml_to_value).collect();
            Ok(Value::List(items?))
        }
        YamlValue::Mapping(map) => {
            let items: Result<HashMap<_, _>, _> = map
                .into_iter()
                .map(|(k, v)| {
                    let key = match k {
                        YamlValue::String(s) => s,
                        YamlValue::Number(n) => n.to_string(),
                        YamlValue::Bool(b) => b.to_string(),
                        other => {
                            return Err(invalid_value(
                                format!("Unsupported mapping key {:?}", other),
                                None,
                            ))
                        }
                    };
                    Ok((key, yaml_to_value(v)?))
                })
                .collect();
            Ok(Value::Dict(items?))
        }
        YamlValue::Tagged(tagged) => yaml_to_value(tagged.value),
    }
}

fn convert_task(raw: RawTask, source: &str, default_name: String) -> Result<Task, ConductorError> {
    let name = raw.name.unwrap_or(default_name);

    let kind = parse_task_kind(raw.module, &name, source)?;

    let notify = match raw.notify {
        Some(NotifyValue::Single(s)) => vec![s],
        Some(NotifyValue::Multiple(v)) => v,
        None => vec![],
    };

    let loop_spec = match raw.loop_items {
        Some(RawLoop::Items(items)) => Some(LoopSpec::Items(
            items
                .into_iter()
                .map(yaml_to_value)
                .collect::<Result<Vec<_>, _>>()?,
        )),
        Some(RawLoop::Expr(expr)) => Some(LoopSpec::Expr(parse_condition(
            &YamlValue::String(expr),
            &name,
        )?)),
        None => None,
    };

    // Support both full retry config and simple task-level fields (until, retries, delay)
    let retry = if let Some(retry_config) = raw.retry {
        Some(convert_retry_config(retry_config, &name)?)
    } else if raw.until.is_some() || raw.retries.is_some() || raw.delay.is_some() {
        Some(RetryConfig {
            attempts: raw.retries.unwrap_or(3),
            delay: DelayStrategy::Fixed(Duration::from_secs(raw.delay.unwrap_or(5))),
            until: raw
                .until
                .map(|u| parse_condition(&u, &name))
                .transpose()?,
            retry_unreachable: false,
        })
    } else {
        None
    };

    if let Some(RetryConfig { attempts: 0, .. }) = retry {
        return Err(invalid_value(
            format!("Task '{}' must allow at least one attempt", name),
            Some(source),
        ));
    }

    Ok(Task {
        when: raw.when.map(|w| parse_condition(&w, &name)).transpose()?,
        failed_when: raw
            .failed_when
            .map(|w| parse_condition(&w, &name))
            .transpose()?,
        changed_when: raw
            .changed_when
            .map(|w| parse_condition(&w, &name))
            .transpose()?,
        register: raw.register,
        notify,
        loop_spec,
        loop_var: raw.loop_var.unwrap_or_else(|| "item".to_string()),
        retry,
        ignore_errors: raw.ignore_errors.unwrap_or(false),
        ignore_unreachable: raw.ignore_unreachable.unwrap_or(false),
        name,
        kind,
    })
}

fn convert_retry_config(
    raw: RawRetryConfig,
    task_name: &str,
) -> Result<RetryConfig, ConductorError> {
    let delay = match raw.delay {
        Some(RawDelayValue::Seconds(s)) => DelayStrategy::Fixed(Duration::from_secs(s)),
        Some(RawDelayValue::Strategy(strat)) => {
            let base = Duration::from_secs(strat.base.unwrap_or(5));
            let max = Duration::from_secs(strat.max.unwrap_or(300));

            match strat.strategy.as_str() {
                "fixed" => DelayStrategy::Fixed(base),
                "exponential" => DelayStrategy::Exponential {
                    base,
                    max,
                    jitter: strat.jitter.unwrap_or(true),
                },
                "linear" => DelayStrategy::Linear {
                    base,
                    increment: Duration::from_secs(strat.increment.unwrap_or(5)),
                    max,
                },
                other => {
                    return Err(invalid_value(
                        format!(
                            "Unknown delay strategy '{}' in task '{}'",
                            other, task_name
                        ),
                        None,
                    ))
                }
            }
        }
        None => DelayStrategy::Fixed(Duration::from_secs(5)),
    };

    Ok(RetryConfig {
        attempts: raw.attempts.unwrap_or(3),
        delay,
        until: raw
            .until
            .map(|u| parse_condition(&u, task_name))
            .transpose()?,
        retry_unreachable: raw.retry_unreachable.unwrap_or(false),
    })
}

/// Conditions may be written as bare YAML scalars (`changed_when: false`)
fn parse_condition(expr: &YamlValue, task_name: &str) -> Result<Condition, ConductorError> {
    let source = match expr {
        YamlValue::String(s) => s.clone(),
        YamlValue::Bool(b) => b.to_string(),
        YamlValue::Number(n) => n.to_string(),
        other => {
            return Err(invalid_value(
                format!("Condition in task '{}' must be a string, got {:?}", task_name, other),
                None,
            ))
        }
    };

    Condition::parse(&source).map_err(|e| match e {
        ConductorError::Parse(mut err) => {
            err.message = format!("{} (task '{}')", err.message, task_name);
            ConductorError::Parse(err)
        }
        other => other,
    })
}

/// Resolve the single action key of a task, or the `meta: flush_handlers` marker
fn parse_task_kind(
    module: HashMap<String, YamlValue>,
    task_name: &str,
    source: &str,
) -> Result<TaskKind, ConductorError> {
    if module.len() != 1 {
        let found: Vec<_> = module.keys().cloned().collect();
        return Err(ConductorError::Parse(Box::new(ParseError {
            kind: ParseErrorKind::MissingField,
            message: if found.is_empty() {
                format!("No action specified in task '{}'", task_name)
            } else {
                format!(
                    "Task '{}' has more than one action: {}",
                    task_name,
                    found.join(", ")
                )
            },
            file: Some(source.to_string()),
            line: None,
            column: None,
            suggestion: Some("Give each task exactly one action key, e.g. 'command:'".to_string()),
        })));
    }

    let Some((key, value)) = module.into_iter().next() else {
        return Err(invalid_value(format!("No action in task '{}'", task_name), Some(source)));
    };

    if key == "meta" {
        return match value.as_str() {
            Some("flush_handlers") => Ok(TaskKind::FlushHandlers),
            _ => Err(invalid_value(
                format!("Unsupported meta action in task '{}'", task_name),
                Some(source),
            )),
        };
    }

    let args = match yaml_to_value(value)? {
        Value::Dict(map) => map,
        Value::Null => HashMap::new(),
        // free-form argument, e.g. `command: uptime`
        other => HashMap::from([("_raw".to_string(), other)]),
    };

    Ok(TaskKind::Action(ActionSpec { module: key, args }))
}

fn invalid_value(message: String, source: Option<&str>) -> ConductorError {
    ConductorError::Parse(Box::new(ParseError {
        kind: ParseErrorKind::InvalidValue,
        message,
        file: source.map(str::to_string),
        line: None,
        column: None,
        suggestion: None,
    }))
}
