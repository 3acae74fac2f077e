// Abstract Syntax Tree types for conductor plays

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::output::errors::ConductorError;

/// Serial execution configuration - controls how many hosts run per batch
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawSerial", into = "RawSerial")]
pub enum Serial {
    /// All play hosts in a single batch (serial: all)
    #[default]
    All,
    /// Fixed number of hosts per batch (e.g., serial: 2)
    Count(usize),
    /// Percentage of the play's hosts per batch (e.g., serial: "25%")
    Percentage(u8),
    /// Progressive batches; the last size repeats (e.g., serial: [1, 5, 10])
    List(Vec<usize>),
}

/// Wire shape of `serial`: an int, `"all"`, `"N%"` or a list
#[doc(hidden)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawSerial {
    Count(usize),
    Text(String),
    List(Vec<usize>),
}

impl TryFrom<RawSerial> for Serial {
    type Error = String;

    fn try_from(raw: RawSerial) -> Result<Self, Self::Error> {
        match raw {
            RawSerial::Count(0) => Err("serial must be at least 1".to_string()),
            RawSerial::Count(n) => Ok(Serial::Count(n)),
            RawSerial::List(sizes) => {
                if sizes.is_empty() || sizes.contains(&0) {
                    Err("serial list must be non-empty with sizes of at least 1".to_string())
                } else {
                    Ok(Serial::List(sizes))
                }
            }
            RawSerial::Text(s) => {
                let s = s.trim();
                if s.eq_ignore_ascii_case("all") {
                    Ok(Serial::All)
                } else if let Some(pct) = s.strip_suffix('%') {
                    match pct.trim().parse::<u8>() {
                        Ok(p) if (1..=100).contains(&p) => Ok(Serial::Percentage(p)),
                        _ => Err(format!("invalid serial percentage '{}'", s)),
                    }
                } else {
                    match s.parse::<usize>() {
                        Ok(n) if n > 0 => Ok(Serial::Count(n)),
                        _ => Err(format!(
                            "invalid serial value '{}' (use a count, 'all' or 'N%')",
                            s
                        )),
                    }
                }
            }
        }
    }
}

impl From<Serial> for RawSerial {
    fn from(serial: Serial) -> Self {
        match serial {
            Serial::All => RawSerial::Text("all".to_string()),
            Serial::Count(n) => RawSerial::Count(n),
            Serial::Percentage(p) => RawSerial::Text(format!("{}%", p)),
            Serial::List(sizes) => RawSerial::List(sizes),
        }
    }
}

/// Execution strategy - controls how tasks are executed across hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStrategy {
    /// Wait for all hosts in the batch to complete a task before moving to the next
    #[default]
    Linear,
    /// Each host proceeds independently through its tasks
    Free,
}

/// Play-wide execution policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionPolicy {
    pub strategy: ExecutionStrategy,
    pub serial: Serial,
    /// Maximum concurrent action invocations within a batch
    pub forks: usize,
    /// Abort when the failed-host share strictly exceeds this
    pub max_fail_percentage: u8,
    pub any_errors_fatal: bool,
    /// Flush handlers for failed hosts and after an abort
    pub force_handlers: bool,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        ExecutionPolicy {
            strategy: ExecutionStrategy::Linear,
            serial: Serial::All,
            forks: 5,
            max_fail_percentage: 100,
            any_errors_fatal: false,
            force_handlers: false,
        }
    }
}

impl ExecutionPolicy {
    pub fn validate(&self) -> Result<(), ConductorError> {
        if self.forks == 0 {
            return Err(ConductorError::Config {
                field: "forks".to_string(),
                message: "forks must be at least 1".to_string(),
                suggestion: Some("Set forks to a positive integer (default 5)".to_string()),
            });
        }
        if self.max_fail_percentage > 100 {
            return Err(ConductorError::Config {
                field: "max_fail_percentage".to_string(),
                message: format!(
                    "max_fail_percentage must be between 0 and 100, got {}",
                    self.max_fail_percentage
                ),
                suggestion: None,
            });
        }
        match &self.serial {
            Serial::Count(0) => Err(ConductorError::config("serial", "serial must be at least 1")),
            Serial::Percentage(p) if *p == 0 || *p > 100 => Err(ConductorError::config(
                "serial",
                format!("serial percentage must be between 1 and 100, got {}", p),
            )),
            Serial::List(sizes) if sizes.is_empty() || sizes.contains(&0) => Err(
                ConductorError::config("serial", "serial list sizes must be at least 1"),
            ),
            _ => Ok(()),
        }
    }
}

/// A complete play: ordered tasks and handlers bound to a host selection
#[derive(Debug, Clone)]
pub struct Play {
    pub name: String,
    /// Host selection pattern: `all`, a group name or a host name
    pub hosts: String,
    pub vars: HashMap<String, Value>,
    pub tasks: Vec<Task>,
    pub handlers: Vec<Handler>,
    pub policy: ExecutionPolicy,
}

impl Play {
    pub fn new(name: impl Into<String>) -> Self {
        Play {
            name: name.into(),
            hosts: "all".to_string(),
            vars: HashMap::new(),
            tasks: Vec::new(),
            handlers: Vec::new(),
            policy: ExecutionPolicy::default(),
        }
    }

    pub fn with_hosts(mut self, pattern: impl Into<String>) -> Self {
        self.hosts = pattern.into();
        self
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_handler(mut self, handler: Handler) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Index of the task with the given name
    pub fn task_index(&self, name: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.name == name)
    }

    /// Check policy bounds, name uniqueness and notify targets
    pub fn validate(&self) -> Result<(), ConductorError> {
        self.policy.validate()?;

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.name.as_str()) {
                return Err(ConductorError::Config {
                    field: "tasks".to_string(),
                    message: format!("duplicate task name '{}'", task.name),
                    suggestion: Some("Task names must be unique within a play".to_string()),
                });
            }
        }

        let mut handler_names = HashSet::new();
        for handler in &self.handlers {
            if !handler_names.insert(handler.name()) {
                return Err(ConductorError::config(
                    "handlers",
                    format!("duplicate handler name '{}'", handler.name()),
                ));
            }
        }

        for task in &self.tasks {
            for target in &task.notify {
                if !handler_names.contains(target.as_str()) {
                    return Err(ConductorError::Config {
                        field: format!("tasks.{}.notify", task.name),
                        message: format!(
                            "task '{}' notifies undefined handler '{}'",
                            task.name, target
                        ),
                        suggestion: Some(format!(
                            "Defined handlers: {}",
                            self.handlers
                                .iter()
                                .map(|h| h.name())
                                .collect::<Vec<_>>()
                                .join(", ")
                        )),
                    });
                }
            }
        }

        Ok(())
    }
}

/// What a task does when it runs
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    /// Invoke an opaque action through the ActionInvoker
    Action(ActionSpec),
    /// Flush the executing host's pending handlers
    FlushHandlers,
}

/// Reference to an opaque action: module name plus arguments
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionSpec {
    pub module: String,
    pub args: HashMap<String, Value>,
}

impl ActionSpec {
    pub fn new(module: impl Into<String>) -> Self {
        ActionSpec {
            module: module.into(),
            args: HashMap::new(),
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }
}

/// Source of loop items
#[derive(Debug, Clone, PartialEq)]
pub enum LoopSpec {
    Items(Vec<Value>),
    /// Expression that must evaluate to a list
    Expr(Condition),
}

/// A single task
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub name: String,
    pub kind: TaskKind,
    pub when: Option<Condition>,
    pub failed_when: Option<Condition>,
    pub changed_when: Option<Condition>,
    pub register: Option<String>,
    pub notify: Vec<String>,
    pub loop_spec: Option<LoopSpec>,
    pub loop_var: String,
    pub retry: Option<RetryConfig>,
    pub ignore_errors: bool,
    pub ignore_unreachable: bool,
}

impl Task {
    pub fn new(name: impl Into<String>, action: ActionSpec) -> Self {
        Task {
            name: name.into(),
            kind: TaskKind::Action(action),
            when: None,
            failed_when: None,
            changed_when: None,
            register: None,
            notify: Vec::new(),
            loop_spec: None,
            loop_var: "item".to_string(),
            retry: None,
            ignore_errors: false,
            ignore_unreachable: false,
        }
    }

    /// Meta task that flushes pending handlers
    pub fn flush_handlers(name: impl Into<String>) -> Self {
        Task {
            kind: TaskKind::FlushHandlers,
            ..Task::new(name, ActionSpec::new("meta"))
        }
    }

    pub fn with_when(mut self, cond: Condition) -> Self {
        self.when = Some(cond);
        self
    }

    pub fn with_failed_when(mut self, cond: Condition) -> Self {
        self.failed_when = Some(cond);
        self
    }

    pub fn with_changed_when(mut self, cond: Condition) -> Self {
        self.changed_when = Some(cond);
        self
    }

    pub fn with_register(mut self, name: impl Into<String>) -> Self {
        self.register = Some(name.into());
        self
    }

    pub fn with_notify(mut self, handler: impl Into<String>) -> Self {
        self.notify.push(handler.into());
        self
    }

    pub fn with_loop(mut self, spec: LoopSpec) -> Self {
        self.loop_spec = Some(spec);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_ignore_errors(mut self, ignore: bool) -> Self {
        self.ignore_errors = ignore;
        self
    }

    pub fn action(&self) -> Option<&ActionSpec> {
        match &self.kind {
            TaskKind::Action(spec) => Some(spec),
            TaskKind::FlushHandlers => None,
        }
    }
}

/// A deferred task run when notified
#[derive(Debug, Clone, PartialEq)]
pub struct Handler {
    pub task: Task,
}

impl Handler {
    pub fn new(task: Task) -> Self {
        Handler { task }
    }

    pub fn name(&self) -> &str {
        &self.task.name
    }
}

/// Retry configuration for tasks
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (including first try)
    pub attempts: u32,
    /// Delay strategy between retries
    pub delay: DelayStrategy,
    /// Condition that means success - stop retrying
    pub until: Option<Condition>,
    /// Keep retrying when the host is unreachable
    pub retry_unreachable: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            attempts: 3,
            delay: DelayStrategy::Fixed(Duration::from_secs(5)),
            until: None,
            retry_unreachable: false,
        }
    }
}

/// Delay strategy for retries
#[derive(Debug, Clone, PartialEq)]
pub enum DelayStrategy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Exponential backoff: base * 2^attempt, with optional jitter
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
    /// Linear increase: base + (increment * attempt)
    Linear {
        base: Duration,
        increment: Duration,
        max: Duration,
    },
}

/// A parsed conditional together with its source text
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub source: String,
    pub expr: Expression,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConductorError> {
        let expr = crate::parser::expressions::parse_expression(source)?;
        Ok(Condition {
            source: source.trim().to_string(),
            expr,
        })
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

/// Expression AST node
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// String literal: "hello"
    String(String),
    /// Integer literal: 42
    Integer(i64),
    /// Float literal: 3.14
    Float(f64),
    /// Boolean literal: true/false
    Boolean(bool),
    /// Null/None value
    Null,
    /// Variable reference: result.stdout
    Variable(Vec<String>),
    /// Binary operation: a + b
    BinaryOp {
        left: Box<Expression>,
        op: BinaryOperator,
        right: Box<Expression>,
    },
    /// Unary operation: not x, -x
    UnaryOp {
        op: UnaryOperator,
        operand: Box<Expression>,
    },
    /// Builtin call: len(x)
    FunctionCall { name: String, args: Vec<Expression> },
    /// Index access: arr[0], dict["key"]
    Index {
        object: Box<Expression>,
        index: Box<Expression>,
    },
    /// Attribute access after an index or call: items[0].name
    Attribute {
        object: Box<Expression>,
        attr: String,
    },
    /// List literal: [1, 2, 3]
    List(Vec<Expression>),
}

impl Expression {
    /// Create a simple string expression
    pub fn string(s: impl Into<String>) -> Self {
        Expression::String(s.into())
    }

    /// Create a simple variable reference
    pub fn var(name: impl Into<String>) -> Self {
        Expression::Variable(vec![name.into()])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // Logical
    And,
    Or,
    // Membership
    In,
    NotIn,
}

impl std::fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Sub => "-",
            BinaryOperator::Mul => "*",
            BinaryOperator::Div => "/",
            BinaryOperator::Mod => "%",
            BinaryOperator::Eq => "==",
            BinaryOperator::Ne => "!=",
            BinaryOperator::Lt => "<",
            BinaryOperator::Le => "<=",
            BinaryOperator::Gt => ">",
            BinaryOperator::Ge => ">=",
            BinaryOperator::And => "and",
            BinaryOperator::Or => "or",
            BinaryOperator::In => "in",
            BinaryOperator::NotIn => "not in",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Neg,
}

/// Runtime value type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Dict(HashMap<String, Value>),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Dict(d) => !d.is_empty(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::String(s) => write!(f, "{}", s),
            Value::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Dict(d) => {
                // sorted for stable output
                let mut keys: Vec<_> = d.keys().collect();
                keys.sort();
                write!(f, "{{")?;
                for (i, k) in keys.into_iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, d[k])?;
                }
                write!(f, "}}")
            }
        }
    }
}
