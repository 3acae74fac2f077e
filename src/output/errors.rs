// Human-readable error messages for conductor

use std::fmt;
use std::io::IsTerminal;
use std::path::PathBuf;

use colored::*;

/// Decide color output based on TTY detection and NO_COLOR
fn should_use_colors() -> bool {
    // https://no-color.org/
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }

    std::io::stderr().is_terminal()
}

/// Play-level errors.
///
/// Per-host failures never surface here; they are recorded in the
/// [`ResultLedger`](crate::executor::ResultLedger) as task statuses.
#[derive(Debug)]
pub enum ConductorError {
    /// Parse errors (YAML play definitions, expressions)
    Parse(Box<ParseError>),

    /// I/O errors
    Io {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid play or policy configuration
    Config {
        field: String,
        message: String,
        suggestion: Option<String>,
    },

    /// A conditional or predicate expression could not be evaluated
    Evaluation {
        expression: String,
        message: String,
        suggestion: Option<String>,
    },

    /// Host selection errors
    Inventory {
        message: String,
        suggestion: Option<String>,
    },

    /// Checkpoint load/verify errors
    Checkpoint {
        message: String,
        suggestion: Option<String>,
    },

    /// Runtime errors (builtin function execution, type errors)
    Runtime {
        function: Option<String>,
        message: String,
        suggestion: Option<String>,
    },
}

#[derive(Debug)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    InvalidYaml,
    InvalidExpression,
    MissingField,
    InvalidValue,
}

impl ConductorError {
    /// Shorthand for a runtime error without a function or hint
    pub fn runtime(message: impl Into<String>) -> Self {
        ConductorError::Runtime {
            function: None,
            message: message.into(),
            suggestion: None,
        }
    }

    /// Shorthand for a configuration error on a named field
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConductorError::Config {
            field: field.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Single-line message without colors or hints, for task results
    pub fn summary(&self) -> String {
        match self {
            ConductorError::Parse(err) => err.message.clone(),
            ConductorError::Io { message, .. } => message.clone(),
            ConductorError::Config { field, message, .. } => format!("{}: {}", field, message),
            ConductorError::Evaluation {
                expression,
                message,
                ..
            } => format!("{} ({})", message, expression),
            ConductorError::Inventory { message, .. }
            | ConductorError::Checkpoint { message, .. }
            | ConductorError::Runtime { message, .. } => message.clone(),
        }
    }

    pub(crate) fn invalid_expression(message: impl Into<String>) -> Self {
        ConductorError::Parse(Box::new(ParseError {
            kind: ParseErrorKind::InvalidExpression,
            message: message.into(),
            file: None,
            line: None,
            column: None,
            suggestion: Some("Check expression syntax".to_string()),
        }))
    }
}

impl std::error::Error for ConductorError {}

impl fmt::Display for ConductorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !should_use_colors() {
            colored::control::set_override(false);
        }

        match self {
            ConductorError::Parse(err) => {
                writeln!(f, "{}: {}", "ERROR".red().bold(), err.message)?;

                if let Some(ref file) = err.file {
                    write!(f, "  {} {}", "-->".blue(), file.cyan())?;
                    if let Some(line) = err.line {
                        write!(f, ":{}", line)?;
                        if let Some(col) = err.column {
                            write!(f, ":{}", col)?;
                        }
                    }
                    writeln!(f)?;
                }

                write_hint(f, err.suggestion.as_deref())
            }

            ConductorError::Io { message, path } => {
                writeln!(f, "{}: {}", "I/O ERROR".red().bold(), message)?;
                if let Some(path) = path {
                    writeln!(f, "  {} {}", "Path:".dimmed(), path.display())?;
                }
                Ok(())
            }

            ConductorError::Config {
                field,
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "CONFIG ERROR".red().bold(), message)?;
                writeln!(f, "  {} {}", "Field:".dimmed(), field)?;
                write_hint(f, suggestion.as_deref())
            }

            ConductorError::Evaluation {
                expression,
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "EVALUATION ERROR".red().bold(), message)?;
                writeln!(f, "  {} {}", "Expression:".dimmed(), expression)?;
                write_hint(f, suggestion.as_deref())
            }

            ConductorError::Inventory {
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "INVENTORY ERROR".red().bold(), message)?;
                write_hint(f, suggestion.as_deref())
            }

            ConductorError::Checkpoint {
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "CHECKPOINT ERROR".red().bold(), message)?;
                write_hint(f, suggestion.as_deref())
            }

            ConductorError::Runtime {
                function,
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "RUNTIME ERROR".red().bold(), message)?;
                if let Some(func) = function {
                    writeln!(f, "  {} {}", "Function:".dimmed(), func)?;
                }
                write_hint(f, suggestion.as_deref())
            }
        }
    }
}

fn write_hint(f: &mut fmt::Formatter<'_>, suggestion: Option<&str>) -> fmt::Result {
    if let Some(suggestion) = suggestion {
        writeln!(f)?;
        writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
    }
    Ok(())
}
