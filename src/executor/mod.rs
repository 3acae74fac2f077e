// Executor module - play execution engine

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::parser::ast::{ActionSpec, Value};

pub mod checkpoint;
pub mod context;
pub mod evaluator;
pub mod failure;
pub mod handlers;
pub mod ledger;
pub mod play;
pub mod retry;
mod runner;
#[cfg(test)]
mod scenarios;
pub mod scheduler;
pub mod strategy;

pub use checkpoint::{Checkpoint, CheckpointManager};
pub use context::ExecutionContext;
pub use evaluator::{Outcome, TaskEvaluator};
pub use failure::{AbortHandle, AbortReason, FailureTracker};
pub use handlers::{FlushBatch, HandlerQueue};
pub use ledger::{FailureKind, LedgerKey, ResultLedger, StepId, TaskResult, TaskStatus};
pub use play::{ExecutorConfig, PlayExecutor, PlayReport, ResumeOptions, StartAt};
pub use retry::{calculate_delay, RetryController};
pub use scheduler::BatchScheduler;
pub use strategy::{FreeStrategy, LinearStrategy, Strategy};

/// What an action sees of its target host
pub type HostContext = ExecutionContext;

/// Raw result of one action invocation, before predicates are applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionResult {
    pub failed: bool,
    pub changed: bool,
    /// Captured output (stdout for command-like actions)
    pub output: String,
    pub rc: Option<i64>,
    pub msg: Option<String>,
    /// Extra module-specific fields, exposed under `result`
    pub data: HashMap<String, Value>,
}

impl ActionResult {
    pub fn ok() -> Self {
        ActionResult::default()
    }

    pub fn changed() -> Self {
        ActionResult {
            changed: true,
            ..Default::default()
        }
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        ActionResult {
            failed: true,
            msg: Some(msg.into()),
            ..Default::default()
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_rc(mut self, rc: i64) -> Self {
        self.rc = Some(rc);
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// The `result` binding seen by predicates and `register`
    pub fn to_value(&self, attempts: u32) -> Value {
        let mut map = self.data.clone();
        let lines: Vec<Value> = self.output.lines().map(Value::from).collect();

        map.insert("output".to_string(), Value::from(self.output.as_str()));
        map.insert("stdout".to_string(), Value::from(self.output.as_str()));
        map.insert("stdout_lines".to_string(), Value::List(lines));
        map.insert(
            "rc".to_string(),
            self.rc.map(Value::Int).unwrap_or(Value::Null),
        );
        map.insert("changed".to_string(), Value::Bool(self.changed));
        map.insert("failed".to_string(), Value::Bool(self.failed));
        map.insert(
            "msg".to_string(),
            self.msg.clone().map(Value::String).unwrap_or(Value::Null),
        );
        map.insert("attempts".to_string(), Value::Int(attempts as i64));
        Value::Dict(map)
    }
}

/// Invocation errors reported by an [`ActionInvoker`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    /// The host could not be reached
    #[error("host unreachable: {0}")]
    Unreachable(String),
    /// The action could not be carried out
    #[error("action failed: {0}")]
    Failed(String),
}

/// Executes one opaque action against one host.
///
/// Implementations own the transport (SSH, local exec, API calls). The
/// executor only sees the returned result.
#[async_trait]
pub trait ActionInvoker: Send + Sync {
    async fn invoke(
        &self,
        action: &ActionSpec,
        host: &HostContext,
    ) -> Result<ActionResult, ActionError>;
}
