// Task evaluation: conditional gate, action invocation and outcome classification

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

use super::context::ExecutionContext;
use super::failure::AbortHandle;
use super::ledger::{FailureKind, TaskStatus};
use super::retry::RetryController;
use super::{ActionError, ActionInvoker, ActionResult};
use crate::output::errors::ConductorError;
use crate::parser::ast::{ActionSpec, Task, Value};
use crate::runtime::evaluate_condition;

/// Classified outcome of one task on one host (one loop item)
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Whether the action was invoked at all
    pub run: bool,
    pub status: TaskStatus,
    pub changed: bool,
    pub output: String,
    pub msg: Option<String>,
    pub failure: Option<FailureKind>,
    pub attempts: u32,
    /// Value bound as `result` and under the task's register name
    pub result: Value,
}

impl Outcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let mut map = std::collections::HashMap::new();
        map.insert("skipped".to_string(), Value::Bool(true));
        map.insert("changed".to_string(), Value::Bool(false));
        map.insert("failed".to_string(), Value::Bool(false));
        map.insert("msg".to_string(), Value::String(reason.clone()));

        Outcome {
            run: false,
            status: TaskStatus::Skipped,
            changed: false,
            output: String::new(),
            msg: Some(reason),
            failure: None,
            attempts: 0,
            result: Value::Dict(map),
        }
    }

    /// A task that failed before or without invoking its action
    pub fn evaluation_failure(err: &ConductorError) -> Self {
        let mut outcome = Outcome::skipped(String::new());
        outcome.result = ActionResult::failed(err.summary()).to_value(0);
        outcome.status = TaskStatus::Failed;
        outcome.failure = Some(FailureKind::Evaluation);
        outcome.msg = Some(err.summary());
        outcome
    }

    pub(crate) fn unreachable(msg: impl Into<String>, attempt: u32) -> Self {
        let msg = msg.into();
        let mut result = ActionResult::failed(msg.clone()).to_value(attempt);
        if let Value::Dict(map) = &mut result {
            map.insert("unreachable".to_string(), Value::Bool(true));
        }

        Outcome {
            run: true,
            status: TaskStatus::Unreachable,
            changed: false,
            output: String::new(),
            msg: Some(msg),
            failure: Some(FailureKind::Unreachable),
            attempts: attempt,
            result,
        }
    }

    pub(crate) fn from_action(action: &ActionResult, attempt: u32) -> Self {
        let status = if action.failed {
            TaskStatus::Failed
        } else if action.changed {
            TaskStatus::Changed
        } else {
            TaskStatus::Ok
        };

        Outcome {
            run: true,
            status,
            changed: action.changed,
            output: action.output.clone(),
            msg: action.msg.clone(),
            failure: action.failed.then_some(FailureKind::ActionFailure),
            attempts: attempt,
            result: action.to_value(attempt),
        }
    }

    /// Context with this outcome bound as `result`, `output` and the
    /// task's register name
    pub(crate) fn scope(&self, ctx: &ExecutionContext, register: Option<&str>) -> ExecutionContext {
        let mut scope = ctx.clone();
        scope.bind("result", self.result.clone());
        scope.bind("output", Value::String(self.output.clone()));
        if let Some(name) = register {
            scope.bind(name, self.result.clone());
        }
        scope
    }

    pub(crate) fn set_attempts(&mut self, attempts: u32) {
        self.attempts = attempts;
        self.sync_result();
    }

    /// Mark failed, keeping an earlier failure kind and message
    pub(crate) fn fail(mut self, kind: FailureKind, msg: impl Into<String>) -> Self {
        if self.status != TaskStatus::Unreachable {
            self.status = TaskStatus::Failed;
        }
        self.failure.get_or_insert(kind);
        self.msg = Some(msg.into());
        self.sync_result();
        self
    }

    pub(crate) fn into_evaluation_failure(mut self, err: &ConductorError) -> Self {
        self.status = TaskStatus::Failed;
        self.failure = Some(FailureKind::Evaluation);
        self.msg = Some(err.summary());
        self.sync_result();
        self
    }

    fn settle(&mut self, failed: bool) {
        if failed {
            self.status = TaskStatus::Failed;
            self.failure.get_or_insert(FailureKind::ActionFailure);
        } else {
            self.status = if self.changed {
                TaskStatus::Changed
            } else {
                TaskStatus::Ok
            };
            self.failure = None;
        }
        self.sync_result();
    }

    fn sync_result(&mut self) {
        if let Value::Dict(map) = &mut self.result {
            map.insert("changed".to_string(), Value::Bool(self.changed));
            map.insert("failed".to_string(), Value::Bool(self.status.is_failure()));
            map.insert("attempts".to_string(), Value::Int(self.attempts as i64));
            map.insert(
                "msg".to_string(),
                self.msg.clone().map(Value::String).unwrap_or(Value::Null),
            );
        }
    }
}

/// Runs one task for one host: the `when` gate, the action (under the
/// retry loop and the fork bound), then `failed_when` and `changed_when`.
#[derive(Clone)]
pub struct TaskEvaluator {
    invoker: Arc<dyn ActionInvoker>,
    forks: Arc<Semaphore>,
    abort: AbortHandle,
}

impl TaskEvaluator {
    pub fn new(invoker: Arc<dyn ActionInvoker>, forks: Arc<Semaphore>, abort: AbortHandle) -> Self {
        TaskEvaluator {
            invoker,
            forks,
            abort,
        }
    }

    /// Same invoker and fork bound, but deaf to play aborts.
    /// Used for forced handler flushes.
    pub fn detached(&self) -> Self {
        TaskEvaluator {
            invoker: self.invoker.clone(),
            forks: self.forks.clone(),
            abort: AbortHandle::new(),
        }
    }

    /// Evaluate the `when` gate. A task without one always runs.
    pub fn should_run(&self, task: &Task, ctx: &ExecutionContext) -> Result<bool, ConductorError> {
        match &task.when {
            Some(cond) => evaluate_condition(cond, ctx),
            None => Ok(true),
        }
    }

    /// Evaluate a task for one host.
    ///
    /// Returns `None` when the play was aborted before the first attempt
    /// started; nothing should be recorded in that case.
    pub async fn evaluate(&self, task: &Task, ctx: &ExecutionContext) -> Option<Outcome> {
        match self.should_run(task, ctx) {
            Ok(true) => {}
            Ok(false) => {
                debug!(host = ctx.host_name(), task = %task.name, "when is false, skipping");
                return Some(Outcome::skipped("conditional result was false"));
            }
            Err(e) => return Some(Outcome::evaluation_failure(&e)),
        }

        let Some(action) = task.action() else {
            return Some(Outcome::skipped("no action to run"));
        };

        RetryController::new(self.abort.clone())
            .run_until(task, ctx, |attempt| self.attempt(task, action, ctx, attempt))
            .await
    }

    async fn attempt(
        &self,
        task: &Task,
        action: &ActionSpec,
        ctx: &ExecutionContext,
        attempt: u32,
    ) -> Option<Outcome> {
        let raw = {
            let _permit = match self.forks.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    return Some(
                        Outcome::from_action(&ActionResult::failed("fork pool closed"), attempt),
                    )
                }
            };
            if self.abort.is_aborted() {
                return None;
            }
            debug!(
                host = ctx.host_name(),
                task = %task.name,
                attempt,
                module = %action.module,
                "invoking action"
            );
            self.invoker.invoke(action, ctx).await
        };

        Some(self.classify(task, ctx, raw, attempt))
    }

    /// Turn a raw invocation result into an outcome by applying
    /// `failed_when` then `changed_when`.
    pub fn classify(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
        raw: Result<ActionResult, ActionError>,
        attempt: u32,
    ) -> Outcome {
        let action = match raw {
            Ok(result) => result,
            Err(ActionError::Unreachable(msg)) => return Outcome::unreachable(msg, attempt),
            Err(ActionError::Failed(msg)) => ActionResult::failed(msg),
        };

        let mut outcome = Outcome::from_action(&action, attempt);
        let register = task.register.as_deref();

        if let Some(cond) = &task.failed_when {
            match evaluate_condition(cond, &outcome.scope(ctx, register)) {
                Ok(failed) => {
                    if failed && !action.failed {
                        outcome.msg = Some(format!("failed_when matched: {}", cond));
                    }
                    outcome.settle(failed);
                }
                // fail closed
                Err(e) => return outcome.into_evaluation_failure(&e),
            }
        }

        if let Some(cond) = &task.changed_when {
            match evaluate_condition(cond, &outcome.scope(ctx, register)) {
                Ok(changed) => {
                    outcome.changed = changed;
                    let failed = outcome.status == TaskStatus::Failed;
                    outcome.settle(failed);
                }
                Err(e) => return outcome.into_evaluation_failure(&e),
            }
        }

        outcome
    }
}
