// Per-host task runner shared by both strategies

use std::collections::HashMap;

use tracing::{debug, info, warn};

use super::context::ExecutionContext;
use super::evaluator::{Outcome, TaskEvaluator};
use super::failure::FailureTracker;
use super::handlers::HandlerQueue;
use super::ledger::{FailureKind, LedgerKey, ResultLedger, StepId, TaskResult, TaskStatus};
use crate::parser::ast::{LoopSpec, Play, Task, TaskKind, Value};
use crate::plugins::CallbackManager;
use crate::runtime::evaluate_expression;

/// Whether a host should keep going through its task list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Everything one play run shares between its host units
pub struct PlayRun<'a> {
    pub(crate) play: &'a Play,
    pub(crate) evaluator: TaskEvaluator,
    pub(crate) ledger: &'a ResultLedger,
    pub(crate) tracker: &'a FailureTracker,
    pub(crate) handlers: HandlerQueue,
    pub(crate) callbacks: &'a CallbackManager,
    /// First task index to run (resume)
    pub(crate) start_index: usize,
}

impl PlayRun<'_> {
    /// Run task `index` for one host and record its results
    pub(crate) async fn run_task(&self, ctx: &ExecutionContext, index: usize) -> Flow {
        let host = ctx.host_name();
        if self.tracker.is_aborted() || self.tracker.is_excluded(host) {
            return Flow::Stop;
        }
        let Some(task) = self.play.tasks.get(index) else {
            return Flow::Stop;
        };

        match &task.kind {
            TaskKind::FlushHandlers => {
                let key = LedgerKey::new(host, StepId::Task(index), None);
                if !self.ledger.contains(&key) {
                    self.callbacks.on_task_start(host, &task.name).await;
                    let mut outcome = Outcome::skipped("handlers flushed");
                    outcome.status = TaskStatus::Ok;
                    self.record(host, StepId::Task(index), None, task, &outcome).await;
                }
                self.flush_handlers(ctx).await;
            }
            TaskKind::Action(_) => {
                self.run_action_task(ctx, StepId::Task(index), task, &self.evaluator, true)
                    .await;
            }
        }

        if self.tracker.is_aborted() || self.tracker.is_excluded(host) {
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    /// Run the host's pending handlers, or drop them if the host can no
    /// longer run them
    pub(crate) async fn flush_handlers(&self, ctx: &ExecutionContext) {
        let host = ctx.host_name();
        if !self.handlers.has_pending(host) {
            return;
        }

        let force = self.play.policy.force_handlers;
        let blocked = self.tracker.is_aborted() || self.tracker.is_excluded(host);
        if blocked && !force {
            let dropped = self.handlers.discard(host);
            debug!(host, dropped = dropped.len(), "host stopped, pending handlers dropped");
            return;
        }

        let evaluator = if blocked {
            self.evaluator.detached()
        } else {
            self.evaluator.clone()
        };

        let batch = self.handlers.flush(host);
        for index in batch.handlers {
            let Some(handler) = self.play.handlers.get(index) else {
                continue;
            };
            info!(host, handler = handler.name(), window = batch.window, "running handler");
            self.callbacks.on_handler_start(host, handler.name()).await;

            let step = StepId::Handler {
                index,
                window: batch.window,
            };
            self.run_action_task(ctx, step, &handler.task, &evaluator, false)
                .await;
        }
    }

    /// Run an action task (or handler) over its loop items, in sequence
    async fn run_action_task(
        &self,
        ctx: &ExecutionContext,
        step: StepId,
        task: &Task,
        evaluator: &TaskEvaluator,
        allow_notify: bool,
    ) {
        let host = ctx.host_name();

        let items = match self.loop_items(task, ctx) {
            Ok(items) => items,
            Err(outcome) => {
                if !self.ledger.contains(&LedgerKey::new(host, step, None)) {
                    self.callbacks.on_task_start(host, &task.name).await;
                    self.record(host, step, None, task, &outcome).await;
                    self.report_failure(host, task, &outcome);
                }
                return;
            }
        };

        let looped = items.is_some();
        let runs: Vec<(Option<usize>, ExecutionContext)> = match items {
            None => vec![(None, ctx.clone())],
            Some(items) if items.is_empty() => {
                let key = LedgerKey::new(host, step, None);
                if !self.ledger.contains(&key) {
                    let outcome = Outcome::skipped("no loop items");
                    self.record(host, step, None, task, &outcome).await;
                    self.register(ctx, task, &outcome.result);
                }
                return;
            }
            Some(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| (Some(i), ctx.with_loop_item(&task.loop_var, item, i)))
                .collect(),
        };

        let mut outcomes: Vec<Outcome> = Vec::with_capacity(runs.len());
        let mut started = false;
        for (item, item_ctx) in runs {
            if self.ledger.contains(&LedgerKey::new(host, step, item)) {
                debug!(host, task = %task.name, ?item, "already recorded, not replayed");
                continue;
            }
            if !started {
                self.callbacks.on_task_start(host, &task.name).await;
                started = true;
            }

            let Some(outcome) = evaluator.evaluate(task, &item_ctx).await else {
                debug!(host, task = %task.name, "play aborted before start");
                break;
            };
            self.record(host, step, item, task, &outcome).await;
            outcomes.push(outcome);
        }

        if outcomes.is_empty() {
            return;
        }

        if looped {
            let mut aggregate = HashMap::new();
            aggregate.insert(
                "results".to_string(),
                Value::List(outcomes.iter().map(|o| o.result.clone()).collect()),
            );
            aggregate.insert(
                "changed".to_string(),
                Value::Bool(outcomes.iter().any(|o| o.changed)),
            );
            aggregate.insert(
                "failed".to_string(),
                Value::Bool(outcomes.iter().any(|o| o.status.is_failure())),
            );
            aggregate.insert(
                "skipped".to_string(),
                Value::Bool(outcomes.iter().all(|o| o.status == TaskStatus::Skipped)),
            );
            self.register(ctx, task, &Value::Dict(aggregate));
        } else if let Some(outcome) = outcomes.first() {
            self.register(ctx, task, &outcome.result);
        }

        if allow_notify && outcomes.iter().any(|o| o.status == TaskStatus::Changed) {
            for name in &task.notify {
                self.handlers.notify(host, name);
            }
        }

        if let Some(failed) = outcomes.iter().find(|o| o.status.is_failure()) {
            self.report_failure(host, task, failed);
        }
    }

    /// Items to iterate over, `None` for a task without a loop
    fn loop_items(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
    ) -> Result<Option<Vec<Value>>, Outcome> {
        match &task.loop_spec {
            None => Ok(None),
            Some(LoopSpec::Items(items)) => Ok(Some(items.clone())),
            Some(LoopSpec::Expr(cond)) => match evaluate_expression(&cond.expr, ctx) {
                Ok(Value::List(items)) => Ok(Some(items)),
                Ok(other) => Err(Outcome::skipped(String::new()).fail(
                    FailureKind::Evaluation,
                    format!("loop source '{}' is a {}, not a list", cond, other.type_name()),
                )),
                Err(e) => Err(Outcome::evaluation_failure(&e)),
            },
        }
    }

    fn register(&self, ctx: &ExecutionContext, task: &Task, value: &Value) {
        if let Some(name) = &task.register {
            ctx.register(name.clone(), value.clone());
        }
    }

    fn report_failure(&self, host: &str, task: &Task, outcome: &Outcome) {
        let kind = outcome.failure.unwrap_or(FailureKind::ActionFailure);
        let ignored = ignored(task, outcome);
        if ignored {
            info!(host, task = %task.name, "failure ignored");
        } else {
            warn!(
                host,
                task = %task.name,
                msg = outcome.msg.as_deref().unwrap_or(""),
                "task failed"
            );
        }
        self.tracker.record_failure(host, kind, ignored);
    }

    async fn record(
        &self,
        host: &str,
        step: StepId,
        item: Option<usize>,
        task: &Task,
        outcome: &Outcome,
    ) {
        let result = TaskResult {
            host: host.to_string(),
            step,
            item,
            task: task.name.clone(),
            status: outcome.status,
            changed: outcome.changed,
            output: outcome.output.clone(),
            msg: outcome.msg.clone(),
            attempts: outcome.attempts,
            failure: outcome.failure,
            ignored: ignored(task, outcome),
            aborted: false,
        };
        if self.ledger.record(result.clone()) {
            self.callbacks.on_task_result(&result).await;
        }
    }
}

fn ignored(task: &Task, outcome: &Outcome) -> bool {
    match outcome.status {
        TaskStatus::Unreachable => task.ignore_unreachable,
        TaskStatus::Failed => task.ignore_errors,
        _ => false,
    }
}
