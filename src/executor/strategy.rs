// Execution strategies: how the hosts of one batch move through the task list

use async_trait::async_trait;
use futures::future::join_all;
use tracing::debug;

use super::context::ExecutionContext;
use super::runner::{Flow, PlayRun};
use crate::parser::ast::ExecutionStrategy;

/// Cross-host synchronization discipline for one batch
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Drive every host of the batch through the play's tasks
    async fn advance(&self, run: &PlayRun<'_>, batch: &[ExecutionContext]);
}

/// Lockstep: every host finishes task *i* (or is excluded) before any
/// host starts task *i+1*
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearStrategy;

/// Each host runs its task list independently
#[derive(Debug, Clone, Copy, Default)]
pub struct FreeStrategy;

/// Pick the strategy for a play; decided once at play start
pub fn for_policy(strategy: ExecutionStrategy) -> Box<dyn Strategy> {
    match strategy {
        ExecutionStrategy::Linear => Box::new(LinearStrategy),
        ExecutionStrategy::Free => Box::new(FreeStrategy),
    }
}

#[async_trait]
impl Strategy for LinearStrategy {
    fn name(&self) -> &'static str {
        "linear"
    }

    async fn advance(&self, run: &PlayRun<'_>, batch: &[ExecutionContext]) {
        for index in run.start_index..run.play.tasks.len() {
            if run.tracker.is_aborted() {
                break;
            }
            let active: Vec<&ExecutionContext> = batch
                .iter()
                .filter(|ctx| !run.tracker.is_excluded(ctx.host_name()))
                .collect();
            if active.is_empty() {
                break;
            }

            debug!(task = index, hosts = active.len(), "linear step");
            // join_all is the barrier
            join_all(active.into_iter().map(|ctx| run.run_task(ctx, index))).await;
        }
    }
}

#[async_trait]
impl Strategy for FreeStrategy {
    fn name(&self) -> &'static str {
        "free"
    }

    async fn advance(&self, run: &PlayRun<'_>, batch: &[ExecutionContext]) {
        join_all(batch.iter().map(|ctx| async move {
            for index in run.start_index..run.play.tasks.len() {
                if run.run_task(ctx, index).await == Flow::Stop {
                    debug!(host = ctx.host_name(), task = index, "host stopped");
                    break;
                }
            }
        }))
        .await;
    }
}
