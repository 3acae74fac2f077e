// Batch scheduler: serial batches run one after another under a strategy

use futures::future::join_all;
use tracing::{info, instrument};

use super::context::ExecutionContext;
use super::runner::PlayRun;
use super::strategy::{self, Strategy};
use crate::parser::ast::{ExecutionPolicy, Serial};

/// Splits a play's hosts into `serial` batches and runs them in order.
///
/// Batches never overlap. Each batch ends with a handler flush for its
/// hosts, which is "play end" for those hosts.
pub struct BatchScheduler {
    strategy: Box<dyn Strategy>,
}

impl BatchScheduler {
    pub fn new(policy: &ExecutionPolicy) -> Self {
        BatchScheduler {
            strategy: strategy::for_policy(policy.strategy),
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Partition `hosts` into ordered batches.
    ///
    /// Percentages are taken of the full host list, with a minimum batch
    /// size of 1. For a list of sizes the last size repeats.
    pub fn calculate_batches<T: Clone>(hosts: &[T], serial: &Serial) -> Vec<Vec<T>> {
        if hosts.is_empty() {
            return Vec::new();
        }

        let sizes: Vec<usize> = match serial {
            Serial::All => vec![hosts.len()],
            Serial::Count(n) => vec![*n],
            Serial::Percentage(pct) => vec![(hosts.len() * *pct as usize / 100).max(1)],
            Serial::List(list) if list.is_empty() => vec![hosts.len()],
            Serial::List(list) => list.clone(),
        };

        let mut batches = Vec::new();
        let mut rest = hosts;
        let mut i = 0;
        while !rest.is_empty() {
            let size = sizes
                .get(i)
                .or(sizes.last())
                .copied()
                .unwrap_or(rest.len())
                .clamp(1, rest.len());
            let (batch, tail) = rest.split_at(size);
            batches.push(batch.to_vec());
            rest = tail;
            i += 1;
        }
        batches
    }

    /// Run every batch; stops starting new batches once the play aborts
    #[instrument(skip_all, fields(strategy = self.strategy.name(), hosts = hosts.len()))]
    pub(crate) async fn run(&self, run: &PlayRun<'_>, hosts: Vec<ExecutionContext>) {
        let batches = Self::calculate_batches(&hosts, &run.play.policy.serial);
        let total = batches.len();

        for (i, batch) in batches.into_iter().enumerate() {
            if run.tracker.is_aborted() {
                info!(remaining = total - i, "play aborted, skipping remaining batches");
                break;
            }

            let batch: Vec<ExecutionContext> = batch
                .into_iter()
                .filter(|ctx| !run.tracker.is_excluded(ctx.host_name()))
                .collect();
            if batch.is_empty() {
                continue;
            }

            let names: Vec<String> = batch.iter().map(|c| c.host_name().to_string()).collect();
            info!(batch = i + 1, of = total, hosts = ?names, "starting batch");
            run.callbacks.on_batch_start(i + 1, &names).await;

            self.strategy.advance(run, &batch).await;

            join_all(batch.iter().map(|ctx| run.flush_handlers(ctx))).await;
        }
    }
}
