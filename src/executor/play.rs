// Play executor: drives one play end to end across its hosts

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use super::checkpoint::{Checkpoint, CheckpointManager};
use super::context::ExecutionContext;
use super::evaluator::TaskEvaluator;
use super::failure::{AbortHandle, AbortReason, FailureTracker};
use super::handlers::HandlerQueue;
use super::ledger::{ResultLedger, TaskResult};
use super::runner::PlayRun;
use super::scheduler::BatchScheduler;
use super::ActionInvoker;
use crate::inventory::{Host, HostState, InventoryProvider};
use crate::output::errors::ConductorError;
use crate::output::recap::PlayRecap;
use crate::parser::ast::Play;
use crate::plugins::CallbackManager;

/// Executor configuration
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    /// Save a checkpoint here when a play does not succeed
    pub checkpoint_dir: Option<PathBuf>,
}

/// Task to re-enter the task list at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartAt {
    Name(String),
    Index(usize),
}

/// Options for resuming a play from an earlier run
#[derive(Debug, Clone, Default)]
pub struct ResumeOptions {
    pub start_at: Option<StartAt>,
    /// Restrict the run to these hosts
    pub limit: Option<Vec<String>>,
    /// Ledger of the earlier run; its successful records are not replayed
    pub prior: Option<Arc<ResultLedger>>,
}

impl ResumeOptions {
    pub fn new() -> Self {
        ResumeOptions::default()
    }

    pub fn with_start_at(mut self, start_at: StartAt) -> Self {
        self.start_at = Some(start_at);
        self
    }

    pub fn with_start_at_task(self, name: impl Into<String>) -> Self {
        self.with_start_at(StartAt::Name(name.into()))
    }

    pub fn with_limit(mut self, hosts: Vec<String>) -> Self {
        self.limit = Some(hosts);
        self
    }

    pub fn with_prior(mut self, ledger: Arc<ResultLedger>) -> Self {
        self.prior = Some(ledger);
        self
    }
}

/// Result of a play run
#[derive(Debug)]
pub struct PlayReport {
    pub play_name: String,
    pub ledger: Arc<ResultLedger>,
    pub recap: PlayRecap,
    /// Final state of every in-scope host
    pub host_states: HashMap<String, HostState>,
    pub abort_reason: Option<AbortReason>,
    pub checkpoint: Checkpoint,
    /// Where the checkpoint was written, if it was
    pub checkpoint_path: Option<PathBuf>,
    /// Active hosts with tasks that never started because of an abort
    pub unfinished_hosts: Vec<String>,
    /// No abort and no failed or unreachable hosts
    pub success: bool,
}

impl PlayReport {
    pub fn failed_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .host_states
            .iter()
            .filter(|(_, state)| **state != HostState::Active)
            .map(|(host, _)| host.clone())
            .collect();
        hosts.sort();
        hosts
    }
}

/// The play executor
pub struct PlayExecutor {
    invoker: Arc<dyn ActionInvoker>,
    config: ExecutorConfig,
    callbacks: Arc<CallbackManager>,
    abort: AbortHandle,
}

impl PlayExecutor {
    pub fn new(invoker: Arc<dyn ActionInvoker>) -> Self {
        PlayExecutor {
            invoker,
            config: ExecutorConfig::default(),
            callbacks: Arc::new(CallbackManager::new()),
            abort: AbortHandle::new(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_callbacks(mut self, callbacks: Arc<CallbackManager>) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Handle for cancelling runs of this executor from elsewhere.
    ///
    /// Once triggered it stays triggered; later runs stop before their
    /// first invocation.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Run a play from the beginning on every selected host
    pub async fn run(
        &self,
        play: &Play,
        inventory: &dyn InventoryProvider,
    ) -> Result<PlayReport, ConductorError> {
        self.resume(play, inventory, ResumeOptions::default()).await
    }

    /// Run a play, re-entering at `options.start_at` on the `options.limit`
    /// hosts and replaying nothing already in `options.prior`
    #[instrument(skip_all, fields(play = %play.name))]
    pub async fn resume(
        &self,
        play: &Play,
        inventory: &dyn InventoryProvider,
        options: ResumeOptions,
    ) -> Result<PlayReport, ConductorError> {
        play.validate()?;

        let hosts = select_hosts(play, inventory, options.limit.as_deref())?;
        let start_index = resolve_start(play, options.start_at.as_ref())?;
        let host_names: Vec<String> = hosts.iter().map(|h| h.name.clone()).collect();

        let ledger = Arc::new(match &options.prior {
            Some(prior) => ResultLedger::seeded_from(prior),
            None => ResultLedger::new(),
        });
        let tracker = FailureTracker::new(hosts.len(), &play.policy, self.abort.clone());

        let play_vars = Arc::new(play.vars.clone());
        let contexts: Vec<ExecutionContext> = hosts
            .into_iter()
            .map(|host| ExecutionContext::new(Arc::new(host), play_vars.clone()))
            .collect();

        info!(
            hosts = host_names.len(),
            tasks = play.tasks.len(),
            start_index,
            forks = play.policy.forks,
            "starting play"
        );
        self.callbacks.on_play_start(&play.name, &host_names).await;

        let handlers = HandlerQueue::from_handlers(&play.handlers);
        handlers.continue_windows(&ledger.handler_windows());

        let run = PlayRun {
            play,
            evaluator: TaskEvaluator::new(
                self.invoker.clone(),
                Arc::new(Semaphore::new(play.policy.forks)),
                self.abort.clone(),
            ),
            ledger: &ledger,
            tracker: &tracker,
            handlers,
            callbacks: &self.callbacks,
            start_index,
        };
        BatchScheduler::new(&play.policy).run(&run, contexts).await;

        if tracker.is_aborted() {
            self.mark_aborted(play, &host_names, &ledger, &tracker, start_index)
                .await;
        }

        let report = self.finish(play, &host_names, ledger.clone(), &tracker, start_index);
        self.callbacks.on_play_complete(&report).await;
        Ok(report)
    }

    /// Record every task an abort kept from starting on a still-active
    /// host as skipped
    async fn mark_aborted(
        &self,
        play: &Play,
        hosts: &[String],
        ledger: &ResultLedger,
        tracker: &FailureTracker,
        start_index: usize,
    ) {
        let mut marked = 0;
        for host in hosts.iter().filter(|h| !tracker.is_excluded(h)) {
            for (index, task) in play.tasks.iter().enumerate().skip(start_index) {
                if ledger.has_task(host, index) {
                    continue;
                }
                let result = TaskResult::aborted(host.as_str(), index, task.name.as_str());
                if ledger.record(result.clone()) {
                    marked += 1;
                    self.callbacks.on_task_result(&result).await;
                }
            }
        }
        info!(marked, "tasks skipped by play abort");
    }

    fn finish(
        &self,
        play: &Play,
        hosts: &[String],
        ledger: Arc<ResultLedger>,
        tracker: &FailureTracker,
        start_index: usize,
    ) -> PlayReport {
        let host_states = tracker.host_states(hosts.iter().map(String::as_str));
        let abort_reason = tracker.abort_reason();
        let success = abort_reason.is_none() && tracker.excluded_hosts().is_empty();

        let unfinished_hosts: Vec<String> = hosts
            .iter()
            .filter(|h| !tracker.is_excluded(h))
            .filter(|h| (start_index..play.tasks.len()).any(|i| !ledger.has_task(h, i)))
            .cloned()
            .collect();

        let checkpoint = Checkpoint::capture(play, hosts, &ledger, tracker, start_index);
        let checkpoint_path = self.persist_checkpoint(&checkpoint, success);

        if success {
            info!("play completed successfully");
        } else {
            warn!(
                failed = tracker.failed_count(),
                excluded = tracker.excluded_hosts().len(),
                aborted = abort_reason.is_some(),
                "play did not succeed"
            );
        }

        PlayReport {
            play_name: play.name.clone(),
            recap: PlayRecap::from_ledger(&ledger, hosts),
            ledger,
            host_states,
            abort_reason,
            checkpoint,
            checkpoint_path,
            unfinished_hosts,
            success,
        }
    }

    /// Save on failure, clean up on success. Errors are logged; the run
    /// result stands either way.
    fn persist_checkpoint(&self, checkpoint: &Checkpoint, success: bool) -> Option<PathBuf> {
        let dir = self.config.checkpoint_dir.as_ref()?;
        let result = CheckpointManager::with_dir(dir.clone()).and_then(|manager| {
            if success {
                manager.cleanup(&checkpoint.play_name).map(|_| None)
            } else {
                manager.save(checkpoint).map(Some)
            }
        });

        match result {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e.summary(), "checkpoint not persisted");
                None
            }
        }
    }
}

/// Hosts matching the play's pattern, narrowed by `limit`
fn select_hosts(
    play: &Play,
    inventory: &dyn InventoryProvider,
    limit: Option<&[String]>,
) -> Result<Vec<Host>, ConductorError> {
    let mut hosts = inventory.select(&play.hosts);
    if let Some(limit) = limit {
        hosts.retain(|h| limit.contains(&h.name));
    }

    if hosts.is_empty() {
        return Err(ConductorError::Inventory {
            message: format!("No hosts matched '{}' for play '{}'", play.hosts, play.name),
            suggestion: Some(
                "Check the play's hosts pattern and any --limit host list".to_string(),
            ),
        });
    }
    Ok(hosts)
}

fn resolve_start(play: &Play, start_at: Option<&StartAt>) -> Result<usize, ConductorError> {
    match start_at {
        None => Ok(0),
        Some(StartAt::Name(name)) => play.task_index(name).ok_or_else(|| ConductorError::Config {
            field: "start_at".to_string(),
            message: format!("No task named '{}' in play '{}'", name, play.name),
            suggestion: Some(format!(
                "Available tasks: {}",
                play.tasks
                    .iter()
                    .map(|t| t.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }),
        Some(StartAt::Index(index)) if *index <= play.tasks.len() => Ok(*index),
        Some(StartAt::Index(index)) => Err(ConductorError::config(
            "start_at",
            format!(
                "Task index {} is past the end of play '{}' ({} tasks)",
                index,
                play.name,
                play.tasks.len()
            ),
        )),
    }
}
