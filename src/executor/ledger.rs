// Result ledger: one immutable record per (host, step, loop item)

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Which step of the play a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    /// Task at this index in the play's task list
    Task(usize),
    /// Handler at this declaration index, run in the host's nth flush window
    Handler { index: usize, window: u32 },
}

impl StepId {
    pub fn task_index(&self) -> Option<usize> {
        match self {
            StepId::Task(i) => Some(*i),
            StepId::Handler { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    pub host: String,
    pub step: StepId,
    /// Loop iteration index; `None` for tasks without a loop
    pub item: Option<usize>,
}

impl LedgerKey {
    pub fn new(host: impl Into<String>, step: StepId, item: Option<usize>) -> Self {
        LedgerKey {
            host: host.into(),
            step,
            item,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Ok,
    Changed,
    Failed,
    Skipped,
    Unreachable,
}

impl TaskStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Unreachable)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Ok => "ok",
            TaskStatus::Changed => "changed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Unreachable => "unreachable",
        };
        write!(f, "{}", s)
    }
}

/// Why a record failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The action reported failure, or `failed_when` triggered
    ActionFailure,
    /// Transport-level failure reaching the host
    Unreachable,
    /// A conditional could not be evaluated
    Evaluation,
}

/// Outcome of one (host, step, loop item)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub host: String,
    pub step: StepId,
    pub item: Option<usize>,
    pub task: String,
    pub status: TaskStatus,
    pub changed: bool,
    /// Captured action output
    pub output: String,
    pub msg: Option<String>,
    pub attempts: u32,
    pub failure: Option<FailureKind>,
    /// Failure recorded but suppressed by ignore_errors/ignore_unreachable
    pub ignored: bool,
    /// Skipped because the play aborted before the task started
    #[serde(default)]
    pub aborted: bool,
}

impl TaskResult {
    /// Placeholder for a task the play abort kept from starting
    pub fn aborted(host: impl Into<String>, index: usize, task: impl Into<String>) -> Self {
        TaskResult {
            host: host.into(),
            step: StepId::Task(index),
            item: None,
            task: task.into(),
            status: TaskStatus::Skipped,
            changed: false,
            output: String::new(),
            msg: Some("play aborted".to_string()),
            attempts: 0,
            failure: None,
            ignored: false,
            aborted: true,
        }
    }

    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(self.host.clone(), self.step, self.item)
    }

    /// Whether this record means the work was done (or deliberately not
    /// needed) and need not run again
    pub fn is_settled(&self) -> bool {
        !self.status.is_failure() && !self.aborted
    }
}

/// Append-only collection of task results for a play run.
///
/// Host units write concurrently; keys never collide across hosts, and
/// each key is written at most once.
#[derive(Debug, Default)]
pub struct ResultLedger {
    entries: DashMap<LedgerKey, (u64, TaskResult)>,
    /// (host, task index) pairs with at least one record that ran or was
    /// skipped on its own terms
    started_tasks: DashSet<(String, usize)>,
    seq: AtomicU64,
}

impl ResultLedger {
    pub fn new() -> Self {
        ResultLedger::default()
    }

    /// Append a record. Returns false (and keeps the original) if the key
    /// was already recorded.
    pub fn record(&self, result: TaskResult) -> bool {
        match self.entries.entry(result.key()) {
            Entry::Occupied(existing) => {
                warn!(
                    host = %existing.key().host,
                    step = ?existing.key().step,
                    "ledger key already recorded, keeping first result"
                );
                false
            }
            Entry::Vacant(slot) => {
                if let (StepId::Task(index), false) = (result.step, result.aborted) {
                    self.started_tasks.insert((result.host.clone(), index));
                }
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                slot.insert((seq, result));
                true
            }
        }
    }

    pub fn contains(&self, key: &LedgerKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &LedgerKey) -> Option<TaskResult> {
        self.entries.get(key).map(|e| e.value().1.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All records in the order they were appended
    pub fn records(&self) -> Vec<TaskResult> {
        let mut all: Vec<(u64, TaskResult)> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|(seq, _)| *seq);
        all.into_iter().map(|(_, r)| r).collect()
    }

    pub fn for_host(&self, host: &str) -> Vec<TaskResult> {
        self.records()
            .into_iter()
            .filter(|r| r.host == host)
            .collect()
    }

    /// Whether the host has any record for the task at `index`, other
    /// than a placeholder written for an abort
    pub fn has_task(&self, host: &str, index: usize) -> bool {
        self.started_tasks.contains(&(host.to_string(), index))
    }

    /// Highest handler flush window recorded for each host
    pub fn handler_windows(&self) -> HashMap<String, u32> {
        let mut windows: HashMap<String, u32> = HashMap::new();
        for entry in self.entries.iter() {
            if let StepId::Handler { window, .. } = entry.key().step {
                let max = windows.entry(entry.key().host.clone()).or_default();
                *max = (*max).max(window);
            }
        }
        windows
    }

    /// Seed from a prior run's ledger for resumption.
    ///
    /// Failed and unreachable records, and placeholders for tasks an abort
    /// kept from starting, are dropped so those steps run again. Everything
    /// else is carried over and will not be replayed.
    pub fn seeded_from(prior: &ResultLedger) -> Self {
        let ledger = ResultLedger::new();
        for record in prior.records() {
            if record.is_settled() {
                ledger.record(record);
            }
        }
        ledger
    }
}
