// Failure tracking: host exclusion and play abort decisions

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::ledger::FailureKind;
use crate::inventory::HostState;
use crate::parser::ast::ExecutionPolicy;

/// Why a play stopped issuing new work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    AnyErrorsFatal { host: String },
    MaxFailPercentage { failed: usize, total: usize, limit: u8 },
    External,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::AnyErrorsFatal { host } => {
                write!(f, "any_errors_fatal: host '{}' failed", host)
            }
            AbortReason::MaxFailPercentage {
                failed,
                total,
                limit,
            } => write!(
                f,
                "{} of {} hosts failed, exceeding max_fail_percentage {}%",
                failed, total, limit
            ),
            AbortReason::External => write!(f, "aborted by request"),
        }
    }
}

#[derive(Debug, Default)]
struct AbortState {
    flag: AtomicBool,
    reason: Mutex<Option<AbortReason>>,
}

/// Cancellation handle for a running play.
///
/// Once triggered, no new action invocations start. In-flight
/// invocations finish and are recorded.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    inner: Arc<AbortState>,
}

impl AbortHandle {
    pub fn new() -> Self {
        AbortHandle::default()
    }

    /// Request an external abort
    pub fn abort(&self) {
        self.trigger(AbortReason::External);
    }

    /// Set the abort flag; the first reason wins
    pub(crate) fn trigger(&self, reason: AbortReason) -> bool {
        let mut slot = self.inner.reason.lock();
        if slot.is_some() {
            return false;
        }
        warn!(%reason, "aborting play");
        *slot = Some(reason);
        self.inner.flag.store(true, Ordering::SeqCst);
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.inner.reason.lock().clone()
    }
}

/// Aggregates per-host failures for one play run
#[derive(Debug)]
pub struct FailureTracker {
    total_hosts: usize,
    max_fail_percentage: u8,
    any_errors_fatal: bool,
    states: DashMap<String, HostState>,
    /// Distinct hosts with at least one failure, ignored ones included
    failed: Mutex<HashSet<String>>,
    abort: AbortHandle,
}

impl FailureTracker {
    pub fn new(total_hosts: usize, policy: &ExecutionPolicy, abort: AbortHandle) -> Self {
        FailureTracker {
            total_hosts,
            max_fail_percentage: policy.max_fail_percentage,
            any_errors_fatal: policy.any_errors_fatal,
            states: DashMap::new(),
            failed: Mutex::new(HashSet::new()),
            abort,
        }
    }

    /// Record a host failure.
    ///
    /// An unsuppressed failure excludes the host (unreachable hosts are
    /// marked `Unreachable`). Suppressed failures still count toward
    /// `max_fail_percentage` but never trip `any_errors_fatal`.
    pub fn record_failure(&self, host: &str, kind: FailureKind, ignored: bool) {
        let failed_count = {
            let mut failed = self.failed.lock();
            failed.insert(host.to_string());
            failed.len()
        };

        if !ignored {
            let state = if kind == FailureKind::Unreachable {
                HostState::Unreachable
            } else {
                HostState::Excluded
            };
            info!(host, %state, "host removed from remaining tasks");
            self.states.insert(host.to_string(), state);

            if self.any_errors_fatal {
                self.abort.trigger(AbortReason::AnyErrorsFatal {
                    host: host.to_string(),
                });
                return;
            }
        }

        if self.should_abort(self.total_hosts) {
            self.abort.trigger(AbortReason::MaxFailPercentage {
                failed: failed_count,
                total: self.total_hosts,
                limit: self.max_fail_percentage,
            });
        }
    }

    /// Failed share strictly above `max_fail_percentage`
    pub fn should_abort(&self, total_hosts: usize) -> bool {
        if total_hosts == 0 {
            return false;
        }
        let failed = self.failed.lock().len();
        // integer form of failed / total * 100 > limit
        failed * 100 > self.max_fail_percentage as usize * total_hosts
    }

    pub fn is_excluded(&self, host: &str) -> bool {
        self.host_state(host) != HostState::Active
    }

    pub fn host_state(&self, host: &str) -> HostState {
        self.states.get(host).map(|s| *s).unwrap_or_default()
    }

    /// Final state for each of the given hosts
    pub fn host_states<'a>(
        &self,
        hosts: impl IntoIterator<Item = &'a str>,
    ) -> HashMap<String, HostState> {
        hosts
            .into_iter()
            .map(|h| (h.to_string(), self.host_state(h)))
            .collect()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.lock().len()
    }

    /// Distinct failed hosts, sorted
    pub fn failed_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<_> = self.failed.lock().iter().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Hosts removed from the play, sorted
    pub fn excluded_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<_> = self
            .states
            .iter()
            .filter(|e| *e.value() != HostState::Active)
            .map(|e| e.key().clone())
            .collect();
        hosts.sort();
        hosts
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.abort.reason()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }
}
