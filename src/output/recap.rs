// Play recap: per-host counters and the per-host, per-task report

use std::collections::BTreeMap;
use std::fmt::Write as _;

use colored::*;
use serde::Serialize;

use crate::executor::ledger::{ResultLedger, StepId, TaskResult, TaskStatus};

/// Outcome counters for one host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostStats {
    pub ok: usize,
    pub changed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub unreachable: usize,
    /// Failures suppressed by ignore_errors/ignore_unreachable
    pub ignored: usize,
}

impl HostStats {
    pub fn record(&mut self, result: &TaskResult) {
        match result.status {
            _ if result.ignored => self.ignored += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Unreachable => self.unreachable += 1,
            TaskStatus::Skipped => self.skipped += 1,
            TaskStatus::Changed => self.changed += 1,
            TaskStatus::Ok => self.ok += 1,
        }
    }
}

/// Summary of a play run
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlayRecap {
    pub hosts: BTreeMap<String, HostStats>,
    /// Every record in append order
    pub results: Vec<TaskResult>,
}

impl PlayRecap {
    pub fn new() -> Self {
        PlayRecap::default()
    }

    /// Build from a ledger, restricted to `hosts`. Every one of them gets
    /// a row even if it never ran a task.
    pub fn from_ledger(ledger: &ResultLedger, hosts: &[String]) -> Self {
        let mut recap = PlayRecap::new();
        for host in hosts {
            recap.hosts.entry(host.clone()).or_default();
        }
        for result in ledger.records() {
            if hosts.contains(&result.host) {
                recap.record(result);
            }
        }
        recap
    }

    pub fn record(&mut self, result: TaskResult) {
        self.hosts
            .entry(result.host.clone())
            .or_default()
            .record(&result);
        self.results.push(result);
    }

    pub fn has_failures(&self) -> bool {
        self.hosts
            .values()
            .any(|s| s.failed > 0 || s.unreachable > 0)
    }

    pub fn total_failed(&self) -> usize {
        self.hosts.values().map(|s| s.failed).sum()
    }

    pub fn total_changed(&self) -> usize {
        self.hosts.values().map(|s| s.changed).sum()
    }

    /// Per-host task outcomes followed by the recap counters
    pub fn render(&self) -> String {
        let mut out = String::new();

        for host in self.hosts.keys() {
            let _ = writeln!(out, "{}", format!("[{}]", host).white().bold());
            for result in self.results.iter().filter(|r| &r.host == host) {
                let _ = writeln!(out, "  {}", render_result(result));
            }
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "{}", "PLAY RECAP".green().bold());
        let _ = writeln!(out, "{}", "─".repeat(60).dimmed());

        for (host, stats) in &self.hosts {
            let ok = format!("ok={}", stats.ok).green();
            let changed = if stats.changed > 0 {
                format!("changed={}", stats.changed).yellow()
            } else {
                format!("changed={}", stats.changed).normal()
            };
            let failed = if stats.failed > 0 {
                format!("failed={}", stats.failed).red().bold()
            } else {
                format!("failed={}", stats.failed).normal()
            };
            let unreachable = if stats.unreachable > 0 {
                format!("unreachable={}", stats.unreachable).red().bold()
            } else {
                format!("unreachable={}", stats.unreachable).normal()
            };
            let skipped = format!("skipped={}", stats.skipped).cyan();
            let ignored = format!("ignored={}", stats.ignored).normal();

            let _ = writeln!(
                out,
                "{:<30} : {}    {}    {}    {}    {}    {}",
                host.white().bold(),
                ok,
                changed,
                unreachable,
                failed,
                skipped,
                ignored
            );
        }
        out
    }
}

fn render_result(result: &TaskResult) -> String {
    let status = match result.status {
        TaskStatus::Ok => "ok".green(),
        TaskStatus::Changed => "changed".yellow(),
        TaskStatus::Skipped => "skipping".cyan(),
        TaskStatus::Failed if result.ignored => "failed (ignored)".red(),
        TaskStatus::Failed => "failed".red().bold(),
        TaskStatus::Unreachable => "unreachable".red().bold(),
    };

    let mut label = match result.step {
        StepId::Task(_) => result.task.clone(),
        StepId::Handler { .. } => format!("handler: {}", result.task),
    };
    if let Some(item) = result.item {
        let _ = write!(label, " (item {})", item);
    }

    let mut line = format!("{}: {}", status, label);
    if result.attempts > 1 {
        let _ = write!(line, " [{} attempts]", result.attempts);
    }
    if result.status.is_failure() {
        if let Some(msg) = &result.msg {
            let _ = write!(line, " - {}", msg.dimmed());
        }
    }
    line
}
