// End-to-end play runs against a scripted invoker

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use super::*;
use crate::inventory::{Host, HostState, StaticInventory};
use crate::output::errors::ConductorError;
use crate::parser::ast::{
    ActionSpec, Condition, DelayStrategy, ExecutionPolicy, ExecutionStrategy, Handler, LoopSpec,
    Play, RetryConfig, Serial, Task, Value,
};
use crate::parser::parse_play;
use crate::plugins::{CallbackManager, CallbackPlugin};

type Behavior = dyn Fn(&str, &HostContext, u32) -> Result<ActionResult, ActionError> + Send + Sync;

#[derive(Debug, Clone, PartialEq)]
struct Call {
    host: String,
    id: String,
    item: Option<Value>,
}

/// Records every invocation and the concurrency high-water mark
struct RecordingInvoker {
    behavior: Box<Behavior>,
    delay: Duration,
    slow: HashMap<(String, String), Duration>,
    calls: Mutex<Vec<Call>>,
    /// (host, id, started)
    events: Mutex<Vec<(String, String, bool)>>,
    counts: Mutex<HashMap<(String, String), u32>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingInvoker {
    fn new(
        behavior: impl Fn(&str, &HostContext, u32) -> Result<ActionResult, ActionError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        RecordingInvoker {
            behavior: Box::new(behavior),
            delay: Duration::ZERO,
            slow: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            counts: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn changed() -> Self {
        RecordingInvoker::new(|_, _, _| Ok(ActionResult::changed()))
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn slow(mut self, host: &str, id: &str, delay: Duration) -> Self {
        self.slow.insert((host.to_string(), id.to_string()), delay);
        self
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .iter()
            .map(|c| (c.host.clone(), c.id.clone()))
            .collect()
    }

    fn calls_for(&self, id: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.id == id).count()
    }

    fn position(&self, host: &str, id: &str, started: bool) -> usize {
        self.events
            .lock()
            .iter()
            .position(|(h, i, s)| h == host && i == id && *s == started)
            .unwrap()
    }
}

#[async_trait]
impl ActionInvoker for RecordingInvoker {
    async fn invoke(
        &self,
        action: &ActionSpec,
        host: &HostContext,
    ) -> Result<ActionResult, ActionError> {
        let id = action
            .args
            .get("id")
            .or_else(|| action.args.get("_raw"))
            .and_then(|v| v.as_str())
            .unwrap_or(action.module.as_str())
            .to_string();
        let name = host.host_name().to_string();

        let attempt = {
            let mut counts = self.counts.lock();
            let count = counts.entry((name.clone(), id.clone())).or_insert(0);
            *count += 1;
            *count
        };
        self.calls.lock().push(Call {
            host: name.clone(),
            id: id.clone(),
            item: host.loop_item.clone(),
        });
        self.events.lock().push((name.clone(), id.clone(), true));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = self
            .slow
            .get(&(name.clone(), id.clone()))
            .copied()
            .unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.events.lock().push((name, id.clone(), false));

        (self.behavior)(&id, host, attempt)
    }
}

fn task(id: &str) -> Task {
    Task::new(id, ActionSpec::new("command").with_arg("id", id))
}

fn handler(id: &str) -> Handler {
    Handler::new(task(id))
}

fn cond(src: &str) -> Condition {
    Condition::parse(src).unwrap()
}

fn inventory(n: usize) -> StaticInventory {
    (0..n).map(|i| Host::new(format!("h{}", i))).collect()
}

fn play(tasks: &[&str]) -> Play {
    tasks
        .iter()
        .fold(Play::new("test play").with_hosts("all"), |p, id| p.with_task(task(id)))
}

fn policy(f: impl FnOnce(&mut ExecutionPolicy)) -> ExecutionPolicy {
    let mut policy = ExecutionPolicy::default();
    f(&mut policy);
    policy
}

fn executor(invoker: &Arc<RecordingInvoker>) -> PlayExecutor {
    PlayExecutor::new(invoker.clone())
}

fn record(report: &PlayReport, host: &str, step: StepId) -> Option<TaskResult> {
    report.ledger.get(&LedgerKey::new(host, step, None))
}

#[tokio::test]
async fn test_when_false_never_invokes() {
    let invoker = Arc::new(RecordingInvoker::changed());
    let inv: StaticInventory = vec![
        Host::new("deb1").with_fact("os_family", "Debian"),
        Host::new("rh1").with_fact("os_family", "RedHat"),
        Host::new("deb2").with_fact("os_family", "Debian"),
    ]
    .into_iter()
    .collect();
    let play = Play::new("apt only")
        .with_task(task("apt").with_when(cond("os_family == 'Debian'")));

    let report = executor(&invoker).run(&play, &inv).await.unwrap();

    assert_eq!(invoker.calls_for("apt"), 2);
    assert!(!invoker.calls().contains(&("rh1".to_string(), "apt".to_string())));
    assert_eq!(
        record(&report, "rh1", StepId::Task(0)).map(|r| r.status),
        Some(TaskStatus::Skipped)
    );
    assert!(report.success);
}

#[tokio::test]
async fn test_handler_runs_once_per_window() {
    let invoker = Arc::new(RecordingInvoker::changed());
    let play = Play::new("configure")
        .with_task(task("t0").with_notify("restart"))
        .with_task(task("t1").with_notify("restart"))
        .with_task(task("t2").with_notify("restart"))
        .with_handler(handler("restart"));

    let report = executor(&invoker).run(&play, &inventory(2)).await.unwrap();

    assert_eq!(invoker.calls_for("restart"), 2);
    for host in ["h0", "h1"] {
        let step = StepId::Handler {
            index: 0,
            window: 1,
        };
        assert_eq!(
            record(&report, host, step).map(|r| r.status),
            Some(TaskStatus::Changed)
        );
    }
}

#[tokio::test]
async fn test_handlers_run_in_declaration_order() {
    let invoker = Arc::new(RecordingInvoker::changed());
    let play = Play::new("order")
        .with_task(task("t0").with_notify("second"))
        .with_task(task("t1").with_notify("first"))
        .with_handler(handler("first"))
        .with_handler(handler("second"));

    executor(&invoker).run(&play, &inventory(1)).await.unwrap();

    let ids: Vec<String> = invoker.calls().into_iter().map(|(_, id)| id).collect();
    assert_eq!(ids, vec!["t0", "t1", "first", "second"]);
}

#[tokio::test]
async fn test_notify_only_on_changed() {
    let invoker = Arc::new(RecordingInvoker::new(|id, _, _| {
        if id == "t0" {
            Ok(ActionResult::ok())
        } else {
            Ok(ActionResult::changed())
        }
    }));
    let play = Play::new("unchanged")
        .with_task(task("t0").with_notify("restart"))
        .with_handler(handler("restart"));

    executor(&invoker).run(&play, &inventory(1)).await.unwrap();
    assert_eq!(invoker.calls_for("restart"), 0);
}

#[tokio::test]
async fn test_flush_handlers_opens_new_window() {
    let invoker = Arc::new(RecordingInvoker::changed());
    let play = Play::new("two windows")
        .with_task(task("t0").with_notify("reload"))
        .with_task(Task::flush_handlers("flush now"))
        .with_task(task("t2").with_notify("reload"))
        .with_handler(handler("reload"));

    let report = executor(&invoker).run(&play, &inventory(1)).await.unwrap();

    let ids: Vec<String> = invoker.calls().into_iter().map(|(_, id)| id).collect();
    assert_eq!(ids, vec!["t0", "reload", "t2", "reload"]);
    for window in [1, 2] {
        assert!(record(&report, "h0", StepId::Handler { index: 0, window }).is_some());
    }
    assert_eq!(
        record(&report, "h0", StepId::Task(1)).map(|r| r.status),
        Some(TaskStatus::Ok)
    );
}

#[tokio::test]
async fn test_serial_batches_never_overlap() {
    let invoker = Arc::new(RecordingInvoker::changed().with_delay(Duration::from_millis(5)));
    let play = play(&["t0", "t1"]).with_policy(policy(|p| p.serial = Serial::Count(2)));

    executor(&invoker).run(&play, &inventory(6)).await.unwrap();

    let events = invoker.events.lock().clone();
    let batch_of = |host: &str| host[1..].parse::<usize>().unwrap() / 2;
    for b in 0..2 {
        let last_end = events
            .iter()
            .rposition(|(h, _, started)| !started && batch_of(h) == b)
            .unwrap();
        let next_start = events
            .iter()
            .position(|(h, _, started)| *started && batch_of(h) == b + 1)
            .unwrap();
        assert!(last_end < next_start, "batch {} overlapped batch {}", b, b + 1);
    }
}

#[tokio::test]
async fn test_forks_bound_concurrency() {
    for strategy in [ExecutionStrategy::Linear, ExecutionStrategy::Free] {
        let invoker = Arc::new(RecordingInvoker::changed().with_delay(Duration::from_millis(10)));
        let play = play(&["t0", "t1"]).with_policy(policy(|p| {
            p.forks = 3;
            p.strategy = strategy;
        }));

        executor(&invoker).run(&play, &inventory(10)).await.unwrap();

        assert_eq!(invoker.peak.load(Ordering::SeqCst), 3, "{:?}", strategy);
        assert_eq!(invoker.calls().len(), 20);
    }
}

#[tokio::test]
async fn test_linear_barrier_per_task() {
    let invoker = Arc::new(
        RecordingInvoker::changed().slow("h0", "t0", Duration::from_millis(40)),
    );
    let play = play(&["t0", "t1"]);

    executor(&invoker).run(&play, &inventory(3)).await.unwrap();

    let slow_end = invoker.position("h0", "t0", false);
    for host in ["h0", "h1", "h2"] {
        assert!(invoker.position(host, "t1", true) > slow_end);
    }
}

#[tokio::test]
async fn test_free_strategy_has_no_barrier() {
    let invoker = Arc::new(
        RecordingInvoker::changed().slow("h0", "t0", Duration::from_millis(40)),
    );
    let play =
        play(&["t0", "t1"]).with_policy(policy(|p| p.strategy = ExecutionStrategy::Free));

    let report = executor(&invoker).run(&play, &inventory(3)).await.unwrap();

    assert!(invoker.position("h1", "t1", true) < invoker.position("h0", "t0", false));
    assert_eq!(report.ledger.len(), 6);
}

#[tokio::test]
async fn test_retry_until_attempt_count() {
    let invoker = Arc::new(RecordingInvoker::new(|_, _, attempt| {
        let rc = if attempt < 3 { 1 } else { 0 };
        Ok(ActionResult::ok().with_rc(rc))
    }));
    let play = Play::new("wait").with_task(task("probe").with_retry(RetryConfig {
        attempts: 5,
        delay: DelayStrategy::Fixed(Duration::ZERO),
        until: Some(cond("result.rc == 0")),
        retry_unreachable: false,
    }));

    let report = executor(&invoker).run(&play, &inventory(2)).await.unwrap();

    assert_eq!(invoker.calls_for("probe"), 6);
    let result = record(&report, "h1", StepId::Task(0)).unwrap();
    assert_eq!(result.attempts, 3);
    assert_eq!(result.status, TaskStatus::Ok);
}

#[tokio::test]
async fn test_retries_exhausted_fail_the_host() {
    let invoker = Arc::new(RecordingInvoker::new(|_, _, _| {
        Ok(ActionResult::ok().with_rc(1).with_output("not yet"))
    }));
    let play = Play::new("wait")
        .with_task(task("probe").with_retry(RetryConfig {
            attempts: 2,
            delay: DelayStrategy::Fixed(Duration::ZERO),
            until: Some(cond("result.rc == 0")),
            retry_unreachable: false,
        }))
        .with_task(task("after"));

    let report = executor(&invoker).run(&play, &inventory(1)).await.unwrap();

    let result = record(&report, "h0", StepId::Task(0)).unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.output, "not yet");
    assert_eq!(invoker.calls_for("after"), 0);
    assert!(!report.success);
}

#[tokio::test]
async fn test_any_errors_fatal_halts_all_hosts() {
    let invoker = Arc::new(RecordingInvoker::new(|id, host, _| {
        if id == "t1" && host.host_name() == "h2" {
            Ok(ActionResult::failed("boom"))
        } else {
            Ok(ActionResult::changed())
        }
    }));
    let play = play(&["t0", "t1", "t2"]).with_policy(policy(|p| p.any_errors_fatal = true));

    let report = executor(&invoker).run(&play, &inventory(5)).await.unwrap();

    assert_eq!(
        report.abort_reason,
        Some(AbortReason::AnyErrorsFatal {
            host: "h2".to_string()
        })
    );
    assert_eq!(invoker.calls_for("t2"), 0);
    for i in 0..5 {
        let host = format!("h{}", i);
        assert_eq!(
            record(&report, &host, StepId::Task(0)).map(|r| r.status),
            Some(TaskStatus::Changed)
        );
        assert!(!report.ledger.has_task(&host, 2));
    }
    assert_eq!(report.host_states["h2"], HostState::Excluded);
    assert_eq!(report.unfinished_hosts, vec!["h0", "h1", "h3", "h4"]);

    // tasks that never started are recorded as skipped, completed ones untouched
    for host in ["h0", "h1", "h3", "h4"] {
        let skipped = record(&report, host, StepId::Task(2)).unwrap();
        assert_eq!(skipped.status, TaskStatus::Skipped);
        assert!(skipped.aborted);
        assert_eq!(skipped.msg.as_deref(), Some("play aborted"));
        assert!(report.recap.hosts[host].skipped >= 1);
    }
    assert!(record(&report, "h2", StepId::Task(2)).is_none());
    assert!(!report.success);
    assert!(report.recap.has_failures());
}

#[tokio::test]
async fn test_max_fail_percentage_across_batches() {
    let invoker = Arc::new(RecordingInvoker::new(|id, host, _| {
        match (id, host.host_name()) {
            ("t0", "h0" | "h1" | "h2" | "h5") => Ok(ActionResult::failed("exit 1")),
            _ => Ok(ActionResult::changed()),
        }
    }));
    let play = play(&["t0", "t1", "t2"]).with_policy(policy(|p| {
        p.serial = Serial::Count(5);
        p.forks = 2;
        p.max_fail_percentage = 30;
    }));

    let report = executor(&invoker).run(&play, &inventory(10)).await.unwrap();

    // three failures in batch 1 are exactly 30%: batch 1 finishes
    for host in ["h3", "h4"] {
        for index in 0..3 {
            assert!(report.ledger.has_task(host, index), "{} task {}", host, index);
        }
    }
    // the fourth failure aborts batch 2
    assert_eq!(
        report.abort_reason,
        Some(AbortReason::MaxFailPercentage {
            failed: 4,
            total: 10,
            limit: 30
        })
    );
    for i in 5..10 {
        let host = format!("h{}", i);
        assert!(!report.ledger.has_task(&host, 1));
        assert!(!report.ledger.has_task(&host, 2));
    }
    for i in 6..10 {
        let host = format!("h{}", i);
        let skipped = record(&report, &host, StepId::Task(2)).unwrap();
        assert!(skipped.aborted);
    }
    assert_eq!(report.failed_hosts(), vec!["h0", "h1", "h2", "h5"]);
    assert!(!report.success);
}

#[tokio::test]
async fn test_ignored_failures_count_toward_max_fail_percentage() {
    let invoker = Arc::new(RecordingInvoker::new(|id, host, _| {
        match (id, host.host_name()) {
            ("t0", "h0" | "h1") => Ok(ActionResult::failed("exit 1")),
            _ => Ok(ActionResult::ok()),
        }
    }));
    let play = Play::new("tolerant but bounded")
        .with_task(task("t0").with_ignore_errors(true))
        .with_task(task("t1"))
        .with_policy(policy(|p| p.max_fail_percentage = 25));

    let report = executor(&invoker).run(&play, &inventory(4)).await.unwrap();

    // 2 of 4 is above 25% even though both failures were ignored
    assert_eq!(
        report.abort_reason,
        Some(AbortReason::MaxFailPercentage {
            failed: 2,
            total: 4,
            limit: 25
        })
    );
    assert_eq!(invoker.calls_for("t1"), 0);
    assert_eq!(report.host_states["h0"], HostState::Active);
    assert!(record(&report, "h0", StepId::Task(0)).unwrap().ignored);
    assert!(record(&report, "h3", StepId::Task(1)).unwrap().aborted);
    assert!(!report.success);
}

#[tokio::test]
async fn test_in_flight_invocation_finishes_after_abort() {
    let invoker = Arc::new(
        RecordingInvoker::new(|id, host, _| match (id, host.host_name()) {
            ("t0", "h1") => Ok(ActionResult::failed("fatal")),
            _ => Ok(ActionResult::changed()),
        })
        .slow("h0", "t0", Duration::from_millis(50)),
    );
    let play = play(&["t0", "t1"]).with_policy(policy(|p| p.any_errors_fatal = true));

    let report = executor(&invoker).run(&play, &inventory(3)).await.unwrap();

    assert_eq!(
        report.abort_reason,
        Some(AbortReason::AnyErrorsFatal {
            host: "h1".to_string()
        })
    );
    // h0 was mid-invocation when h1 failed; its result still lands
    assert!(invoker.position("h0", "t0", false) > invoker.position("h1", "t0", false));
    let finished = record(&report, "h0", StepId::Task(0)).unwrap();
    assert_eq!(finished.status, TaskStatus::Changed);
    assert!(!finished.aborted);
    assert_eq!(invoker.calls_for("t1"), 0);
    assert!(record(&report, "h0", StepId::Task(1)).unwrap().aborted);
}

#[tokio::test]
async fn test_failed_when_on_output() {
    let invoker = Arc::new(RecordingInvoker::new(|_, _, _| {
        Ok(ActionResult::ok().with_output("line one\nERROR: disk full"))
    }));
    let play = Play::new("check")
        .with_task(task("check").with_failed_when(cond("'ERROR' in output")));

    let report = executor(&invoker).run(&play, &inventory(1)).await.unwrap();

    let result = record(&report, "h0", StepId::Task(0)).unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.failure, Some(FailureKind::ActionFailure));
    assert_eq!(report.host_states["h0"], HostState::Excluded);
}

#[tokio::test]
async fn test_ignore_errors_keeps_host_running() {
    let invoker = Arc::new(RecordingInvoker::new(|id, _, _| {
        if id == "t0" {
            Err(ActionError::Failed("module crashed".to_string()))
        } else {
            Ok(ActionResult::ok())
        }
    }));
    let play = Play::new("tolerant")
        .with_task(task("t0").with_ignore_errors(true))
        .with_task(task("t1"));

    let report = executor(&invoker).run(&play, &inventory(2)).await.unwrap();

    let result = record(&report, "h0", StepId::Task(0)).unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert!(result.ignored);
    assert_eq!(invoker.calls_for("t1"), 2);
    assert_eq!(report.recap.hosts["h0"].ignored, 1);
    assert!(report.success);
}

#[tokio::test]
async fn test_unreachable_host_is_removed() {
    let invoker = Arc::new(RecordingInvoker::new(|_, host, _| {
        if host.host_name() == "h1" {
            Err(ActionError::Unreachable("connection timed out".to_string()))
        } else {
            Ok(ActionResult::ok())
        }
    }));
    let play = play(&["t0", "t1"]);

    let report = executor(&invoker).run(&play, &inventory(3)).await.unwrap();

    assert_eq!(report.host_states["h1"], HostState::Unreachable);
    assert_eq!(
        record(&report, "h1", StepId::Task(0)).map(|r| r.status),
        Some(TaskStatus::Unreachable)
    );
    assert_eq!(invoker.calls_for("t1"), 2);
    assert_eq!(report.recap.hosts["h1"].unreachable, 1);
    assert!(!report.success);
}

#[tokio::test]
async fn test_loop_items_run_in_sequence_and_register() {
    let invoker = Arc::new(RecordingInvoker::new(|_, host, _| {
        if host.loop_item == Some(Value::from("b")) {
            Ok(ActionResult::failed("no such package"))
        } else {
            Ok(ActionResult::changed())
        }
    }));
    let items = vec![Value::from("a"), Value::from("b"), Value::from("c")];
    let play = Play::new("packages")
        .with_task(
            task("install")
                .with_loop(LoopSpec::Items(items.clone()))
                .with_register("pkgs")
                .with_ignore_errors(true),
        )
        .with_task(task("report").with_when(cond("pkgs.failed and len(pkgs.results) == 3")))
        .with_task(
            task("odd")
                .with_loop(LoopSpec::Items(vec![
                    Value::Int(1),
                    Value::Int(2),
                    Value::Int(3),
                ]))
                .with_when(cond("item != 2")),
        );

    let report = executor(&invoker).run(&play, &inventory(1)).await.unwrap();

    let seen: Vec<Option<Value>> = invoker
        .calls
        .lock()
        .iter()
        .filter(|c| c.id == "install")
        .map(|c| c.item.clone())
        .collect();
    assert_eq!(seen, items.into_iter().map(Some).collect::<Vec<_>>());

    let statuses: Vec<TaskStatus> = (0..3)
        .map(|i| {
            report
                .ledger
                .get(&LedgerKey::new("h0", StepId::Task(0), Some(i)))
                .unwrap()
                .status
        })
        .collect();
    assert_eq!(
        statuses,
        vec![TaskStatus::Changed, TaskStatus::Failed, TaskStatus::Changed]
    );
    assert_eq!(invoker.calls_for("report"), 1);
    assert_eq!(invoker.calls_for("odd"), 2);
    assert_eq!(
        report
            .ledger
            .get(&LedgerKey::new("h0", StepId::Task(2), Some(1)))
            .map(|r| r.status),
        Some(TaskStatus::Skipped)
    );
}

#[tokio::test]
async fn test_registered_result_feeds_later_when() {
    let invoker = Arc::new(RecordingInvoker::new(|id, _, _| match id {
        "version" => Ok(ActionResult::ok().with_output("nginx version 1.24")),
        _ => Ok(ActionResult::changed()),
    }));
    let play = Play::new("upgrade")
        .with_task(task("version").with_register("ver"))
        .with_task(task("upgrade").with_when(cond("'1.22' in ver.stdout")))
        .with_task(task("reload").with_when(cond("'1.24' in ver.stdout")));

    executor(&invoker).run(&play, &inventory(1)).await.unwrap();

    assert_eq!(invoker.calls_for("upgrade"), 0);
    assert_eq!(invoker.calls_for("reload"), 1);
}

#[tokio::test]
async fn test_force_handlers_for_failed_host() {
    let behavior = |id: &str, host: &HostContext, _: u32| {
        if id == "t1" && host.host_name() == "h0" {
            Ok(ActionResult::failed("broken"))
        } else {
            Ok(ActionResult::changed())
        }
    };
    let base = Play::new("handlers")
        .with_task(task("t0").with_notify("restart"))
        .with_task(task("t1"))
        .with_handler(handler("restart"));

    let invoker = Arc::new(RecordingInvoker::new(behavior));
    executor(&invoker).run(&base, &inventory(2)).await.unwrap();
    assert_eq!(
        invoker.calls().into_iter().filter(|(_, id)| id == "restart").collect::<Vec<_>>(),
        vec![("h1".to_string(), "restart".to_string())]
    );

    let forced = base.with_policy(policy(|p| p.force_handlers = true));
    let invoker = Arc::new(RecordingInvoker::new(behavior));
    executor(&invoker).run(&forced, &inventory(2)).await.unwrap();
    assert_eq!(invoker.calls_for("restart"), 2);
}

#[tokio::test]
async fn test_external_abort_before_start() {
    let invoker = Arc::new(RecordingInvoker::changed());
    let exec = executor(&invoker);
    exec.abort_handle().abort();

    let report = exec.run(&play(&["t0"]), &inventory(2)).await.unwrap();

    assert!(invoker.calls().is_empty());
    assert_eq!(report.abort_reason, Some(AbortReason::External));
    assert_eq!(report.unfinished_hosts, vec!["h0", "h1"]);
    assert!(!report.success);
}

#[tokio::test]
async fn test_resume_replays_nothing_already_done() {
    let fixed = Arc::new(AtomicBool::new(false));
    let flag = fixed.clone();
    let invoker = Arc::new(RecordingInvoker::new(move |id, host, _| {
        if id == "t1" && host.host_name() == "h1" && !flag.load(Ordering::SeqCst) {
            Ok(ActionResult::failed("disk full"))
        } else {
            Ok(ActionResult::ok())
        }
    }));
    let play = play(&["t0", "t1", "t2"]);
    let exec = executor(&invoker);

    let first = exec.run(&play, &inventory(2)).await.unwrap();
    assert!(!first.success);
    assert_eq!(first.checkpoint.excluded_hosts, vec!["h1"]);
    assert_eq!(first.checkpoint.last_completed_task_index, Some(2));

    fixed.store(true, Ordering::SeqCst);
    invoker.calls.lock().clear();

    let options = first.checkpoint.retry_options().with_prior(first.ledger.clone());
    let second = exec.resume(&play, &inventory(2), options).await.unwrap();

    assert_eq!(
        invoker.calls(),
        vec![
            ("h1".to_string(), "t1".to_string()),
            ("h1".to_string(), "t2".to_string())
        ]
    );
    assert!(second.success);
    assert!(second.ledger.has_task("h1", 0));
    assert_eq!(second.recap.hosts.len(), 1);
}

#[tokio::test]
async fn test_resumed_notify_runs_handler_again() {
    let fixed = Arc::new(AtomicBool::new(false));
    let flag = fixed.clone();
    let invoker = Arc::new(RecordingInvoker::new(move |id, _, _| {
        if id == "t2" && !flag.load(Ordering::SeqCst) {
            Ok(ActionResult::failed("package locked"))
        } else {
            Ok(ActionResult::changed())
        }
    }));
    let play = Play::new("reloads")
        .with_task(task("t0").with_notify("reload"))
        .with_task(Task::flush_handlers("flush"))
        .with_task(task("t2").with_notify("reload"))
        .with_handler(handler("reload"));
    let exec = executor(&invoker);

    let first = exec.run(&play, &inventory(1)).await.unwrap();
    assert_eq!(invoker.calls_for("reload"), 1);
    assert!(!first.success);

    fixed.store(true, Ordering::SeqCst);
    invoker.calls.lock().clear();

    let options = first.checkpoint.retry_options().with_prior(first.ledger.clone());
    let second = exec.resume(&play, &inventory(1), options).await.unwrap();

    let ids: Vec<String> = invoker.calls().into_iter().map(|(_, id)| id).collect();
    assert_eq!(ids, vec!["t2", "reload"]);
    assert!(record(&second, "h0", StepId::Handler { index: 0, window: 1 }).is_some());
    assert_eq!(
        record(&second, "h0", StepId::Handler { index: 0, window: 2 }).map(|r| r.status),
        Some(TaskStatus::Changed)
    );
    assert!(second.success);
}

#[tokio::test]
async fn test_start_at_task_and_limit() {
    let invoker = Arc::new(RecordingInvoker::changed());
    let play = play(&["t0", "t1", "t2"]);
    let exec = executor(&invoker);

    let options = ResumeOptions::new()
        .with_start_at_task("t1")
        .with_limit(vec!["h2".to_string()]);
    let report = exec.resume(&play, &inventory(3), options).await.unwrap();

    assert_eq!(
        invoker.calls(),
        vec![
            ("h2".to_string(), "t1".to_string()),
            ("h2".to_string(), "t2".to_string())
        ]
    );
    assert_eq!(report.checkpoint.last_completed_task_index, Some(2));

    let bad = ResumeOptions::new().with_start_at_task("nope");
    let err = exec.resume(&play, &inventory(3), bad).await.unwrap_err();
    assert!(matches!(err, ConductorError::Config { ref field, .. } if field == "start_at"));

    let empty = ResumeOptions::new().with_limit(vec!["db9".to_string()]);
    let err = exec.resume(&play, &inventory(3), empty).await.unwrap_err();
    assert!(matches!(err, ConductorError::Inventory { .. }));
}

#[tokio::test]
async fn test_checkpoint_saved_on_failure_removed_on_success() {
    let dir = TempDir::new().unwrap();
    let failing = Arc::new(AtomicBool::new(true));
    let flag = failing.clone();
    let invoker = Arc::new(RecordingInvoker::new(move |_, _, _| {
        if flag.load(Ordering::SeqCst) {
            Ok(ActionResult::failed("boom"))
        } else {
            Ok(ActionResult::ok())
        }
    }));
    let exec = executor(&invoker).with_config(ExecutorConfig {
        checkpoint_dir: Some(dir.path().to_path_buf()),
    });
    let play = play(&["t0"]);

    let report = exec.run(&play, &inventory(1)).await.unwrap();
    let path = report.checkpoint_path.clone().unwrap();
    let saved = CheckpointManager::with_dir(dir.path()).unwrap().load(&path).unwrap();
    assert_eq!(saved, report.checkpoint);
    assert!(saved.verify(&play).is_ok());

    failing.store(false, Ordering::SeqCst);
    let report = exec.run(&play, &inventory(1)).await.unwrap();
    assert!(report.success);
    assert!(report.checkpoint_path.is_none());
    assert!(!path.exists());
}

#[derive(Default)]
struct Counting {
    plays: AtomicUsize,
    batches: AtomicUsize,
    results: AtomicUsize,
    handlers: AtomicUsize,
    completed: AtomicBool,
}

#[async_trait]
impl CallbackPlugin for Arc<Counting> {
    fn name(&self) -> &str {
        "counting"
    }

    async fn on_play_start(&self, _play: &str, _hosts: &[String]) {
        self.plays.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_batch_start(&self, _batch: usize, _hosts: &[String]) {
        self.batches.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_task_result(&self, _result: &TaskResult) {
        self.results.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_handler_start(&self, _host: &str, _handler: &str) {
        self.handlers.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_play_complete(&self, report: &PlayReport) {
        self.completed.store(report.success, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_callbacks_fire() {
    let counting = Arc::new(Counting::default());
    let callbacks = CallbackManager::new().with_plugin(Box::new(counting.clone()));
    let invoker = Arc::new(RecordingInvoker::changed());
    let play = Play::new("observed")
        .with_task(task("t0").with_notify("restart"))
        .with_handler(handler("restart"))
        .with_policy(policy(|p| p.serial = Serial::Count(2)));

    let report = executor(&invoker)
        .with_callbacks(Arc::new(callbacks))
        .run(&play, &inventory(3))
        .await
        .unwrap();

    assert_eq!(counting.plays.load(Ordering::SeqCst), 1);
    assert_eq!(counting.batches.load(Ordering::SeqCst), 2);
    assert_eq!(counting.handlers.load(Ordering::SeqCst), 3);
    assert_eq!(counting.results.load(Ordering::SeqCst), report.ledger.len());
    assert!(counting.completed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_yaml_play_end_to_end() {
    let yaml = r#"
name: rolling restart
hosts: web
serial: 1
forks: 2
vars:
  target_version: "2.0"
tasks:
  - name: fetch version
    command: version
    register: current
  - name: upgrade
    command: upgrade
    when: "current.stdout != target_version"
    notify: restart app
handlers:
  - name: restart app
    service: restart
"#;
    let play = parse_play(yaml, "rolling.yml").unwrap();
    let inv: StaticInventory = vec![
        Host::new("web1").with_group("web"),
        Host::new("web2").with_group("web"),
        Host::new("db1").with_group("db"),
    ]
    .into_iter()
    .collect();
    let invoker = Arc::new(RecordingInvoker::new(|id, host, _| match (id, host.host_name()) {
        ("version", "web1") => Ok(ActionResult::ok().with_output("2.0")),
        ("version", _) => Ok(ActionResult::ok().with_output("1.9")),
        _ => Ok(ActionResult::changed()),
    }));

    let report = executor(&invoker).run(&play, &inv).await.unwrap();

    assert_eq!(
        invoker.calls(),
        vec![
            ("web1".to_string(), "version".to_string()),
            ("web2".to_string(), "version".to_string()),
            ("web2".to_string(), "upgrade".to_string()),
            ("web2".to_string(), "restart".to_string()),
        ]
    );
    assert_eq!(report.recap.hosts.len(), 2);
    assert!(report.success);
}
