//! Parent-side dispatcher: owns the worker pool, assigns test groups,
//! recovers from worker crashes, and enforces the run's stop conditions.
//!
//! The dispatcher is a single-threaded, cooperative event loop (§5): one
//! `tokio::select!` multiplexes worker messages, the global deadline timer,
//! and `SIGINT`. No dispatcher state is shared across tasks — each worker's
//! framed stdout is decoded by its own lightweight reader task and forwarded
//! as a tagged event, which is the only concession to "one loop" a
//! multi-child-process design needs.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;

use crate::config::RunConfig;
use crate::model::{TestId, TestResult, TestStatus, Variant};
use crate::protocol::{GroupAssignment, ParentMessage, TestEndResult, WorkerMessage};
use crate::report::Reporter;

/// Errors from spawning or supervising the worker pool.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A worker-assignable unit of work: tests sharing `(file, variant)`.
#[derive(Debug, Clone)]
pub struct TestGroupSpec {
    pub group_id: u64,
    pub file: std::path::PathBuf,
    pub variant: Variant,
    pub test_ids: Vec<TestId>,
    pub repeat_index: u32,
    pub retry_index: u32,
}

impl From<TestGroupSpec> for GroupAssignment {
    fn from(g: TestGroupSpec) -> Self {
        GroupAssignment {
            group_id: g.group_id,
            file: g.file,
            variant: g.variant,
            test_ids: g.test_ids,
            repeat_index: g.repeat_index,
            retry_index: g.retry_index,
        }
    }
}

/// Why the run stopped pulling from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    QueueDrained,
    MaxFailures,
    Sigint,
    GlobalTimeout,
}

/// Final disposition of a run.
pub struct DispatchOutcome {
    pub results: HashMap<TestId, TestResult>,
    pub flaky: std::collections::HashSet<TestId>,
    pub stop_reason: StopReason,
}

impl DispatchOutcome {
    /// Whether the run should be considered green, given each test's
    /// `expectedToFail` flag.
    pub fn passed(&self, expected_to_fail: impl Fn(TestId) -> bool) -> bool {
        if !matches!(self.stop_reason, StopReason::QueueDrained) {
            return false;
        }
        self.results.iter().all(|(id, r)| match r.status {
            TestStatus::Passed => !expected_to_fail(*id),
            TestStatus::Skipped => true,
            TestStatus::Failed => expected_to_fail(*id),
            TestStatus::TimedOut => false,
        })
    }
}

struct WorkerHandle {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    /// The group currently assigned to this worker, kept in full (not just
    /// its id) so a crash mid-group can split off the tests after
    /// `last_test_seen` into a fresh group instead of losing them.
    assigned: Option<TestGroupSpec>,
    last_test_seen: Option<TestId>,
}

enum Event {
    Worker { worker: usize, message: WorkerMessage },
    WorkerGone { worker: usize },
}

/// Spawns a fresh worker process running this binary in worker mode, sends
/// its one-time `init`, and starts a reader task that decodes its framed
/// stdout.
async fn spawn_worker(
    id: usize,
    config: &RunConfig,
    tx: mpsc::UnboundedSender<Event>,
) -> Result<WorkerHandle, DispatchError> {
    let exe = std::env::current_exe().map_err(DispatchError::Spawn)?;
    let mut command = tokio::process::Command::new(exe);
    command
        .arg("--worker-mode")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    for (k, v) in &config.env {
        command.env(k, v);
    }

    let mut child = command.spawn().map_err(DispatchError::Spawn)?;
    let mut stdin = BufWriter::new(child.stdin.take().expect("stdin piped"));
    let stdout = child.stdout.take().expect("stdout piped");

    let config_snapshot = serde_json::to_value(config).unwrap_or(serde_json::Value::Null);
    let init = ParentMessage::Init {
        worker_index: id,
        config_snapshot,
        variant: Variant::default(),
    };
    if let Err(e) = crate::protocol::write_message(&mut stdin, &init).await {
        tracing::warn!(worker = id, error = %e, "failed to send init message to worker");
    }

    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        loop {
            match crate::protocol::read_message::<_, WorkerMessage>(&mut reader).await {
                Ok(Some(message)) => {
                    if tx.send(Event::Worker { worker: id, message }).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = tx.send(Event::WorkerGone { worker: id });
                    break;
                }
                Err(e) => {
                    tracing::warn!(worker = id, error = %e, "worker protocol decode error, treating as crash");
                    let _ = tx.send(Event::WorkerGone { worker: id });
                    break;
                }
            }
        }
    });

    Ok(WorkerHandle {
        child,
        stdin,
        assigned: None,
        last_test_seen: None,
    })
}

struct DispatchState {
    workers: HashMap<usize, WorkerHandle>,
    idle: VecDeque<usize>,
    next_worker_id: usize,
    queue: VecDeque<TestGroupSpec>,
    results: HashMap<TestId, TestResult>,
    flaky: std::collections::HashSet<TestId>,
    retry_counts: HashMap<TestId, u32>,
    failure_count: u32,
    retries: u32,
}

/// Runs the dispatch loop to completion against `queue`, reporting progress
/// through `reporter`.
///
/// # Errors
/// [`DispatchError::Spawn`] if the worker pool cannot be populated at all.
pub async fn run(
    config: &RunConfig,
    queue: VecDeque<TestGroupSpec>,
    retries: u32,
    reporter: &dyn Reporter,
) -> Result<DispatchOutcome, DispatchError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let pool_cap = config.workers.max(1);

    let mut state = DispatchState {
        workers: HashMap::new(),
        idle: VecDeque::new(),
        next_worker_id: 0,
        queue,
        results: HashMap::new(),
        flaky: std::collections::HashSet::new(),
        retry_counts: HashMap::new(),
        failure_count: 0,
        retries,
    };

    for _ in 0..pool_cap {
        let handle = spawn_worker(state.next_worker_id, config, tx.clone()).await?;
        state.workers.insert(state.next_worker_id, handle);
        state.next_worker_id += 1;
    }

    let started = Instant::now();
    let global_deadline =
        (config.global_timeout_ms > 0).then(|| Duration::from_millis(config.global_timeout_ms));

    let sigint = tokio::signal::ctrl_c();
    tokio::pin!(sigint);
    let mut sigint_fired = false;

    let stop_reason = loop {
        if state.queue.is_empty() && state.workers.values().all(|w| w.assigned.is_none()) {
            break StopReason::QueueDrained;
        }
        if let Some(max) = config.max_failures {
            if state.failure_count >= max {
                break StopReason::MaxFailures;
            }
        }

        dispatch_idle_workers(&mut state).await;

        let timeout_fut = async {
            match global_deadline {
                Some(deadline) => {
                    let elapsed = started.elapsed();
                    if elapsed >= deadline {
                        std::future::pending::<()>().await;
                    } else {
                        tokio::time::sleep(deadline - elapsed).await;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = &mut sigint, if !sigint_fired => {
                sigint_fired = true;
                break StopReason::Sigint;
            }
            _ = timeout_fut => {
                break StopReason::GlobalTimeout;
            }
            event = rx.recv() => {
                match event {
                    Some(Event::Worker { worker, message }) => {
                        handle_worker_message(worker, message, &mut state, reporter).await;
                    }
                    Some(Event::WorkerGone { worker }) => {
                        handle_worker_crash(worker, &mut state);
                        if state.workers.len() < pool_cap {
                            if let Ok(fresh) = spawn_worker(state.next_worker_id, config, tx.clone()).await {
                                state.workers.insert(state.next_worker_id, fresh);
                                state.next_worker_id += 1;
                            }
                        }
                    }
                    None => break StopReason::QueueDrained,
                }
            }
        }
    };

    for handle in state.workers.values_mut() {
        let _ = crate::protocol::write_message(&mut handle.stdin, &ParentMessage::Stop).await;
        let _ = handle.stdin.shutdown().await;
    }

    // A second SIGINT hard-kills the drain instead of waiting for workers to
    // finish their cooperative shutdown (§5: "a second within 1s hard-kills").
    let drain = async {
        for handle in state.workers.values_mut() {
            let _ = handle.child.wait().await;
        }
    };
    if sigint_fired {
        tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                for handle in state.workers.values_mut() {
                    let _ = handle.child.start_kill();
                }
            }
            _ = drain => {}
        }
    } else {
        drain.await;
    }

    Ok(DispatchOutcome {
        results: state.results,
        flaky: state.flaky,
        stop_reason,
    })
}

async fn dispatch_idle_workers(state: &mut DispatchState) {
    while let Some(worker_id) = state.idle.pop_front() {
        let Some(group) = state.queue.pop_front() else {
            state.idle.push_front(worker_id);
            break;
        };
        let handle = state.workers.get_mut(&worker_id).expect("worker exists");
        handle.assigned = Some(group.clone());
        let assignment: GroupAssignment = group.into();
        if let Err(e) =
            crate::protocol::write_message(&mut handle.stdin, &ParentMessage::Run { group: assignment }).await
        {
            tracing::warn!(worker = worker_id, error = %e, "failed to send run message");
        }
    }
}

async fn handle_worker_message(
    worker: usize,
    message: WorkerMessage,
    state: &mut DispatchState,
    reporter: &dyn Reporter,
) {
    match message {
        WorkerMessage::Ready => {
            state.idle.push_back(worker);
        }
        WorkerMessage::TestBegin { test_id, .. } => {
            if let Some(handle) = state.workers.get_mut(&worker) {
                handle.last_test_seen = Some(test_id);
            }
            reporter.on_test_begin(test_id).await;
        }
        WorkerMessage::Stdout { test_id, text } => {
            reporter.on_stdout(test_id, &text).await;
        }
        WorkerMessage::Stderr { test_id, text } => {
            reporter.on_stderr(test_id, &text).await;
        }
        WorkerMessage::TestEnd { test_id, result } => {
            record_attempt(test_id, result, state, reporter).await;
        }
        WorkerMessage::Done { .. } => {
            if let Some(handle) = state.workers.get_mut(&worker) {
                handle.assigned = None;
                handle.last_test_seen = None;
            }
            state.idle.push_back(worker);
        }
        WorkerMessage::FatalError { message } => {
            tracing::error!(worker, %message, "worker reported fatal error");
            if let Some(handle) = state.workers.get_mut(&worker) {
                if let Some(test_id) = handle.last_test_seen.take() {
                    state.failure_count += 1;
                    state.results.insert(
                        test_id,
                        TestResult::new(TestStatus::Failed, Duration::ZERO).with_error(message, None),
                    );
                }
                handle.assigned = None;
            }
        }
    }
}

async fn record_attempt(
    test_id: TestId,
    result: TestEndResult,
    state: &mut DispatchState,
    reporter: &dyn Reporter,
) {
    let mut test_result = TestResult::new(result.status, result.duration);
    test_result.error = result.error;
    test_result.data = result.data;

    let needs_retry = matches!(result.status, TestStatus::Failed | TestStatus::TimedOut);
    let attempt = *state.retry_counts.get(&test_id).unwrap_or(&0);

    reporter.on_test_end(test_id, &test_result).await;

    if needs_retry && attempt < state.retries {
        state.retry_counts.insert(test_id, attempt + 1);
        state.queue.push_back(TestGroupSpec {
            group_id: retry_group_id(test_id, attempt + 1),
            file: std::path::PathBuf::new(),
            variant: Variant::default(),
            test_ids: vec![test_id],
            repeat_index: 0,
            retry_index: attempt + 1,
        });
        return;
    }

    if needs_retry {
        state.failure_count += 1;
    } else if attempt > 0 && result.status == TestStatus::Passed {
        state.flaky.insert(test_id);
    }

    state.results.insert(test_id, test_result);
}

/// Retry groups get ids outside the normal `(file, variant)` group-id space
/// so they never collide with an originally generated group.
fn retry_group_id(test_id: TestId, retry_index: u32) -> u64 {
    u64::MAX - (test_id.wrapping_mul(1000) + retry_index as u64)
}

/// Marks the in-flight test (if any) failed, then splits whatever remained
/// unexecuted in the crashed worker's group into a fresh group and
/// re-enqueues it so the run still covers every test (§4.3).
fn handle_worker_crash(worker: usize, state: &mut DispatchState) {
    state.idle.retain(|&w| w != worker);
    let Some(handle) = state.workers.remove(&worker) else {
        return;
    };

    let Some(group) = handle.assigned else {
        return;
    };

    recover_crashed_group(group, handle.last_test_seen, state);
}

/// Pure recovery logic, split out from [`handle_worker_crash`] so it can be
/// exercised without constructing a real [`WorkerHandle`].
fn recover_crashed_group(
    group: TestGroupSpec,
    last_test_seen: Option<TestId>,
    state: &mut DispatchState,
) {
    let remaining: Vec<TestId> = match last_test_seen {
        Some(test_id) => {
            state.failure_count += 1;
            state.results.insert(
                test_id,
                TestResult::new(TestStatus::Failed, Duration::ZERO)
                    .with_error("worker crashed before reporting a result for this test", None),
            );
            let from = group
                .test_ids
                .iter()
                .position(|&t| t == test_id)
                .map(|i| i + 1)
                .unwrap_or(0);
            group.test_ids[from..].to_vec()
        }
        None => group.test_ids.clone(),
    };

    if remaining.is_empty() {
        return;
    }

    state.queue.push_front(TestGroupSpec {
        group_id: recovery_group_id(group.group_id, remaining[0]),
        file: group.file,
        variant: group.variant,
        test_ids: remaining,
        repeat_index: group.repeat_index,
        retry_index: group.retry_index,
    });
}

/// Recovery groups get ids outside the normal `(file, variant)` group-id
/// space, distinct from retry group ids, so they never collide with an
/// originally generated group.
fn recovery_group_id(original_group_id: u64, first_test_id: TestId) -> u64 {
    (u64::MAX / 2) - (original_group_id.wrapping_mul(1_000_003) + first_test_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_outcome_passed_respects_expected_to_fail() {
        let mut results = HashMap::new();
        results.insert(1, TestResult::new(TestStatus::Failed, Duration::ZERO));
        let outcome = DispatchOutcome {
            results,
            flaky: Default::default(),
            stop_reason: StopReason::QueueDrained,
        };
        assert!(outcome.passed(|_| true));
        assert!(!outcome.passed(|_| false));
    }

    #[test]
    fn dispatch_outcome_fails_on_timeout_regardless_of_expected_to_fail() {
        let mut results = HashMap::new();
        results.insert(1, TestResult::new(TestStatus::TimedOut, Duration::ZERO));
        let outcome = DispatchOutcome {
            results,
            flaky: Default::default(),
            stop_reason: StopReason::QueueDrained,
        };
        assert!(!outcome.passed(|_| true));
    }

    #[test]
    fn dispatch_outcome_fails_when_stopped_early() {
        let outcome = DispatchOutcome {
            results: HashMap::new(),
            flaky: Default::default(),
            stop_reason: StopReason::MaxFailures,
        };
        assert!(!outcome.passed(|_| false));
    }

    fn empty_state() -> DispatchState {
        DispatchState {
            workers: HashMap::new(),
            idle: VecDeque::new(),
            next_worker_id: 0,
            queue: VecDeque::new(),
            results: HashMap::new(),
            flaky: Default::default(),
            retry_counts: HashMap::new(),
            failure_count: 0,
            retries: 0,
        }
    }

    #[test]
    fn crash_marks_in_flight_test_failed_and_requeues_the_rest() {
        let mut state = empty_state();
        let group = TestGroupSpec {
            group_id: 1,
            file: "a.test.js".into(),
            variant: Variant::default(),
            test_ids: vec![10, 11, 12],
            repeat_index: 0,
            retry_index: 0,
        };

        recover_crashed_group(group, Some(10), &mut state);

        assert_eq!(state.failure_count, 1);
        assert_eq!(state.results[&10].status, TestStatus::Failed);
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.queue[0].test_ids, vec![11, 12]);
    }

    #[test]
    fn crash_with_no_in_flight_test_requeues_the_whole_group() {
        let mut state = empty_state();
        let group = TestGroupSpec {
            group_id: 1,
            file: "a.test.js".into(),
            variant: Variant::default(),
            test_ids: vec![10, 11],
            repeat_index: 0,
            retry_index: 0,
        };

        recover_crashed_group(group, None, &mut state);

        assert_eq!(state.failure_count, 0);
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.queue[0].test_ids, vec![10, 11]);
    }

    #[test]
    fn crash_on_last_test_of_group_requeues_nothing() {
        let mut state = empty_state();
        let group = TestGroupSpec {
            group_id: 1,
            file: "a.test.js".into(),
            variant: Variant::default(),
            test_ids: vec![10],
            repeat_index: 0,
            retry_index: 0,
        };

        recover_crashed_group(group, Some(10), &mut state);

        assert_eq!(state.failure_count, 1);
        assert!(state.queue.is_empty());
    }
}
