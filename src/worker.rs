//! The worker-side test executor: hook ordering, per-test timeout
//! supervision, and status derivation for one assigned test group.
//!
//! A worker processes its group's tests sequentially (§4.5). Parallelism is
//! strictly inter-worker; within one worker, execution is single-threaded
//! and cooperative, so cancellation is only observed at suspension points —
//! every `.await` inside a hook or test body.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::model::{SpecTree, SuiteId, TestError, TestId, TestResult, TestStatus};
use crate::protocol::{GroupAssignment, TestEndResult};

type StateBag = HashMap<String, serde_json::Value>;

/// Mutable, shared state a test body and its hooks observe and mutate
/// through the run — the Rust analogue of the scripting runtime's
/// `testInfo` object.
#[derive(Clone)]
pub struct TestInfo {
    inner: Arc<Mutex<TestInfoInner>>,
}

struct TestInfoInner {
    title: String,
    retry: u32,
    repeat_each_index: u32,
    timeout: Duration,
    data: StateBag,
    annotations: Vec<String>,
    skip_requested: bool,
    fail_requested: bool,
    timeout_started_at: Instant,
}

impl TestInfo {
    fn new(title: String, retry: u32, repeat_each_index: u32, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TestInfoInner {
                title,
                retry,
                repeat_each_index,
                timeout,
                data: HashMap::new(),
                annotations: Vec::new(),
                skip_requested: false,
                fail_requested: false,
                timeout_started_at: Instant::now(),
            })),
        }
    }

    pub fn title(&self) -> String {
        self.inner.lock().unwrap().title.clone()
    }

    pub fn retry(&self) -> u32 {
        self.inner.lock().unwrap().retry
    }

    pub fn repeat_each_index(&self) -> u32 {
        self.inner.lock().unwrap().repeat_each_index
    }

    /// `test.skip(cond?)` — skip this test if `cond` is true or absent.
    pub fn skip(&self, cond: Option<bool>) {
        if cond.unwrap_or(true) {
            self.inner.lock().unwrap().skip_requested = true;
        }
    }

    /// `test.fail(cond?)` — expect this test to fail if `cond` is true or
    /// absent.
    pub fn fail(&self, cond: Option<bool>) {
        if cond.unwrap_or(true) {
            self.inner.lock().unwrap().fail_requested = true;
        }
    }

    /// `test.slow()` — multiplies the effective timeout by 3.
    pub fn slow(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.timeout *= 3;
    }

    /// `test.setTimeout(ms)` — replaces the effective timeout. If the timer
    /// has already expired the caller (the run loop) marks the test
    /// `timedOut` regardless.
    pub fn set_timeout(&self, ms: u64) {
        self.inner.lock().unwrap().timeout = Duration::from_millis(ms);
    }

    pub fn annotate(&self, message: impl Into<String>) {
        self.inner.lock().unwrap().annotations.push(message.into());
    }

    pub fn set_data(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.lock().unwrap().data.insert(key.into(), value);
    }

    fn remaining_budget(&self) -> Duration {
        let inner = self.inner.lock().unwrap();
        inner
            .timeout
            .checked_sub(inner.timeout_started_at.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// The currently effective timeout, as last set by `slow()`/`setTimeout`.
    /// The cancellation timer in [`run_group`] polls this so a runtime change
    /// actually moves the deadline instead of being silently ignored.
    fn timeout(&self) -> Duration {
        self.inner.lock().unwrap().timeout
    }
}

/// Emits a protocol-shaped event for the host process to forward. Decoupled
/// from the wire format itself so unit tests can observe the sequence
/// directly.
pub trait WorkerEventSink: Send {
    fn test_begin(&mut self, test_id: TestId);
    fn test_end(&mut self, test_id: TestId, result: &TestEndResult);
    fn log(&mut self, test_id: Option<TestId>, stdout: bool, text: String);
}

/// An in-memory sink used by tests and by the real worker binary's bridge to
/// the protocol writer.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Vec<String>,
    pub results: Vec<(TestId, TestEndResult)>,
}

impl WorkerEventSink for RecordingSink {
    fn test_begin(&mut self, test_id: TestId) {
        self.events.push(format!("begin:{test_id}"));
    }

    fn test_end(&mut self, test_id: TestId, result: &TestEndResult) {
        self.events.push(format!("end:{test_id}:{}", result.status));
        self.results.push((test_id, result.clone()));
    }

    fn log(&mut self, test_id: Option<TestId>, stdout: bool, text: String) {
        let stream = if stdout { "stdout" } else { "stderr" };
        self.events.push(format!("{stream}:{test_id:?}:{text}"));
    }
}

/// Tracks which suites have had `beforeAll` executed in this worker, so a
/// later group sharing the same worker process does not re-run it and so
/// `afterAll` can be paired up correctly.
#[derive(Default)]
pub struct WorkerLifecycle {
    before_all_ran: HashSet<SuiteId>,
    before_all_order: Vec<SuiteId>,
    /// Variant tags whose env `beforeAll` has already run in this worker
    /// process, in execution order, so `afterAll` can unwind them on
    /// shutdown even across several groups.
    env_before_all_ran: Vec<String>,
    /// Accumulated worker state bag populated by `beforeAll` hooks, visible
    /// to every test's `beforeEach` chain and to `afterAll`.
    bag: StateBag,
}

impl WorkerLifecycle {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Runs a variant's env `beforeAll` chain exactly once per worker process
/// lifetime (not once per group, even if the same tag is assigned again
/// later), merging results into `lifecycle.bag`.
async fn run_env_before_all(
    env_chain: &crate::env::EnvChain,
    tag: &str,
    lifecycle: &mut WorkerLifecycle,
) -> Result<(), String> {
    if lifecycle.env_before_all_ran.iter().any(|t| t == tag) {
        return Ok(());
    }
    lifecycle.env_before_all_ran.push(tag.to_string());
    for env in &env_chain.envs {
        if let Some(hook) = &env.before_all {
            match hook(lifecycle.bag.clone()).await {
                Ok(Some(next)) => lifecycle.bag.extend(next),
                Ok(None) => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

/// Runs every not-yet-run `beforeAll` over ancestor suites of `suite`,
/// exactly once per suite per worker lifetime, merging results into
/// `lifecycle.bag`.
async fn run_before_all(
    tree: &SpecTree,
    suite: SuiteId,
    lifecycle: &mut WorkerLifecycle,
) -> Result<(), String> {
    for ancestor in tree.ancestors_outermost_first(suite) {
        if lifecycle.before_all_ran.contains(&ancestor) {
            continue;
        }
        lifecycle.before_all_ran.insert(ancestor);
        lifecycle.before_all_order.push(ancestor);

        for hook in &tree.suites[ancestor].hooks.before_all {
            match (hook.body)(lifecycle.bag.clone()).await {
                Ok(next) => lifecycle.bag = next,
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

/// Drains pending `afterAll` hooks for every suite whose `beforeAll` ran, in
/// reverse order of execution.
async fn run_after_all(tree: &SpecTree, lifecycle: &WorkerLifecycle) {
    for &suite in lifecycle.before_all_order.iter().rev() {
        for hook in &tree.suites[suite].hooks.after_all {
            let _ = (hook.body)(lifecycle.bag.clone()).await;
        }
    }
}

/// Drains every variant's env `afterAll` in reverse order of the env
/// `beforeAll`s that ran during this worker's lifetime. Called once, when
/// the worker is told to shut down — never between groups.
pub async fn run_env_after_all_on_shutdown(
    lifecycle: &WorkerLifecycle,
    resolve: impl Fn(&str) -> crate::env::EnvChain,
) {
    for tag in lifecycle.env_before_all_ran.iter().rev() {
        let chain = resolve(tag);
        for env in chain.envs.iter().rev() {
            if let Some(hook) = &env.after_all {
                let _ = hook(lifecycle.bag.clone()).await;
            }
        }
    }
}

/// Runs env `beforeEach` (outermost factory first), then `before_each` hooks
/// outermost-first; merging each returned bag shallowly. Stops and records
/// the first error but the caller must still run every `after_each`.
async fn run_before_each(
    tree: &SpecTree,
    suite: SuiteId,
    env_chain: &crate::env::EnvChain,
    state: &mut StateBag,
) -> Option<String> {
    for env in &env_chain.envs {
        if let Some(hook) = &env.before_each {
            match hook(state.clone()).await {
                Ok(Some(next)) => state.extend(next),
                Ok(None) => {}
                Err(e) => return Some(e),
            }
        }
    }
    for ancestor in tree.ancestors_outermost_first(suite) {
        for hook in &tree.suites[ancestor].hooks.before_each {
            match (hook.body)(state.clone()).await {
                Ok(next) => state.extend(next),
                Err(e) => return Some(e),
            }
        }
    }
    None
}

/// Runs `after_each` hooks innermost-first, then env `afterEach` innermost
/// (reverse factory order), collecting the *first* error but continuing
/// through every hook.
async fn run_after_each(
    tree: &SpecTree,
    suite: SuiteId,
    env_chain: &crate::env::EnvChain,
    state: &StateBag,
) -> Option<String> {
    let mut first_error = None;
    for ancestor in tree.ancestors_innermost_first(suite) {
        for hook in &tree.suites[ancestor].hooks.after_each {
            if let Err(e) = (hook.body)(state.clone()).await {
                first_error.get_or_insert(e);
            }
        }
    }
    for env in env_chain.envs.iter().rev() {
        if let Some(hook) = &env.after_each {
            if let Err(e) = hook(state.clone()).await {
                first_error.get_or_insert(e);
            }
        }
    }
    first_error
}

/// Executes one test attempt to completion (or timeout/cancellation),
/// returning the computed [`TestEndResult`].
///
/// Hook and body errors are surfaced via `error`; `timed_out` distinguishes
/// a cancellation-induced failure from an ordinary one so the run loop can
/// apply §3's status derivation (`timedOut` takes priority, then `skipped`,
/// then the inverted pass/fail per `expected_to_fail`).
#[allow(clippy::too_many_arguments)]
pub async fn run_one_test(
    tree: &SpecTree,
    lifecycle: &mut WorkerLifecycle,
    env_chain: &crate::env::EnvChain,
    env_tag: &str,
    test_id: TestId,
    retry: u32,
    cancel: &CancellationToken,
    expected_to_fail: bool,
    already_skipped: bool,
    info: TestInfo,
) -> TestEndResult {
    let test = tree.test(test_id);
    let spec = &tree.specs[test.spec];
    let suite = spec.suite;

    if let Err(e) = run_env_before_all(env_chain, env_tag, lifecycle).await {
        return finalize(
            TestStatus::Failed,
            Some(e),
            false,
            expected_to_fail,
            Duration::ZERO,
            &info,
        );
    }

    if let Err(e) = run_before_all(tree, suite, lifecycle).await {
        return finalize(
            TestStatus::Failed,
            Some(e),
            false,
            expected_to_fail,
            Duration::ZERO,
            &info,
        );
    }

    let started = Instant::now();
    let mut state = lifecycle.bag.clone();

    let body_future = async {
        let mut hook_error = run_before_each(tree, suite, env_chain, &mut state).await;

        let mut body_error = None;
        if hook_error.is_none() && !already_skipped {
            body_error = (spec.body)(state.clone(), info.clone()).await.err();
        }

        let after_error = run_after_each(tree, suite, env_chain, &state).await;
        hook_error = hook_error.or(body_error).or(after_error);
        hook_error
    };

    let timed_out;
    let error = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            timed_out = true;
            Some("test timed out".to_string())
        }
        result = body_future => {
            timed_out = false;
            result
        }
    };

    let duration = started.elapsed();
    let skipped = already_skipped || info.inner.lock().unwrap().skip_requested;
    let expect_fail = expected_to_fail || info.inner.lock().unwrap().fail_requested;

    let status = if timed_out {
        TestStatus::TimedOut
    } else if skipped {
        TestStatus::Skipped
    } else if error.is_some() {
        TestStatus::Failed
    } else {
        TestStatus::Passed
    };

    finalize(status, error, skipped, expect_fail, duration, &info)
}

fn finalize(
    mut status: TestStatus,
    error: Option<String>,
    skipped: bool,
    expected_to_fail: bool,
    duration: Duration,
    info: &TestInfo,
) -> TestEndResult {
    let mut error = error.map(|message| TestError { message, stack: None });

    // `skipped` dominates `expectedToFail` per §3.
    if !skipped && status != TestStatus::TimedOut {
        match (status, expected_to_fail) {
            (TestStatus::Failed, true) => status = TestStatus::Passed,
            (TestStatus::Passed, true) => {
                status = TestStatus::Failed;
                error = Some(TestError {
                    message: "passed unexpectedly".to_string(),
                    stack: None,
                });
            }
            _ => {}
        }
    }

    let inner = info.inner.lock().unwrap();
    TestEndResult {
        status,
        error,
        duration,
        data: inner.data.clone(),
        annotations: inner.annotations.clone(),
        timed_out: status == TestStatus::TimedOut,
    }
}

/// Converts a [`TestEndResult`] into a persisted [`TestResult`].
pub fn into_test_result(result: TestEndResult) -> TestResult {
    let mut r = TestResult::new(result.status, result.duration);
    r.error = result.error;
    r.data = result.data;
    r
}

/// Drives a whole [`GroupAssignment`] against `tree` sequentially, in the
/// order §4.5 specifies, reporting through `sink`.
///
/// `lifecycle` is owned by the caller across the worker process's entire
/// life, not recreated per group: suite and env `beforeAll` must run at
/// most once per worker even when the same suite or variant tag reappears
/// in a later assignment. `afterAll` (suite and env alike) only drains at
/// process shutdown — see [`run_worker_shutdown`].
pub async fn run_group(
    tree: &SpecTree,
    group: &GroupAssignment,
    lifecycle: &mut WorkerLifecycle,
    env_chain: &crate::env::EnvChain,
    sink: &mut dyn WorkerEventSink,
    expected_to_fail: impl Fn(TestId) -> bool,
    skipped: impl Fn(TestId) -> bool,
) {
    for &test_id in &group.test_ids {
        sink.test_begin(test_id);
        let cancel = CancellationToken::new();
        let test = tree.test(test_id);
        let spec = &tree.specs[test.spec];
        let info = TestInfo::new(spec.title.clone(), group.retry_index, test.repeat_index, test.timeout);

        let guard = cancel.clone();
        let info_for_timer = info.clone();
        let timer = tokio::spawn(async move {
            loop {
                let before = info_for_timer.timeout();
                let remaining = info_for_timer.remaining_budget();
                if remaining.is_zero() {
                    break;
                }
                tokio::time::sleep(remaining).await;
                // `slow()`/`setTimeout()` may have moved the deadline while we
                // slept; only cancel once a full sleep elapses against the
                // timeout that was still current when it started.
                if info_for_timer.timeout() == before {
                    break;
                }
            }
            guard.cancel();
        });

        let result = run_one_test(
            tree,
            lifecycle,
            env_chain,
            &group.variant.tag,
            test_id,
            group.retry_index,
            &cancel,
            expected_to_fail(test_id),
            skipped(test_id),
            info,
        )
        .await;

        timer.abort();
        sink.test_end(test_id, &result);
    }
}

/// Drains every suite `afterAll` (reverse of execution order), then every
/// variant env `afterAll` (reverse of execution order) — env wraps user
/// hooks, so it unwinds last. Call exactly once, when the worker process is
/// told to stop.
pub async fn run_worker_shutdown(
    tree: &SpecTree,
    lifecycle: &WorkerLifecycle,
    resolve_env: impl Fn(&str) -> crate::env::EnvChain,
) {
    run_after_all(tree, lifecycle).await;
    run_env_after_all_on_shutdown(lifecycle, resolve_env).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SpecTree;
    use crate::registration::{hook, load_file, test as register_test, HookKind};
    use std::path::Path;
    use std::sync::Arc as StdArc;

    fn body_ok() -> crate::model::SpecBody {
        StdArc::new(|_s, _i| Box::pin(async { Ok(()) }))
    }

    fn body_err() -> crate::model::SpecBody {
        StdArc::new(|_s, _i| Box::pin(async { Err("boom".to_string()) }))
    }

    fn sample_group(tree: &mut SpecTree, body: crate::model::SpecBody) -> GroupAssignment {
        load_file(tree, Path::new("a.test.js"), |cell| {
            register_test(cell, "t", 1, 1, body).unwrap();
        })
        .unwrap();
        crate::generator::expand_specs(tree, &[], Duration::from_millis(200));

        GroupAssignment {
            group_id: 1,
            file: "a.test.js".into(),
            variant: Default::default(),
            test_ids: tree.tests.iter().map(|t| t.id).collect(),
            repeat_index: 0,
            retry_index: 0,
        }
    }

    #[tokio::test]
    async fn passing_test_reports_passed() {
        let mut tree = SpecTree::new();
        let group = sample_group(&mut tree, body_ok());
        let mut sink = RecordingSink::default();
        run_group(&tree, &group, &mut WorkerLifecycle::new(), &crate::env::EnvChain { envs: Vec::new() }, &mut sink, |_| false, |_| false).await;

        assert_eq!(sink.results.len(), 1);
        assert_eq!(sink.results[0].1.status, TestStatus::Passed);
    }

    #[tokio::test]
    async fn failing_test_reports_failed_with_message() {
        let mut tree = SpecTree::new();
        let group = sample_group(&mut tree, body_err());
        let mut sink = RecordingSink::default();
        run_group(&tree, &group, &mut WorkerLifecycle::new(), &crate::env::EnvChain { envs: Vec::new() }, &mut sink, |_| false, |_| false).await;

        let (_, result) = &sink.results[0];
        assert_eq!(result.status, TestStatus::Failed);
        assert_eq!(result.error.as_ref().unwrap().message, "boom");
    }

    #[tokio::test]
    async fn expected_to_fail_inverts_pass_to_failed_with_unexpected_message() {
        let mut tree = SpecTree::new();
        let group = sample_group(&mut tree, body_ok());
        let mut sink = RecordingSink::default();
        run_group(&tree, &group, &mut WorkerLifecycle::new(), &crate::env::EnvChain { envs: Vec::new() }, &mut sink, |_| true, |_| false).await;

        let (_, result) = &sink.results[0];
        assert_eq!(result.status, TestStatus::Failed);
        assert_eq!(result.error.as_ref().unwrap().message, "passed unexpectedly");
    }

    #[tokio::test]
    async fn expected_to_fail_inverts_failure_to_passed() {
        let mut tree = SpecTree::new();
        let group = sample_group(&mut tree, body_err());
        let mut sink = RecordingSink::default();
        run_group(&tree, &group, &mut WorkerLifecycle::new(), &crate::env::EnvChain { envs: Vec::new() }, &mut sink, |_| true, |_| false).await;

        assert_eq!(sink.results[0].1.status, TestStatus::Passed);
    }

    #[tokio::test]
    async fn skip_dominates_expected_to_fail() {
        let mut tree = SpecTree::new();
        let group = sample_group(&mut tree, body_err());
        let mut sink = RecordingSink::default();
        run_group(&tree, &group, &mut WorkerLifecycle::new(), &crate::env::EnvChain { envs: Vec::new() }, &mut sink, |_| true, |_| true).await;

        assert_eq!(sink.results[0].1.status, TestStatus::Skipped);
    }

    #[tokio::test]
    async fn timeout_marks_test_timed_out() {
        let mut tree = SpecTree::new();
        let slow_body: crate::model::SpecBody =
            StdArc::new(|_s, _i| Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }));
        load_file(&mut tree, Path::new("a.test.js"), |cell| {
            register_test(cell, "t", 1, 1, slow_body).unwrap();
        })
        .unwrap();
        crate::generator::expand_specs(&mut tree, &[], Duration::from_millis(20));

        let group = GroupAssignment {
            group_id: 1,
            file: "a.test.js".into(),
            variant: Default::default(),
            test_ids: tree.tests.iter().map(|t| t.id).collect(),
            repeat_index: 0,
            retry_index: 0,
        };
        let mut sink = RecordingSink::default();
        run_group(&tree, &group, &mut WorkerLifecycle::new(), &crate::env::EnvChain { envs: Vec::new() }, &mut sink, |_| false, |_| false).await;

        assert_eq!(sink.results[0].1.status, TestStatus::TimedOut);
    }

    #[tokio::test]
    async fn set_timeout_extends_the_deadline_at_runtime() {
        let mut tree = SpecTree::new();
        let body: crate::model::SpecBody = StdArc::new(|_s, info| {
            Box::pin(async move {
                info.set_timeout(300);
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(())
            })
        });
        load_file(&mut tree, Path::new("a.test.js"), |cell| {
            register_test(cell, "t", 1, 1, body).unwrap();
        })
        .unwrap();
        // Static timeout is shorter than the body's sleep; only a runtime
        // setTimeout() moving the deadline keeps this test from timing out.
        crate::generator::expand_specs(&mut tree, &[], Duration::from_millis(20));

        let group = GroupAssignment {
            group_id: 1,
            file: "a.test.js".into(),
            variant: Default::default(),
            test_ids: tree.tests.iter().map(|t| t.id).collect(),
            repeat_index: 0,
            retry_index: 0,
        };
        let mut sink = RecordingSink::default();
        run_group(&tree, &group, &mut WorkerLifecycle::new(), &crate::env::EnvChain { envs: Vec::new() }, &mut sink, |_| false, |_| false).await;

        assert_eq!(sink.results[0].1.status, TestStatus::Passed);
    }

    #[tokio::test]
    async fn hook_failure_still_runs_after_each() {
        let mut tree = SpecTree::new();
        let ran_after_each = StdArc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = StdArc::clone(&ran_after_each);

        load_file(&mut tree, Path::new("a.test.js"), |cell| {
            let before_each_hook: crate::model::HookBody =
                StdArc::new(|_state| Box::pin(async { Err("setup failed".to_string()) }));
            hook(cell, HookKind::BeforeEach, Path::new("a.test.js"), 1, before_each_hook).unwrap();

            let after_each_hook: crate::model::HookBody = StdArc::new(move |state| {
                let flag = StdArc::clone(&flag);
                Box::pin(async move {
                    flag.store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok(state)
                })
            });
            hook(cell, HookKind::AfterEach, Path::new("a.test.js"), 2, after_each_hook).unwrap();

            register_test(cell, "t", 3, 1, body_ok()).unwrap();
        })
        .unwrap();
        crate::generator::expand_specs(&mut tree, &[], Duration::from_millis(200));

        let group = GroupAssignment {
            group_id: 1,
            file: "a.test.js".into(),
            variant: Default::default(),
            test_ids: tree.tests.iter().map(|t| t.id).collect(),
            repeat_index: 0,
            retry_index: 0,
        };
        let mut sink = RecordingSink::default();
        run_group(&tree, &group, &mut WorkerLifecycle::new(), &crate::env::EnvChain { envs: Vec::new() }, &mut sink, |_| false, |_| false).await;

        assert!(ran_after_each.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(sink.results[0].1.status, TestStatus::Failed);
    }
}
