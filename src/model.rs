//! The in-memory tree of suites, specs, and their expanded test instances.
//!
//! A [`Suite`] nests child suites and owns [`Spec`]s; a `Spec` is the
//! author-declared intent of one test, and expands at generation time into
//! one or more [`Test`]s — one per bound environment variant times repeat
//! index. Every node is addressed by a stable, arena-relative id rather than
//! an owning pointer, since suites and specs refer to each other in both
//! directions (child suites point back to their parent).

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Index of a [`Suite`] within a [`SpecTree`]'s arena.
pub type SuiteId = usize;
/// Index of a [`Spec`] within a [`SpecTree`]'s arena.
pub type SpecId = usize;
/// Stable numeric id of an expanded [`Test`].
pub type TestId = u64;

/// A registered hook body plus the source location it was declared at.
pub struct Hook {
    pub file: std::path::PathBuf,
    pub line: u32,
    pub body: HookBody,
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("file", &self.file)
            .field("line", &self.line)
            .finish()
    }
}

/// A boxed async hook body. Takes and returns a shallow state bag (see
/// `[ADD] Worker state bag` in SPEC_FULL.md §4.5) that is merged into the
/// test's accumulated state.
pub type HookBody = std::sync::Arc<
    dyn Fn(
            HashMap<String, serde_json::Value>,
        ) -> futures::future::BoxFuture<
            'static,
            Result<HashMap<String, serde_json::Value>, String>,
        > + Send
        + Sync,
>;

/// A boxed async test body. Receives the merged state bag and a
/// [`crate::worker::TestInfo`] handle, and may fail with a message.
pub type SpecBody = std::sync::Arc<
    dyn Fn(
            HashMap<String, serde_json::Value>,
            crate::worker::TestInfo,
        ) -> futures::future::BoxFuture<'static, Result<(), String>>
        + Send
        + Sync,
>;

/// The four hook buckets every [`Suite`] carries.
#[derive(Default)]
pub struct HookBuckets {
    pub before_all: Vec<Hook>,
    pub after_all: Vec<Hook>,
    pub before_each: Vec<Hook>,
    pub after_each: Vec<Hook>,
}

impl fmt::Debug for HookBuckets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookBuckets")
            .field("before_all", &self.before_all.len())
            .field("after_all", &self.after_all.len())
            .field("before_each", &self.before_each.len())
            .field("after_each", &self.after_each.len())
            .finish()
    }
}

/// A node in the spec tree: a title, a source file, child suites, owned
/// specs, and hook buckets.
#[derive(Debug)]
pub struct Suite {
    pub id: SuiteId,
    pub title: String,
    pub file: std::path::PathBuf,
    pub parent: Option<SuiteId>,
    pub children: Vec<SuiteId>,
    pub specs: Vec<SpecId>,
    pub hooks: HookBuckets,
    pub focused: bool,
    pub skipped: bool,
}

impl Suite {
    fn root(id: SuiteId, file: std::path::PathBuf) -> Self {
        Self {
            id,
            title: String::new(),
            file,
            parent: None,
            children: Vec::new(),
            specs: Vec::new(),
            hooks: HookBuckets::default(),
            focused: false,
            skipped: false,
        }
    }
}

/// A leaf inside a suite: the author-declared intent of one test.
pub struct Spec {
    pub id: SpecId,
    pub suite: SuiteId,
    pub title: String,
    pub file: std::path::PathBuf,
    pub line: u32,
    pub column: u32,
    pub body: SpecBody,
    pub focused: bool,
    pub skipped: bool,
    pub expected_to_fail: bool,
    pub tests: Vec<TestId>,
}

impl fmt::Debug for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spec")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("file", &self.file)
            .field("line", &self.line)
            .field("focused", &self.focused)
            .field("skipped", &self.skipped)
            .field("expected_to_fail", &self.expected_to_fail)
            .field("tests", &self.tests)
            .finish()
    }
}

impl Spec {
    /// The `' '`-joined chain of ancestor suite titles plus this spec's
    /// title.
    pub fn full_title(&self, tree: &SpecTree) -> String {
        let mut parts = Vec::new();
        let mut cursor = Some(self.suite);
        while let Some(id) = cursor {
            let suite = &tree.suites[id];
            if !suite.title.is_empty() {
                parts.push(suite.title.clone());
            }
            cursor = suite.parent;
        }
        parts.reverse();
        parts.push(self.title.clone());
        parts.join(" ")
    }
}

/// An (env binding, tag, options) tuple produced by `runWith`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Variant {
    pub tag: String,
    pub dict: HashMap<String, serde_json::Value>,
}

/// One expanded execution instance of a [`Spec`] for a given variant and
/// repeat index.
#[derive(Debug)]
pub struct Test {
    pub id: TestId,
    pub spec: SpecId,
    pub variant: Variant,
    pub repeat_index: u32,
    pub timeout: Duration,
    pub annotations: Mutex<Vec<String>>,
    pub results: Mutex<Vec<TestResult>>,
}

impl Test {
    pub fn new(id: TestId, spec: SpecId, variant: Variant, repeat_index: u32, timeout: Duration) -> Self {
        Self {
            id,
            spec,
            variant,
            repeat_index,
            timeout,
            annotations: Mutex::new(Vec::new()),
            results: Mutex::new(Vec::new()),
        }
    }

    /// Appends a run attempt, returning its retry index.
    pub fn record_result(&self, mut result: TestResult) -> u32 {
        let mut results = self.results.lock().expect("test results mutex poisoned");
        result.retry_index = results.len() as u32;
        let idx = result.retry_index;
        results.push(result);
        idx
    }

    /// Number of completed attempts so far.
    pub fn attempt_count(&self) -> u32 {
        self.results.lock().expect("test results mutex poisoned").len() as u32
    }

    /// Whether the first attempt failed and a later attempt passed.
    pub fn is_flaky(&self) -> bool {
        let results = self.results.lock().expect("test results mutex poisoned");
        if results.len() < 2 {
            return false;
        }
        let first_failed = matches!(
            results[0].status,
            TestStatus::Failed | TestStatus::TimedOut
        );
        let later_passed = results[1..]
            .iter()
            .any(|r| matches!(r.status, TestStatus::Passed));
        first_failed && later_passed
    }

    /// `ok()` per §3: the last result decides, with `expectedToFail`
    /// inversion and `skipped` taking priority over everything.
    pub fn ok(&self, expected_to_fail: bool) -> bool {
        let results = self.results.lock().expect("test results mutex poisoned");
        match results.last() {
            None => false,
            Some(last) => match last.status {
                TestStatus::Skipped => true,
                TestStatus::Passed => !expected_to_fail,
                TestStatus::Failed => expected_to_fail,
                TestStatus::TimedOut => false,
            },
        }
    }

    pub fn last_status(&self) -> Option<TestStatus> {
        self.results
            .lock()
            .expect("test results mutex poisoned")
            .last()
            .map(|r| r.status)
    }
}

/// The status of one run attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestStatus {
    Passed,
    Failed,
    TimedOut,
    Skipped,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::TimedOut => "timedOut",
            TestStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// A formatted test failure: message plus an optional stack trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestError {
    pub message: String,
    pub stack: Option<String>,
}

/// One run attempt of a [`Test`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub retry_index: u32,
    pub start: chrono::DateTime<chrono::Utc>,
    pub duration: Duration,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub status: TestStatus,
    pub error: Option<TestError>,
    pub data: HashMap<String, serde_json::Value>,
}

impl TestResult {
    pub fn new(status: TestStatus, duration: Duration) -> Self {
        Self {
            retry_index: 0,
            start: chrono::Utc::now(),
            duration,
            stdout: Vec::new(),
            stderr: Vec::new(),
            status,
            error: None,
            data: HashMap::new(),
        }
    }

    pub fn with_error(mut self, message: impl Into<String>, stack: Option<String>) -> Self {
        self.error = Some(TestError {
            message: message.into(),
            stack,
        });
        self
    }

    pub fn with_stdout(mut self, lines: Vec<String>) -> Self {
        self.stdout = lines;
        self
    }

    pub fn with_stderr(mut self, lines: Vec<String>) -> Self {
        self.stderr = lines;
        self
    }
}

/// An arena of [`Suite`]s, [`Spec`]s, and their expanded [`Test`]s, owned by
/// one loaded test file tree (in practice, one arena spans the whole run —
/// each file gets its own root suite inside it).
#[derive(Default)]
pub struct SpecTree {
    pub suites: Vec<Suite>,
    pub specs: Vec<Spec>,
    pub tests: Vec<Test>,
    next_test_id: TestId,
}

impl SpecTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fresh root suite for `file` and returns its id.
    pub fn new_root_suite(&mut self, file: std::path::PathBuf) -> SuiteId {
        let id = self.suites.len();
        self.suites.push(Suite::root(id, file));
        id
    }

    /// Creates a child suite of `parent` and returns its id.
    pub fn new_child_suite(
        &mut self,
        parent: SuiteId,
        title: String,
        file: std::path::PathBuf,
    ) -> SuiteId {
        let id = self.suites.len();
        self.suites.push(Suite {
            id,
            title,
            file,
            parent: Some(parent),
            children: Vec::new(),
            specs: Vec::new(),
            hooks: HookBuckets::default(),
            focused: false,
            skipped: false,
        });
        self.suites[parent].children.push(id);
        id
    }

    /// Registers a new spec under `suite` and returns its id.
    #[allow(clippy::too_many_arguments)]
    pub fn new_spec(
        &mut self,
        suite: SuiteId,
        title: String,
        file: std::path::PathBuf,
        line: u32,
        column: u32,
        body: SpecBody,
    ) -> SpecId {
        let id = self.specs.len();
        self.specs.push(Spec {
            id,
            suite,
            title,
            file,
            line,
            column,
            body,
            focused: false,
            skipped: false,
            expected_to_fail: false,
            tests: Vec::new(),
        });
        self.suites[suite].specs.push(id);
        id
    }

    /// Expands a spec into a new [`Test`] for `variant`/`repeat_index` and
    /// returns its id.
    pub fn new_test(
        &mut self,
        spec: SpecId,
        variant: Variant,
        repeat_index: u32,
        timeout: Duration,
    ) -> TestId {
        let id = self.next_test_id;
        self.next_test_id += 1;
        self.tests.push(Test::new(id, spec, variant, repeat_index, timeout));
        self.specs[spec].tests.push(id);
        id
    }

    pub fn test(&self, id: TestId) -> &Test {
        self.tests
            .iter()
            .find(|t| t.id == id)
            .expect("test id not found in arena")
    }

    /// Ancestor suites of `suite`, innermost first (the suite itself comes
    /// first, then its parent, etc.).
    pub fn ancestors_innermost_first(&self, suite: SuiteId) -> Vec<SuiteId> {
        let mut chain = Vec::new();
        let mut cursor = Some(suite);
        while let Some(id) = cursor {
            chain.push(id);
            cursor = self.suites[id].parent;
        }
        chain
    }

    /// Ancestor suites of `suite`, outermost first — the order `beforeAll`
    /// and `beforeEach` run in.
    pub fn ancestors_outermost_first(&self, suite: SuiteId) -> Vec<SuiteId> {
        let mut chain = self.ancestors_innermost_first(suite);
        chain.reverse();
        chain
    }

    pub fn spec_full_title(&self, spec: SpecId) -> String {
        self.specs[spec].full_title(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_title_joins_ancestor_chain() {
        let mut tree = SpecTree::new();
        let root = tree.new_root_suite("a.test.js".into());
        let outer = tree.new_child_suite(root, "outer".to_string(), "a.test.js".into());
        let inner = tree.new_child_suite(outer, "inner".to_string(), "a.test.js".into());
        let body: SpecBody = std::sync::Arc::new(|state, _info| Box::pin(async move { let _ = state; Ok(()) }));
        let spec = tree.new_spec(inner, "does a thing".to_string(), "a.test.js".into(), 1, 1, body);
        assert_eq!(tree.spec_full_title(spec), "outer inner does a thing");
    }

    #[test]
    fn ancestor_ordering_is_inverse_of_each_other() {
        let mut tree = SpecTree::new();
        let root = tree.new_root_suite("a.test.js".into());
        let outer = tree.new_child_suite(root, "outer".to_string(), "a.test.js".into());
        let inner = tree.new_child_suite(outer, "inner".to_string(), "a.test.js".into());

        let innermost_first = tree.ancestors_innermost_first(inner);
        let outermost_first = tree.ancestors_outermost_first(inner);
        assert_eq!(innermost_first, vec![inner, outer, root]);
        assert_eq!(outermost_first, vec![root, outer, inner]);
    }

    #[test]
    fn test_ok_respects_expected_to_fail_and_skip_priority() {
        let mut tree = SpecTree::new();
        let root = tree.new_root_suite("a.test.js".into());
        let body: SpecBody = std::sync::Arc::new(|state, _info| Box::pin(async move { let _ = state; Ok(()) }));
        let spec = tree.new_spec(root, "does a thing".to_string(), "a.test.js".into(), 1, 1, body);
        tree.new_test(spec, Variant::default(), 0, Duration::from_secs(1));
        let t = &tree.tests[0];

        t.record_result(TestResult::new(TestStatus::Skipped, Duration::ZERO));
        assert!(t.ok(true), "skipped always ok regardless of expectedToFail");
    }

    #[test]
    fn test_is_flaky_when_first_fails_and_later_passes() {
        let mut tree = SpecTree::new();
        let root = tree.new_root_suite("a.test.js".into());
        let body: SpecBody = std::sync::Arc::new(|state, _info| Box::pin(async move { let _ = state; Ok(()) }));
        let spec = tree.new_spec(root, "does a thing".to_string(), "a.test.js".into(), 1, 1, body);
        tree.new_test(spec, Variant::default(), 0, Duration::from_secs(1));
        let t = &tree.tests[0];
        t.record_result(TestResult::new(TestStatus::Failed, Duration::ZERO));
        t.record_result(TestResult::new(TestStatus::Passed, Duration::ZERO));
        assert!(t.is_flaky());
        assert!(t.ok(false));
    }
}
