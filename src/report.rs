//! Test reporting and output generation.
//!
//! This module provides the [`Reporter`] trait for receiving test execution
//! events and the built-in reporter implementations that consume them.
//!
//! # Reporter Trait
//!
//! Reporters receive callbacks for the run's full lifecycle, in this order:
//!
//! 1. [`on_begin`](Reporter::on_begin) — once, after the plan is generated
//! 2. [`on_test_begin`](Reporter::on_test_begin) / [`on_stdout`](Reporter::on_stdout) /
//!    [`on_stderr`](Reporter::on_stderr) / [`on_test_end`](Reporter::on_test_end) —
//!    per test attempt, possibly interleaved across workers
//! 3. [`on_timeout`](Reporter::on_timeout) — at most once, if the global
//!    deadline is hit
//! 4. [`on_end`](Reporter::on_end) — once, after the run settles
//!
//! # Built-in Reporters
//!
//! | Reporter | Description |
//! |----------|-------------|
//! | [`ConsoleReporter`] | Terminal output with progress bar |
//! | [`JUnitReporter`] | JUnit XML file for CI systems |
//! | [`MultiReporter`] | Combines multiple reporters, isolating their errors |
//! | [`NullReporter`] | Discards all events (for testing) |
//!
//! # Combining Reporters
//!
//! Use [`MultiReporter`] to send events to multiple reporters:
//!
//! ```
//! use corral::report::{MultiReporter, ConsoleReporter, JUnitReporter};
//!
//! let reporter = MultiReporter::new()
//!     .with_reporter(ConsoleReporter::new(true))
//!     .with_reporter(JUnitReporter::new("test-results/junit.xml".into()));
//! ```

pub mod junit;

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;

use crate::model::{TestId, TestResult};

pub use junit::JUnitReporter;

/// Aggregated counts and timing for a finished run, handed to
/// [`Reporter::on_end`].
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub flaky: usize,
    pub duration: Duration,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Trait for receiving test execution events.
///
/// Reporters are notified at key points during a run and can output results
/// in various formats (terminal, files, CI annotations).
///
/// # Thread Safety
///
/// Reporters must be `Send + Sync`: events arrive from the dispatcher's
/// single event loop, but a reporter may itself spawn background work.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once the test plan is generated, before any test runs.
    async fn on_begin(&self, _total_tests: usize) {}

    /// Called when a test attempt starts executing.
    async fn on_test_begin(&self, _test_id: TestId) {}

    /// Captured stdout, attributed to `test_id` when the worker could tell
    /// which test produced it.
    async fn on_stdout(&self, _test_id: Option<TestId>, _text: &str) {}

    /// Captured stderr, same attribution rule as [`on_stdout`](Self::on_stdout).
    async fn on_stderr(&self, _test_id: Option<TestId>, _text: &str) {}

    /// Called when a test attempt finishes, with its final result.
    async fn on_test_end(&self, test_id: TestId, result: &TestResult);

    /// Called once if the global timeout cuts the run short.
    async fn on_timeout(&self) {}

    /// Called once after the run settles (queue drained, max failures hit,
    /// `SIGINT`, or global timeout).
    async fn on_end(&self, summary: &RunSummary);
}

/// A reporter that discards all events.
///
/// Useful for testing or when no output is desired.
///
/// # Example
///
/// ```
/// use corral::report::NullReporter;
///
/// let reporter = NullReporter;
/// ```
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_test_end(&self, _test_id: TestId, _result: &TestResult) {}
    async fn on_end(&self, _summary: &RunSummary) {}
}

/// A reporter that forwards events to multiple child reporters.
///
/// A panicking or failing child reporter must never take down the run: each
/// dispatch is isolated, logged, and skipped rather than propagated.
///
/// # Example
///
/// ```
/// use corral::report::{MultiReporter, ConsoleReporter, JUnitReporter};
///
/// let reporter = MultiReporter::new()
///     .with_reporter(ConsoleReporter::new(true))
///     .with_reporter(JUnitReporter::new("test-results/junit.xml".into()));
/// ```
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    /// Creates a new empty multi-reporter.
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    /// Adds a reporter to receive events. Returns `self` for chaining.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

/// Runs `fut` for one child reporter, converting a panic into a logged
/// warning instead of unwinding through the whole dispatch loop.
async fn isolated(label: &str, fut: impl std::future::Future<Output = ()>) {
    if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
        tracing::error!(reporter = label, "reporter panicked while handling an event");
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_begin(&self, total_tests: usize) {
        for (i, reporter) in self.reporters.iter().enumerate() {
            isolated(&i.to_string(), reporter.on_begin(total_tests)).await;
        }
    }

    async fn on_test_begin(&self, test_id: TestId) {
        for (i, reporter) in self.reporters.iter().enumerate() {
            isolated(&i.to_string(), reporter.on_test_begin(test_id)).await;
        }
    }

    async fn on_stdout(&self, test_id: Option<TestId>, text: &str) {
        for (i, reporter) in self.reporters.iter().enumerate() {
            isolated(&i.to_string(), reporter.on_stdout(test_id, text)).await;
        }
    }

    async fn on_stderr(&self, test_id: Option<TestId>, text: &str) {
        for (i, reporter) in self.reporters.iter().enumerate() {
            isolated(&i.to_string(), reporter.on_stderr(test_id, text)).await;
        }
    }

    async fn on_test_end(&self, test_id: TestId, result: &TestResult) {
        for (i, reporter) in self.reporters.iter().enumerate() {
            isolated(&i.to_string(), reporter.on_test_end(test_id, result)).await;
        }
    }

    async fn on_timeout(&self) {
        for (i, reporter) in self.reporters.iter().enumerate() {
            isolated(&i.to_string(), reporter.on_timeout()).await;
        }
    }

    async fn on_end(&self, summary: &RunSummary) {
        for (i, reporter) in self.reporters.iter().enumerate() {
            isolated(&i.to_string(), reporter.on_end(summary)).await;
        }
    }
}

/// Terminal reporter with a progress bar and colored pass/fail output.
///
/// # Output Modes
///
/// - **Normal** (`verbose: false`): shows only failures and the summary
/// - **Verbose** (`verbose: true`): shows every test as it completes
pub struct ConsoleReporter {
    progress: std::sync::Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    /// Creates a new console reporter.
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: std::sync::Mutex::new(None),
            verbose,
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_begin(&self, total_tests: usize) {
        println!("Running {total_tests} tests");

        let pb = indicatif::ProgressBar::new(total_tests as u64);
        pb.set_style(
            indicatif::ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
                )
                .unwrap()
                .progress_chars("#>-"),
        );

        *self.progress.lock().unwrap() = Some(pb);
    }

    async fn on_test_begin(&self, test_id: TestId) {
        if self.verbose {
            println!("Running: test #{test_id}");
        }
    }

    async fn on_test_end(&self, test_id: TestId, result: &TestResult) {
        if let Some(pb) = self.progress.lock().unwrap().as_ref() {
            pb.inc(1);

            let status = match result.status {
                crate::model::TestStatus::Passed => console::style("PASS").green(),
                crate::model::TestStatus::Failed => console::style("FAIL").red(),
                crate::model::TestStatus::Skipped => console::style("SKIP").yellow(),
                crate::model::TestStatus::TimedOut => console::style("TIME").red().bold(),
            };

            if self.verbose || result.status != crate::model::TestStatus::Passed {
                pb.println(format!("{status} test #{test_id}"));
            }
        }
    }

    async fn on_end(&self, summary: &RunSummary) {
        if let Some(pb) = self.progress.lock().unwrap().take() {
            pb.finish_and_clear();
        }

        println!();
        println!("Results:");
        println!("  Total:   {}", summary.total);
        println!("  Passed:  {}", console::style(summary.passed).green());
        println!("  Failed:  {}", console::style(summary.failed).red());
        println!("  Skipped: {}", console::style(summary.skipped).yellow());
        if summary.flaky > 0 {
            println!("  Flaky:   {}", console::style(summary.flaky).yellow());
        }
        println!("  Duration: {:?}", summary.duration);

        println!();
        if summary.success() {
            println!("{}", console::style("All tests passed!").green().bold());
        } else {
            println!("{}", console::style("Some tests failed.").red().bold());
        }
    }
}
