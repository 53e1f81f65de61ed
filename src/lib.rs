//! # corral
//!
//! A parallel test runner for suites that declare their tests with a small
//! `describe`/`test` registration API and run fixtures through composable
//! environments (`runWith`, `declare`/`extend`).
//!
//! ## Overview
//!
//! corral discovers test files, loads them to build an in-memory suite tree,
//! expands that tree into a filtered, ordered list of tests, and dispatches
//! them across a pool of worker processes. It provides:
//!
//! - **Parallel execution** across worker processes, each running tests
//!   sequentially within its assigned group
//! - **Crash recovery**: a worker that dies mid-group has its in-flight test
//!   marked failed and the rest of the run continues
//! - **Retry-on-failure** with flaky detection
//! - **JUnit XML and console reporting**
//!
//! ## Architecture
//!
//! ### Data model ([`model`])
//!
//! [`model::SpecTree`] is the arena of [`model::Suite`]s, [`model::Spec`]s,
//! and their expanded [`model::Test`]s.
//!
//! ### Registration ([`registration`])
//!
//! The `describe`/`test`/hook surface test files call into while loading.
//!
//! ### Loader ([`loader`])
//!
//! Maps a discovered file path to the compile-time-registered function that
//! declares its suites, standing in for the dynamic `import` a scripting
//! runtime would use.
//!
//! ### Environments ([`env`])
//!
//! [`env::Env`] and [`env::TestFactory`] model `runWith`/`declare`/`extend`.
//!
//! ### Generation ([`generator`])
//!
//! [`generator::generate_plan`] expands, filters, and orders the final test
//! list (focus, grep, shard, name filters).
//!
//! ### Protocol ([`protocol`])
//!
//! The length-framed JSON messages exchanged between the dispatcher and
//! worker processes.
//!
//! ### Worker runtime ([`worker`])
//!
//! Executes one assigned group of tests sequentially, with hook ordering and
//! per-test timeout supervision.
//!
//! ### Dispatcher ([`dispatcher`])
//!
//! Owns the worker pool, assigns groups, recovers from crashes, and enforces
//! stop conditions (`maxFailures`, `SIGINT`, global timeout).
//!
//! ### Discovery ([`discovery`])
//!
//! Finds test and fixture files on disk.
//!
//! ### Reporting ([`report`])
//!
//! [`report::Reporter`] and its built-in implementations
//! ([`report::ConsoleReporter`], [`report::JUnitReporter`]).
//!
//! ### Runner façade ([`runner`])
//!
//! Drives discovery → load → generate → dispatch end to end and translates
//! the outcome into an exit code. Parent and worker processes both call
//! [`runner::build_tree`] to reconstruct an identical [`model::SpecTree`]
//! independently, since `Env`/hook/test closures cannot cross the process
//! boundary — only the deterministic inputs (discovered paths, configured
//! variant tags) do.
//!
//! ## Configuration
//!
//! corral is configured via an optional TOML file, overridden field-by-field
//! by CLI flags. See the [`config`] module for the schema.

pub mod config;
pub mod dispatcher;
pub mod discovery;
pub mod env;
pub mod generator;
pub mod loader;
pub mod model;
pub mod protocol;
pub mod registration;
pub mod report;
pub mod runner;
pub mod worker;

pub use config::{load_config, RunConfig};
pub use model::{SpecTree, Test, TestId, TestResult, TestStatus};
pub use report::{MultiReporter, Reporter};
