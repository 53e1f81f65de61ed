//! The runner façade: discovery → load → generate → dispatch, and the
//! exit-code translation at the end of it.
//!
//! [`build_tree`] is the one function both the parent process and every
//! worker process call. Since `Env`/hook/test bodies are Rust closures that
//! cannot cross a process boundary, the parent cannot hand a worker its
//! already-built [`SpecTree`] — instead both sides run the identical
//! deterministic pipeline (same discovery order, same load order, same
//! `expand_specs` call) so the monotonically assigned [`TestId`]s line up
//! without ever serializing a closure.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::RunConfig;
use crate::dispatcher::{self, DispatchError, DispatchOutcome, TestGroupSpec};
use crate::env::{self, EnvChain};
use crate::generator::{self, GenerateError};
use crate::loader::{self, LoadError};
use crate::model::{SpecTree, TestId, Variant};
use crate::report::junit::TestMeta;
use crate::report::{Reporter, RunSummary};

/// Errors that can abort a run before any test executes.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Discovery(#[from] crate::discovery::DiscoveryError),
    #[error(transparent)]
    Generate(#[from] GenerateError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// A freshly built tree plus the load failures discovered along the way. A
/// file with no registered module does not abort the build — see
/// [`loader::load_all`] — so callers can decide whether an unloadable file
/// should fail the whole run or just be reported per file.
pub struct BuiltTree {
    pub tree: SpecTree,
    pub load_failures: Vec<(PathBuf, LoadError)>,
}

/// Resolves the configured `runWith` bindings for this config.
fn configured_bindings(config: &RunConfig) -> Vec<env::VariantBinding> {
    let tags: Vec<(String, Option<u32>)> = config
        .run_with
        .iter()
        .map(|e| (e.tag.clone(), e.repeat_each))
        .collect();
    env::bindings_from_tags(&tags)
}

/// Discovers, loads, and expands the spec tree for `config`. Deterministic:
/// calling this twice with the same config and the same files on disk
/// produces trees with identical suite/spec/test ids, which is what lets the
/// parent and a worker process reconstruct matching [`TestId`]s
/// independently.
pub fn build_tree(config: &RunConfig) -> Result<BuiltTree, RunnerError> {
    let discovered = crate::discovery::discover(
        &config.test_dir,
        &config.test_match,
        &config.test_ignore,
        &config.fixture_match,
        &config.fixture_ignore,
        &config.name_filters,
    )?;

    let (mut tree, load_failures) = loader::load_all(&discovered.fixtures, &discovered.tests);

    let bindings = configured_bindings(config);
    let timeout = Duration::from_millis(config.timeout_ms);
    generator::expand_specs(&mut tree, &bindings, timeout);

    Ok(BuiltTree { tree, load_failures })
}

/// Resolves the [`EnvChain`] a group's variant tag should run under.
pub fn env_chain_for(variant: &Variant) -> EnvChain {
    env::resolve_chain_for_tag(&variant.tag)
}

/// Groups an ordered test plan into worker-assignable [`TestGroupSpec`]s:
/// consecutive runs of tests sharing `(file, variant.tag)`, in plan order
/// (§4.3 — "share `(file, variant)` so a single worker can run all").
pub fn build_groups(tree: &SpecTree, plan: &[TestId]) -> VecDeque<TestGroupSpec> {
    let mut groups: VecDeque<TestGroupSpec> = VecDeque::new();
    let mut next_group_id: u64 = 0;

    for &test_id in plan {
        let test = tree.test(test_id);
        let spec = &tree.specs[test.spec];

        let continues_last = groups.back().is_some_and(|g| {
            g.file == spec.file && g.variant.tag == test.variant.tag && g.repeat_index == test.repeat_index
        });

        if continues_last {
            groups.back_mut().unwrap().test_ids.push(test_id);
        } else {
            groups.push_back(TestGroupSpec {
                group_id: next_group_id,
                file: spec.file.clone(),
                variant: test.variant.clone(),
                test_ids: vec![test_id],
                repeat_index: test.repeat_index,
                retry_index: 0,
            });
            next_group_id += 1;
        }
    }

    groups
}

/// Builds the `(classname, name, file)` triple JUnit needs for every test in
/// the plan.
pub fn build_test_meta(tree: &SpecTree, plan: &[TestId]) -> std::collections::HashMap<TestId, TestMeta> {
    let mut out = std::collections::HashMap::new();
    for &test_id in plan {
        let test = tree.test(test_id);
        let spec = &tree.specs[test.spec];
        let classname = tree
            .ancestors_outermost_first(spec.suite)
            .into_iter()
            .map(|s| tree.suites[s].title.clone())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(".");
        out.insert(
            test_id,
            TestMeta {
                file: spec.file.to_string_lossy().to_string(),
                classname: if classname.is_empty() {
                    spec.file.to_string_lossy().to_string()
                } else {
                    classname
                },
                name: spec.title.clone(),
            },
        );
    }
    out
}

/// End-to-end: build the tree, generate the plan, group it, and dispatch.
///
/// # Errors
/// Propagates discovery, generation (`forbid-only`, `no-tests`, bad `grep`),
/// or worker-pool spawn failures.
pub async fn run(config: &RunConfig, reporter: &dyn Reporter) -> Result<DispatchOutcome, RunnerError> {
    let started = Instant::now();
    let mut built = build_tree(config)?;
    for (path, err) in &built.load_failures {
        tracing::warn!(file = %path.display(), error = %err, "file failed to load");
    }

    let plan = generator::generate_plan(&mut built.tree, config)?;
    reporter.on_begin(plan.len()).await;

    let groups = build_groups(&built.tree, &plan);
    let outcome = dispatcher::run(config, groups, config.retries, reporter).await?;

    if matches!(outcome.stop_reason, dispatcher::StopReason::GlobalTimeout) {
        reporter.on_timeout().await;
    }

    let summary = summarize(&outcome, &built.tree, started.elapsed());
    reporter.on_end(&summary).await;

    Ok(outcome)
}

fn expected_to_fail(tree: &SpecTree, test_id: TestId) -> bool {
    tree.specs[tree.test(test_id).spec].expected_to_fail
}

fn summarize(outcome: &DispatchOutcome, tree: &SpecTree, duration: Duration) -> RunSummary {
    let mut summary = RunSummary {
        total: outcome.results.len(),
        duration,
        ..Default::default()
    };
    for (test_id, result) in &outcome.results {
        match result.status {
            crate::model::TestStatus::Passed => summary.passed += 1,
            crate::model::TestStatus::Skipped => summary.skipped += 1,
            crate::model::TestStatus::Failed | crate::model::TestStatus::TimedOut => {
                if expected_to_fail(tree, *test_id) && result.status == crate::model::TestStatus::Failed {
                    summary.passed += 1;
                } else {
                    summary.failed += 1;
                }
            }
        }
    }
    summary.flaky = outcome.flaky.len();
    summary
}

/// Translates a finished run into the process exit code (§7): `0` on a
/// clean pass, `1` for failures or a fatal config/generation error, `130`
/// for `SIGINT`.
pub fn exit_code(outcome: &DispatchOutcome, tree: &SpecTree) -> i32 {
    if matches!(outcome.stop_reason, dispatcher::StopReason::Sigint) {
        return 130;
    }
    if outcome.passed(|test_id| expected_to_fail(tree, test_id)) {
        0
    } else {
        1
    }
}

/// Exit code for a run that never got a [`DispatchOutcome`] at all —
/// `forbid-only`, `no-tests`, or any other pre-dispatch error.
pub fn exit_code_for_error(_err: &RunnerError) -> i32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::{load_file, test as register_test};
    use std::path::Path;
    use std::sync::Arc;

    fn noop_body() -> crate::model::SpecBody {
        Arc::new(|_s, _i| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn build_groups_splits_by_file_and_variant() {
        let mut tree = SpecTree::new();
        load_file(&mut tree, Path::new("a.test.js"), |cell| {
            register_test(cell, "one", 1, 1, noop_body()).unwrap();
        })
        .unwrap();
        load_file(&mut tree, Path::new("b.test.js"), |cell| {
            register_test(cell, "two", 1, 1, noop_body()).unwrap();
        })
        .unwrap();
        generator::expand_specs(&mut tree, &[], Duration::from_secs(1));

        let plan: Vec<TestId> = tree.tests.iter().map(|t| t.id).collect();
        let groups = build_groups(&tree, &plan);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].file, PathBuf::from("a.test.js"));
        assert_eq!(groups[1].file, PathBuf::from("b.test.js"));
    }

    #[test]
    fn build_test_meta_uses_spec_file_and_title() {
        let mut tree = SpecTree::new();
        load_file(&mut tree, Path::new("a.test.js"), |cell| {
            register_test(cell, "does a thing", 1, 1, noop_body()).unwrap();
        })
        .unwrap();
        generator::expand_specs(&mut tree, &[], Duration::from_secs(1));

        let plan: Vec<TestId> = tree.tests.iter().map(|t| t.id).collect();
        let meta = build_test_meta(&tree, &plan);
        assert_eq!(meta[&plan[0]].name, "does a thing");
        assert_eq!(meta[&plan[0]].file, "a.test.js");
    }
}
