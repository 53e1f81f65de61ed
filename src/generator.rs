//! Expands the spec tree into the flat, filtered, deterministically ordered
//! list of [`Test`](crate::model::Test)s that the dispatcher will run.

use std::time::Duration;

use regex::Regex;
use thiserror::Error;

use crate::config::RunConfig;
use crate::env::VariantBinding;
use crate::model::{SpecId, SpecTree, TestId, Variant};

/// Why generation did not produce a runnable plan.
#[derive(Debug, Error)]
pub enum GenerateError {
    /// `--forbid-only` was set and a focus mark (`only`) was found.
    #[error("--forbid-only set and a focused test or suite exists")]
    ForbidOnly,
    /// The resulting test list was empty after filtering.
    #[error("no tests matched the given filters")]
    NoTests,
    /// `--grep` held an unparsable `/pattern/flags` literal.
    #[error("invalid grep pattern: {0}")]
    BadGrep(#[from] regex::Error),
}

/// Expands every spec into its bound variants × `repeat_each`, in
/// depth-first pre-order, and populates `tree.tests`/`spec.tests`.
pub fn expand_specs(
    tree: &mut SpecTree,
    bindings: &[VariantBinding],
    default_timeout: Duration,
) {
    let spec_ids: Vec<SpecId> = (0..tree.specs.len()).collect();
    for spec_id in spec_ids {
        if bindings.is_empty() {
            expand_one(tree, spec_id, Variant::default(), 1, default_timeout);
            continue;
        }
        for binding in bindings {
            let repeat = binding.repeat_each.unwrap_or(1).max(1);
            let variant = Variant {
                tag: binding.tag.clone(),
                dict: Default::default(),
            };
            expand_one(tree, spec_id, variant, repeat, default_timeout);
        }
    }
}

fn expand_one(
    tree: &mut SpecTree,
    spec_id: SpecId,
    variant: Variant,
    repeat_each: u32,
    timeout: Duration,
) {
    for repeat_index in 0..repeat_each {
        tree.new_test(spec_id, variant.clone(), repeat_index, timeout);
    }
}

/// Produces the final, filtered, ordered list of test ids to dispatch.
///
/// Filters are applied in the order the spec requires: focus, skip
/// propagation, grep, shard, then name filters.
///
/// # Errors
/// [`GenerateError::ForbidOnly`] / [`GenerateError::NoTests`] /
/// [`GenerateError::BadGrep`] per the conditions documented on each variant.
pub fn generate_plan(tree: &mut SpecTree, config: &RunConfig) -> Result<Vec<TestId>, GenerateError> {
    let any_focused = tree.suites.iter().any(|s| s.focused) || tree.specs.iter().any(|s| s.focused);
    if config.forbid_only && any_focused {
        return Err(GenerateError::ForbidOnly);
    }

    // Depth-first pre-order over root suites (suites with no parent), by
    // file path then declaration order, collecting every test id.
    let mut ordered_specs: Vec<SpecId> = Vec::new();
    let mut roots: Vec<usize> = tree
        .suites
        .iter()
        .enumerate()
        .filter(|(_, s)| s.parent.is_none())
        .map(|(i, _)| i)
        .collect();
    roots.sort_by(|a, b| tree.suites[*a].file.cmp(&tree.suites[*b].file));
    for root in roots {
        walk_suite(tree, root, &mut ordered_specs);
    }

    // Skip propagation (step 2) does not remove tests from the plan — a
    // skipped spec is still dispatched and reported, just with status
    // `skipped` (see `is_spec_skipped`, consulted by the worker runtime).

    // Focus: if anything is focused, keep only specs transitively inside a
    // focused suite or themselves focused.
    let keep_spec = |tree: &SpecTree, spec_id: SpecId| -> bool {
        if !any_focused {
            return true;
        }
        let spec = &tree.specs[spec_id];
        if spec.focused {
            return true;
        }
        tree.ancestors_innermost_first(spec.suite)
            .into_iter()
            .any(|s| tree.suites[s].focused)
    };

    let grep = config
        .grep
        .as_deref()
        .map(compile_grep)
        .transpose()?;

    let mut test_order: Vec<TestId> = Vec::new();
    for &spec_id in &ordered_specs {
        if !keep_spec(tree, spec_id) {
            continue;
        }
        if let Some(grep) = &grep {
            let full_title = tree.spec_full_title(spec_id);
            if !grep.is_match(&full_title) {
                continue;
            }
        }
        if !config.name_filters.is_empty() {
            let file = tree.specs[spec_id].file.to_string_lossy().to_string();
            if !config
                .name_filters
                .iter()
                .any(|f| file.contains(f.as_str()))
            {
                continue;
            }
        }
        for &test_id in &tree.specs[spec_id].tests {
            test_order.push(test_id);
        }
    }

    // Shard: keep tests whose global index (post-filter, pre-dispatch)
    // satisfies index % total == current - 1 (shard is 1-based per §6).
    let final_order: Vec<TestId> = if let Some((current, total)) = config.shard {
        test_order
            .into_iter()
            .enumerate()
            .filter(|(i, _)| (*i as u32) % total == current.saturating_sub(1))
            .map(|(_, id)| id)
            .collect()
    } else {
        test_order
    };

    if final_order.is_empty() {
        return Err(GenerateError::NoTests);
    }

    Ok(final_order)
}

fn walk_suite(tree: &SpecTree, suite_id: usize, out: &mut Vec<SpecId>) {
    let suite = &tree.suites[suite_id];
    for &spec_id in &suite.specs {
        out.push(spec_id);
    }
    for &child in &suite.children {
        walk_suite(tree, child, out);
    }
}

/// Accepts a bare substring or a `/pattern/flags` literal (`i` = case
/// insensitive is the only flag recognized).
fn compile_grep(pattern: &str) -> Result<Regex, regex::Error> {
    if let Some(rest) = pattern.strip_prefix('/') {
        if let Some(end) = rest.rfind('/') {
            let body = &rest[..end];
            let flags = &rest[end + 1..];
            let case_insensitive = flags.contains('i');
            return regex::RegexBuilder::new(body)
                .case_insensitive(case_insensitive)
                .build();
        }
    }
    Regex::new(&regex::escape(pattern))
}

/// Whether a test's spec and suite chain is skipped, consulted by the
/// worker runtime before running a test body.
pub fn is_spec_skipped(tree: &SpecTree, spec_id: SpecId) -> bool {
    let spec = &tree.specs[spec_id];
    spec.skipped
        || tree
            .ancestors_innermost_first(spec.suite)
            .into_iter()
            .any(|s| tree.suites[s].skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::{describe, load_file, test as register_test};
    use std::sync::Arc;

    fn noop_body() -> crate::model::SpecBody {
        Arc::new(|_s, _i| Box::pin(async { Ok(()) }))
    }

    fn sample_tree() -> SpecTree {
        let mut tree = SpecTree::new();
        load_file(&mut tree, std::path::Path::new("a.test.js"), |cell| {
            register_test(cell, "one", 1, 1, noop_body()).unwrap();
            register_test(cell, "two", 2, 1, noop_body()).unwrap();
        })
        .unwrap();
        expand_specs(&mut tree, &[], Duration::from_secs(30));
        tree
    }

    #[test]
    fn no_tests_errors_when_all_filtered_out() {
        let mut tree = sample_tree();
        let config = RunConfig {
            name_filters: vec!["nonexistent".to_string()],
            ..Default::default()
        };
        let result = generate_plan(&mut tree, &config);
        assert!(matches!(result, Err(GenerateError::NoTests)));
    }

    #[test]
    fn grep_filters_by_full_title() {
        let mut tree = sample_tree();
        let config = RunConfig {
            grep: Some("two".to_string()),
            ..Default::default()
        };
        let plan = generate_plan(&mut tree, &config).unwrap();
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn shard_partitions_disjointly() {
        let mut tree = sample_tree();
        let mut all = Vec::new();
        for current in 1..=2 {
            let mut t = sample_tree();
            let config = RunConfig {
                shard: Some((current, 2)),
                ..Default::default()
            };
            let plan = generate_plan(&mut t, &config).unwrap();
            all.extend(plan);
        }
        let base = generate_plan(&mut tree, &RunConfig::default()).unwrap();
        assert_eq!(all.len(), base.len());
    }

    #[test]
    fn focus_keeps_only_focused_specs() {
        let mut tree = SpecTree::new();
        load_file(&mut tree, std::path::Path::new("a.test.js"), |cell| {
            describe(cell, "a", |cell| {
                let id = register_test(cell, "b", 1, 1, noop_body()).unwrap();
                crate::registration::mark_spec(cell, id, true, false, false);
                register_test(cell, "c", 2, 1, noop_body()).unwrap();
            })
            .unwrap();
        })
        .unwrap();
        expand_specs(&mut tree, &[], Duration::from_secs(30));

        let plan = generate_plan(&mut tree, &RunConfig::default()).unwrap();
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn compile_grep_parses_regex_literal_with_flags() {
        let re = compile_grep("/FOO/i").unwrap();
        assert!(re.is_match("a foo b"));
    }
}
