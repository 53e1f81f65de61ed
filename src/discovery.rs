//! Filesystem discovery of test and fixture files.
//!
//! A gitignore-aware recursive walk of the configured test directory,
//! narrowed by a match/ignore glob pair, then narrowed again by positional
//! substring filters on the path. Fixture files (matched by a second,
//! independent glob pair) are returned separately so the runner façade can
//! load them strictly before test files, per §6.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use thiserror::Error;

/// Errors raised while building glob matchers or walking the test directory.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid glob pattern '{pattern}': {source}")]
    BadGlob {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

/// The discovered files for one run: fixtures first, then test files, both
/// in deterministic (sorted) order.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredFiles {
    pub fixtures: Vec<PathBuf>,
    pub tests: Vec<PathBuf>,
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet, DiscoveryError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| DiscoveryError::BadGlob {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| DiscoveryError::BadGlob {
        pattern: patterns.join(","),
        source,
    })
}

/// Walks `root` honoring `.gitignore`, collecting every regular file whose
/// relative path matches `match_globs` and none of `ignore_globs`.
fn walk_matching(
    root: &Path,
    match_globs: &[String],
    ignore_globs: &[String],
) -> Result<Vec<PathBuf>, DiscoveryError> {
    let matcher = build_glob_set(match_globs)?;
    let excluder = build_glob_set(ignore_globs)?;

    let mut found = Vec::new();
    for entry in WalkBuilder::new(root).standard_filters(true).build() {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if matcher.is_match(relative) && !excluder.is_match(relative) {
            found.push(path.to_path_buf());
        }
    }
    found.sort();
    Ok(found)
}

/// Discovers fixture files, then test files, under `root`, applying the
/// match/ignore glob pairs and the positional substring `name_filters`
/// against each test file's path.
///
/// # Errors
/// [`DiscoveryError::BadGlob`] if any configured pattern fails to compile.
pub fn discover(
    root: &Path,
    test_match: &[String],
    test_ignore: &[String],
    fixture_match: &[String],
    fixture_ignore: &[String],
    name_filters: &[String],
) -> Result<DiscoveredFiles, DiscoveryError> {
    let fixtures = walk_matching(root, fixture_match, fixture_ignore)?;

    let mut tests = walk_matching(root, test_match, test_ignore)?;
    if !name_filters.is_empty() {
        tests.retain(|p| {
            let s = p.to_string_lossy();
            name_filters.iter().any(|f| s.contains(f.as_str()))
        });
    }

    Ok(DiscoveredFiles { fixtures, tests })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn discovers_matching_files_and_skips_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.join("a.test.rs"), "").unwrap();
        fs::write(dir.join("b.test.rs"), "").unwrap();
        fs::write(dir.join("c.skip.test.rs"), "").unwrap();
        fs::write(dir.join("readme.md"), "").unwrap();

        let found = discover(
            &dir,
            &["**/*.test.rs".to_string()],
            &["**/*.skip.test.rs".to_string()],
            &[],
            &[],
            &[],
        )
        .unwrap();

        assert_eq!(found.tests.len(), 2);
    }

    #[test]
    fn fixtures_and_tests_are_discovered_independently() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.join("env.fixture.rs"), "").unwrap();
        fs::write(dir.join("a.test.rs"), "").unwrap();

        let found = discover(
            &dir,
            &["**/*.test.rs".to_string()],
            &[],
            &["**/*.fixture.rs".to_string()],
            &[],
            &[],
        )
        .unwrap();

        assert_eq!(found.fixtures.len(), 1);
        assert_eq!(found.tests.len(), 1);
    }

    #[test]
    fn name_filters_keep_only_matching_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.join("auth.test.rs"), "").unwrap();
        fs::write(dir.join("billing.test.rs"), "").unwrap();

        let found = discover(
            &dir,
            &["**/*.test.rs".to_string()],
            &[],
            &[],
            &[],
            &["auth".to_string()],
        )
        .unwrap();

        assert_eq!(found.tests.len(), 1);
        assert!(found.tests[0].to_string_lossy().contains("auth"));
    }
}
