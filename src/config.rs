//! Configuration loading and schema for the runner.
//!
//! Settings live in an optional TOML file and are overridden field-by-field
//! by CLI flags (see [`crate::cli`]). Every field has a default so an empty
//! file, or no file at all, produces a usable [`RunConfig`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A 1-based shard selector `(current, total)`.
pub type Shard = (u32, u32);

/// A configured `runWith` binding: which registered env tag to run every
/// spec under, and how many times each spec bound to it repeats.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunWithEntry {
    pub tag: String,
    pub repeat_each: Option<u32>,
}

/// Fully resolved run configuration: TOML file contents merged with CLI
/// overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Root directory to discover test files from.
    pub test_dir: PathBuf,
    /// Size of the worker pool. Default: `max(1, num_cpus / 2)`.
    pub workers: usize,
    /// Default per-test timeout in milliseconds.
    pub timeout_ms: u64,
    /// Whole-run deadline in milliseconds. `0` means no deadline.
    pub global_timeout_ms: u64,
    /// Maximum retry attempts for a failed or timed-out test.
    pub retries: u32,
    /// Number of times to repeat each spec.
    pub repeat_each: u32,
    /// Stop dispatching once this many tests have failed.
    pub max_failures: Option<u32>,
    /// Abort with `forbid-only` if any focus mark (`only`) is present.
    pub forbid_only: bool,
    /// Suppress worker stdio forwarding to the console reporter.
    pub quiet: bool,
    /// Only generate and print the plan; do not run anything.
    pub list_only: bool,
    /// `grep` filter: bare substring, or `/pattern/flags` for regex.
    pub grep: Option<String>,
    /// Shard selector.
    pub shard: Option<Shard>,
    /// Positional substring filters on test file paths.
    pub name_filters: Vec<String>,
    /// Artifact root directory.
    pub output_dir: PathBuf,
    /// Comma-separated reporter names, in registration order.
    pub reporters: Vec<String>,
    /// Glob patterns identifying test files.
    pub test_match: Vec<String>,
    /// Glob patterns excluding otherwise-matched test files.
    pub test_ignore: Vec<String>,
    /// Glob patterns identifying fixture files, loaded before test files.
    pub fixture_match: Vec<String>,
    /// Glob patterns excluding otherwise-matched fixture files.
    pub fixture_ignore: Vec<String>,
    /// Snapshot root, relative to `test_dir`.
    pub snapshot_dir: PathBuf,
    /// Rewrite snapshots on mismatch instead of failing.
    pub update_snapshots: bool,
    /// Environment variables forwarded to every worker process.
    pub env: HashMap<String, String>,
    /// Path to the JUnit XML file, when the `junit` reporter is active.
    pub junit_file: PathBuf,
    /// Variant bindings every spec runs under, resolved through the
    /// compile-time env registry (`[ADD]` simplification of `runWith`: see
    /// DESIGN.md — bindings are run-global rather than per-spec since a test
    /// file registering its own `runWith` would need a dynamic-import
    /// analogue this crate does not have).
    pub run_with: Vec<RunWithEntry>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            test_dir: PathBuf::from("."),
            workers: default_workers(),
            timeout_ms: 30_000,
            global_timeout_ms: 0,
            retries: 0,
            repeat_each: 1,
            max_failures: None,
            forbid_only: false,
            quiet: false,
            list_only: false,
            grep: None,
            shard: None,
            name_filters: Vec::new(),
            output_dir: PathBuf::from("test-results"),
            reporters: vec!["console".to_string()],
            test_match: vec!["**/*.test.*".to_string()],
            test_ignore: Vec::new(),
            fixture_match: vec!["**/*.fixture.*".to_string()],
            fixture_ignore: Vec::new(),
            snapshot_dir: PathBuf::from("__snapshots__"),
            update_snapshots: false,
            env: HashMap::new(),
            junit_file: PathBuf::from("test-results/junit.xml"),
            run_with: Vec::new(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| (n.get() / 2).max(1))
        .unwrap_or(1)
}

/// Loads a [`RunConfig`] from a TOML file.
///
/// Missing files are not an error at this layer — callers that want a config
/// file to be mandatory should check existence themselves; this function is
/// also used to load optional `runner.toml` files that fall back to defaults.
///
/// # Errors
///
/// Returns an error if the file exists but contains invalid TOML or fields
/// that don't match the schema.
pub fn load_config(path: &Path) -> Result<RunConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    load_config_str(&content)
}

/// Loads a [`RunConfig`] from a TOML string, expanding `${VAR}` references
/// in the `[env]` table.
///
/// # Example
///
/// ```
/// use corral::config::load_config_str;
///
/// let config = load_config_str(r#"
///     workers = 4
///     retries = 2
/// "#).unwrap();
///
/// assert_eq!(config.workers, 4);
/// assert_eq!(config.retries, 2);
/// ```
pub fn load_config_str(content: &str) -> Result<RunConfig> {
    let mut config: RunConfig = toml::from_str(content).context("failed to parse config")?;
    expand_env_hashmap(&mut config.env)?;
    Ok(config)
}

/// Expands `${VAR}` / `${VAR:-default}` / `$$` references in a string value.
///
/// # Errors
/// Returns an error if a required variable is not set.
fn expand_env_value(value: &str) -> Result<String, String> {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }

        match chars.peek() {
            Some('$') => {
                chars.next();
                result.push('$');
            }
            Some('{') => {
                chars.next();

                let mut var_content = String::new();
                let mut found_close = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        found_close = true;
                        break;
                    }
                    var_content.push(c);
                }

                if !found_close {
                    return Err(format!("unclosed variable reference: ${{{var_content}"));
                }

                let (var_name, default_value) = if let Some(idx) = var_content.find(":-") {
                    let (name, rest) = var_content.split_at(idx);
                    (name, Some(&rest[2..]))
                } else {
                    (var_content.as_str(), None)
                };

                if var_name.is_empty() {
                    return Err("empty variable name in ${}".to_string());
                }

                match std::env::var(var_name) {
                    Ok(val) => result.push_str(&val),
                    Err(_) => match default_value {
                        Some(default) => result.push_str(default),
                        None => {
                            return Err(format!(
                                "required environment variable not set: {var_name}"
                            ));
                        }
                    },
                }
            }
            _ => result.push('$'),
        }
    }

    Ok(result)
}

fn expand_env_hashmap(env: &mut HashMap<String, String>) -> Result<()> {
    for (key, value) in env.iter_mut() {
        *value = expand_env_value(value)
            .map_err(|e| anyhow::anyhow!("failed to expand env var '{key}': {e}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = RunConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.retries, 0);
        assert_eq!(config.reporters, vec!["console".to_string()]);
    }

    #[test]
    fn load_config_str_overrides_fields() {
        let config = load_config_str(
            r#"
            workers = 8
            retries = 3
            timeout_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.retries, 3);
        assert_eq!(config.timeout_ms, 5000);
    }

    #[test]
    fn load_config_str_rejects_bad_toml() {
        assert!(load_config_str("not valid = = toml").is_err());
    }

    #[test]
    fn expand_env_value_escaped_dollar() {
        assert_eq!(expand_env_value("price is $$100").unwrap(), "price is $100");
    }

    #[test]
    fn expand_env_value_default_used_when_unset() {
        let result = expand_env_value("${_CORRAL_TEST_MISSING:-fallback}").unwrap();
        assert_eq!(result, "fallback");
    }

    #[test]
    fn expand_env_value_unset_without_default_errors() {
        let result = expand_env_value("${_CORRAL_TEST_NONEXISTENT_VAR}");
        assert!(result.is_err());
    }

    #[test]
    fn expand_env_hashmap_applies_to_every_entry() {
        let mut env = HashMap::new();
        env.insert("A".to_string(), "${_CORRAL_TEST_MISSING:-x}".to_string());
        expand_env_hashmap(&mut env).unwrap();
        assert_eq!(env.get("A").unwrap(), "x");
    }
}
