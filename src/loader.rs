//! Maps a discovered file path to the Rust function that registers its
//! specs, standing in for a scripting runtime's dynamic `import`.
//!
//! Rust has no runtime `import`: a "test file" here is a plain function,
//! written alongside the suites it declares, submitted at compile time via
//! [`inventory::submit!`] through the [`register_test_file!`] macro. Loading
//! a file at runtime (§4.1, §4.5) means looking up its registered function
//! by path and invoking it with the [`crate::registration`] Loader slot
//! installed — the inventory collection plays the role of the scripting
//! runtime's module cache.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::model::SpecTree;
use crate::registration::{self, RegistrationError};

/// One compile-time-registered test or fixture file: its logical path and
/// the function that declares its suites/specs/hooks when loaded.
pub struct FileModule {
    pub path: &'static str,
    pub register: fn(&RefCell<SpecTree>),
}

inventory::collect!(FileModule);

/// Declares a file module and submits it to the compile-time registry.
///
/// ```ignore
/// register_test_file!("demos/basic.rs", |tree| {
///     test(tree, "adds", 1, 1, body).unwrap();
/// });
/// ```
#[macro_export]
macro_rules! register_test_file {
    ($path:expr, $body:expr) => {
        $crate::loader::inventory::submit! {
            $crate::loader::FileModule {
                path: $path,
                register: $body,
            }
        }
    };
}

pub use inventory;

/// Errors from resolving or loading a discovered file.
#[derive(Debug, Error)]
pub enum LoadError {
    /// No compile-time module was registered for this path; the scripting
    /// runtime's analogue is an `import` that 404s.
    #[error("no test module registered for {0}")]
    NotFound(PathBuf),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// Builds a path → loader-function lookup from every compile-time
/// registered [`FileModule`].
pub fn registry() -> HashMap<PathBuf, fn(&RefCell<SpecTree>)> {
    inventory::iter::<FileModule>()
        .map(|m| (PathBuf::from(m.path), m.register))
        .collect()
}

/// Loads one discovered file into `tree`, looking up its registration
/// function by path and running it under the [`registration`] Loader.
///
/// # Errors
/// [`LoadError::NotFound`] if no module was registered for `path`;
/// [`LoadError::Registration`] if the file's registration calls violate
/// the load-phase invariants (§4.1).
pub fn load_one(
    tree: &mut SpecTree,
    registry: &HashMap<PathBuf, fn(&RefCell<SpecTree>)>,
    path: &Path,
) -> Result<(), LoadError> {
    let register = registry
        .get(path)
        .copied()
        .ok_or_else(|| LoadError::NotFound(path.to_path_buf()))?;
    registration::load_file(tree, path, register)?;
    Ok(())
}

/// Loads every fixture file, then every test file, in the order [`discover`](crate::discovery::discover)
/// returned them, accumulating every [`Spec`](crate::model::Spec)/[`Suite`](crate::model::Suite) into one [`SpecTree`].
///
/// A file with no registered module does not abort the whole run: it is
/// recorded so the caller can synthesize a failing test for it (`LoadError`
/// policy, §7), matching the scripting runtime's behavior when one file
/// fails to `import` without taking down the rest of the suite.
pub fn load_all(
    fixtures: &[PathBuf],
    tests: &[PathBuf],
) -> (SpecTree, Vec<(PathBuf, LoadError)>) {
    let reg = registry();
    let mut tree = SpecTree::new();
    let mut failures = Vec::new();

    for path in fixtures.iter().chain(tests.iter()) {
        if let Err(e) = load_one(&mut tree, &reg, path) {
            failures.push((path.clone(), e));
        }
    }

    (tree, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn noop_body() -> crate::model::SpecBody {
        Arc::new(|_s, _i| Box::pin(async { Ok(()) }))
    }

    register_test_file!("loader-test-fixture.rs", |tree| {
        crate::registration::test(tree, "registered via inventory", 1, 1, noop_body()).unwrap();
    });

    #[test]
    fn registry_contains_compile_time_submitted_modules() {
        let reg = registry();
        assert!(reg.contains_key(Path::new("loader-test-fixture.rs")));
    }

    #[test]
    fn load_one_reports_not_found_for_unregistered_path() {
        let mut tree = SpecTree::new();
        let reg = registry();
        let err = load_one(&mut tree, &reg, Path::new("nope.rs")).unwrap_err();
        assert!(matches!(err, LoadError::NotFound(_)));
    }

    #[test]
    fn load_all_loads_registered_files_and_records_missing_ones() {
        let (tree, failures) = load_all(&[], &[
            PathBuf::from("loader-test-fixture.rs"),
            PathBuf::from("missing.rs"),
        ]);
        assert_eq!(tree.specs.len(), 1);
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0].1, LoadError::NotFound(_)));
    }
}
