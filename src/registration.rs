//! The author-facing registration surface: `describe`/`test`/hooks.
//!
//! Loading a test file is side-effectful: the file's top-level code calls
//! [`describe`], [`test`], and the hook functions below, and those calls must
//! land in the tree belonging to *that* file. We capture this "thread of
//! control" in a [`Loader`] installed in a thread-local slot for the
//! duration of one file's registration closure — the Rust analogue of the
//! scripting runtime's process-wide "currently loading file" variable.

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::model::{SpecBody, SpecId, SpecTree, SuiteId};

/// Errors raised by the registration surface.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// A hook or `test`/`describe` call happened while no file was loading.
    #[error("registration called outside of file loading")]
    PhaseViolation,
    /// A hook was registered from a file other than the one currently
    /// loading (i.e. from a shared helper module).
    #[error("hook can only be defined in a test file")]
    HookOutsideTestFile,
}

/// Holds the suite stack for one file's registration pass.
pub struct Loader {
    file: PathBuf,
    stack: Vec<SuiteId>,
}

impl Loader {
    fn new(file: PathBuf, root: SuiteId) -> Self {
        Self {
            file,
            stack: vec![root],
        }
    }

    fn top(&self) -> SuiteId {
        *self.stack.last().expect("suite stack is never empty")
    }
}

thread_local! {
    static ACTIVE: RefCell<Option<Loader>> = const { RefCell::new(None) };
}

/// Loads one test file: installs a fresh [`Loader`] over a new root suite,
/// runs `register` (the file's top-level registration code), then tears the
/// loader down. `register` typically closes over `tree` via interior
/// mutability exposed through the free functions in this module.
///
/// # Errors
/// Propagates any [`RegistrationError`] raised by `register`'s calls to
/// [`describe`]/[`test`]/hook functions.
pub fn load_file<F>(tree: &mut SpecTree, file: &Path, register: F) -> Result<(), RegistrationError>
where
    F: FnOnce(&RefCell<SpecTree>),
{
    let cell = RefCell::new(std::mem::take(tree));
    let root = cell.borrow_mut().new_root_suite(file.to_path_buf());

    ACTIVE.with(|active| {
        *active.borrow_mut() = Some(Loader::new(file.to_path_buf(), root));
    });

    register(&cell);

    ACTIVE.with(|active| {
        *active.borrow_mut() = None;
    });

    *tree = cell.into_inner();
    Ok(())
}

fn with_active<T>(
    f: impl FnOnce(&mut Loader) -> Result<T, RegistrationError>,
) -> Result<T, RegistrationError> {
    ACTIVE.with(|cell| {
        let mut guard = cell.borrow_mut();
        match guard.as_mut() {
            Some(loader) => f(loader),
            None => Err(RegistrationError::PhaseViolation),
        }
    })
}

/// Pushes a new suite titled `title`, runs `body` with it on top of the
/// stack, then pops it.
///
/// # Errors
/// [`RegistrationError::PhaseViolation`] if no file is currently loading.
pub fn describe(
    tree: &RefCell<SpecTree>,
    title: &str,
    body: impl FnOnce(&RefCell<SpecTree>),
) -> Result<SuiteId, RegistrationError> {
    let (parent, file) = with_active(|loader| Ok((loader.top(), loader.file.clone())))?;
    let suite = tree.borrow_mut().new_child_suite(parent, title.to_string(), file);

    ACTIVE.with(|cell| {
        cell.borrow_mut().as_mut().unwrap().stack.push(suite);
    });
    body(tree);
    ACTIVE.with(|cell| {
        cell.borrow_mut().as_mut().unwrap().stack.pop();
    });

    Ok(suite)
}

/// Appends a spec titled `title` to the suite on top of the stack.
///
/// # Errors
/// [`RegistrationError::PhaseViolation`] if no file is currently loading.
pub fn test(
    tree: &RefCell<SpecTree>,
    title: &str,
    line: u32,
    column: u32,
    body: SpecBody,
) -> Result<SpecId, RegistrationError> {
    let (suite, file) = with_active(|loader| Ok((loader.top(), loader.file.clone())))?;
    Ok(tree
        .borrow_mut()
        .new_spec(suite, title.to_string(), file, line, column, body))
}

/// Which hook bucket a registration call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    BeforeAll,
    AfterAll,
    BeforeEach,
    AfterEach,
}

/// Registers a hook of `kind` on the suite at the top of the stack.
///
/// # Errors
/// - [`RegistrationError::PhaseViolation`] if no file is loading.
/// - [`RegistrationError::HookOutsideTestFile`] if the calling file differs
///   from the file currently loading (a shared helper registering a hook on
///   behalf of another file).
pub fn hook(
    tree: &RefCell<SpecTree>,
    kind: HookKind,
    calling_file: &Path,
    line: u32,
    body: crate::model::HookBody,
) -> Result<(), RegistrationError> {
    let (suite, loading_file) =
        with_active(|loader| Ok((loader.top(), loader.file.clone())))?;

    if calling_file != loading_file {
        return Err(RegistrationError::HookOutsideTestFile);
    }

    let hook = crate::model::Hook {
        file: calling_file.to_path_buf(),
        line,
        body,
    };

    let mut tree = tree.borrow_mut();
    let bucket = &mut tree.suites[suite].hooks;
    match kind {
        HookKind::BeforeAll => bucket.before_all.push(hook),
        HookKind::AfterAll => bucket.after_all.push(hook),
        HookKind::BeforeEach => bucket.before_each.push(hook),
        HookKind::AfterEach => bucket.after_each.push(hook),
    }
    Ok(())
}

/// Marks the suite at the top of the stack as focused (`describe.only`).
///
/// # Errors
/// [`RegistrationError::PhaseViolation`] if no file is loading.
pub fn mark_suite_only(tree: &RefCell<SpecTree>) -> Result<(), RegistrationError> {
    let suite = with_active(|loader| Ok(loader.top()))?;
    tree.borrow_mut().suites[suite].focused = true;
    Ok(())
}

/// Marks a registered spec as focused, skipped, or expected-to-fail.
pub fn mark_spec(tree: &RefCell<SpecTree>, spec: SpecId, focused: bool, skipped: bool, expected_to_fail: bool) {
    let mut tree = tree.borrow_mut();
    let s = &mut tree.specs[spec];
    s.focused |= focused;
    s.skipped |= skipped;
    s.expected_to_fail |= expected_to_fail;
}

/// Marks the suite at the top of the stack as skipped (`describe.skip`).
///
/// # Errors
/// [`RegistrationError::PhaseViolation`] if no file is loading.
pub fn mark_suite_skip(tree: &RefCell<SpecTree>) -> Result<(), RegistrationError> {
    let suite = with_active(|loader| Ok(loader.top()))?;
    tree.borrow_mut().suites[suite].skipped = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SpecTree;
    use std::sync::Arc;

    fn noop_body() -> SpecBody {
        Arc::new(|_state, _info| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn registration_outside_load_fails() {
        let tree = RefCell::new(SpecTree::new());
        let err = test(&tree, "t", 1, 1, noop_body()).unwrap_err();
        assert!(matches!(err, RegistrationError::PhaseViolation));
    }

    #[test]
    fn describe_and_test_build_tree_under_active_loader() {
        let mut tree = SpecTree::new();
        load_file(&mut tree, Path::new("a.test.js"), |cell| {
            describe(cell, "group", |cell| {
                test(cell, "does x", 3, 1, noop_body()).unwrap();
            })
            .unwrap();
        })
        .unwrap();

        assert_eq!(tree.specs.len(), 1);
        assert_eq!(tree.spec_full_title(0), "group does x");
    }

    #[test]
    fn hook_from_other_file_is_rejected() {
        let mut tree = SpecTree::new();
        let result = load_file(&mut tree, Path::new("a.test.js"), |cell| {
            let body: crate::model::HookBody = Arc::new(|state| Box::pin(async move { Ok(state) }));
            let err = hook(cell, HookKind::BeforeEach, Path::new("helper.js"), 1, body).unwrap_err();
            assert!(matches!(err, RegistrationError::HookOutsideTestFile));
        });
        assert!(result.is_ok());
    }
}
