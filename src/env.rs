//! Environment declarations and variant composition (`runWith`,
//! `declare`/`extend`).
//!
//! An [`Env`] exposes up to four lifecycle operations. A [`TestFactory`] is a
//! node in a DAG of env compositions: `declare`/`extend` produce a derived
//! factory whose hooks run outside the base's. At generation time the chain
//! from root to leaf is folded into a flat, ordered [`EnvChain`] — "a tagged
//! variant list, not prototype/inheritance" per the design notes.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

type StateBag = HashMap<String, serde_json::Value>;
type HookResult = Result<Option<StateBag>, String>;

/// One environment's lifecycle hooks. Any of the four may be absent.
#[derive(Clone, Default)]
pub struct Env {
    pub before_all: Option<Arc<dyn Fn(StateBag) -> BoxFuture<'static, HookResult> + Send + Sync>>,
    pub after_all: Option<Arc<dyn Fn(StateBag) -> BoxFuture<'static, Result<(), String>> + Send + Sync>>,
    pub before_each: Option<Arc<dyn Fn(StateBag) -> BoxFuture<'static, HookResult> + Send + Sync>>,
    pub after_each: Option<Arc<dyn Fn(StateBag) -> BoxFuture<'static, Result<(), String>> + Send + Sync>>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A single node in the `declare`/`extend` DAG: an optional [`Env`] plus a
/// link to the factory it extends.
#[derive(Clone, Default)]
pub struct TestFactory {
    pub env: Option<Env>,
    pub extends: Option<Arc<TestFactory>>,
}

impl TestFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a derived factory that composes `env` on top of `self`.
    pub fn extend(self: &Arc<Self>, env: Env) -> TestFactory {
        TestFactory {
            env: Some(env),
            extends: Some(Arc::clone(self)),
        }
    }

    /// Folds the chain from root to leaf (base-first) into an ordered list
    /// of envs to invoke. `beforeAll`/`beforeEach` run in this order;
    /// `afterAll`/`afterEach` run in reverse.
    pub fn resolve_chain(&self) -> EnvChain {
        let mut envs = Vec::new();
        let mut cursor = Some(self);
        let mut owned_chain: Vec<Arc<TestFactory>> = Vec::new();

        // Walk leaf -> root collecting owned Arc links so we can reverse.
        while let Some(factory) = cursor {
            if let Some(env) = &factory.env {
                envs.push(env.clone());
            }
            match &factory.extends {
                Some(parent) => {
                    owned_chain.push(Arc::clone(parent));
                    cursor = Some(owned_chain.last().unwrap().as_ref());
                }
                None => cursor = None,
            }
        }

        envs.reverse();
        EnvChain { envs }
    }
}

/// The resolved, flat list of envs for one variant, base (outermost) first.
pub struct EnvChain {
    pub envs: Vec<Env>,
}

/// A variant binding registered by `runWith`: which env, under what tag, and
/// how many times each spec bound to it repeats.
#[derive(Clone, Default)]
pub struct VariantBinding {
    pub factory: Arc<TestFactory>,
    pub tag: String,
    pub repeat_each: Option<u32>,
}

/// A compile-time-registered test factory, looked up by the tag a config
/// file's `runWith` binds to. Since factory closures can't cross the
/// parent↔worker process boundary, both sides resolve the same tag through
/// this registry independently rather than shipping the `Env` itself over
/// the wire — only the tag travels, inside [`crate::model::Variant`].
pub struct EnvModule {
    pub tag: &'static str,
    pub build: fn() -> Arc<TestFactory>,
}

inventory::collect!(EnvModule);

/// Declares a named env/test-factory and submits it to the compile-time
/// registry under `tag`.
///
/// ```ignore
/// register_env!("chromium", || std::sync::Arc::new(TestFactory {
///     env: Some(my_env()),
///     extends: None,
/// }));
/// ```
#[macro_export]
macro_rules! register_env {
    ($tag:expr, $build:expr) => {
        $crate::env::inventory::submit! {
            $crate::env::EnvModule {
                tag: $tag,
                build: $build,
            }
        }
    };
}

pub use inventory;

/// Resolves the [`EnvChain`] for a variant tag by looking it up in the
/// compile-time registry. An unregistered or empty tag resolves to an empty
/// chain — the default, env-less variant.
pub fn resolve_chain_for_tag(tag: &str) -> EnvChain {
    if tag.is_empty() {
        return EnvChain { envs: Vec::new() };
    }
    inventory::iter::<EnvModule>()
        .find(|m| m.tag == tag)
        .map(|m| (m.build)().resolve_chain())
        .unwrap_or(EnvChain { envs: Vec::new() })
}

/// Builds the [`VariantBinding`]s for a run from the configured `(tag,
/// repeat_each)` pairs, resolving each tag's factory through the compile-time
/// registry. A tag with no registered factory still produces a binding with
/// an empty chain (an env-less variant, distinguished from the default only
/// by its tag).
pub fn bindings_from_tags(tags: &[(String, Option<u32>)]) -> Vec<VariantBinding> {
    tags.iter()
        .map(|(tag, repeat_each)| {
            let factory = inventory::iter::<EnvModule>()
                .find(|m| &m.tag == tag)
                .map(|m| (m.build)())
                .unwrap_or_default();
            VariantBinding {
                factory,
                tag: tag.clone(),
                repeat_each: *repeat_each,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with_tag(tag: &'static str) -> Env {
        let mut e = Env::new();
        e.before_all = Some(Arc::new(move |mut state| {
            Box::pin(async move {
                state.insert("order".to_string(), serde_json::json!(tag));
                Ok(Some(state))
            })
        }));
        e
    }

    #[test]
    fn resolve_chain_is_base_first() {
        let base = Arc::new(TestFactory {
            env: Some(env_with_tag("base")),
            extends: None,
        });
        let derived = Arc::new(base.extend(env_with_tag("derived")));

        let chain = derived.resolve_chain();
        assert_eq!(chain.envs.len(), 2);
    }

    #[test]
    fn empty_factory_resolves_to_empty_chain() {
        let factory = TestFactory::new();
        let chain = factory.resolve_chain();
        assert!(chain.envs.is_empty());
    }
}
