//! Tracks which namespaces are watched and owns the informer set of each.
//!
//! The registry is always in exactly one of three states: *empty*, *explicit*
//! (one or more named namespaces), or *catch-all* (only the distinguished
//! [`ALL_NAMESPACES`] key). Cross-transitions between explicit and catch-all
//! are rejected; the caller decides how to surface that.

use std::collections::HashMap;
use std::sync::Arc;

use snafu::Snafu;

use crate::informer::InformerSet;

/// Distinguished registry key meaning "all namespaces".
pub const ALL_NAMESPACES: &str = "";

#[derive(Debug, Snafu)]
pub enum RegistryError {
    #[snafu(display("cannot watch namespace \"{namespace}\": all namespaces are already watched"))]
    AlreadyWatchingAll { namespace: String },
    #[snafu(display("cannot watch all namespaces: specific namespaces are already watched"))]
    AlreadyWatchingSpecific,
    #[snafu(display("namespace \"{namespace}\" is not watched"))]
    NotWatched { namespace: String },
    #[snafu(display("watching namespaces by label requires an empty registry"))]
    NotEmpty,
}

#[derive(Default)]
pub struct Registry {
    sets: HashMap<String, Arc<InformerSet>>,
}

impl Registry {
    /// Registers `namespace`, building its informer set with `make` when it
    /// is not already present. Returns the set and whether it was created.
    pub fn insert_with(
        &mut self,
        namespace: &str,
        make: impl FnOnce() -> Arc<InformerSet>,
    ) -> Result<(Arc<InformerSet>, bool), RegistryError> {
        if namespace == ALL_NAMESPACES {
            if !self.sets.is_empty() && !self.sets.contains_key(ALL_NAMESPACES) {
                return AlreadyWatchingSpecificSnafu.fail();
            }
        } else if self.sets.contains_key(ALL_NAMESPACES) {
            return AlreadyWatchingAllSnafu { namespace }.fail();
        }
        if let Some(existing) = self.sets.get(namespace) {
            return Ok((Arc::clone(existing), false));
        }
        let set = make();
        self.sets.insert(namespace.to_string(), Arc::clone(&set));
        Ok((set, true))
    }

    pub fn remove(&mut self, namespace: &str) -> Result<Arc<InformerSet>, RegistryError> {
        self.sets
            .remove(namespace)
            .ok_or_else(|| RegistryError::NotWatched {
                namespace: namespace.to_string(),
            })
    }

    /// The informer set responsible for `namespace`. Under catch-all every
    /// namespace resolves to the [`ALL_NAMESPACES`] set.
    pub fn resolve(&self, namespace: &str) -> Option<Arc<InformerSet>> {
        if let Some(all) = self.sets.get(ALL_NAMESPACES) {
            return Some(Arc::clone(all));
        }
        self.sets.get(namespace).cloned()
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.sets.contains_key(namespace)
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn sets(&self) -> impl Iterator<Item = &Arc<InformerSet>> {
        self.sets.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::informer::testing::{empty_informer_set, NullSink};
    use crate::informer::EventSink;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        registry: Registry,
        sink: Arc<dyn EventSink>,
        stop: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: Registry::default(),
                sink: Arc::new(NullSink),
                stop: CancellationToken::new(),
            }
        }

        fn add(&mut self, namespace: &str) -> Result<(Arc<InformerSet>, bool), RegistryError> {
            let sink = Arc::downgrade(&self.sink);
            let stop = self.stop.clone();
            self.registry
                .insert_with(namespace, || empty_informer_set(namespace, sink, &stop))
        }
    }

    #[tokio::test]
    async fn explicit_namespaces_reject_catch_all() {
        let mut fixture = Fixture::new();
        fixture.add("demo").unwrap();
        fixture.add("other").unwrap();
        assert!(matches!(
            fixture.add(ALL_NAMESPACES),
            Err(RegistryError::AlreadyWatchingSpecific)
        ));
    }

    #[tokio::test]
    async fn catch_all_rejects_explicit_namespaces() {
        let mut fixture = Fixture::new();
        fixture.add(ALL_NAMESPACES).unwrap();
        assert!(matches!(
            fixture.add("demo"),
            Err(RegistryError::AlreadyWatchingAll { .. })
        ));
    }

    #[tokio::test]
    async fn catch_all_into_empty_registry_succeeds() {
        let mut fixture = Fixture::new();
        let (_, created) = fixture.add(ALL_NAMESPACES).unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn adding_a_present_namespace_returns_the_existing_set() {
        let mut fixture = Fixture::new();
        let (first, created) = fixture.add("demo").unwrap();
        assert!(created);
        let (second, created) = fixture.add("demo").unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn removing_an_absent_namespace_fails() {
        let mut fixture = Fixture::new();
        assert!(matches!(
            fixture.registry.remove("demo"),
            Err(RegistryError::NotWatched { .. })
        ));
    }

    #[tokio::test]
    async fn removing_the_last_namespace_empties_the_registry() {
        let mut fixture = Fixture::new();
        fixture.add("demo").unwrap();
        fixture.registry.remove("demo").unwrap();
        assert!(fixture.registry.is_empty());
        // empty again, so catch-all is allowed now
        assert!(fixture.add(ALL_NAMESPACES).is_ok());
    }

    #[tokio::test]
    async fn resolve_uses_the_catch_all_set_for_any_namespace() {
        let mut fixture = Fixture::new();
        let (all, _) = fixture.add(ALL_NAMESPACES).unwrap();
        let resolved = fixture.registry.resolve("demo").unwrap();
        assert!(Arc::ptr_eq(&all, &resolved));
    }

    #[tokio::test]
    async fn resolve_is_exact_for_explicit_namespaces() {
        let mut fixture = Fixture::new();
        fixture.add("demo").unwrap();
        assert!(fixture.registry.resolve("demo").is_some());
        assert!(fixture.registry.resolve("other").is_none());
    }
}
