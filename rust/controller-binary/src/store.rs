//! Concurrency-safe, ordered store of virtual-server configurations.
//!
//! All mutations are serialized by one exclusive lock. The guard is exposed
//! so callers can compound reads with writes, and so emission can observe a
//! consistent snapshot; the convenience methods on [`VirtualServerStore`]
//! lock per operation.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::{Mutex, MutexGuard};

use crate::config::{ServiceKey, VirtualServerConfig};

/// Map of (service key, virtual-server name) to configuration. Two entries
/// may share a [`ServiceKey`] and differ by name. Iteration is in key order
/// (namespace, service, port, name), which is the emission order.
#[derive(Debug, Default)]
pub struct VirtualServerMap {
    entries: BTreeMap<(ServiceKey, String), VirtualServerConfig>,
}

impl VirtualServerMap {
    pub fn get(&self, key: &ServiceKey, name: &str) -> Option<&VirtualServerConfig> {
        self.entries.get(&(key.clone(), name.to_string()))
    }

    /// Inserts or replaces the entry for (`key`, `name`).
    pub fn assign(&mut self, key: ServiceKey, name: impl Into<String>, cfg: VirtualServerConfig) {
        self.entries.insert((key, name.into()), cfg);
    }

    /// Returns whether an entry existed.
    pub fn remove(&mut self, key: &ServiceKey, name: &str) -> bool {
        self.entries.remove(&(key.clone(), name.to_string())).is_some()
    }

    /// Drops every entry in `namespace`; returns how many were dropped.
    pub fn remove_namespace(&mut self, namespace: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(key, _), _| key.namespace != namespace);
        before - self.entries.len()
    }

    /// Snapshot of the entries backing (`namespace`, `service_name`), indexed
    /// by service port. The stored virtual-server name travels along so
    /// leftover entries can be deleted precisely.
    pub fn virtual_servers_for_service(
        &self,
        namespace: &str,
        service_name: &str,
    ) -> HashMap<i32, (String, VirtualServerConfig)> {
        self.entries
            .iter()
            .filter(|((key, _), _)| key.namespace == namespace && key.service_name == service_name)
            .map(|((key, name), cfg)| (key.service_port, (name.clone(), cfg.clone())))
            .collect()
    }

    /// Visits every entry in emission order. The visitor only sees shared
    /// references and cannot re-enter mutation.
    pub fn for_each(&self, mut visit: impl FnMut(&ServiceKey, &str, &VirtualServerConfig)) {
        for ((key, name), cfg) in &self.entries {
            visit(key, name, cfg);
        }
    }

    pub fn for_each_mut(&mut self, mut visit: impl FnMut(&ServiceKey, &str, &mut VirtualServerConfig)) {
        for ((key, name), cfg) in &mut self.entries {
            visit(key, name, cfg);
        }
    }

    /// Active entries in emission order.
    pub fn active(&self) -> impl Iterator<Item = &VirtualServerConfig> {
        self.entries.values().filter(|cfg| cfg.meta_data.active)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct VirtualServerStore {
    inner: Mutex<VirtualServerMap>,
}

impl VirtualServerStore {
    /// Exclusive guard over the whole map, for compound operations and for
    /// holding the store stable across an emission.
    pub async fn lock(&self) -> MutexGuard<'_, VirtualServerMap> {
        self.inner.lock().await
    }

    pub async fn get(&self, key: &ServiceKey, name: &str) -> Option<VirtualServerConfig> {
        self.inner.lock().await.get(key, name).cloned()
    }

    pub async fn assign(&self, key: ServiceKey, name: impl Into<String>, cfg: VirtualServerConfig) {
        self.inner.lock().await.assign(key, name, cfg);
    }

    pub async fn remove(&self, key: &ServiceKey, name: &str) -> bool {
        self.inner.lock().await.remove(key, name)
    }
}
