//! Core reconciliation: watches ConfigMaps, Services, and Endpoints across
//! the registered namespaces, maintains the virtual-server store, and hands
//! snapshots of the active virtual servers to the config writer.
//!
//! Lock order, outermost first: informers mutex, then store lock, then node
//! cache lock. The informers mutex is never held across an await; the store
//! lock is held across the bounded emission wait and the node fan-out.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Namespace, Node, Service};
use kube::ResourceExt;
use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};
use strum::{Display, EnumString};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{
    self, ServiceKey, VirtualServerConfig, DEFAULT_CONFIGMAP_SELECTOR,
    VS_STATUS_BINDADDR_ANNOTATION,
};
use crate::informer::{
    namespace_key, object_key, ClusterSource, ConfigMapUpdater, EventSink, Informer, InformerSet,
};
use crate::nodes::{node_addresses, NodeCache};
use crate::queue::WorkQueue;
use crate::registry::{Registry, RegistryError};
use crate::store::{VirtualServerMap, VirtualServerStore};
use crate::writer::ConfigWriter;

/// Bound on waiting for the writer to pick up an emission.
const EMIT_TIMEOUT: Duration = Duration::from_secs(1);

const SERVICE_TYPE_NODE_PORT: &str = "NodePort";

/// Pool-member derivation mode.
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum PoolMemberType {
    NodePort,
    Cluster,
}

/// Reconciler knobs consumed from the outer process.
#[derive(Clone, Debug)]
pub struct ControllerOptions {
    pub pool_member_type: PoolMemberType,
    /// Use node InternalIP addresses instead of ExternalIP for NodePort pool
    /// members.
    pub use_node_internal: bool,
    /// Default re-delivery interval for namespaces added through the
    /// namespace informer.
    pub resync_period: Option<Duration>,
}

/// Work-queue item: one (namespace, service) reconciliation unit.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VsQueueKey {
    pub namespace: String,
    pub service_name: String,
}

#[derive(Debug, Snafu)]
pub enum SyncError {
    #[snafu(display("cannot watch namespace \"{namespace}\""))]
    WatchNamespace {
        source: RegistryError,
        namespace: String,
    },
    #[snafu(display("cannot stop watching namespace \"{namespace}\""))]
    UnwatchNamespace {
        source: RegistryError,
        namespace: String,
    },
}

/// One controller instance: registry, store, node cache, queues, and the
/// writer hand-off. Created at start, destroyed at stop.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    options: ControllerOptions,
    cluster: Arc<dyn ClusterSource>,
    writer: Arc<dyn ConfigWriter>,
    store: VirtualServerStore,
    nodes: NodeCache,
    informers: Mutex<InformersState>,
    vs_queue: WorkQueue<VsQueueKey>,
    ns_queue: WorkQueue<String>,
    stop: CancellationToken,
}

struct InformersState {
    registry: Registry,
    namespace_informer: Option<Arc<Informer<Namespace>>>,
    running: bool,
}

impl Controller {
    pub fn new(
        cluster: Arc<dyn ClusterSource>,
        writer: Arc<dyn ConfigWriter>,
        options: ControllerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                options,
                cluster,
                writer,
                store: VirtualServerStore::default(),
                nodes: NodeCache::default(),
                informers: Mutex::new(InformersState {
                    registry: Registry::default(),
                    namespace_informer: None,
                    running: false,
                }),
                vs_queue: WorkQueue::new(),
                ns_queue: WorkQueue::new(),
                stop: CancellationToken::new(),
            }),
        }
    }

    /// Registers `namespace` for watching. A no-op returning the existing set
    /// when the namespace is already watched; fails on catch-all/explicit
    /// conflicts. Sets added while the controller runs start immediately.
    pub fn add_namespace(
        &self,
        namespace: &str,
        selector: &str,
        resync_period: Option<Duration>,
    ) -> Result<Arc<InformerSet>, RegistryError> {
        let inner = &self.inner;
        let (set, created, running) = {
            let mut state = inner.informers.lock();
            let (set, created) = state.registry.insert_with(namespace, || {
                inner.new_informer_set(namespace, selector, resync_period)
            })?;
            (set, created, state.running)
        };
        if created && running {
            set.start();
        }
        Ok(set)
    }

    /// Stops watching `namespace` and purges its store entries, emitting if
    /// anything was purged.
    pub async fn remove_namespace(&self, namespace: &str) -> Result<(), RegistryError> {
        let set = { self.inner.informers.lock().registry.remove(namespace)? };
        set.stop();
        self.inner.purge_namespace(namespace).await;
        Ok(())
    }

    /// Installs the namespace informer: namespaces matching `selector` are
    /// watched dynamically. Requires an empty registry.
    pub fn watch_namespaces(&self, selector: &str) -> Result<(), RegistryError> {
        let (informer, running) = {
            let mut state = self.inner.informers.lock();
            if !state.registry.is_empty() || state.namespace_informer.is_some() {
                return Err(RegistryError::NotEmpty);
            }
            let informer = Arc::new(Informer::new(self.inner.cluster.namespaces(selector)));
            state.namespace_informer = Some(Arc::clone(&informer));
            (informer, state.running)
        };
        if running {
            self.inner.start_namespace_informer(&informer);
        }
        Ok(())
    }

    /// Applies a fresh node snapshot from the poller: extracts addresses and,
    /// on change, rewrites NodePort pool members and emits.
    pub async fn process_node_update(&self, nodes: &[Node]) {
        let addrs = node_addresses(nodes, self.inner.options.use_node_internal);
        self.inner.apply_node_addresses(addrs).await;
    }

    /// Runs informers and workers until [`Controller::shutdown`] (or a cancel
    /// of the stop token). Shutdown is idempotent; workers finish their
    /// current item before exiting.
    pub async fn run(&self) {
        let (sets, namespace_informer) = {
            let mut state = self.inner.informers.lock();
            state.running = true;
            let sets: Vec<_> = state.registry.sets().cloned().collect();
            (sets, state.namespace_informer.clone())
        };
        for set in &sets {
            set.start();
        }
        if let Some(informer) = &namespace_informer {
            self.inner.start_namespace_informer(informer);
            informer.wait_for_sync().await;
        }
        futures::future::join_all(sets.iter().map(|set| set.wait_for_cache_sync())).await;
        info!("initial caches synced");

        let inner = Arc::clone(&self.inner);
        let vs_worker = tokio::spawn(async move { inner.virtual_server_worker().await });
        let inner = Arc::clone(&self.inner);
        let ns_worker = tokio::spawn(async move { inner.namespace_worker().await });

        self.inner.stop.cancelled().await;
        self.inner.vs_queue.shut_down();
        self.inner.ns_queue.shut_down();
        let _ = tokio::join!(vs_worker, ns_worker);
        info!("controller stopped");
    }

    pub fn shutdown(&self) {
        self.inner.stop.cancel();
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.inner.stop.clone()
    }
}

impl ControllerInner {
    fn new_informer_set(
        self: &Arc<Self>,
        namespace: &str,
        selector: &str,
        resync_period: Option<Duration>,
    ) -> Arc<InformerSet> {
        let sink: Arc<dyn EventSink> = self.clone() as Arc<dyn EventSink>;
        InformerSet::new(
            namespace,
            self.cluster.config_maps(namespace, selector),
            self.cluster.services(namespace),
            self.cluster.endpoints(namespace),
            resync_period,
            Arc::downgrade(&sink),
            &self.stop,
        )
    }

    fn start_namespace_informer(self: &Arc<Self>, informer: &Arc<Informer<Namespace>>) {
        let sink: Arc<dyn EventSink> = self.clone() as Arc<dyn EventSink>;
        let sink = Arc::downgrade(&sink);
        informer.start(
            self.stop.child_token(),
            None,
            namespace_key,
            move |ns: Namespace| {
                let sink = sink.clone();
                async move {
                    if let Some(sink) = sink.upgrade() {
                        sink.on_namespace(&ns.name_any()).await;
                    }
                }
            },
        );
    }

    fn watching(&self, namespace: &str) -> bool {
        self.informers.lock().registry.resolve(namespace).is_some()
    }

    async fn virtual_server_worker(self: Arc<Self>) {
        while let Some(key) = self.vs_queue.get().await {
            match self.sync_virtual_server(&key).await {
                Ok(()) => self.vs_queue.forget(&key),
                Err(err) => {
                    warn!(
                        namespace = %key.namespace,
                        service = %key.service_name,
                        error = %err,
                        "virtual-server sync failed, requeueing"
                    );
                    self.vs_queue.add_rate_limited(key.clone());
                }
            }
            self.vs_queue.done(&key);
        }
    }

    async fn namespace_worker(self: Arc<Self>) {
        while let Some(namespace) = self.ns_queue.get().await {
            match self.sync_namespace(&namespace).await {
                Ok(()) => self.ns_queue.forget(&namespace),
                Err(err) => {
                    warn!(namespace = %namespace, error = %err, "namespace sync failed, requeueing");
                    self.ns_queue.add_rate_limited(namespace.clone());
                }
            }
            self.ns_queue.done(&namespace);
        }
    }

    /// Converges the watched-namespace set with the namespace informer: a
    /// namespace present in the informer is watched, one that disappeared is
    /// unwatched and its store entries purged.
    async fn sync_namespace(self: &Arc<Self>, namespace: &str) -> Result<(), SyncError> {
        enum Action {
            None,
            Add(Arc<InformerSet>),
            Remove(Arc<InformerSet>),
        }

        let action = {
            let mut state = self.informers.lock();
            let exists = state
                .namespace_informer
                .as_ref()
                .is_some_and(|informer| informer.get(namespace).is_some());
            let found = state.registry.contains(namespace);
            match (exists, found) {
                (true, true) | (false, false) => Action::None,
                (true, false) => {
                    let resync_period = self.options.resync_period;
                    let (set, _created) = state
                        .registry
                        .insert_with(namespace, || {
                            self.new_informer_set(
                                namespace,
                                DEFAULT_CONFIGMAP_SELECTOR,
                                resync_period,
                            )
                        })
                        .context(WatchNamespaceSnafu { namespace })?;
                    Action::Add(set)
                }
                (false, true) => Action::Remove(
                    state
                        .registry
                        .remove(namespace)
                        .context(UnwatchNamespaceSnafu { namespace })?,
                ),
            }
        };

        match action {
            Action::None => {}
            Action::Add(set) => {
                set.start();
                set.wait_for_cache_sync().await;
                info!(namespace, "watching namespace");
            }
            Action::Remove(set) => {
                set.stop();
                self.purge_namespace(namespace).await;
                info!(namespace, "stopped watching namespace");
            }
        }
        Ok(())
    }

    /// Reconciles every virtual-server definition backed by one (namespace,
    /// service) pair against the service, its endpoints, and the node cache.
    async fn sync_virtual_server(&self, key: &VsQueueKey) -> Result<(), SyncError> {
        let Some(set) = ({ self.informers.lock().registry.resolve(&key.namespace) }) else {
            warn!(
                namespace = %key.namespace,
                service = %key.service_name,
                "dropping sync for unwatched namespace"
            );
            return Ok(());
        };

        let svc = set
            .services
            .get(&format!("{}/{}", key.namespace, key.service_name));
        let svc_port_map: HashSet<i32> = svc
            .as_ref()
            .and_then(|svc| svc.spec.as_ref())
            .and_then(|spec| spec.ports.as_ref())
            .map(|ports| ports.iter().map(|port| port.port).collect())
            .unwrap_or_default();

        let mut vs_map = self
            .store
            .lock()
            .await
            .virtual_servers_for_service(&key.namespace, &key.service_name);

        let mut updated = 0usize;
        let mut deleted = 0usize;

        for cm in set.config_maps.list() {
            if cm.namespace().unwrap_or_default() != key.namespace {
                continue;
            }
            let mut cfg = match config::parse_virtual_server_config(&cm) {
                Ok(cfg) => cfg,
                Err(err) => {
                    // stale entries for this object are handled on the
                    // watch-handler path
                    debug!(config_map = %object_key(&cm), error = %err, "skipping unparseable definition");
                    continue;
                }
            };
            if cfg.virtual_server.backend.service_name != key.service_name {
                continue;
            }
            vs_map.remove(&cfg.virtual_server.backend.service_port);

            let vs_name = config::virtual_server_name(&cm);
            let service_key = ServiceKey {
                namespace: key.namespace.clone(),
                service_name: key.service_name.clone(),
                service_port: cfg.virtual_server.backend.service_port,
            };

            if !svc_port_map.contains(&cfg.virtual_server.backend.service_port) {
                warn!(
                    service = %key.service_name,
                    port = cfg.virtual_server.backend.service_port,
                    "service does not expose the backend port"
                );
                if self
                    .deactivate_virtual_server(&service_key, &vs_name, &mut cfg)
                    .await
                {
                    updated += 1;
                }
            }
            cfg.virtual_server.frontend.virtual_server_name = vs_name.clone();

            let Some(svc) = svc.as_ref() else {
                if self
                    .deactivate_virtual_server(&service_key, &vs_name, &mut cfg)
                    .await
                {
                    updated += 1;
                }
                continue;
            };

            match self.options.pool_member_type {
                PoolMemberType::NodePort => {
                    self.update_pool_members_for_node_port(svc, &service_key, &mut cfg)
                }
                PoolMemberType::Cluster => {
                    self.update_pool_members_for_cluster(&set, svc, &service_key, &mut cfg)
                }
            }

            if cfg
                .virtual_server
                .frontend
                .iapp_template
                .as_deref()
                .unwrap_or_default()
                .is_empty()
            {
                if let Some(bind_addr) = cfg
                    .virtual_server
                    .frontend
                    .virtual_address
                    .as_ref()
                    .map(|virtual_address| virtual_address.bind_addr.clone())
                    .filter(|bind_addr| !bind_addr.is_empty())
                {
                    self.set_bindaddr_annotation(&cm, &bind_addr).await;
                }
            }

            if self.save_virtual_server(&service_key, &vs_name, cfg).await {
                updated += 1;
            }
        }

        // leftover ports: no configuration object claims them anymore
        for (port, (vs_name, _)) in vs_map {
            let service_key = ServiceKey {
                namespace: key.namespace.clone(),
                service_name: key.service_name.clone(),
                service_port: port,
            };
            if self.store.remove(&service_key, &vs_name).await {
                deleted += 1;
            }
        }

        if updated > 0 || deleted > 0 {
            debug!(
                namespace = %key.namespace,
                service = %key.service_name,
                updated,
                deleted,
                "virtual servers changed"
            );
            self.emit().await;
        }
        Ok(())
    }

    /// Marks the candidate inactive with no pool members and stores it unless
    /// an equal entry is already present. Returns whether the store changed.
    async fn deactivate_virtual_server(
        &self,
        key: &ServiceKey,
        vs_name: &str,
        cfg: &mut VirtualServerConfig,
    ) -> bool {
        cfg.meta_data.active = false;
        cfg.virtual_server.backend.pool_member_addrs.clear();
        let mut store = self.store.lock().await;
        if store.get(key, vs_name).is_some_and(|existing| *existing == *cfg) {
            return false;
        }
        store.assign(key.clone(), vs_name, cfg.clone());
        true
    }

    /// Stores the candidate unless an equal entry is already present.
    async fn save_virtual_server(
        &self,
        key: &ServiceKey,
        vs_name: &str,
        cfg: VirtualServerConfig,
    ) -> bool {
        let mut store = self.store.lock().await;
        if store.get(key, vs_name).is_some_and(|existing| *existing == cfg) {
            return false;
        }
        store.assign(key.clone(), vs_name, cfg);
        true
    }

    /// NodePort derivation: pool members are `node_ip:nodePort` for every
    /// cached node address. Leaves the entry untouched when the service is
    /// not of type NodePort.
    fn update_pool_members_for_node_port(
        &self,
        svc: &Service,
        key: &ServiceKey,
        cfg: &mut VirtualServerConfig,
    ) {
        let spec = svc.spec.as_ref();
        let svc_type = spec.and_then(|spec| spec.type_.as_deref()).unwrap_or("ClusterIP");
        if svc_type != SERVICE_TYPE_NODE_PORT {
            warn!(
                service = %key.service_name,
                service_type = svc_type,
                "NodePort mode requires a NodePort service"
            );
            return;
        }
        let Some(ports) = spec.and_then(|spec| spec.ports.as_ref()) else {
            return;
        };
        for port in ports.iter().filter(|port| port.port == key.service_port) {
            let node_port = port.node_port.unwrap_or_default();
            cfg.meta_data.active = true;
            cfg.meta_data.node_port = node_port;
            cfg.virtual_server.backend.pool_member_addrs =
                pool_member_addrs(&self.nodes.snapshot(), node_port);
        }
    }

    /// Cluster derivation: pool members are `pod_ip:port` from the endpoint
    /// subset ports whose name matches the service port's name, across all
    /// subsets, sorted.
    fn update_pool_members_for_cluster(
        &self,
        set: &InformerSet,
        svc: &Service,
        key: &ServiceKey,
        cfg: &mut VirtualServerConfig,
    ) {
        let endpoints = set
            .endpoints
            .get(&format!("{}/{}", key.namespace, key.service_name));
        let Some(ports) = svc.spec.as_ref().and_then(|spec| spec.ports.as_ref()) else {
            return;
        };
        for port in ports.iter().filter(|port| port.port == key.service_port) {
            let mut addrs =
                endpoint_addrs(endpoints.as_ref(), port.name.as_deref().unwrap_or_default());
            addrs.sort();
            cfg.meta_data.active = true;
            cfg.virtual_server.backend.pool_member_addrs = addrs;
        }
    }

    /// Rewrites NodePort pool members from a changed node-address list and
    /// emits. The node cache lock nests inside the store lock here.
    async fn apply_node_addresses(&self, addrs: Vec<String>) {
        let mut store = self.store.lock().await;
        if !self.nodes.update(addrs.clone()) {
            return;
        }
        if self.options.pool_member_type != PoolMemberType::NodePort {
            return;
        }
        store.for_each_mut(|_, _, cfg| {
            if cfg.meta_data.active {
                cfg.virtual_server.backend.pool_member_addrs =
                    pool_member_addrs(&addrs, cfg.meta_data.node_port);
            }
        });
        info!(nodes = addrs.len(), "node addresses changed");
        self.emit_locked(&store).await;
    }

    /// Deletes the store entries of `namespace` and emits if any existed.
    async fn purge_namespace(&self, namespace: &str) {
        let mut store = self.store.lock().await;
        let removed = store.remove_namespace(namespace);
        if removed > 0 {
            debug!(namespace, removed, "purged namespace entries");
            self.emit_locked(&store).await;
        }
    }

    async fn emit(&self) {
        let store = self.store.lock().await;
        self.emit_locked(&store).await;
    }

    /// Serializes every active virtual server, in store order, and hands the
    /// snapshot to the writer under the `services` section. The caller holds
    /// the store lock for the duration, so the snapshot is consistent.
    async fn emit_locked(&self, store: &VirtualServerMap) {
        let services: Vec<&VirtualServerConfig> = store.active().collect();
        let count = services.len();
        let value = match serde_json::to_value(&services) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "failed to serialize virtual servers");
                return;
            }
        };
        match self.writer.send_section("services", value) {
            Err(err) => warn!(error = %err, "config writer rejected section update"),
            Ok(handle) => match tokio::time::timeout(EMIT_TIMEOUT, handle.wait()).await {
                Ok(Ok(())) => debug!(virtual_servers = count, "config section written"),
                Ok(Err(err)) => warn!(error = %err, "config writer reported failure"),
                Err(_) => warn!("timed out waiting for the config writer"),
            },
        }
    }

    /// Purge path for a definition that previously produced a store entry and
    /// no longer parses: drop the entry, strip the bind-address annotation,
    /// and emit.
    async fn handle_parse_failure(
        &self,
        cm: &ConfigMap,
        namespace: &str,
        err: config::ParseError,
    ) {
        warn!(
            config_map = %object_key(cm),
            error = %err,
            "ignoring malformed virtual-server definition"
        );
        let Some(partial) = err.partial() else {
            return;
        };
        let key = ServiceKey {
            namespace: namespace.to_string(),
            service_name: partial.virtual_server.backend.service_name.clone(),
            service_port: partial.virtual_server.backend.service_port,
        };
        let vs_name = config::virtual_server_name(cm);
        if !self.store.remove(&key, &vs_name).await {
            return;
        }
        self.strip_bindaddr_annotation(cm).await;
        self.emit().await;
    }

    async fn set_bindaddr_annotation(&self, cm: &ConfigMap, bind_addr: &str) {
        let current = cm
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(VS_STATUS_BINDADDR_ANNOTATION));
        if current.map(String::as_str) == Some(bind_addr) {
            return;
        }
        let mut updated = cm.clone();
        updated
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(
                VS_STATUS_BINDADDR_ANNOTATION.to_string(),
                bind_addr.to_string(),
            );
        if let Err(err) = self.cluster.replace_config_map(&updated).await {
            warn!(config_map = %object_key(cm), error = %err, "failed to set bind-address annotation");
        }
    }

    async fn strip_bindaddr_annotation(&self, cm: &ConfigMap) {
        let present = cm
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|annotations| annotations.contains_key(VS_STATUS_BINDADDR_ANNOTATION));
        if !present {
            return;
        }
        let mut updated = cm.clone();
        if let Some(annotations) = updated.metadata.annotations.as_mut() {
            annotations.remove(VS_STATUS_BINDADDR_ANNOTATION);
        }
        if let Err(err) = self.cluster.replace_config_map(&updated).await {
            warn!(config_map = %object_key(cm), error = %err, "failed to strip bind-address annotation");
        }
    }
}

#[async_trait]
impl EventSink for ControllerInner {
    async fn on_config_map(&self, cm: &ConfigMap) {
        let namespace = cm.namespace().unwrap_or_default();
        if !self.watching(&namespace) {
            return;
        }
        match config::parse_virtual_server_config(cm) {
            Ok(cfg) => self.vs_queue.add(VsQueueKey {
                namespace,
                service_name: cfg.virtual_server.backend.service_name,
            }),
            Err(err) => self.handle_parse_failure(cm, &namespace, err).await,
        }
    }

    async fn on_service(&self, svc: &Service) {
        let namespace = svc.namespace().unwrap_or_default();
        if !self.watching(&namespace) {
            return;
        }
        self.vs_queue.add(VsQueueKey {
            namespace,
            service_name: svc.name_any(),
        });
    }

    /// Endpoints share their service's name by convention; the queue key
    /// relies on it. In a cluster where that does not hold, reconciliation of
    /// the service stalls.
    async fn on_endpoints(&self, ep: &Endpoints) {
        let namespace = ep.namespace().unwrap_or_default();
        if !self.watching(&namespace) {
            return;
        }
        self.vs_queue.add(VsQueueKey {
            namespace,
            service_name: ep.name_any(),
        });
    }

    async fn on_namespace(&self, name: &str) {
        self.ns_queue.add(name.to_string());
    }
}

fn pool_member_addrs(nodes: &[String], node_port: i32) -> Vec<String> {
    nodes
        .iter()
        .map(|node_ip| format!("{node_ip}:{node_port}"))
        .collect()
}

fn endpoint_addrs(endpoints: Option<&Endpoints>, port_name: &str) -> Vec<String> {
    let Some(subsets) = endpoints.and_then(|endpoints| endpoints.subsets.as_ref()) else {
        return Vec::new();
    };
    let mut addrs = Vec::new();
    for subset in subsets {
        let Some(ports) = subset.ports.as_ref() else {
            continue;
        };
        for port in ports
            .iter()
            .filter(|port| port.name.as_deref().unwrap_or_default() == port_name)
        {
            if let Some(addresses) = subset.addresses.as_ref() {
                for address in addresses {
                    addrs.push(format!("{}:{}", address.ip, port.port));
                }
            }
        }
    }
    addrs
}
