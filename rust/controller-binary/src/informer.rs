//! Cached list/watch streams over the cluster resources the controller
//! reconciles, grouped per namespace behind a shared stop signal.
//!
//! The cluster API client stays behind the [`ListWatch`] and
//! [`ClusterSource`] seams: production wires them to `kube`'s watcher, tests
//! script them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Namespace, Service};
use kube::api::{Api, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::ResourceExt;
use parking_lot::RwLock;
use snafu::Snafu;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One event on a cached stream, in the shape `kube`'s watcher yields them:
/// `Init`/`InitApply`/`InitDone` bracket a (re)list, `Apply` and `Delete` are
/// live changes.
#[derive(Clone, Debug)]
pub enum CacheEvent<K> {
    Init,
    InitApply(K),
    InitDone,
    Apply(K),
    Delete(K),
}

#[derive(Debug, Snafu)]
#[snafu(display("watch stream failed: {message}"))]
pub struct ListWatchError {
    pub(crate) message: String,
}

/// An endless stream of cache events for one resource kind. Implementations
/// re-list and back off internally; a yielded error is informational.
pub trait ListWatch<K>: Send + Sync + 'static {
    fn events(&self) -> BoxStream<'static, Result<CacheEvent<K>, ListWatchError>>;
}

#[derive(Debug, Snafu)]
#[snafu(display("cluster API request failed: {message}"))]
pub struct ClusterError {
    pub(crate) message: String,
}

/// ConfigMap replacement for status annotations, kept separate from the
/// list/watch surface.
#[async_trait]
pub trait ConfigMapUpdater: Send + Sync + 'static {
    async fn replace_config_map(&self, cm: &ConfigMap) -> Result<(), ClusterError>;
}

/// The cluster API client, reduced to what the reconciler needs: list/watch
/// streams per resource kind, plus [`ConfigMapUpdater`] for annotation
/// writes. A namespace of `""` means all namespaces.
pub trait ClusterSource: ConfigMapUpdater {
    fn config_maps(&self, namespace: &str, selector: &str) -> Arc<dyn ListWatch<ConfigMap>>;
    fn services(&self, namespace: &str) -> Arc<dyn ListWatch<Service>>;
    fn endpoints(&self, namespace: &str) -> Arc<dyn ListWatch<Endpoints>>;
    fn namespaces(&self, selector: &str) -> Arc<dyn ListWatch<Namespace>>;
}

/// Capability handed to informer sets; called for adds, updates, and deletes,
/// including initial-list deliveries.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn on_config_map(&self, cm: &ConfigMap);
    async fn on_service(&self, svc: &Service);
    async fn on_endpoints(&self, ep: &Endpoints);
    async fn on_namespace(&self, name: &str);
}

/// Cache key for namespaced objects.
pub fn object_key<K: ResourceExt>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

pub fn namespace_key(ns: &Namespace) -> String {
    ns.name_any()
}

/// One cached stream: a `"namespace/name"`-indexed map kept current by a
/// driver task, plus a synced flag that flips after the first complete list.
pub struct Informer<K> {
    cache: Arc<RwLock<HashMap<String, K>>>,
    list_watch: Arc<dyn ListWatch<K>>,
    synced_tx: watch::Sender<bool>,
    synced_rx: watch::Receiver<bool>,
    started: AtomicBool,
}

impl<K> Informer<K>
where
    K: Clone + Send + Sync + 'static,
{
    pub fn new(list_watch: Arc<dyn ListWatch<K>>) -> Self {
        let (synced_tx, synced_rx) = watch::channel(false);
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            list_watch,
            synced_tx,
            synced_rx,
            started: AtomicBool::new(false),
        }
    }

    pub fn get(&self, key: &str) -> Option<K> {
        self.cache.read().get(key).cloned()
    }

    pub fn list(&self) -> Vec<K> {
        self.cache.read().values().cloned().collect()
    }

    pub fn has_synced(&self) -> bool {
        *self.synced_rx.borrow()
    }

    /// Waits until the initial list has been delivered.
    pub async fn wait_for_sync(&self) {
        let mut synced = self.synced_rx.clone();
        let _ = synced.wait_for(|synced| *synced).await;
    }

    /// Spawns the driver task. `dispatch` runs inside the driver for every
    /// event; it must not block beyond its own awaits.
    pub fn start<F, Fut>(
        &self,
        stop: CancellationToken,
        resync_period: Option<Duration>,
        key_of: fn(&K) -> String,
        dispatch: F,
    ) where
        F: Fn(K) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let cache = Arc::clone(&self.cache);
        let synced = self.synced_tx.clone();
        let mut events = self.list_watch.events();
        tokio::spawn(async move {
            let mut resync = resync_period
                .map(|period| tokio::time::interval_at(tokio::time::Instant::now() + period, period));
            let mut relisted: Option<HashMap<String, K>> = None;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    Some(_) = tick(&mut resync) => {
                        let objects: Vec<K> = cache.read().values().cloned().collect();
                        for obj in objects {
                            dispatch(obj).await;
                        }
                    }
                    event = events.next() => match event {
                        None => {
                            debug!("watch stream ended");
                            return;
                        }
                        Some(Err(err)) => warn!(error = %err, "watch stream error"),
                        Some(Ok(CacheEvent::Init)) => relisted = Some(HashMap::new()),
                        Some(Ok(CacheEvent::InitApply(obj))) => {
                            if let Some(buffer) = relisted.as_mut() {
                                buffer.insert(key_of(&obj), obj);
                            }
                        }
                        Some(Ok(CacheEvent::InitDone)) => {
                            let next = relisted.take().unwrap_or_default();
                            let removed: Vec<K> = {
                                let mut cache = cache.write();
                                let removed = cache
                                    .iter()
                                    .filter(|(key, _)| !next.contains_key(*key))
                                    .map(|(_, obj)| obj.clone())
                                    .collect();
                                *cache = next;
                                removed
                            };
                            synced.send_replace(true);
                            let objects: Vec<K> = cache.read().values().cloned().collect();
                            for obj in objects {
                                dispatch(obj).await;
                            }
                            // objects that vanished across the relist still
                            // need their keys reconciled
                            for obj in removed {
                                dispatch(obj).await;
                            }
                        }
                        Some(Ok(CacheEvent::Apply(obj))) => {
                            cache.write().insert(key_of(&obj), obj.clone());
                            dispatch(obj).await;
                        }
                        Some(Ok(CacheEvent::Delete(obj))) => {
                            cache.write().remove(&key_of(&obj));
                            dispatch(obj).await;
                        }
                    }
                }
            }
        });
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) -> Option<tokio::time::Instant> {
    match interval {
        Some(interval) => Some(interval.tick().await),
        None => std::future::pending().await,
    }
}

/// The three cached streams for one namespace, sharing one stop signal.
/// Lifecycle: created → running (`start`) → stopped (`stop`, terminal).
pub struct InformerSet {
    namespace: String,
    pub config_maps: Informer<ConfigMap>,
    pub services: Informer<Service>,
    pub endpoints: Informer<Endpoints>,
    resync_period: Option<Duration>,
    sink: Weak<dyn EventSink>,
    stop: CancellationToken,
    started: AtomicBool,
}

impl InformerSet {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        namespace: impl Into<String>,
        config_maps: Arc<dyn ListWatch<ConfigMap>>,
        services: Arc<dyn ListWatch<Service>>,
        endpoints: Arc<dyn ListWatch<Endpoints>>,
        resync_period: Option<Duration>,
        sink: Weak<dyn EventSink>,
        parent_stop: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            namespace: namespace.into(),
            config_maps: Informer::new(config_maps),
            services: Informer::new(services),
            endpoints: Informer::new(endpoints),
            resync_period,
            sink,
            stop: parent_stop.child_token(),
            started: AtomicBool::new(false),
        })
    }

    /// Launches the three driver tasks. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(namespace = %self.namespace, "starting informers");
        let sink = self.sink.clone();
        self.config_maps.start(
            self.stop.clone(),
            self.resync_period,
            object_key,
            move |cm: ConfigMap| {
                let sink = sink.clone();
                async move {
                    if let Some(sink) = sink.upgrade() {
                        sink.on_config_map(&cm).await;
                    }
                }
            },
        );
        let sink = self.sink.clone();
        self.services.start(
            self.stop.clone(),
            None,
            object_key,
            move |svc: Service| {
                let sink = sink.clone();
                async move {
                    if let Some(sink) = sink.upgrade() {
                        sink.on_service(&svc).await;
                    }
                }
            },
        );
        let sink = self.sink.clone();
        self.endpoints.start(
            self.stop.clone(),
            None,
            object_key,
            move |ep: Endpoints| {
                let sink = sink.clone();
                async move {
                    if let Some(sink) = sink.upgrade() {
                        sink.on_endpoints(&ep).await;
                    }
                }
            },
        );
    }

    /// Blocks until all three initial lists have been delivered.
    pub async fn wait_for_cache_sync(&self) {
        tokio::join!(
            self.config_maps.wait_for_sync(),
            self.services.wait_for_sync(),
            self.endpoints.wait_for_sync(),
        );
    }

    pub fn has_synced(&self) -> bool {
        self.config_maps.has_synced() && self.services.has_synced() && self.endpoints.has_synced()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}

/// [`ListWatch`] backed by a `kube` watcher, which re-lists and backs off
/// internally.
pub struct ApiListWatch<K> {
    api: Api<K>,
    config: watcher::Config,
}

impl<K> ApiListWatch<K> {
    pub fn new(api: Api<K>, config: watcher::Config) -> Self {
        Self { api, config }
    }
}

impl<K> ListWatch<K> for ApiListWatch<K>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + Sync + 'static,
    K::DynamicType: Clone + Default,
{
    fn events(&self) -> BoxStream<'static, Result<CacheEvent<K>, ListWatchError>> {
        watcher(self.api.clone(), self.config.clone())
            .default_backoff()
            .map(|event| match event {
                Ok(watcher::Event::Init) => Ok(CacheEvent::Init),
                Ok(watcher::Event::InitApply(obj)) => Ok(CacheEvent::InitApply(obj)),
                Ok(watcher::Event::InitDone) => Ok(CacheEvent::InitDone),
                Ok(watcher::Event::Apply(obj)) => Ok(CacheEvent::Apply(obj)),
                Ok(watcher::Event::Delete(obj)) => Ok(CacheEvent::Delete(obj)),
                Err(err) => Err(ListWatchError {
                    message: err.to_string(),
                }),
            })
            .boxed()
    }
}

/// Production [`ClusterSource`] over a `kube` client.
pub struct KubeClusterSource {
    client: kube::Client,
}

impl KubeClusterSource {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn namespaced_api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        }
    }
}

#[async_trait]
impl ConfigMapUpdater for KubeClusterSource {
    async fn replace_config_map(&self, cm: &ConfigMap) -> Result<(), ClusterError> {
        let api: Api<ConfigMap> =
            Api::namespaced(self.client.clone(), &cm.namespace().unwrap_or_default());
        api.replace(&cm.name_any(), &PostParams::default(), cm)
            .await
            .map(|_| ())
            .map_err(|err| ClusterError {
                message: err.to_string(),
            })
    }
}

impl ClusterSource for KubeClusterSource {
    fn config_maps(&self, namespace: &str, selector: &str) -> Arc<dyn ListWatch<ConfigMap>> {
        Arc::new(ApiListWatch::new(
            self.namespaced_api(namespace),
            watcher::Config::default().labels(selector),
        ))
    }

    fn services(&self, namespace: &str) -> Arc<dyn ListWatch<Service>> {
        Arc::new(ApiListWatch::new(
            self.namespaced_api(namespace),
            watcher::Config::default(),
        ))
    }

    fn endpoints(&self, namespace: &str) -> Arc<dyn ListWatch<Endpoints>> {
        Arc::new(ApiListWatch::new(
            self.namespaced_api(namespace),
            watcher::Config::default(),
        ))
    }

    fn namespaces(&self, selector: &str) -> Arc<dyn ListWatch<Namespace>> {
        Arc::new(ApiListWatch::new(
            Api::all(self.client.clone()),
            watcher::Config::default().labels(selector),
        ))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    /// Scripted [`ListWatch`]: yields an initial list bracketed by
    /// `Init`/`InitDone`, then live events pushed through the sender.
    pub(crate) struct FakeListWatch<K> {
        initial: Mutex<Vec<K>>,
        rx: Mutex<Option<mpsc::UnboundedReceiver<CacheEvent<K>>>>,
    }

    impl<K: Clone + Send + Sync + 'static> FakeListWatch<K> {
        pub(crate) fn with_initial(
            initial: Vec<K>,
        ) -> (Arc<Self>, mpsc::UnboundedSender<CacheEvent<K>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    initial: Mutex::new(initial),
                    rx: Mutex::new(Some(rx)),
                }),
                tx,
            )
        }
    }

    impl<K: Clone + Send + Sync + 'static> ListWatch<K> for FakeListWatch<K> {
        fn events(&self) -> BoxStream<'static, Result<CacheEvent<K>, ListWatchError>> {
            let initial = self.initial.lock().clone();
            let head: Vec<Result<CacheEvent<K>, ListWatchError>> =
                std::iter::once(CacheEvent::Init)
                    .chain(initial.into_iter().map(CacheEvent::InitApply))
                    .chain(std::iter::once(CacheEvent::InitDone))
                    .map(Ok)
                    .collect();
            let tail: BoxStream<'static, Result<CacheEvent<K>, ListWatchError>> =
                match self.rx.lock().take() {
                    Some(rx) => futures::stream::unfold(rx, |mut rx| async move {
                        rx.recv().await.map(|event| (Ok(event), rx))
                    })
                    .boxed(),
                    None => futures::stream::pending().boxed(),
                };
            futures::stream::iter(head).chain(tail).boxed()
        }
    }

    pub(crate) struct NullSink;

    #[async_trait]
    impl EventSink for NullSink {
        async fn on_config_map(&self, _cm: &ConfigMap) {}
        async fn on_service(&self, _svc: &Service) {}
        async fn on_endpoints(&self, _ep: &Endpoints) {}
        async fn on_namespace(&self, _name: &str) {}
    }

    /// Builds an informer set over empty fake streams, for lifecycle tests.
    pub(crate) fn empty_informer_set(
        namespace: &str,
        sink: Weak<dyn EventSink>,
        stop: &CancellationToken,
    ) -> Arc<InformerSet> {
        let (config_maps, _) = FakeListWatch::<ConfigMap>::with_initial(Vec::new());
        let (services, _) = FakeListWatch::<Service>::with_initial(Vec::new());
        let (endpoints, _) = FakeListWatch::<Endpoints>::with_initial(Vec::new());
        InformerSet::new(namespace, config_maps, services, endpoints, None, sink, stop)
    }
}
