//! Kubernetes lifecycle processing.
//!
//! Consumes processing-unit lifecycle events for pod-backed workloads,
//! maintains the identity cache, and delivers enriched events upstream.

use crate::{
    cache::{pod_key, CacheError, IdentityCache, PodSnapshot},
    extract::{
        DefaultKubernetesExtractor, KubernetesMetadataExtractor, POD_NAMESPACE_TAG, POD_NAME_TAG,
    },
    metrics::Metrics,
    PuEvent, SetupError,
};
use ahash::AHashSet;
use anyhow::{anyhow, Context, Result};
use microseg_core::{Collector, ContainerRecord, Event, PuHandler, PuRuntime};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Read access to the external pod API. Implementations are expected to
/// serve from a local watch cache, so calls are cheap but may be stale.
#[async_trait::async_trait]
pub trait PodSource: Send + Sync {
    async fn pod(&self, namespace: &str, name: &str) -> Result<Option<PodSnapshot>>;

    async fn list_pods(&self) -> Result<Vec<PodSnapshot>>;
}

#[derive(Clone)]
pub struct KubernetesConfig {
    /// Whether pods on the host network are activated. When unset, events
    /// for host-network pods still update the cache but never bind a PU id
    /// or reach the handler.
    pub enable_host_pods: bool,

    pub extractor: Option<Arc<dyn KubernetesMetadataExtractor>>,
}

pub struct KubernetesMonitor {
    cache: Arc<IdentityCache>,
    pods: Arc<dyn PodSource>,
    handler: Arc<dyn PuHandler>,
    collector: Arc<dyn Collector>,
    extractor: Arc<dyn KubernetesMetadataExtractor>,
    enable_host_pods: bool,
    metrics: Metrics,
}

/// Reads the pod coordinates off a runtime's identity tags.
fn kubernetes_information(runtime: &PuRuntime) -> Result<(String, String)> {
    let namespace = runtime
        .tag(POD_NAMESPACE_TAG)
        .ok_or_else(|| anyhow!("runtime tags carry no pod namespace"))?;
    let name = runtime
        .tag(POD_NAME_TAG)
        .ok_or_else(|| anyhow!("runtime tags carry no pod name"))?;
    Ok((namespace.to_string(), name.to_string()))
}

// === impl KubernetesConfig ===

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            enable_host_pods: false,
            extractor: Some(Arc::new(DefaultKubernetesExtractor::default())),
        }
    }
}

// === impl KubernetesMonitor ===

impl KubernetesMonitor {
    pub fn new(
        config: KubernetesConfig,
        pods: Arc<dyn PodSource>,
        handler: Arc<dyn PuHandler>,
        collector: Arc<dyn Collector>,
        metrics: Metrics,
    ) -> Result<Self, SetupError> {
        let extractor = config.extractor.ok_or(SetupError::MissingExtractor)?;
        Ok(Self {
            cache: Arc::new(IdentityCache::new()),
            pods,
            handler,
            collector,
            extractor,
            enable_host_pods: config.enable_host_pods,
            metrics,
        })
    }

    pub fn cache(&self) -> &IdentityCache {
        &self.cache
    }

    /// Drives the monitor from a stream of lifecycle events. Resyncs once
    /// up front, then processes events until the stream closes or shutdown
    /// is signaled. Each event is fully applied before the next is taken,
    /// so cancellation never leaves an entry half-updated.
    pub async fn run(self, mut events: mpsc::Receiver<PuEvent>, shutdown: drain::Watch) -> Result<()> {
        self.resync().await?;

        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    tracing::debug!("shutdown signaled");
                    return Ok(());
                }

                event = events.recv() => match event {
                    Some(PuEvent { pu_id, event, runtime }) => {
                        if let Err(error) = self.handle_pu_event(&pu_id, event, &runtime).await {
                            tracing::warn!(pu = %pu_id, %event, %error, "event processing failed");
                        }
                    }
                    None => {
                        tracing::debug!("event stream closed");
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Reconciles the cache against the external pod list. Pods without a
    /// cache entry gain one; cached keys no longer present externally are
    /// purged from both indices.
    pub async fn resync(&self) -> Result<()> {
        let pods = self.pods.list_pods().await.context("unable to list pods")?;

        let mut live = AHashSet::with_capacity(pods.len());
        for pod in pods {
            let key = pod_key(&pod.namespace, &pod.name);
            self.cache.get_or_create(&key).set_pod(pod);
            live.insert(key);
        }

        for key in self.cache.keys() {
            if !live.contains(&key) {
                match self.cache.delete_by_key(&key) {
                    Ok(()) => tracing::debug!(pod = %key, "purged stale cache entry"),
                    Err(error) => tracing::debug!(pod = %key, %error, "stale entry already gone"),
                }
            }
        }

        self.metrics.cache_size(self.cache.len());
        Ok(())
    }

    async fn start(&self, pu_id: &str, event: Event, runtime: &PuRuntime) -> Result<()> {
        let (namespace, name) = kubernetes_information(runtime)?;
        let key = pod_key(&namespace, &name);
        let entry = self.cache.get_or_create(&key);
        entry.set_runtime(runtime.clone());

        let pod = self
            .pods
            .pod(&namespace, &name)
            .await
            .with_context(|| format!("unable to fetch pod {key}"))?
            .ok_or_else(|| anyhow!("pod {key} not found"))?;
        let host_network = pod.host_network;
        entry.set_pod(pod.clone());

        if host_network && !self.enable_host_pods {
            tracing::debug!(pod = %key, "ignoring host-network pod");
            return Ok(());
        }

        let enriched = self.extractor.extract(&pod, runtime)?;
        entry.set_runtime(enriched.clone());
        self.cache.bind(&key, pu_id);

        self.handler.handle_pu_event(pu_id, event, &enriched).await?;

        self.collector.collect_container(ContainerRecord {
            context_id: pu_id.to_string(),
            ip_addresses: enriched.ip_addresses.clone(),
            tags: enriched.tags().clone(),
            event,
        });
        Ok(())
    }

    async fn update(&self, pu_id: &str, event: Event, runtime: &PuRuntime) -> Result<()> {
        if let Ok((namespace, name)) = kubernetes_information(runtime) {
            if let Some(entry) = self.cache.get(&pod_key(&namespace, &name)) {
                entry.set_runtime(runtime.clone());
            }
        }
        self.handler.handle_pu_event(pu_id, event, runtime).await
    }

    async fn destroy(&self, pu_id: &str, event: Event, runtime: &PuRuntime) -> Result<()> {
        match self.cache.delete_by_pu_id(pu_id) {
            Ok(()) => {}
            Err(CacheError::PuNotFound(_)) => {
                tracing::debug!(pu = %pu_id, "destroy for unknown processing unit");
            }
            Err(error) => return Err(error.into()),
        }
        self.handler.handle_pu_event(pu_id, event, runtime).await
    }
}

#[async_trait::async_trait]
impl PuHandler for KubernetesMonitor {
    async fn handle_pu_event(&self, pu_id: &str, event: Event, runtime: &PuRuntime) -> Result<()> {
        self.metrics.event(event);
        let result = match event {
            Event::Create | Event::Start => self.start(pu_id, event, runtime).await,
            Event::Stop | Event::Pause => self.update(pu_id, event, runtime).await,
            Event::Destroy => self.destroy(pu_id, event, runtime).await,
            Event::ReSync => self.resync().await,
        };
        self.metrics.cache_size(self.cache.len());
        if result.is_err() {
            self.metrics.event_error(event);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use microseg_core::{PuType, TagSet};
    use parking_lot::Mutex;

    struct StaticPods {
        pods: Vec<PodSnapshot>,
        fail_list: bool,
    }

    #[async_trait::async_trait]
    impl PodSource for StaticPods {
        async fn pod(&self, namespace: &str, name: &str) -> Result<Option<PodSnapshot>> {
            Ok(self
                .pods
                .iter()
                .find(|p| p.namespace == namespace && p.name == name)
                .cloned())
        }

        async fn list_pods(&self) -> Result<Vec<PodSnapshot>> {
            if self.fail_list {
                anyhow::bail!("pod list unavailable");
            }
            Ok(self.pods.clone())
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<(String, Event, PuRuntime)>>,
    }

    #[async_trait::async_trait]
    impl PuHandler for RecordingHandler {
        async fn handle_pu_event(
            &self,
            pu_id: &str,
            event: Event,
            runtime: &PuRuntime,
        ) -> Result<()> {
            self.events
                .lock()
                .push((pu_id.to_string(), event, runtime.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recording {
        containers: Mutex<Vec<ContainerRecord>>,
    }

    impl Collector for Recording {
        fn collect_flow(&self, _: microseg_core::FlowRecord) {}

        fn collect_container(&self, record: ContainerRecord) {
            self.containers.lock().push(record);
        }
    }

    fn pod(namespace: &str, name: &str, host_network: bool) -> PodSnapshot {
        PodSnapshot {
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: format!("uid-{name}"),
            labels: btreemap! { "app".to_string() => "web".to_string() },
            host_network,
        }
    }

    fn runtime(namespace: &str, name: &str) -> PuRuntime {
        PuRuntime::new(PuType::Kubernetes, name).with_tags(TagSet::from(btreemap! {
            POD_NAMESPACE_TAG.to_string() => namespace.to_string(),
            POD_NAME_TAG.to_string() => name.to_string(),
        }))
    }

    struct Fixture {
        monitor: KubernetesMonitor,
        handler: Arc<RecordingHandler>,
        collector: Arc<Recording>,
    }

    fn fixture(pods: Vec<PodSnapshot>, enable_host_pods: bool) -> Fixture {
        let handler = Arc::new(RecordingHandler::default());
        let collector = Arc::new(Recording::default());
        let monitor = KubernetesMonitor::new(
            KubernetesConfig {
                enable_host_pods,
                ..Default::default()
            },
            Arc::new(StaticPods {
                pods,
                fail_list: false,
            }),
            handler.clone(),
            collector.clone(),
            Metrics::default(),
        )
        .unwrap();
        Fixture {
            monitor,
            handler,
            collector,
        }
    }

    #[test]
    fn missing_extractor_is_a_setup_error() {
        let result = KubernetesMonitor::new(
            KubernetesConfig {
                enable_host_pods: false,
                extractor: None,
            },
            Arc::new(StaticPods {
                pods: vec![],
                fail_list: false,
            }),
            Arc::new(RecordingHandler::default()),
            Arc::new(Recording::default()),
            Metrics::default(),
        );
        assert!(matches!(result, Err(SetupError::MissingExtractor)));
    }

    #[test]
    fn pod_coordinates_resolve_from_tags() {
        // (namespace tag, name tag, expected)
        let cases: Vec<(Option<&str>, Option<&str>, Option<(&str, &str)>)> = vec![
            (Some("ns1"), Some("podA"), Some(("ns1", "podA"))),
            (Some("ns1"), None, None),
            (None, Some("podA"), None),
            (None, None, None),
            (Some(""), Some("podA"), Some(("", "podA"))),
        ];
        for (namespace, name, expected) in cases {
            let mut tags = TagSet::new();
            if let Some(ns) = namespace {
                tags.insert(POD_NAMESPACE_TAG, ns);
            }
            if let Some(n) = name {
                tags.insert(POD_NAME_TAG, n);
            }
            let rt = PuRuntime::new(PuType::Kubernetes, "w").with_tags(tags);
            match (kubernetes_information(&rt), expected) {
                (Ok((ns, n)), Some((ens, en))) => {
                    assert_eq!((ns.as_str(), n.as_str()), (ens, en));
                }
                (Err(_), None) => {}
                (got, want) => panic!("got {got:?}, want {want:?}"),
            }
        }
    }

    #[tokio::test]
    async fn start_binds_and_delivers_enriched_runtime() {
        let fix = fixture(vec![pod("ns1", "podA", false)], false);

        fix.monitor
            .handle_pu_event("pu-1", Event::Start, &runtime("ns1", "podA"))
            .await
            .unwrap();

        let entry = fix.monitor.cache().get_by_pu_id("pu-1").unwrap();
        assert_eq!(entry.pu_id().as_deref(), Some("pu-1"));

        let events = fix.handler.events.lock();
        assert_eq!(events.len(), 1);
        let (pu_id, event, enriched) = &events[0];
        assert_eq!(pu_id, "pu-1");
        assert_eq!(*event, Event::Start);
        assert_eq!(enriched.tag("app"), Some("web"));
        assert_eq!(enriched.tag(POD_NAME_TAG), Some("podA"));

        let containers = fix.collector.containers.lock();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].context_id, "pu-1");
        assert_eq!(containers[0].event, Event::Start);
    }

    #[tokio::test]
    async fn start_fails_without_pod_tags() {
        let fix = fixture(vec![pod("ns1", "podA", false)], false);
        let bare = PuRuntime::new(PuType::Kubernetes, "podA");

        assert!(fix
            .monitor
            .handle_pu_event("pu-1", Event::Start, &bare)
            .await
            .is_err());
        assert!(fix.monitor.cache().is_empty());
        assert!(fix.handler.events.lock().is_empty());
    }

    #[tokio::test]
    async fn host_network_pods_are_gated() {
        let fix = fixture(vec![pod("ns1", "podA", true)], false);

        fix.monitor
            .handle_pu_event("pu-1", Event::Start, &runtime("ns1", "podA"))
            .await
            .unwrap();

        // The snapshot is cached but the pod is never bound or delivered.
        let entry = fix.monitor.cache().get("ns1/podA").unwrap();
        assert!(entry.pod().is_some());
        assert_eq!(entry.pu_id(), None);
        assert_eq!(
            fix.monitor.cache().get_by_pu_id("pu-1"),
            Err(CacheError::PuNotFound("pu-1".to_string()))
        );
        assert!(fix.handler.events.lock().is_empty());
        assert!(fix.collector.containers.lock().is_empty());
    }

    #[tokio::test]
    async fn host_network_pods_activate_when_enabled() {
        let fix = fixture(vec![pod("ns1", "podA", true)], true);

        fix.monitor
            .handle_pu_event("pu-1", Event::Start, &runtime("ns1", "podA"))
            .await
            .unwrap();

        assert!(fix.monitor.cache().get_by_pu_id("pu-1").is_ok());
        assert_eq!(fix.handler.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn stop_updates_the_cached_runtime_and_delivers() {
        let fix = fixture(vec![pod("ns1", "podA", false)], false);
        fix.monitor
            .handle_pu_event("pu-1", Event::Start, &runtime("ns1", "podA"))
            .await
            .unwrap();

        let mut stopped = runtime("ns1", "podA");
        stopped.pid = Some(42);
        fix.monitor
            .handle_pu_event("pu-1", Event::Stop, &stopped)
            .await
            .unwrap();

        let entry = fix.monitor.cache().get("ns1/podA").unwrap();
        assert_eq!(entry.runtime().unwrap().pid, Some(42));
        let events = fix.handler.events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].1, Event::Stop);
    }

    #[tokio::test]
    async fn destroy_purges_both_indices_and_tolerates_unknown() {
        let fix = fixture(vec![pod("ns1", "podA", false)], false);
        let rt = runtime("ns1", "podA");
        fix.monitor
            .handle_pu_event("pu-1", Event::Start, &rt)
            .await
            .unwrap();

        fix.monitor
            .handle_pu_event("pu-1", Event::Destroy, &rt)
            .await
            .unwrap();
        assert!(fix.monitor.cache().get("ns1/podA").is_none());
        assert_eq!(
            fix.monitor.cache().get_by_pu_id("pu-1"),
            Err(CacheError::PuNotFound("pu-1".to_string()))
        );

        // A second destroy still delivers upstream.
        fix.monitor
            .handle_pu_event("pu-1", Event::Destroy, &rt)
            .await
            .unwrap();
        assert_eq!(fix.handler.events.lock().len(), 3);
    }

    #[tokio::test]
    async fn resync_reconciles_both_directions() {
        let fix = fixture(vec![pod("ns1", "podB", false)], false);

        // Seed a stale, bound entry that the external API no longer knows.
        fix.monitor.cache().get_or_create("ns1/podA");
        fix.monitor.cache().bind("ns1/podA", "pu-stale");

        fix.monitor.resync().await.unwrap();

        assert!(fix.monitor.cache().get("ns1/podA").is_none());
        assert_eq!(
            fix.monitor.cache().get_by_pu_id("pu-stale"),
            Err(CacheError::PuNotFound("pu-stale".to_string()))
        );
        assert!(fix.monitor.cache().get("ns1/podB").is_some());
    }

    #[tokio::test]
    async fn resync_propagates_listing_failures() {
        let handler = Arc::new(RecordingHandler::default());
        let monitor = KubernetesMonitor::new(
            KubernetesConfig::default(),
            Arc::new(StaticPods {
                pods: vec![],
                fail_list: true,
            }),
            handler,
            Arc::new(Recording::default()),
            Metrics::default(),
        )
        .unwrap();

        monitor.cache().get_or_create("ns1/podA");
        assert!(monitor.resync().await.is_err());
        // Nothing is purged on a failed listing.
        assert!(monitor.cache().get("ns1/podA").is_some());
    }

    #[tokio::test]
    async fn run_resyncs_then_drains_the_event_stream() {
        let fix = fixture(vec![pod("ns1", "podA", false)], false);
        let handler = fix.handler.clone();

        let (tx, rx) = mpsc::channel(8);
        let (signal, watch) = drain::channel();
        let task = tokio::spawn(fix.monitor.run(rx, watch));

        tx.send(PuEvent {
            pu_id: "pu-1".to_string(),
            event: Event::Start,
            runtime: runtime("ns1", "podA"),
        })
        .await
        .unwrap();
        drop(tx);

        task.await.unwrap().unwrap();
        signal.drain().await;
        assert_eq!(handler.events.lock().len(), 1);
    }
}
