//! Metadata extraction.
//!
//! Extractors turn raw platform metadata into the identity tags carried on
//! a processing unit's runtime. The default extractor covers the common
//! Kubernetes case; deployments with bespoke labeling conventions supply
//! their own.

use crate::cache::PodSnapshot;
use microseg_core::{PuRuntime, TagSet};

/// Tag key carrying the pod's namespace. The `@usr:` prefix marks tags
/// sourced from user metadata on the wire.
pub const POD_NAMESPACE_TAG: &str = "@usr:io.kubernetes.pod.namespace";

/// Tag key carrying the pod's name.
pub const POD_NAME_TAG: &str = "@usr:io.kubernetes.pod.name";

/// Derives identity tags for a pod-backed processing unit.
pub trait KubernetesMetadataExtractor: Send + Sync {
    /// Produces the runtime to activate for `pod`. `runtime` is the
    /// runtime observed from the container layer; implementations augment
    /// its tags rather than rebuild it.
    fn extract(&self, pod: &PodSnapshot, runtime: &PuRuntime) -> anyhow::Result<PuRuntime>;
}

/// Derives identity tags for a host process or login session.
pub trait LinuxMetadataExtractor: Send + Sync {
    fn extract(&self, runtime: &PuRuntime) -> anyhow::Result<PuRuntime>;
}

/// Tags pods with their namespace, name, and every pod label.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultKubernetesExtractor(());

// === impl DefaultKubernetesExtractor ===

impl KubernetesMetadataExtractor for DefaultKubernetesExtractor {
    fn extract(&self, pod: &PodSnapshot, runtime: &PuRuntime) -> anyhow::Result<PuRuntime> {
        let mut tags = TagSet::default();
        tags.insert(POD_NAMESPACE_TAG, &pod.namespace);
        tags.insert(POD_NAME_TAG, &pod.name);
        for (key, value) in &pod.labels {
            tags.insert(key, value);
        }

        let mut extracted = runtime.clone();
        extracted.merge_tags(&tags);
        Ok(extracted)
    }
}
