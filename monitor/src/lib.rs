//! Microseg monitors
//!
//! Lifecycle monitors watch workloads come and go, keep the identity cache
//! current, and hand enriched processing-unit events to the controller:
//!
//! ```text
//! event source ──> monitor ──> identity cache
//!                      │
//!                      └─────> PuHandler (controller)
//! ```
//!
//! Two monitors are provided: [`kubernetes::KubernetesMonitor`] for
//! pod-backed workloads and [`linux::LinuxMonitor`] for host services and
//! login sessions.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cache;
pub mod extract;
pub mod kubernetes;
pub mod linux;
pub mod metrics;

pub use self::{
    cache::{pod_key, CacheEntry, CacheError, IdentityCache, PodSnapshot},
    extract::{
        DefaultKubernetesExtractor, KubernetesMetadataExtractor, LinuxMetadataExtractor,
        POD_NAMESPACE_TAG, POD_NAME_TAG,
    },
    kubernetes::{KubernetesConfig, KubernetesMonitor, PodSource},
    linux::{CgroupController, LinuxConfig, LinuxMonitor, CGROUP_BASE_PATH},
    metrics::Metrics,
};

use microseg_core::{Event, PuRuntime};

/// A lifecycle event as queued from an event source to a monitor's run
/// loop.
#[derive(Clone, Debug)]
pub struct PuEvent {
    pub pu_id: String,
    pub event: Event,
    pub runtime: PuRuntime,
}

/// Monitor construction failures.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("monitor requires a metadata extractor")]
    MissingExtractor,
}
