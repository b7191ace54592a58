use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, net::IpAddr};

/// The kinds of workloads that can be enforced.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PuType {
    LinuxProcess,
    UidLogin,
    Container,
    Kubernetes,
}

/// Lifecycle events delivered by a monitor for a processing unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    Create,
    Start,
    Stop,
    Destroy,
    Pause,
    ReSync,
}

/// An ordered set of identity tags attached to a workload.
///
/// Tags are `key=value` pairs; keys are unique. The ordering is stable so
/// that serialized tag sets compare bit-for-bit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSet(BTreeMap<String, String>);

/// A point-in-time snapshot of a processing unit's runtime state, as
/// reported by the lifecycle source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PuRuntime {
    pub pu_type: PuType,
    pub name: String,
    pub pid: Option<u32>,
    pub ip_addresses: Vec<IpAddr>,
    tags: TagSet,
}

/// The enforceable identity of a processing unit, as seen by the datapath.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PuContext {
    /// Unique identifier within this controller instance.
    pub context_id: String,

    /// Identifier under which the PU is known to management tooling.
    pub management_id: String,

    pub pu_type: PuType,

    pub annotations: TagSet,
}

/// Consumes resolved lifecycle events. Implemented by the controller;
/// monitors deliver each event exactly once and surface the result to
/// their caller.
#[async_trait::async_trait]
pub trait PuHandler: Send + Sync {
    async fn handle_pu_event(&self, pu_id: &str, event: Event, runtime: &PuRuntime) -> Result<()>;
}

// === impl Event ===

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => "create".fmt(f),
            Self::Start => "start".fmt(f),
            Self::Stop => "stop".fmt(f),
            Self::Destroy => "destroy".fmt(f),
            Self::Pause => "pause".fmt(f),
            Self::ReSync => "resync".fmt(f),
        }
    }
}

// === impl TagSet ===

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Merges `other` into this set. Existing keys are overwritten.
    pub fn merge(&mut self, other: &TagSet) {
        for (k, v) in other.iter() {
            self.0.insert(k.to_string(), v.to_string());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for TagSet {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, String)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// === impl PuRuntime ===

impl PuRuntime {
    pub fn new(pu_type: PuType, name: impl Into<String>) -> Self {
        Self {
            pu_type,
            name: name.into(),
            pid: None,
            ip_addresses: vec![],
            tags: TagSet::default(),
        }
    }

    pub fn with_tags(mut self, tags: TagSet) -> Self {
        self.tags = tags;
        self
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key)
    }

    pub fn set_tags(&mut self, tags: TagSet) {
        self.tags = tags;
    }

    /// Folds additional tags into the runtime, preserving unrelated ones.
    pub fn merge_tags(&mut self, tags: &TagSet) {
        self.tags.merge(tags);
    }
}
