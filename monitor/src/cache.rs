//! The workload-identity cache.
//!
//! Maps external lifecycle keys (`namespace/name`) to cache entries and,
//! once known, PU identifiers back to external keys. The two indices are
//! kept consistent under a single coarse lock; entry payloads carry their
//! own lock so lifecycle updates to one workload never block lookups for
//! unrelated ones.

use ahash::AHashMap as HashMap;
use microseg_core::PuRuntime;
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};

/// The latest pod state received from the external API.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodSnapshot {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    pub host_network: bool,
}

/// Renders the external lifecycle key for a pod. The format is consumed by
/// external reconciliation tooling and must stay byte-for-byte stable.
pub fn pod_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("no cache entry for key {0}")]
    KeyNotFound(String),

    #[error("no cache entry for processing unit {0}")]
    PuNotFound(String),

    /// The reverse index points at a forward entry that no longer exists.
    /// This is an internal-consistency violation, distinct from a plain
    /// miss, and is surfaced rather than masked.
    #[error("cache indices diverged: {pu_id} points at missing key {key}")]
    Inconsistent { pu_id: String, key: String },
}

/// A single workload's cached state. Mutated in place under the entry
/// lock; index membership is governed by [`IdentityCache`]'s coarse lock.
#[derive(Debug, Default)]
pub struct CacheEntry {
    state: RwLock<EntryState>,
}

#[derive(Debug, Default)]
struct EntryState {
    pu_id: Option<String>,
    pod: Option<PodSnapshot>,
    runtime: Option<PuRuntime>,
}

#[derive(Debug, Default)]
struct Indices {
    /// Forward index: external key to entry.
    by_key: HashMap<String, Arc<CacheEntry>>,

    /// Reverse index: PU identifier to external key.
    by_pu_id: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct IdentityCache {
    indices: RwLock<Indices>,
}

// === impl CacheEntry ===

impl CacheEntry {
    pub fn pu_id(&self) -> Option<String> {
        self.state.read().pu_id.clone()
    }

    pub fn pod(&self) -> Option<PodSnapshot> {
        self.state.read().pod.clone()
    }

    pub fn runtime(&self) -> Option<PuRuntime> {
        self.state.read().runtime.clone()
    }

    pub fn set_pod(&self, pod: PodSnapshot) {
        self.state.write().pod = Some(pod);
    }

    pub fn set_runtime(&self, runtime: PuRuntime) {
        self.state.write().runtime = Some(runtime);
    }
}

/// Entries compare by their current state snapshots. Both entry locks are
/// taken; the pointer check keeps self-comparison from re-entering the
/// lock.
impl PartialEq for CacheEntry {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        let a = self.state.read();
        let b = other.state.read();
        a.pu_id == b.pu_id && a.pod == b.pod && a.runtime == b.runtime
    }
}

impl Eq for CacheEntry {}

// === impl IdentityCache ===

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for a key, creating an empty placeholder if none
    /// exists. Concurrent callers for the same key observe the same entry.
    pub fn get_or_create(&self, key: &str) -> Arc<CacheEntry> {
        let mut indices = self.indices.write();
        indices
            .by_key
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.indices.read().by_key.get(key).cloned()
    }

    /// Looks an entry up through the reverse index.
    pub fn get_by_pu_id(&self, pu_id: &str) -> Result<Arc<CacheEntry>, CacheError> {
        let indices = self.indices.read();
        let key = indices
            .by_pu_id
            .get(pu_id)
            .ok_or_else(|| CacheError::PuNotFound(pu_id.to_string()))?;
        match indices.by_key.get(key) {
            Some(entry) => Ok(entry.clone()),
            None => {
                tracing::error!(pu_id = %pu_id, key = %key, "identity cache indices diverged");
                Err(CacheError::Inconsistent {
                    pu_id: pu_id.to_string(),
                    key: key.clone(),
                })
            }
        }
    }

    /// Records the PU identifier for a key, making the entry reachable from
    /// the reverse index. The entry update and the reverse-index insert are
    /// applied under one lock acquisition, so no observer sees one half.
    pub fn bind(&self, key: &str, pu_id: &str) {
        let mut indices = self.indices.write();
        let entry = indices
            .by_key
            .entry(key.to_string())
            .or_default()
            .clone();
        entry.state.write().pu_id = Some(pu_id.to_string());
        if let Some(stale) = indices.by_pu_id.insert(pu_id.to_string(), key.to_string()) {
            if stale != key {
                tracing::warn!(pu_id = %pu_id, old = %stale, new = %key, "rebinding processing unit");
            }
        }
    }

    /// Removes an entry by its external key, purging both indices.
    pub fn delete_by_key(&self, key: &str) -> Result<(), CacheError> {
        let mut indices = self.indices.write();
        let entry = indices
            .by_key
            .remove(key)
            .ok_or_else(|| CacheError::KeyNotFound(key.to_string()))?;
        if let Some(pu_id) = &entry.state.read().pu_id {
            indices.by_pu_id.remove(pu_id);
        }
        Ok(())
    }

    /// Removes an entry by its PU identifier, purging both indices.
    pub fn delete_by_pu_id(&self, pu_id: &str) -> Result<(), CacheError> {
        let mut indices = self.indices.write();
        let key = indices
            .by_pu_id
            .remove(pu_id)
            .ok_or_else(|| CacheError::PuNotFound(pu_id.to_string()))?;
        indices.by_key.remove(&key);
        Ok(())
    }

    /// A snapshot of the forward-index keys, for reconciliation.
    pub fn keys(&self) -> Vec<String> {
        self.indices.read().by_key.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.indices.read().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.read().by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_key_format_is_stable() {
        assert_eq!(pod_key("ns1", "podA"), "ns1/podA");
        // Odd names pass through untouched; the key is used verbatim.
        assert_eq!(pod_key("", "x"), "/x");
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let cache = IdentityCache::new();
        let a = cache.get_or_create("ns1/podA");
        let b = cache.get_or_create("ns1/podA");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn bind_makes_entry_reachable_from_both_indices() {
        let cache = IdentityCache::new();
        let entry = cache.get_or_create("ns1/podA");
        assert_eq!(
            cache.get_by_pu_id("pu-123"),
            Err(CacheError::PuNotFound("pu-123".to_string()))
        );

        cache.bind("ns1/podA", "pu-123");
        let by_pu = cache.get_by_pu_id("pu-123").unwrap();
        assert!(Arc::ptr_eq(&entry, &by_pu));
        assert_eq!(entry.pu_id().as_deref(), Some("pu-123"));
    }

    #[test]
    fn delete_by_key_purges_reverse_index() {
        let cache = IdentityCache::new();
        cache.get_or_create("ns1/podA");
        cache.bind("ns1/podA", "pu-123");

        cache.delete_by_key("ns1/podA").unwrap();
        assert!(cache.get("ns1/podA").is_none());
        assert_eq!(
            cache.get_by_pu_id("pu-123"),
            Err(CacheError::PuNotFound("pu-123".to_string()))
        );
        assert_eq!(
            cache.delete_by_key("ns1/podA"),
            Err(CacheError::KeyNotFound("ns1/podA".to_string()))
        );
    }

    #[test]
    fn delete_by_pu_id_purges_forward_index() {
        let cache = IdentityCache::new();
        cache.get_or_create("ns1/podA");
        cache.bind("ns1/podA", "pu-123");

        cache.delete_by_pu_id("pu-123").unwrap();
        assert_eq!(
            cache.get_by_pu_id("pu-123"),
            Err(CacheError::PuNotFound("pu-123".to_string()))
        );
        assert!(cache.get("ns1/podA").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn unbound_entry_deletes_cleanly() {
        let cache = IdentityCache::new();
        cache.get_or_create("ns1/podA");
        cache.delete_by_key("ns1/podA").unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn entries_compare_by_state_snapshot() {
        let cache = IdentityCache::new();
        let a = cache.get_or_create("ns1/podA");
        let b = cache.get_or_create("ns2/podB");

        // Fresh entries hold identical (empty) state.
        assert_eq!(a, b);
        assert_eq!(a, a);

        cache.bind("ns1/podA", "pu-123");
        assert_ne!(a, b);

        // Lookup results are comparable wholesale, including the error arm.
        assert_eq!(cache.get_by_pu_id("pu-123"), Ok(a));
        assert_eq!(
            cache.get_by_pu_id("pu-999"),
            Err(CacheError::PuNotFound("pu-999".to_string()))
        );
    }

    #[test]
    fn diverged_indices_report_inconsistency() {
        let cache = IdentityCache::new();
        cache.get_or_create("ns1/podA");
        cache.bind("ns1/podA", "pu-123");

        // Forge a divergence by removing the forward entry behind the
        // cache's back.
        cache.indices.write().by_key.remove("ns1/podA");

        assert_eq!(
            cache.get_by_pu_id("pu-123"),
            Err(CacheError::Inconsistent {
                pu_id: "pu-123".to_string(),
                key: "ns1/podA".to_string(),
            })
        );
    }

    #[test]
    fn rebinding_moves_the_reverse_mapping() {
        let cache = IdentityCache::new();
        cache.get_or_create("ns1/podA");
        cache.bind("ns1/podA", "pu-123");
        cache.get_or_create("ns1/podB");
        cache.bind("ns1/podB", "pu-123");

        let entry = cache.get_by_pu_id("pu-123").unwrap();
        assert!(Arc::ptr_eq(&entry, &cache.get("ns1/podB").unwrap()));
    }

    #[test]
    fn concurrent_get_or_create_yields_one_entry() {
        let cache = Arc::new(IdentityCache::new());
        let handles = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.get_or_create("ns1/podA"))
            })
            .collect::<Vec<_>>();
        let entries = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>();
        assert!(entries.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(cache.len(), 1);
    }
}
