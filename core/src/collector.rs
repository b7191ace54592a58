use crate::{
    policy::Action,
    pu::{Event, TagSet},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Why a flow was dropped.
///
/// Only `PolicyDrop` marks a connection as reject-reported; the other
/// reasons describe failures that precede a policy decision and may be
/// reported again once policy is actually evaluated.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// An enforced policy said to drop the flow.
    PolicyDrop,

    /// An API-level (external service) policy said to drop the flow.
    ApiPolicyDrop,

    InvalidToken,
    InvalidFormat,
    MissingToken,
    InvalidConnection,
}

/// Distinguishes flow endpoints resolved to a processing unit from plain
/// network addresses outside the mesh.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointKind {
    Pu,
    Address,
}

/// One side of a reported flow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub kind: EndpointKind,
    pub id: String,
    pub ip: IpAddr,
    pub port: u16,
}

/// The policy that was evaluated but not enforced, attached to a record
/// when the matched policy is observe-only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedPolicy {
    pub action: Action,
    pub policy_id: String,
}

/// Telemetry emitted for a single connection outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub context_id: String,
    pub source: Endpoint,
    pub destination: Endpoint,

    /// IANA L4 protocol number.
    pub protocol: u8,

    pub action: Action,
    pub drop_reason: Option<DropReason>,
    pub policy_id: String,
    pub tags: TagSet,

    /// Set iff the matched policy was observed rather than enforced; holds
    /// the decision that was actually applied.
    pub observed: Option<ObservedPolicy>,

    pub timestamp: DateTime<Utc>,
}

/// Telemetry emitted for a processing-unit lifecycle transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub context_id: String,
    pub ip_addresses: Vec<IpAddr>,
    pub tags: TagSet,
    pub event: Event,
}

/// Receives telemetry records. Emission is fire-and-forget: delivery and
/// durability are the collector's concern and failures never propagate
/// back into the datapath.
pub trait Collector: Send + Sync {
    fn collect_flow(&self, record: FlowRecord);

    fn collect_container(&self, record: ContainerRecord);
}

/// A collector that logs records and otherwise discards them. Used when no
/// external collector is configured.
#[derive(Copy, Clone, Debug, Default)]
pub struct LogCollector;

// === impl DropReason ===

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PolicyDrop => "policy".fmt(f),
            Self::ApiPolicyDrop => "api_policy".fmt(f),
            Self::InvalidToken => "invalid_token".fmt(f),
            Self::InvalidFormat => "invalid_format".fmt(f),
            Self::MissingToken => "missing_token".fmt(f),
            Self::InvalidConnection => "invalid_connection".fmt(f),
        }
    }
}

// === impl LogCollector ===

impl Collector for LogCollector {
    fn collect_flow(&self, record: FlowRecord) {
        tracing::debug!(
            context = %record.context_id,
            action = %record.action,
            policy = %record.policy_id,
            "flow",
        );
    }

    fn collect_container(&self, record: ContainerRecord) {
        tracing::debug!(context = %record.context_id, event = %record.event, "container");
    }
}
