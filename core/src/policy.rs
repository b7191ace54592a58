use crate::{connection::FlowTuple, pu::PuContext};
use serde::{Deserialize, Serialize};

/// The verdict a policy renders for a flow.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Accept,
    Reject,
}

/// Distinguishes policies that are enforced from policies that are only
/// evaluated for audit purposes.
///
/// An observed policy produces telemetry describing what it *would* have
/// done, alongside the decision that was actually applied to the packet.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObserveAction {
    #[default]
    NotObserved,

    /// Record the match and continue evaluating further policies.
    ObserveContinue,

    /// Record the match and apply the policy's action.
    ObserveApply,
}

/// A single policy decision for a flow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowPolicy {
    pub action: Action,
    pub policy_id: String,

    /// Identifies the external service a policy matched, if any.
    pub service_id: String,

    pub observe_action: ObserveAction,
}

/// Supplies policy decisions to the datapath. Implemented by the external
/// policy engine; the core only reads the returned decisions.
pub trait PolicyEngine: Send + Sync {
    fn decide(&self, flow: &FlowTuple, context: &PuContext) -> FlowPolicy;
}

// === impl Action ===

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept => "accept".fmt(f),
            Self::Reject => "reject".fmt(f),
        }
    }
}

// === impl ObserveAction ===

impl ObserveAction {
    pub fn observed(self) -> bool {
        !matches!(self, Self::NotObserved)
    }
}

// === impl FlowPolicy ===

impl FlowPolicy {
    /// The policy reported when a flow is rejected without an explicit
    /// policy object, i.e. an implicit default-deny.
    pub fn reject_default() -> Self {
        Self {
            action: Action::Reject,
            policy_id: String::new(),
            service_id: String::new(),
            observe_action: ObserveAction::NotObserved,
        }
    }
}
