//! Seams for the external collaborators the controller drives but does not
//! implement: key material, packet-processing plugins, the low-level
//! network-interception engine, and the remote-enforcer RPC transport.

use anyhow::Result;
use ipnet::IpNet;
use microseg_core::{FlowTuple, PuContext, PuRuntime};

/// Provides key material for the mutual-authentication handshake.
pub trait Secrets: Send + Sync {
    /// The key transmitted to peers during the handshake.
    fn transmitted_key(&self) -> &[u8];

    /// The key used to sign locally-produced identity tokens.
    fn encoding_key(&self) -> &[u8];
}

/// An optional plugin invoked around datapath decisions. Returning false
/// vetoes the flow regardless of policy.
pub trait PacketProcessor: Send + Sync {
    fn process(&self, flow: &FlowTuple, context: &PuContext) -> bool;
}

/// Programs the network-interception layer (filter rules, queue bindings)
/// for a processing unit. The rule grammar lives behind this seam.
pub trait InterceptionDriver: Send + Sync {
    fn install(&self, context_id: &str, runtime: &PuRuntime, target_networks: &[IpNet])
        -> Result<()>;

    fn remove(&self, context_id: &str) -> Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("remote enforcer unavailable: {0}")]
    Unavailable(String),

    #[error("rpc call failed: {0}")]
    Call(String),
}

/// Opaque request/response transport to an out-of-process enforcer. Calls
/// are addressed by a server identifier and an operation name; the channel
/// has its own failure domain, independent of local state.
#[async_trait::async_trait]
pub trait RpcClient: Send + Sync {
    async fn call(
        &self,
        server_id: &str,
        operation: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RpcError>;
}
