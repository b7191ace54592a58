use crate::{
    config::Config,
    datapath::FlowReporter,
    ext::{PacketProcessor, RpcClient, Secrets},
    Error,
};
use ahash::AHashMap as HashMap;
use microseg_core::{PuContext, PuRuntime};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

/// Tag carrying the identifier under which a workload is known to
/// management tooling.
pub const MANAGEMENT_ID_TAG: &str = "@app:microseg:management-id";

pub(crate) const ENFORCE_OPERATION: &str = "enforce";
pub(crate) const UNENFORCE_OPERATION: &str = "unenforce";

/// Makes per-packet decisions for activated processing units.
#[async_trait::async_trait]
pub trait Enforcer: Send + Sync {
    /// Activates enforcement for a processing unit.
    async fn enforce(&self, context_id: &str, runtime: &PuRuntime) -> Result<(), Error>;

    /// Tears down enforcement for a processing unit.
    async fn unenforce(&self, context_id: &str) -> Result<(), Error>;
}

/// In-process enforcement against the kernel datapath.
pub struct LocalEnforcer {
    server_id: String,
    secrets: Arc<dyn Secrets>,
    packet_processor: Option<Arc<dyn PacketProcessor>>,
    reporter: FlowReporter,

    /// Activated PU contexts, looked up by the datapath per packet.
    contexts: RwLock<HashMap<String, Arc<PuContext>>>,
}

/// Delegates enforcement to an out-of-process enforcer over RPC. Holds only
/// transport state, so construction cannot fail; calls fail individually
/// when no transport is configured.
pub struct ProxyEnforcer {
    server_id: String,
    rpc: Option<Arc<dyn RpcClient>>,
}

#[derive(Serialize)]
struct RemoteRequest<'a> {
    context_id: &'a str,
    runtime: &'a PuRuntime,
}

// === impl LocalEnforcer ===

impl LocalEnforcer {
    pub(crate) fn new(config: &Config) -> Result<Self, Error> {
        config.filter_queue.validate()?;
        let secrets = config.secrets.clone().ok_or(Error::MissingSecrets)?;

        tracing::debug!(
            server_id = %config.server_id,
            mutual_auth = config.mutual_auth,
            packet_logs = config.packet_logs,
            "initializing local enforcer",
        );

        Ok(Self {
            server_id: config.server_id.clone(),
            secrets,
            packet_processor: config.packet_processor.clone(),
            reporter: FlowReporter::new(config.collector.clone()),
            contexts: RwLock::new(HashMap::default()),
        })
    }

    /// The reporting engine the datapath emits telemetry through.
    pub fn reporter(&self) -> &FlowReporter {
        &self.reporter
    }

    /// Key material for the datapath handshake.
    pub fn secrets(&self) -> &Arc<dyn Secrets> {
        &self.secrets
    }

    /// The packet-processing plugin, if one is installed.
    pub fn packet_processor(&self) -> Option<&Arc<dyn PacketProcessor>> {
        self.packet_processor.as_ref()
    }

    /// Looks up the context for an activated processing unit.
    pub fn context(&self, context_id: &str) -> Option<Arc<PuContext>> {
        self.contexts.read().get(context_id).cloned()
    }
}

#[async_trait::async_trait]
impl Enforcer for LocalEnforcer {
    async fn enforce(&self, context_id: &str, runtime: &PuRuntime) -> Result<(), Error> {
        let management_id = runtime
            .tag(MANAGEMENT_ID_TAG)
            .unwrap_or(context_id)
            .to_string();
        let context = Arc::new(PuContext {
            context_id: context_id.to_string(),
            management_id,
            pu_type: runtime.pu_type,
            annotations: runtime.tags().clone(),
        });

        self.contexts
            .write()
            .insert(context_id.to_string(), context);
        tracing::debug!(server_id = %self.server_id, context = %context_id, "enforcing");
        Ok(())
    }

    async fn unenforce(&self, context_id: &str) -> Result<(), Error> {
        if self.contexts.write().remove(context_id).is_none() {
            return Err(Error::UnknownPu(context_id.to_string()));
        }
        tracing::debug!(context = %context_id, "unenforced");
        Ok(())
    }
}

// === impl ProxyEnforcer ===

impl ProxyEnforcer {
    pub(crate) fn new(server_id: String, rpc: Option<Arc<dyn RpcClient>>) -> Self {
        Self { server_id, rpc }
    }

    fn transport(&self) -> Result<&Arc<dyn RpcClient>, Error> {
        self.rpc.as_ref().ok_or(Error::MissingTransport)
    }
}

#[async_trait::async_trait]
impl Enforcer for ProxyEnforcer {
    async fn enforce(&self, context_id: &str, runtime: &PuRuntime) -> Result<(), Error> {
        let payload = serde_json::to_vec(&RemoteRequest {
            context_id,
            runtime,
        })
        .expect("runtime snapshots are serializable");
        self.transport()?
            .call(&self.server_id, ENFORCE_OPERATION, payload)
            .await?;
        tracing::debug!(context = %context_id, "remote enforce dispatched");
        Ok(())
    }

    async fn unenforce(&self, context_id: &str) -> Result<(), Error> {
        self.transport()?
            .call(
                &self.server_id,
                UNENFORCE_OPERATION,
                context_id.as_bytes().to_vec(),
            )
            .await?;
        Ok(())
    }
}
