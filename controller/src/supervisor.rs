use crate::{
    ext::{InterceptionDriver, RpcClient},
    Error, Mode,
};
use ahash::AHashSet as HashSet;
use ipnet::IpNet;
use microseg_core::PuRuntime;
use parking_lot::RwLock;
use std::sync::Arc;

pub(crate) const SUPERVISE_OPERATION: &str = "supervise";
pub(crate) const UNSUPERVISE_OPERATION: &str = "unsupervise";

/// Programs traffic interception for activated processing units.
#[async_trait::async_trait]
pub trait Supervisor: Send + Sync {
    async fn supervise(&self, context_id: &str, runtime: &PuRuntime) -> Result<(), Error>;

    async fn unsupervise(&self, context_id: &str) -> Result<(), Error>;
}

/// Supervision of in-process enforcement: drives the interception driver
/// for each activated PU against the configured target networks.
pub struct LocalSupervisor {
    target_networks: Vec<IpNet>,
    driver: Option<Arc<dyn InterceptionDriver>>,
    supervised: RwLock<HashSet<String>>,
}

/// Supervision delegated to the remote enforcer process. Unlike the proxy
/// enforcer, this cannot be constructed without a transport.
pub struct ProxySupervisor {
    server_id: String,
    rpc: Arc<dyn RpcClient>,
}

// === impl LocalSupervisor ===

impl LocalSupervisor {
    pub(crate) fn new(
        mode: Mode,
        target_networks: Vec<IpNet>,
        driver: Option<Arc<dyn InterceptionDriver>>,
    ) -> Result<Self, Error> {
        if mode != Mode::LocalServer {
            return Err(Error::InvalidMode(mode));
        }
        Ok(Self {
            target_networks,
            driver,
            supervised: RwLock::new(HashSet::default()),
        })
    }

    pub fn target_networks(&self) -> &[IpNet] {
        &self.target_networks
    }
}

#[async_trait::async_trait]
impl Supervisor for LocalSupervisor {
    async fn supervise(&self, context_id: &str, runtime: &PuRuntime) -> Result<(), Error> {
        if let Some(driver) = &self.driver {
            driver
                .install(context_id, runtime, &self.target_networks)
                .map_err(|e| Error::Interception(e.to_string()))?;
        }
        self.supervised.write().insert(context_id.to_string());
        tracing::debug!(
            context = %context_id,
            networks = self.target_networks.len(),
            "supervised",
        );
        Ok(())
    }

    async fn unsupervise(&self, context_id: &str) -> Result<(), Error> {
        if !self.supervised.write().remove(context_id) {
            return Err(Error::UnknownPu(context_id.to_string()));
        }
        if let Some(driver) = &self.driver {
            driver
                .remove(context_id)
                .map_err(|e| Error::Interception(e.to_string()))?;
        }
        Ok(())
    }
}

// === impl ProxySupervisor ===

impl ProxySupervisor {
    pub(crate) fn new(server_id: String, rpc: Option<Arc<dyn RpcClient>>) -> Result<Self, Error> {
        let rpc = rpc.ok_or(Error::MissingTransport)?;
        Ok(Self { server_id, rpc })
    }
}

#[async_trait::async_trait]
impl Supervisor for ProxySupervisor {
    async fn supervise(&self, context_id: &str, _runtime: &PuRuntime) -> Result<(), Error> {
        self.rpc
            .call(
                &self.server_id,
                SUPERVISE_OPERATION,
                context_id.as_bytes().to_vec(),
            )
            .await?;
        Ok(())
    }

    async fn unsupervise(&self, context_id: &str) -> Result<(), Error> {
        self.rpc
            .call(
                &self.server_id,
                UNSUPERVISE_OPERATION,
                context_id.as_bytes().to_vec(),
            )
            .await?;
        Ok(())
    }
}
