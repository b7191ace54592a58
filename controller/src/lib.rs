//! Microseg controller
//!
//! Wires processing units to the enforcement datapath. At construction the
//! controller builds one enforcer/supervisor pair per enabled mode and a
//! write-once table binding PU types to modes:
//!
//! ```text
//! [ PuType ] -> [ Mode ] -> ([ Enforcer ], [ Supervisor ])
//! ```
//!
//! Local (in-process) enforcement serves host workloads; remote enforcement
//! proxies to an out-of-process enforcer over an opaque RPC transport. The
//! maps are immutable after construction, so activation paths read them
//! without locks.
//!
//! Construction fatality is asymmetric: local-mode failures abort
//! controller creation, while a remote-proxy supervisor failure only logs
//! and degrades remote mode. Activating a PU whose mode is unbound or
//! degraded fails with a typed error rather than silently defaulting.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod datapath;
pub mod enforcer;
pub mod ext;
pub mod supervisor;


pub use self::{
    config::{Builder, Config, FilterQueue},
    datapath::FlowReporter,
    enforcer::{Enforcer, LocalEnforcer, ProxyEnforcer, MANAGEMENT_ID_TAG},
    ext::RpcError,
    supervisor::{LocalSupervisor, ProxySupervisor, Supervisor},
};

use ahash::AHashMap as HashMap;
use anyhow::Context as _;
use microseg_core::{Event, PuHandler, PuRuntime, PuType};
use std::sync::Arc;

/// Deployment style of enforcement for a processing unit. Fixed per PU
/// type at controller construction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Enforcement runs in this process against the kernel datapath.
    LocalServer,

    /// Enforcement is delegated over RPC to a remote process.
    RemoteContainer,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("secrets must be configured for local enforcement")]
    MissingSecrets,

    #[error("invalid filter queue: {0}")]
    InvalidFilterQueue(String),

    #[error("an RPC transport must be configured for remote enforcement")]
    MissingTransport,

    #[error("{0:?} supervision cannot be constructed for this mode")]
    InvalidMode(Mode),

    #[error("{0:?} processing units are not bound to an enforcement mode")]
    UnboundPuType(PuType),

    #[error("{0:?} enforcement is not available")]
    UnsupportedMode(Mode),

    #[error("unknown processing unit {0}")]
    UnknownPu(String),

    #[error("interception driver: {0}")]
    Interception(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// The enforcement control plane: per-mode enforcer/supervisor pairs and
/// the PU-type binding table, all write-once.
pub struct Controller {
    config: Config,
    enforcers: HashMap<Mode, Arc<dyn Enforcer>>,
    supervisors: HashMap<Mode, Arc<dyn Supervisor>>,
    pu_mode: HashMap<PuType, Mode>,
}

// === impl Controller ===

impl Controller {
    pub(crate) fn new(config: Config) -> Result<Self, Error> {
        let mut enforcers: HashMap<Mode, Arc<dyn Enforcer>> = HashMap::default();
        let mut supervisors: HashMap<Mode, Arc<dyn Supervisor>> = HashMap::default();

        if config.linux_process {
            // Local-mode construction failures are fatal: no controller is
            // returned.
            let enforcer = Arc::new(LocalEnforcer::new(&config)?);
            let supervisor = LocalSupervisor::new(
                Mode::LocalServer,
                config.target_networks.clone(),
                config.interception_driver.clone(),
            )?;
            enforcers.insert(Mode::LocalServer, enforcer);
            supervisors.insert(Mode::LocalServer, Arc::new(supervisor));
        }

        if config.remote_container {
            // The proxy enforcer only holds transport state and always
            // constructs.
            let enforcer = ProxyEnforcer::new(config.server_id.clone(), config.rpc.clone());
            enforcers.insert(Mode::RemoteContainer, Arc::new(enforcer));

            // A remote supervisor failure degrades remote mode but does not
            // abort the controller; later activations fail with
            // `UnsupportedMode`.
            match ProxySupervisor::new(config.server_id.clone(), config.rpc.clone()) {
                Ok(supervisor) => {
                    supervisors.insert(Mode::RemoteContainer, Arc::new(supervisor));
                }
                Err(error) => {
                    tracing::error!(%error, "unable to create remote supervisor");
                }
            }
        }

        let mut pu_mode = HashMap::default();
        if config.linux_process {
            pu_mode.insert(PuType::LinuxProcess, Mode::LocalServer);
            pu_mode.insert(PuType::UidLogin, Mode::LocalServer);
        }
        if config.remote_container {
            pu_mode.insert(PuType::Container, Mode::RemoteContainer);
            pu_mode.insert(PuType::Kubernetes, Mode::RemoteContainer);
        }

        Ok(Self {
            config,
            enforcers,
            supervisors,
            pu_mode,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The enforcement mode bound to a PU type, if the mode was enabled.
    pub fn mode_of(&self, pu_type: PuType) -> Option<Mode> {
        self.pu_mode.get(&pu_type).copied()
    }

    /// Resolves a PU type to its enforcer/supervisor pair. Fails with a
    /// typed error when the type is unbound or the mode is degraded.
    pub fn resolve(
        &self,
        pu_type: PuType,
    ) -> Result<(Arc<dyn Enforcer>, Arc<dyn Supervisor>), Error> {
        let mode = self
            .mode_of(pu_type)
            .ok_or(Error::UnboundPuType(pu_type))?;
        let enforcer = self
            .enforcers
            .get(&mode)
            .cloned()
            .ok_or(Error::UnsupportedMode(mode))?;
        let supervisor = self
            .supervisors
            .get(&mode)
            .cloned()
            .ok_or(Error::UnsupportedMode(mode))?;
        Ok((enforcer, supervisor))
    }

    /// Activates enforcement for a processing unit: the datapath is primed
    /// before traffic is redirected toward it.
    pub async fn activate(&self, context_id: &str, runtime: &PuRuntime) -> anyhow::Result<()> {
        let (enforcer, supervisor) = self.resolve(runtime.pu_type)?;
        enforcer
            .enforce(context_id, runtime)
            .await
            .with_context(|| format!("enforcing {context_id}"))?;
        supervisor
            .supervise(context_id, runtime)
            .await
            .with_context(|| format!("supervising {context_id}"))?;
        Ok(())
    }

    /// Tears down enforcement in the reverse of the activation order.
    pub async fn deactivate(&self, context_id: &str, runtime: &PuRuntime) -> anyhow::Result<()> {
        let (enforcer, supervisor) = self.resolve(runtime.pu_type)?;
        supervisor
            .unsupervise(context_id)
            .await
            .with_context(|| format!("unsupervising {context_id}"))?;
        enforcer
            .unenforce(context_id)
            .await
            .with_context(|| format!("unenforcing {context_id}"))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl PuHandler for Controller {
    async fn handle_pu_event(
        &self,
        pu_id: &str,
        event: Event,
        runtime: &PuRuntime,
    ) -> anyhow::Result<()> {
        match event {
            Event::Start => self.activate(pu_id, runtime).await,
            Event::Stop => self.deactivate(pu_id, runtime).await,
            Event::Destroy => match self.deactivate(pu_id, runtime).await {
                Ok(()) => Ok(()),
                // A destroy commonly follows a stop that already tore the
                // PU down.
                Err(error)
                    if error
                        .chain()
                        .any(|e| matches!(e.downcast_ref::<Error>(), Some(Error::UnknownPu(_)))) =>
                {
                    tracing::debug!(pu_id = %pu_id, "already deactivated");
                    Ok(())
                }
                Err(error) => Err(error),
            },
            Event::Create | Event::Pause | Event::ReSync => {
                tracing::trace!(pu_id = %pu_id, event = %event, "no enforcement change");
                Ok(())
            }
        }
    }
}
