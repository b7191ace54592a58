use crate::{
    ext::{InterceptionDriver, PacketProcessor, RpcClient, Secrets},
    Controller, Error,
};
use ipnet::IpNet;
use microseg_core::{Collector, LogCollector};
use std::{sync::Arc, time::Duration};

/// NFQUEUE tuning for the local datapath.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FilterQueue {
    /// First queue number of the contiguous range used by this controller.
    pub queue_start: u16,

    /// Queues serving application-originated packets.
    pub num_app_queues: u16,

    /// Queues serving network-originated packets.
    pub num_net_queues: u16,

    /// Packet mark applied to traffic already processed, so it bypasses
    /// re-interception.
    pub mark: u32,
}

/// Everything the controller is constructed from. Populated by [`Builder`];
/// immutable once the controller exists.
pub struct Config {
    pub server_id: String,
    pub collector: Arc<dyn Collector>,
    pub packet_processor: Option<Arc<dyn PacketProcessor>>,
    pub secrets: Option<Arc<dyn Secrets>>,
    pub interception_driver: Option<Arc<dyn InterceptionDriver>>,
    pub rpc: Option<Arc<dyn RpcClient>>,

    /// Enables local (in-process) enforcement for host processes.
    pub linux_process: bool,

    /// Enables remote (out-of-process) enforcement for containers.
    pub remote_container: bool,

    pub filter_queue: FilterQueue,
    pub mutual_auth: bool,
    pub packet_logs: bool,

    /// Lifetime of issued identity credentials.
    pub validity: Duration,

    pub proc_mount_point: String,
    pub external_ip_cache_timeout: Duration,
    pub target_networks: Vec<IpNet>,
}

/// Assembles a [`Controller`]. Every option is independently optional; the
/// defaults are documented on each method.
pub struct Builder {
    config: Config,
}

// === impl FilterQueue ===

impl Default for FilterQueue {
    fn default() -> Self {
        Self {
            queue_start: 0,
            num_app_queues: 4,
            num_net_queues: 4,
            mark: 0x1111,
        }
    }
}

impl FilterQueue {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.num_app_queues == 0 || self.num_net_queues == 0 {
            return Err(Error::InvalidFilterQueue(
                "queue counts must be non-zero".to_string(),
            ));
        }
        if self.mark == 0 {
            return Err(Error::InvalidFilterQueue(
                "the bypass mark must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

// === impl Builder ===

impl Builder {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            config: Config {
                server_id: server_id.into(),
                collector: Arc::new(LogCollector),
                packet_processor: None,
                secrets: None,
                interception_driver: None,
                rpc: None,
                linux_process: false,
                remote_container: false,
                filter_queue: FilterQueue::default(),
                mutual_auth: true,
                packet_logs: false,
                validity: Duration::from_secs(60 * 60),
                proc_mount_point: "/proc".to_string(),
                external_ip_cache_timeout: Duration::from_secs(120),
                target_networks: vec![],
            },
        }
    }

    /// Sets the telemetry collector. Defaults to a collector that logs and
    /// discards records.
    pub fn collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.config.collector = collector;
        self
    }

    /// Installs a packet-processing plugin. No plugin by default.
    pub fn packet_processor(mut self, processor: Arc<dyn PacketProcessor>) -> Self {
        self.config.packet_processor = Some(processor);
        self
    }

    /// Sets the secrets provider. Unset by default; required when local
    /// enforcement is enabled.
    pub fn secrets(mut self, secrets: Arc<dyn Secrets>) -> Self {
        self.config.secrets = Some(secrets);
        self
    }

    /// Installs the network-interception driver used by the local
    /// supervisor. Without one, supervision only tracks state.
    pub fn interception_driver(mut self, driver: Arc<dyn InterceptionDriver>) -> Self {
        self.config.interception_driver = Some(driver);
        self
    }

    /// Sets the RPC transport to the remote enforcer process. Unset by
    /// default; without one, remote supervision is degraded.
    pub fn rpc_client(mut self, rpc: Arc<dyn RpcClient>) -> Self {
        self.config.rpc = Some(rpc);
        self
    }

    /// Enables local enforcement of Linux-process workloads. Off by default.
    pub fn enable_linux_process(mut self) -> Self {
        self.config.linux_process = true;
        self
    }

    /// Enables remote enforcement of container workloads. Off by default.
    pub fn enable_remote_container(mut self) -> Self {
        self.config.remote_container = true;
        self
    }

    /// Overrides the filter-queue tuning.
    pub fn filter_queue(mut self, fq: FilterQueue) -> Self {
        self.config.filter_queue = fq;
        self
    }

    /// Disables mutual authentication. Enabled by default.
    pub fn disable_mutual_auth(mut self) -> Self {
        self.config.mutual_auth = false;
        self
    }

    /// Enables packet-level logging. Off by default.
    pub fn enable_packet_logs(mut self) -> Self {
        self.config.packet_logs = true;
        self
    }

    /// Sets the credential validity period. Defaults to one hour.
    pub fn validity(mut self, validity: Duration) -> Self {
        self.config.validity = validity;
        self
    }

    /// Overrides the proc filesystem mount point. Defaults to `/proc`.
    pub fn proc_mount_point(mut self, path: impl Into<String>) -> Self {
        self.config.proc_mount_point = path.into();
        self
    }

    /// Sets how long resolved external-service addresses are cached.
    /// Defaults to two minutes.
    pub fn external_ip_cache_timeout(mut self, timeout: Duration) -> Self {
        self.config.external_ip_cache_timeout = timeout;
        self
    }

    /// Sets the networks whose traffic is intercepted. Empty by default.
    pub fn target_networks(mut self, networks: Vec<IpNet>) -> Self {
        self.config.target_networks = networks;
        self
    }

    /// Constructs the per-mode enforcers and supervisors and binds PU types
    /// to modes. Local-mode construction failures abort; see
    /// [`Controller::new`] for the fatality rules.
    pub fn build(self) -> Result<Controller, Error> {
        Controller::new(self.config)
    }
}
