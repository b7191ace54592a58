//! Linux process and login-session lifecycle processing.
//!
//! Host services are tracked through net_cls-style cgroups: activation
//! assigns the service pid into a group under the monitor's base path, and
//! teardown removes the group. Actual cgroup filesystem access sits behind
//! the [`CgroupController`] seam.

use crate::{extract::LinuxMetadataExtractor, metrics::Metrics, PuEvent, SetupError};
use anyhow::{anyhow, Context, Result};
use microseg_core::{Event, PuHandler, PuRuntime};
use regex::Regex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Root of the cgroup hierarchy owned by this monitor.
pub const CGROUP_BASE_PATH: &str = "/microseg";

/// Manages the cgroup hierarchy for monitored services.
pub trait CgroupController: Send + Sync {
    fn assign(&self, group: &str, pid: u32) -> Result<()>;

    fn delete(&self, group: &str) -> Result<()>;

    /// Lists the groups currently present under the monitor's base path.
    fn groups(&self) -> Result<Vec<String>>;
}

#[derive(Clone, Default)]
pub struct LinuxConfig {
    /// Whether this monitor manages host services rather than login
    /// sessions.
    pub host: bool,

    pub extractor: Option<Arc<dyn LinuxMetadataExtractor>>,
}

pub struct LinuxMonitor {
    handler: Arc<dyn PuHandler>,
    extractor: Arc<dyn LinuxMetadataExtractor>,
    cgroups: Arc<dyn CgroupController>,
    host: bool,
    metrics: Metrics,
    service_name: Regex,
    cgroup_path: Regex,
}

// === impl LinuxMonitor ===

impl LinuxMonitor {
    pub fn new(
        config: LinuxConfig,
        handler: Arc<dyn PuHandler>,
        cgroups: Arc<dyn CgroupController>,
        metrics: Metrics,
    ) -> Result<Self, SetupError> {
        let extractor = config.extractor.ok_or(SetupError::MissingExtractor)?;
        // The patterns are fixed, so compilation cannot fail.
        let service_name = Regex::new(r"^[a-zA-Z0-9_].{0,11}$").expect("valid pattern");
        let cgroup_path = Regex::new(r"^/microseg/[a-zA-Z0-9_].{0,11}$").expect("valid pattern");
        Ok(Self {
            handler,
            extractor,
            cgroups,
            host: config.host,
            metrics,
            service_name,
            cgroup_path,
        })
    }

    pub fn is_host(&self) -> bool {
        self.host
    }

    pub fn valid_service_name(&self, name: &str) -> bool {
        self.service_name.is_match(name)
    }

    pub fn valid_cgroup_path(&self, path: &str) -> bool {
        self.cgroup_path.is_match(path)
    }

    /// Resyncs, then parks until the stream closes or shutdown is signaled.
    /// Linux events are push-based, so the loop only forwards envelopes.
    pub async fn run(self, mut events: mpsc::Receiver<PuEvent>, shutdown: drain::Watch) -> Result<()> {
        self.resync()?;

        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    tracing::debug!("shutdown signaled");
                    return Ok(());
                }

                event = events.recv() => match event {
                    Some(PuEvent { pu_id, event, runtime }) => {
                        if let Err(error) = self.handle_pu_event(&pu_id, event, &runtime).await {
                            tracing::warn!(pu = %pu_id, %event, %error, "event processing failed");
                        }
                    }
                    None => {
                        tracing::debug!("event stream closed");
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Sweeps the cgroup hierarchy, deleting groups whose paths no longer
    /// validate. Leftovers appear after unclean restarts.
    pub fn resync(&self) -> Result<()> {
        for group in self.cgroups.groups().context("unable to list cgroups")? {
            if !self.valid_cgroup_path(&group) {
                tracing::info!(%group, "removing invalid cgroup");
                if let Err(error) = self.cgroups.delete(&group) {
                    tracing::warn!(%group, %error, "unable to remove cgroup");
                }
            }
        }
        Ok(())
    }

    fn group_for(&self, name: &str) -> String {
        format!("{CGROUP_BASE_PATH}/{name}")
    }

    async fn start(&self, pu_id: &str, event: Event, runtime: &PuRuntime) -> Result<()> {
        if !self.valid_service_name(&runtime.name) {
            return Err(anyhow!("invalid service name {}", runtime.name));
        }

        let enriched = self.extractor.extract(runtime)?;

        if let Some(pid) = runtime.pid {
            let group = self.group_for(&runtime.name);
            self.cgroups
                .assign(&group, pid)
                .with_context(|| format!("unable to assign pid {pid} to {group}"))?;
        }

        self.handler.handle_pu_event(pu_id, event, &enriched).await
    }

    async fn destroy(&self, pu_id: &str, event: Event, runtime: &PuRuntime) -> Result<()> {
        let group = self.group_for(&runtime.name);
        if let Err(error) = self.cgroups.delete(&group) {
            tracing::debug!(%group, %error, "destroy for missing cgroup");
        }
        self.handler.handle_pu_event(pu_id, event, runtime).await
    }
}

#[async_trait::async_trait]
impl PuHandler for LinuxMonitor {
    async fn handle_pu_event(&self, pu_id: &str, event: Event, runtime: &PuRuntime) -> Result<()> {
        self.metrics.event(event);
        let result = match event {
            Event::Create | Event::Start => self.start(pu_id, event, runtime).await,
            Event::Stop | Event::Pause => self.handler.handle_pu_event(pu_id, event, runtime).await,
            Event::Destroy => self.destroy(pu_id, event, runtime).await,
            Event::ReSync => self.resync(),
        };
        if result.is_err() {
            self.metrics.event_error(event);
        }
        result
    }
}
