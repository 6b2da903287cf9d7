//! Entry point for owners: creates host controllers that share one registry
//! and, optionally, one poll thread.

use crate::endpoint::Registry;
use crate::host::{HostConfig, HostOwner, PluginProcessHost};
use crate::launcher::{CommandLauncher, LaunchParams, ProcessLauncher};
use crate::poll::PollThread;
use std::io;
use std::sync::Arc;
use tether_core::PluginsConfig;
use tracing::{debug, info};

pub struct PluginHostManager {
    config: PluginsConfig,
    registry: Arc<Registry>,
    launcher: Arc<dyn ProcessLauncher>,
    poll_thread: Option<PollThread>,
    /// Controllers whose owners asked them to shut down and handed them over.
    retired: Vec<PluginProcessHost>,
}

impl std::fmt::Debug for PluginHostManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHostManager")
            .field("active", &self.registry.len())
            .field("retired", &self.retired.len())
            .field("poll_thread", &self.poll_thread.is_some())
            .finish_non_exhaustive()
    }
}

impl PluginHostManager {
    pub fn new(config: PluginsConfig) -> io::Result<Self> {
        Self::with_launcher(config, Arc::new(CommandLauncher))
    }

    pub fn with_launcher(
        config: PluginsConfig,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> io::Result<Self> {
        let mut manager = Self {
            registry: Arc::new(Registry::new()),
            launcher,
            poll_thread: None,
            retired: Vec::new(),
            config,
        };
        manager.set_use_poll_thread(manager.config.use_poll_thread)?;
        Ok(manager)
    }

    pub fn config(&self) -> &PluginsConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Launch parameters for `plugin_file` with this manager's defaults.
    /// `launcher` is used when the config names no child executable.
    pub fn launch_params(
        &self,
        launcher: impl Into<std::path::PathBuf>,
        plugin_dir: impl Into<std::path::PathBuf>,
        plugin_file: &str,
    ) -> LaunchParams {
        let executable = self
            .config
            .launcher
            .clone()
            .unwrap_or_else(|| launcher.into());
        let mut params = LaunchParams::new(executable, plugin_dir, plugin_file);
        params.debug = self.config.debug;
        params.not_found_policy = self.config.not_found_policy;
        params
    }

    pub fn create_host(
        &self,
        params: LaunchParams,
        owner: Option<Box<dyn HostOwner>>,
    ) -> PluginProcessHost {
        PluginProcessHost::new(
            params,
            HostConfig::from(&self.config),
            self.launcher.clone(),
            self.registry.clone(),
            owner,
        )
    }

    /// Starts or stops the shared poll thread. Connections fall back to
    /// pumping their own sockets while it is off.
    pub fn set_use_poll_thread(&mut self, enabled: bool) -> io::Result<()> {
        self.config.use_poll_thread = enabled;
        match (enabled, self.poll_thread.is_some()) {
            (true, false) => self.poll_thread = Some(PollThread::spawn(self.registry.clone())?),
            (false, true) => {
                if let Some(mut thread) = self.poll_thread.take() {
                    thread.stop();
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn uses_poll_thread(&self) -> bool {
        self.poll_thread.is_some()
    }

    /// Takes over a controller so it can finish shutting down without its owner.
    pub fn retire(&mut self, mut host: PluginProcessHost) {
        host.request_shutdown();
        if host.is_done() {
            return;
        }
        debug!(endpoint = host.endpoint_id(), "retiring plugin host");
        self.retired.push(host);
    }

    /// Ticks retired controllers and drops the finished ones.
    pub fn idle(&mut self) {
        for host in &mut self.retired {
            host.idle();
        }
        self.retired.retain(|host| !host.is_done());
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Live connections, retired ones included.
    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    /// Asks every connection to shut down; each acts on its next `idle`.
    pub fn shutdown_all(&self) {
        info!(count = self.registry.len(), "shutting down all plugins");
        self.registry.shutdown_all();
    }
}

impl Drop for PluginHostManager {
    fn drop(&mut self) {
        if let Some(mut thread) = self.poll_thread.take() {
            thread.stop();
        }
    }
}
