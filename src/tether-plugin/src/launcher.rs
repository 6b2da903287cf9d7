//! Spawning plugin processes.
//!
//! The host never creates processes itself; it hands the bound port to a
//! [`ProcessLauncher`] and keeps the returned [`PluginProcess`] handle.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use tether_core::NotFoundPolicy;
use thiserror::Error;
use tracing::{debug, warn};

/// What to run and which plugin the child should load.
#[derive(Debug, Clone)]
pub struct LaunchParams {
    /// Child executable.
    pub launcher: PathBuf,
    /// Arguments placed before the port.
    pub args: Vec<String>,
    pub plugin_dir: PathBuf,
    pub plugin_file: String,
    pub env: BTreeMap<String, String>,
    /// Launch on the calling thread and disable all timeouts.
    pub debug: bool,
    pub not_found_policy: NotFoundPolicy,
}

impl LaunchParams {
    pub fn new(
        launcher: impl Into<PathBuf>,
        plugin_dir: impl Into<PathBuf>,
        plugin_file: &str,
    ) -> Self {
        Self {
            launcher: launcher.into(),
            args: Vec::new(),
            plugin_dir: plugin_dir.into(),
            plugin_file: plugin_file.to_string(),
            env: BTreeMap::new(),
            debug: false,
            not_found_policy: NotFoundPolicy::default(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn {executable}: {source}")]
    Spawn {
        executable: PathBuf,
        source: io::Error,
    },
    #[error("launch thread panicked")]
    ThreadPanicked,
    #[error("{0}")]
    Other(String),
}

/// A running (or exited) plugin process.
pub trait PluginProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Reaps the process if it exited; true while it is still alive.
    fn is_running(&mut self) -> bool;

    /// Terminates the process and waits for it. Safe to call repeatedly.
    fn kill(&mut self);
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(
        &self,
        params: &LaunchParams,
        port: u16,
    ) -> Result<Box<dyn PluginProcess>, LaunchError>;
}

/// Spawns the child with `std::process::Command`, passing the port last.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLauncher;

impl ProcessLauncher for CommandLauncher {
    fn launch(
        &self,
        params: &LaunchParams,
        port: u16,
    ) -> Result<Box<dyn PluginProcess>, LaunchError> {
        let mut command = Command::new(&params.launcher);
        command
            .args(&params.args)
            .arg(port.to_string())
            .envs(&params.env)
            .stdin(Stdio::null());
        if params.plugin_dir.is_dir() {
            command.current_dir(&params.plugin_dir);
        }

        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            executable: params.launcher.clone(),
            source,
        })?;
        debug!(
            pid = child.id(),
            port,
            launcher = %params.launcher.display(),
            "spawned plugin process"
        );
        Ok(Box::new(ChildProcess::new(child)))
    }
}

#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    exited: bool,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self {
            child,
            exited: false,
        }
    }
}

impl PluginProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn is_running(&mut self) -> bool {
        if self.exited {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = self.child.id(), %status, "plugin process exited");
                self.exited = true;
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!(pid = self.child.id(), error = %err, "failed to query plugin process");
                false
            }
        }
    }

    fn kill(&mut self) {
        if self.exited {
            return;
        }
        if let Err(err) = self.child.kill() {
            // Already exited; still reap below.
            debug!(pid = self.child.id(), error = %err, "kill failed");
        }
        if let Err(err) = self.child.wait() {
            warn!(pid = self.child.id(), error = %err, "failed to reap plugin process");
        }
        self.exited = true;
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        self.kill();
    }
}
