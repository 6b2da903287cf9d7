mod plugins;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use plugins::{BuiltinLoader, ECHO_CLASS};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_core::{init_logging, AppDirs, Config, PluginsConfig};
use tether_plugin::{
    ChildConfig, HostOwner, HostState, PluginHostManager, PluginMessage, PluginProcessChild,
};

const IDLE_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Parser)]
#[command(name = "tether", version, about = "Out-of-process plugin host")]
struct Cli {
    /// Launch plugins synchronously and keep them attached to this process
    #[arg(long, global = true)]
    debug: bool,
    /// Service plugin sockets from one shared poll thread
    #[arg(long, global = true)]
    poll_thread: bool,
    /// Seconds a plugin gets to connect after launch
    #[arg(long, global = true)]
    launch_timeout: Option<f64>,
    /// Seconds without a heartbeat before a plugin counts as locked up
    #[arg(long, global = true)]
    lockup_timeout: Option<f64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Launch a plugin, exchange messages with it and shut it down
    Host(HostCommand),
    /// Run the child side of a plugin connection (started by `host`)
    Launcher {
        /// Loopback port the host is listening on
        port: u16,
    },
}

#[derive(Debug, Parser, Clone)]
struct HostCommand {
    /// Plugin file to load
    #[arg(long, default_value = plugins::ECHO_PLUGIN)]
    plugin: String,
    /// Directory the plugin lives in
    #[arg(long, default_value = ".")]
    dir: PathBuf,
    /// Child executable (defaults to this binary's `launcher` subcommand)
    #[arg(long)]
    launcher: Option<PathBuf>,
    /// Number of ping messages to send once the plugin is running
    #[arg(long, default_value_t = 3)]
    ping: usize,
    /// Offer a shared memory segment of this many bytes
    #[arg(long)]
    shm: Option<usize>,
}

impl Cli {
    fn apply_overrides(&self, plugins: &mut PluginsConfig) {
        plugins.debug |= self.debug;
        plugins.use_poll_thread |= self.poll_thread;
        if let Some(secs) = self.launch_timeout {
            plugins.launch_timeout_secs = secs;
        }
        if let Some(secs) = self.lockup_timeout {
            plugins.lockup_timeout_secs = secs;
        }
    }
}

/// Prints what the plugin sends and remembers how it ended.
struct ConsoleOwner {
    replies: Arc<AtomicUsize>,
    failed: Arc<AtomicBool>,
}

impl HostOwner for ConsoleOwner {
    fn receive_plugin_message(&mut self, message: &PluginMessage) {
        if message.is_class(ECHO_CLASS) {
            self.replies.fetch_add(1, Ordering::SeqCst);
        }
        match message.get_u64("seq") {
            Some(seq) => println!("{}:{} seq={seq}", message.class(), message.name()),
            None => println!("{}:{}", message.class(), message.name()),
        }
    }

    fn plugin_launch_failed(&mut self) {
        self.failed.store(true, Ordering::SeqCst);
        eprintln!("plugin failed to launch");
    }

    fn plugin_died(&mut self) {
        self.failed.store(true, Ordering::SeqCst);
        eprintln!("plugin died");
    }

    fn state_changed(&mut self, state: HostState) {
        tracing::debug!(?state, "host state changed");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::discover()?;
    let mut config = Config::load_or_default(&dirs)?;
    cli.apply_overrides(&mut config.plugins);
    config.validate()?;

    match &cli.command {
        Command::Host(host) => {
            let _logging = init_logging(&config.logging, &dirs, "tether-host")?;
            run_host(config.plugins, host)
        }
        Command::Launcher { port } => {
            let _logging = init_logging(&config.logging, &dirs, "tether-launcher")?;
            let mut child = PluginProcessChild::new(*port, BuiltinLoader, ChildConfig::default());
            child.run().context("plugin child failed")
        }
    }
}

fn run_host(plugins: PluginsConfig, command: &HostCommand) -> Result<()> {
    let launcher = match &command.launcher {
        Some(path) => path.clone(),
        None => std::env::current_exe().context("locating the tether executable")?,
    };
    let manager = PluginHostManager::new(plugins).context("starting plugin manager")?;
    let mut params = manager.launch_params(launcher, &command.dir, &command.plugin);
    if command.launcher.is_none() && manager.config().launcher.is_none() {
        params = params.with_args(["launcher"]);
    }

    let replies = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicBool::new(false));
    let owner = ConsoleOwner {
        replies: replies.clone(),
        failed: failed.clone(),
    };
    let mut host = manager.create_host(params, Some(Box::new(owner)));

    while !host.is_running() && !host.is_done() {
        host.idle_for(IDLE_SLICE);
    }
    if host.is_done() {
        bail!("plugin '{}' never started", command.plugin);
    }
    tracing::info!(
        plugin = %command.plugin,
        version = host.plugin_version().unwrap_or("unknown"),
        "plugin running"
    );

    let segment = match command.shm {
        Some(size) => Some(host.add_shared_memory(size)?),
        None => None,
    };

    for seq in 0..command.ping {
        let ping = PluginMessage::new(ECHO_CLASS, "ping").with_value("seq", seq as u64);
        host.send_message(&ping);
    }

    let deadline = Instant::now().checked_add(manager.config().lockup_timeout());
    while replies.load(Ordering::SeqCst) < command.ping && !host.is_done() {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            tracing::warn!(
                expected = command.ping,
                received = replies.load(Ordering::SeqCst),
                "gave up waiting for replies"
            );
            break;
        }
        host.idle_for(IDLE_SLICE);
    }

    if let Some(name) = segment {
        if let Err(err) = host.remove_shared_memory(&name) {
            tracing::warn!(%name, error = %err, "could not release shared memory");
        }
    }

    host.request_shutdown();
    while !host.is_done() {
        host.idle_for(IDLE_SLICE);
    }

    if failed.load(Ordering::SeqCst) {
        bail!("plugin '{}' did not finish cleanly", command.plugin);
    }
    println!(
        "plugin '{}' answered {} of {} pings",
        command.plugin,
        replies.load(Ordering::SeqCst).min(command.ping),
        command.ping
    );
    Ok(())
}
