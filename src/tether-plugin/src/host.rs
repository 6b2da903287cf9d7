//! Host-side process controller.
//!
//! A [`PluginProcessHost`] owns one plugin process and its connection. The
//! owner drives it by calling [`PluginProcessHost::idle`] from its own loop;
//! every call pumps the connection, dispatches inbound messages and advances
//! the state machine:
//!
//! ```text
//! Initialized -> Listening -> Launched -> Connected -> Hello -> Loading
//!     -> Running -> Goodbye -> Exiting -> Cleanup -> Done
//! ```
//!
//! Failures before `Running` go through `LaunchFailure`, later ones through
//! `Error`; both end in `Cleanup`, the only place OS resources are released.

use crate::endpoint::{Endpoint, Registry};
use crate::launcher::{LaunchError, LaunchParams, PluginProcess, ProcessLauncher};
use crate::message::{InternalMessage, PluginMessage, MESSAGE_CLASS_INTERNAL};
use crate::pipe::MessagePipe;
use crate::shm::{SegmentTable, SharedMemoryRegion, ShmError};
use std::collections::BTreeMap;
use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tether_core::{NotFoundPolicy, PluginsConfig};
use tracing::{debug, info, warn};

const MAX_STEPS_PER_IDLE: usize = 16;

/// Timeouts applied to one connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostConfig {
    pub launch_timeout: Duration,
    pub lockup_timeout: Duration,
    pub exit_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::from(&PluginsConfig::default())
    }
}

impl From<&PluginsConfig> for HostConfig {
    fn from(config: &PluginsConfig) -> Self {
        Self {
            launch_timeout: config.launch_timeout(),
            lockup_timeout: config.lockup_timeout(),
            exit_timeout: config.exit_timeout(),
        }
    }
}

/// Receives messages and lifecycle events from a [`PluginProcessHost`].
pub trait HostOwner: Send {
    fn receive_plugin_message(&mut self, message: &PluginMessage);

    /// The plugin failed before it reached `Running`.
    fn plugin_launch_failed(&mut self) {}

    /// The plugin failed after it reached `Running`.
    fn plugin_died(&mut self) {}

    fn state_changed(&mut self, _state: HostState) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HostState {
    Uninitialized,
    Initialized,
    Listening,
    Launched,
    Connected,
    Hello,
    Loading,
    Running,
    Goodbye,
    Exiting,
    LaunchFailure,
    Error,
    Cleanup,
    Done,
}

type LaunchResult = Result<Box<dyn PluginProcess>, LaunchError>;

pub struct PluginProcessHost {
    params: LaunchParams,
    config: HostConfig,
    state: HostState,
    owner: Option<Box<dyn HostOwner>>,
    launcher: Arc<dyn ProcessLauncher>,
    registry: Arc<Registry>,
    endpoint: Arc<Endpoint>,
    listener: Option<TcpListener>,
    port: Option<u16>,
    process: Option<Box<dyn PluginProcess>>,
    launch_thread: Option<JoinHandle<LaunchResult>>,
    /// Launch deadline while launching, lockup deadline afterwards.
    deadline: Option<Instant>,
    segments: SegmentTable,
    sleep_time: f64,
    cpu_usage: f64,
    blocked: bool,
    disable_timeout: bool,
    plugin_version: Option<String>,
    message_class_versions: BTreeMap<String, String>,
}

impl std::fmt::Debug for PluginProcessHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginProcessHost")
            .field("endpoint", &self.endpoint.id())
            .field("state", &self.state)
            .field("port", &self.port)
            .field("plugin", &self.params.plugin_file)
            .finish_non_exhaustive()
    }
}

impl PluginProcessHost {
    /// Registers a new connection; nothing is bound or spawned until `idle`.
    pub fn new(
        params: LaunchParams,
        config: HostConfig,
        launcher: Arc<dyn ProcessLauncher>,
        registry: Arc<Registry>,
        owner: Option<Box<dyn HostOwner>>,
    ) -> Self {
        let endpoint = registry.register();
        let mut host = Self {
            params,
            config,
            state: HostState::Uninitialized,
            owner,
            launcher,
            registry,
            endpoint,
            listener: None,
            port: None,
            process: None,
            launch_thread: None,
            deadline: None,
            segments: SegmentTable::new(),
            sleep_time: 0.0,
            cpu_usage: 0.0,
            blocked: false,
            disable_timeout: false,
            plugin_version: None,
            message_class_versions: BTreeMap::new(),
        };
        host.set_state(HostState::Initialized);
        host
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn endpoint_id(&self) -> u64 {
        self.endpoint.id()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn is_running(&self) -> bool {
        self.state == HostState::Running
    }

    pub fn is_loading(&self) -> bool {
        self.state <= HostState::Loading
    }

    pub fn is_done(&self) -> bool {
        self.state == HostState::Done
    }

    /// True while the plugin waits for a `blocking_response` from the owner.
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn can_send_message(&self) -> bool {
        matches!(
            self.state,
            HostState::Hello | HostState::Loading | HostState::Running
        ) && self.endpoint.has_pipe()
    }

    pub fn cpu_usage(&self) -> f64 {
        self.cpu_usage
    }

    pub fn plugin_version(&self) -> Option<&str> {
        self.plugin_version.as_deref()
    }

    pub fn message_class_version(&self, class: &str) -> Option<&str> {
        self.message_class_versions.get(class).map(String::as_str)
    }

    /// Suspends lockup detection without entering debug mode.
    pub fn set_disable_timeout(&mut self, disable: bool) {
        self.disable_timeout = disable;
    }

    /// Runs one tick without waiting for input.
    pub fn idle(&mut self) {
        self.idle_for(Duration::ZERO);
    }

    /// Runs one tick, waiting up to `timeout` for input when this
    /// connection pumps its own socket.
    pub fn idle_for(&mut self, timeout: Duration) {
        if self.endpoint.take_shutdown_request() {
            self.request_shutdown();
        }

        if self.state < HostState::Cleanup {
            let include_input = !self.endpoint.polled_input();
            self.endpoint.pump(timeout, include_input);
            self.process_incoming();
            self.check_transport();
        }

        for _ in 0..MAX_STEPS_PER_IDLE {
            let before = self.state;
            self.step();
            if self.state == before {
                break;
            }
        }
    }

    /// Sends a message to the plugin. Dropped with a warning when the
    /// connection is not up.
    pub fn send_message(&mut self, message: &PluginMessage) {
        if message.is_blocking_response() {
            self.blocked = false;
            self.reset_lockup_deadline();
        }

        let raw = match message.generate() {
            Ok(raw) => raw,
            Err(err) => {
                warn!(endpoint = self.endpoint.id(), error = %err, "failed to serialize message");
                return;
            }
        };

        let mut io = self.endpoint.io();
        let Some(pipe) = io.pipe.as_mut() else {
            warn!(
                endpoint = self.endpoint.id(),
                class = message.class(),
                name = message.name(),
                "dropping message, plugin not connected"
            );
            return;
        };
        debug!(
            endpoint = self.endpoint.id(),
            class = message.class(),
            name = message.name(),
            "sending"
        );
        pipe.enqueue(&raw);
        if let Err(err) = pipe.pump_output() {
            io.record_error(err);
        }
    }

    /// Creates a segment and offers it to the plugin. Returns the segment name.
    pub fn add_shared_memory(&mut self, size: usize) -> Result<String, ShmError> {
        if !self.can_send_message() {
            return Err(ShmError::NotConnected);
        }
        let region = SharedMemoryRegion::create(size)?;
        let name = self.segments.insert(region);
        info!(endpoint = self.endpoint.id(), name = %name, size, "adding shared memory");
        self.send_internal(&InternalMessage::ShmAdd {
            name: name.clone(),
            size,
        });
        Ok(name)
    }

    /// Starts negotiated removal; the segment is destroyed once the plugin
    /// acknowledges, or immediately when there is no plugin left to ask.
    pub fn remove_shared_memory(&mut self, name: &str) -> Result<(), ShmError> {
        self.segments.begin_remove(name)?;
        if self.endpoint.has_pipe() && self.state < HostState::LaunchFailure {
            self.send_internal(&InternalMessage::ShmRemove {
                name: name.to_string(),
            });
        } else {
            self.segments.complete_remove(name);
        }
        Ok(())
    }

    pub fn shared_memory_size(&self, name: &str) -> Option<usize> {
        self.segments.size(name)
    }

    pub fn shared_memory_address(&self, name: &str) -> Option<usize> {
        self.segments.address(name)
    }

    pub fn shared_memory_region(&mut self, name: &str) -> Option<&mut SharedMemoryRegion> {
        self.segments.region_mut(name)
    }

    /// Sets the plugin's wait between idle slices, in seconds.
    pub fn set_sleep_time(&mut self, seconds: f64, force_send: bool) {
        if force_send || seconds != self.sleep_time {
            self.sleep_time = seconds;
            if self.can_send_message() {
                self.send_internal(&InternalMessage::SleepTime { time: seconds });
            }
        }
    }

    /// Begins graceful shutdown and detaches the owner; no further
    /// callbacks are made.
    pub fn request_shutdown(&mut self) {
        self.owner = None;
        if self.state >= HostState::Goodbye {
            return;
        }
        if self.endpoint.has_pipe() && self.state >= HostState::Connected {
            self.set_state(HostState::Goodbye);
        } else {
            self.set_state(HostState::Cleanup);
        }
    }

    fn send_internal(&mut self, message: &InternalMessage) {
        self.send_message(&message.to_message());
    }

    fn set_state(&mut self, state: HostState) {
        debug!(endpoint = self.endpoint.id(), from = ?self.state, to = ?state, "host state");
        self.state = state;
        if let Some(owner) = self.owner.as_mut() {
            owner.state_changed(state);
        }
    }

    fn error_state(&mut self) {
        if self.state >= HostState::LaunchFailure {
            return;
        }
        if self.state < HostState::Running {
            self.set_state(HostState::LaunchFailure);
        } else {
            self.set_state(HostState::Error);
        }
    }

    fn reset_lockup_deadline(&mut self) {
        self.deadline = deadline_after(self.config.lockup_timeout);
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn timeouts_disabled(&self) -> bool {
        self.params.debug || self.disable_timeout
    }

    fn locked_up_or_quit(&mut self) -> bool {
        if let Some(process) = self.process.as_mut() {
            if !process.is_running() {
                warn!(endpoint = self.endpoint.id(), state = ?self.state, "plugin process exited");
                return true;
            }
        }
        if self.timeouts_disabled() || self.blocked {
            return false;
        }
        if self.deadline_passed() {
            warn!(endpoint = self.endpoint.id(), state = ?self.state, "plugin locked up");
            return true;
        }
        false
    }

    fn process_incoming(&mut self) {
        let messages = self.endpoint.io().incoming.drain();
        for message in messages {
            self.receive_message(message);
        }
    }

    fn check_transport(&mut self) {
        let err = self.endpoint.io().transport_error.take();
        let Some(err) = err else {
            return;
        };

        if err.io_kind() == Some(io::ErrorKind::NotFound)
            && self.params.not_found_policy == NotFoundPolicy::Ignore
        {
            warn!(endpoint = self.endpoint.id(), error = %err, "ignoring transport error");
            return;
        }

        self.endpoint.close();
        self.registry.mark_dirty();
        if self.state >= HostState::Goodbye {
            debug!(endpoint = self.endpoint.id(), error = %err, "closed during shutdown");
            return;
        }
        warn!(
            endpoint = self.endpoint.id(),
            state = ?self.state,
            error = %err,
            "plugin connection failed"
        );
        self.error_state();
    }

    fn receive_message(&mut self, message: PluginMessage) {
        if message.is_class(MESSAGE_CLASS_INTERNAL) {
            match InternalMessage::decode(&message) {
                Ok(internal) => self.receive_internal(internal),
                Err(err) => {
                    warn!(endpoint = self.endpoint.id(), error = %err, "malformed control message");
                    self.error_state();
                }
            }
            return;
        }

        if message.is_blocking_request() {
            self.blocked = true;
        }
        if let Some(owner) = self.owner.as_mut() {
            owner.receive_plugin_message(&message);
        }
    }

    fn receive_internal(&mut self, message: InternalMessage) {
        match message {
            InternalMessage::Hello => {
                if self.state == HostState::Connected {
                    self.set_state(HostState::Hello);
                } else {
                    self.protocol_violation("hello");
                }
            }
            InternalMessage::LoadPluginResponse {
                versions,
                plugin_version,
            } => {
                if self.state != HostState::Loading {
                    self.protocol_violation("load_plugin_response");
                    return;
                }
                info!(
                    endpoint = self.endpoint.id(),
                    plugin_version = plugin_version.as_deref().unwrap_or("unknown"),
                    "plugin loaded"
                );
                self.message_class_versions = versions;
                self.plugin_version = plugin_version;
                self.reset_lockup_deadline();
                self.set_state(HostState::Running);
                self.set_sleep_time(self.sleep_time, true);
            }
            InternalMessage::Heartbeat { cpu_usage } => {
                self.reset_lockup_deadline();
                self.cpu_usage = cpu_usage;
            }
            InternalMessage::ShmAddResponse { name, error: None } => {
                if !self.segments.add_acknowledged(&name) {
                    warn!(endpoint = self.endpoint.id(), name = %name, "ack for unknown segment");
                }
            }
            InternalMessage::ShmAddResponse {
                name,
                error: Some(error),
            } => {
                warn!(
                    endpoint = self.endpoint.id(),
                    name = %name,
                    error = %error,
                    "plugin could not attach shared memory"
                );
                self.segments.add_failed(&name);
            }
            InternalMessage::ShmRemoveResponse { name } => {
                if self.segments.complete_remove(&name) {
                    debug!(endpoint = self.endpoint.id(), name = %name, "shared memory removed");
                }
            }
            InternalMessage::Goodbye => {
                info!(endpoint = self.endpoint.id(), state = ?self.state, "plugin said goodbye");
                if self.state == HostState::Running {
                    self.owner = None;
                    self.deadline = deadline_after(self.config.exit_timeout);
                    self.set_state(HostState::Exiting);
                }
            }
            InternalMessage::Unrecognized(name) => {
                warn!(endpoint = self.endpoint.id(), name = %name, "unknown control message");
            }
            other => {
                warn!(
                    endpoint = self.endpoint.id(),
                    message = ?other,
                    "unexpected control message from plugin"
                );
            }
        }
    }

    fn protocol_violation(&mut self, name: &str) {
        warn!(
            endpoint = self.endpoint.id(),
            state = ?self.state,
            name,
            "control message out of sequence"
        );
        self.error_state();
    }

    fn step(&mut self) {
        match self.state {
            HostState::Uninitialized => self.set_state(HostState::Initialized),
            HostState::Initialized => self.listen(),
            HostState::Listening => self.launch(),
            HostState::Launched => self.await_connection(),
            HostState::Connected => {
                if self.locked_up_or_quit() {
                    self.error_state();
                }
            }
            HostState::Hello => {
                self.send_internal(&InternalMessage::LoadPlugin {
                    file: self.params.plugin_file.clone(),
                    dir: self.params.plugin_dir.display().to_string(),
                });
                self.set_state(HostState::Loading);
            }
            HostState::Loading | HostState::Running => {
                if self.locked_up_or_quit() {
                    self.error_state();
                }
            }
            HostState::Goodbye => {
                self.send_internal(&InternalMessage::ShutdownPlugin);
                self.deadline = deadline_after(self.config.exit_timeout);
                self.set_state(HostState::Exiting);
            }
            HostState::Exiting => {
                let running = self
                    .process
                    .as_mut()
                    .is_some_and(|process| process.is_running());
                if !running {
                    self.set_state(HostState::Cleanup);
                } else if self.deadline_passed() {
                    warn!(endpoint = self.endpoint.id(), "plugin did not exit in time");
                    self.set_state(HostState::Error);
                }
            }
            HostState::LaunchFailure => {
                if let Some(owner) = self.owner.as_mut() {
                    owner.plugin_launch_failed();
                }
                self.set_state(HostState::Cleanup);
            }
            HostState::Error => {
                if let Some(owner) = self.owner.as_mut() {
                    owner.plugin_died();
                }
                self.set_state(HostState::Cleanup);
            }
            HostState::Cleanup => {
                self.cleanup();
                self.set_state(HostState::Done);
            }
            HostState::Done => {}
        }
    }

    fn listen(&mut self) {
        let bound = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).and_then(|listener| {
            listener.set_nonblocking(true)?;
            let port = listener.local_addr()?.port();
            Ok((listener, port))
        });
        match bound {
            Ok((listener, port)) => {
                debug!(endpoint = self.endpoint.id(), port, "listening for plugin");
                self.listener = Some(listener);
                self.port = Some(port);
                self.set_state(HostState::Listening);
            }
            Err(err) => {
                warn!(endpoint = self.endpoint.id(), error = %err, "failed to bind plugin socket");
                self.set_state(HostState::LaunchFailure);
            }
        }
    }

    fn launch(&mut self) {
        let Some(port) = self.port else {
            self.set_state(HostState::LaunchFailure);
            return;
        };
        self.deadline = deadline_after(self.config.launch_timeout);

        if self.params.debug {
            match self.launcher.launch(&self.params, port) {
                Ok(process) => self.process = Some(process),
                Err(err) => {
                    warn!(endpoint = self.endpoint.id(), error = %err, "failed to launch plugin");
                    self.set_state(HostState::LaunchFailure);
                    return;
                }
            }
        } else {
            let launcher = self.launcher.clone();
            let params = self.params.clone();
            let spawned = thread::Builder::new()
                .name("plugin-launch".to_string())
                .spawn(move || launcher.launch(&params, port));
            match spawned {
                Ok(handle) => self.launch_thread = Some(handle),
                Err(err) => {
                    warn!(endpoint = self.endpoint.id(), error = %err, "no launch thread");
                    self.set_state(HostState::LaunchFailure);
                    return;
                }
            }
        }
        info!(
            endpoint = self.endpoint.id(),
            port,
            plugin = %self.params.plugin_file,
            "launching plugin"
        );
        self.set_state(HostState::Launched);
    }

    fn await_connection(&mut self) {
        if let Some(handle) = self.launch_thread.take() {
            if !handle.is_finished() {
                self.launch_thread = Some(handle);
                if !self.timeouts_disabled() && self.deadline_passed() {
                    warn!(endpoint = self.endpoint.id(), "plugin launch timed out");
                    self.error_state();
                }
                return;
            }
            match handle.join().unwrap_or(Err(LaunchError::ThreadPanicked)) {
                Ok(process) => self.process = Some(process),
                Err(err) => {
                    warn!(endpoint = self.endpoint.id(), error = %err, "failed to launch plugin");
                    self.error_state();
                    return;
                }
            }
        }

        if self.locked_up_or_quit_launching() {
            self.error_state();
            return;
        }

        let Some(listener) = self.listener.as_ref() else {
            self.error_state();
            return;
        };
        match listener.accept() {
            Ok((stream, peer)) => match MessagePipe::from_stream(stream) {
                Ok(pipe) => {
                    debug!(endpoint = self.endpoint.id(), %peer, "plugin connected");
                    self.endpoint.install_pipe(pipe);
                    self.registry.mark_dirty();
                    self.listener = None;
                    self.reset_lockup_deadline();
                    self.set_state(HostState::Connected);
                }
                Err(err) => {
                    warn!(endpoint = self.endpoint.id(), error = %err, "bad plugin socket");
                    self.error_state();
                }
            },
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                warn!(endpoint = self.endpoint.id(), error = %err, "accept failed");
                self.error_state();
            }
        }
    }

    fn locked_up_or_quit_launching(&mut self) -> bool {
        if let Some(process) = self.process.as_mut() {
            if !process.is_running() {
                warn!(endpoint = self.endpoint.id(), "plugin process exited before connecting");
                return true;
            }
        }
        if !self.timeouts_disabled() && self.deadline_passed() {
            warn!(endpoint = self.endpoint.id(), "plugin never connected");
            return true;
        }
        false
    }

    fn cleanup(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.kill();
        }
        if let Some(handle) = self.launch_thread.take() {
            reap_launch(handle);
        }
        self.endpoint.close();
        self.listener = None;
        self.segments.destroy_all();
        self.blocked = false;
        self.registry.deregister(self.endpoint.id());
        debug!(endpoint = self.endpoint.id(), "plugin resources released");
    }
}

impl Drop for PluginProcessHost {
    fn drop(&mut self) {
        if self.state != HostState::Done {
            self.owner = None;
            self.cleanup();
            self.state = HostState::Done;
        }
    }
}

/// `None` when the timeout is too large to represent, meaning no deadline.
fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// Kills whatever a still-running launch produces, without waiting for it.
fn reap_launch(handle: JoinHandle<LaunchResult>) {
    let reap = move || {
        if let Ok(Ok(mut process)) = handle.join() {
            process.kill();
        }
    };
    if let Err(err) = thread::Builder::new()
        .name("plugin-launch-reaper".to_string())
        .spawn(reap)
    {
        warn!(error = %err, "failed to start launch reaper");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::{MessagePipe, PipeError};
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::sync::Mutex;

    /// Stands in for a child process; the test plays the child over the socket.
    struct FakeProcess {
        alive: Arc<AtomicBool>,
    }

    impl PluginProcess for FakeProcess {
        fn id(&self) -> Option<u32> {
            None
        }

        fn is_running(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn kill(&mut self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    struct PortLauncher {
        ports: Mutex<mpsc::Sender<u16>>,
        alive: Arc<AtomicBool>,
        launched_on: Arc<Mutex<Option<thread::ThreadId>>>,
    }

    impl ProcessLauncher for PortLauncher {
        fn launch(&self, _params: &LaunchParams, port: u16) -> LaunchResult {
            *self.launched_on.lock().unwrap() = Some(thread::current().id());
            self.ports.lock().unwrap().send(port).unwrap();
            Ok(Box::new(FakeProcess {
                alive: self.alive.clone(),
            }))
        }
    }

    #[derive(Default)]
    struct Events {
        states: Vec<HostState>,
        messages: Vec<String>,
        died: bool,
        launch_failed: bool,
    }

    struct Recorder(Arc<Mutex<Events>>);

    impl HostOwner for Recorder {
        fn receive_plugin_message(&mut self, message: &PluginMessage) {
            self.0.lock().unwrap().messages.push(message.name().to_string());
        }

        fn plugin_launch_failed(&mut self) {
            self.0.lock().unwrap().launch_failed = true;
        }

        fn plugin_died(&mut self) {
            self.0.lock().unwrap().died = true;
        }

        fn state_changed(&mut self, state: HostState) {
            self.0.lock().unwrap().states.push(state);
        }
    }

    struct Harness {
        host: PluginProcessHost,
        events: Arc<Mutex<Events>>,
        alive: Arc<AtomicBool>,
        ports: mpsc::Receiver<u16>,
        launched_on: Arc<Mutex<Option<thread::ThreadId>>>,
    }

    fn harness(config: HostConfig) -> Harness {
        harness_with(LaunchParams::new("unused", "/plugins", "x.so"), config)
    }

    fn harness_with(params: LaunchParams, config: HostConfig) -> Harness {
        let (tx, rx) = mpsc::channel();
        let alive = Arc::new(AtomicBool::new(true));
        let launched_on = Arc::new(Mutex::new(None));
        let launcher = Arc::new(PortLauncher {
            ports: Mutex::new(tx),
            alive: alive.clone(),
            launched_on: launched_on.clone(),
        });
        let events = Arc::new(Mutex::new(Events::default()));
        let host = PluginProcessHost::new(
            params,
            config,
            launcher,
            Arc::new(Registry::new()),
            Some(Box::new(Recorder(events.clone()))),
        );
        Harness {
            host,
            events,
            alive,
            ports: rx,
            launched_on,
        }
    }

    fn config(lockup: Duration) -> HostConfig {
        HostConfig {
            launch_timeout: Duration::from_secs(5),
            lockup_timeout: lockup,
            exit_timeout: Duration::from_secs(1),
        }
    }

    fn tick_until(host: &mut PluginProcessHost, state: HostState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while host.state() != state {
            assert!(Instant::now() < deadline, "stuck in {:?}", host.state());
            host.idle();
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn send(pipe: &mut MessagePipe, message: InternalMessage) {
        pipe.enqueue(&message.to_message().generate().unwrap());
        pipe.pump_output().unwrap();
    }

    fn receive(pipe: &mut MessagePipe) -> PluginMessage {
        let mut raw: Vec<String> = Vec::new();
        while raw.is_empty() {
            pipe.pump_input(Duration::from_secs(2), &mut raw).unwrap();
        }
        PluginMessage::parse(&raw[0]).unwrap()
    }

    /// Collects exactly `count` messages, however the reads split them.
    fn receive_n(pipe: &mut MessagePipe, count: usize) -> Vec<InternalMessage> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut raw: Vec<String> = Vec::new();
        while raw.len() < count {
            assert!(Instant::now() < deadline, "only got {} messages", raw.len());
            pipe.pump_input(Duration::from_millis(50), &mut raw).unwrap();
        }
        raw.iter()
            .map(|raw| InternalMessage::decode(&PluginMessage::parse(raw).unwrap()).unwrap())
            .collect()
    }

    /// Connects as the child and completes the handshake.
    fn connect_and_load(h: &mut Harness) -> MessagePipe {
        tick_until(&mut h.host, HostState::Launched);
        let port = h.ports.recv_timeout(Duration::from_secs(5)).unwrap();
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut child = MessagePipe::from_stream(stream).unwrap();
        tick_until(&mut h.host, HostState::Connected);

        send(&mut child, InternalMessage::Hello);
        tick_until(&mut h.host, HostState::Loading);
        let load = InternalMessage::decode(&receive(&mut child)).unwrap();
        assert_eq!(
            load,
            InternalMessage::LoadPlugin {
                file: "x.so".to_string(),
                dir: "/plugins".to_string(),
            }
        );

        let mut versions = BTreeMap::new();
        versions.insert("media".to_string(), "1.2".to_string());
        send(
            &mut child,
            InternalMessage::LoadPluginResponse {
                versions,
                plugin_version: Some("1.0".to_string()),
            },
        );
        tick_until(&mut h.host, HostState::Running);
        child
    }

    #[test]
    fn handshake_walks_states_in_order() {
        let mut h = harness(config(Duration::from_secs(5)));
        let mut child = connect_and_load(&mut h);

        assert_eq!(
            h.events.lock().unwrap().states,
            vec![
                HostState::Initialized,
                HostState::Listening,
                HostState::Launched,
                HostState::Connected,
                HostState::Hello,
                HostState::Loading,
                HostState::Running,
            ]
        );
        assert_eq!(h.host.plugin_version(), Some("1.0"));
        assert_eq!(h.host.message_class_version("media"), Some("1.2"));
        assert!(h.host.is_running());
        assert!(!h.host.is_loading());

        let sleep = InternalMessage::decode(&receive(&mut child)).unwrap();
        assert_eq!(sleep, InternalMessage::SleepTime { time: 0.0 });
    }

    #[test]
    fn silent_plugin_is_declared_dead() {
        let mut h = harness(config(Duration::from_millis(150)));
        let _child = connect_and_load(&mut h);

        thread::sleep(Duration::from_millis(200));
        h.host.idle();

        let events = h.events.lock().unwrap();
        assert!(events.died);
        assert!(!events.launch_failed);
        assert!(events.states.ends_with(&[
            HostState::Error,
            HostState::Cleanup,
            HostState::Done
        ]));
        assert!(!h.alive.load(Ordering::SeqCst));
    }

    #[test]
    fn heartbeats_keep_plugin_alive() {
        let mut h = harness(config(Duration::from_millis(150)));
        let mut child = connect_and_load(&mut h);

        for _ in 0..5 {
            thread::sleep(Duration::from_millis(60));
            send(&mut child, InternalMessage::Heartbeat { cpu_usage: 0.25 });
            h.host.idle();
            assert!(h.host.is_running());
        }
        assert_eq!(h.host.cpu_usage(), 0.25);
    }

    #[test]
    fn blocking_request_suspends_lockup_detection() {
        let mut h = harness(config(Duration::from_millis(100)));
        let mut child = connect_and_load(&mut h);

        let request = PluginMessage::new("media", "query").into_blocking_request();
        child.enqueue(&request.generate().unwrap());
        child.pump_output().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !h.host.is_blocked() {
            assert!(Instant::now() < deadline);
            h.host.idle();
        }

        thread::sleep(Duration::from_millis(200));
        h.host.idle();
        assert!(h.host.is_running());

        h.host
            .send_message(&PluginMessage::new("media", "answer").into_blocking_response());
        assert!(!h.host.is_blocked());
        thread::sleep(Duration::from_millis(200));
        h.host.idle();
        assert!(h.events.lock().unwrap().died);
        assert_eq!(h.events.lock().unwrap().messages, vec!["query".to_string()]);
    }

    #[test]
    fn out_of_sequence_hello_is_fatal() {
        let mut h = harness(config(Duration::from_secs(5)));
        let mut child = connect_and_load(&mut h);
        send(&mut child, InternalMessage::Hello);
        tick_until(&mut h.host, HostState::Done);
        assert!(h.events.lock().unwrap().died);
    }

    #[test]
    fn exited_process_before_connect_is_launch_failure() {
        let mut h = harness(config(Duration::from_secs(5)));
        tick_until(&mut h.host, HostState::Launched);
        h.alive.store(false, Ordering::SeqCst);
        tick_until(&mut h.host, HostState::Done);
        let events = h.events.lock().unwrap();
        assert!(events.launch_failed);
        assert!(!events.died);
    }

    #[test]
    fn shutdown_before_connect_cleans_up_directly() {
        let mut h = harness(config(Duration::from_secs(5)));
        tick_until(&mut h.host, HostState::Launched);
        h.host.request_shutdown();
        h.host.idle();
        assert!(h.host.is_done());

        // The launch may still be in flight; its result is killed when it lands.
        let deadline = Instant::now() + Duration::from_secs(5);
        while h.alive.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "launched process was never killed");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn shutdown_sends_request_and_kills_stubborn_plugin() {
        let mut h = harness(config(Duration::from_secs(5)));
        let mut child = connect_and_load(&mut h);
        let _sleep_time = receive(&mut child);

        h.host.request_shutdown();
        h.host.idle();
        assert_eq!(h.host.state(), HostState::Exiting);
        let request = InternalMessage::decode(&receive(&mut child)).unwrap();
        assert_eq!(request, InternalMessage::ShutdownPlugin);

        // The fake child never exits; the exit deadline forces cleanup.
        tick_until(&mut h.host, HostState::Done);
        assert!(!h.alive.load(Ordering::SeqCst));
        // The owner was detached by request_shutdown.
        assert!(!h.events.lock().unwrap().died);
    }

    fn inject_not_found(host: &PluginProcessHost) {
        host.endpoint
            .io()
            .record_error(PipeError::Io(io::ErrorKind::NotFound.into()));
    }

    #[test]
    fn not_found_is_fatal_by_default() {
        let mut h = harness(config(Duration::from_secs(5)));
        let _child = connect_and_load(&mut h);

        inject_not_found(&h.host);
        h.host.idle();
        assert!(h.host.is_done());
        assert!(h.events.lock().unwrap().died);
    }

    #[test]
    fn not_found_is_only_logged_under_ignore_policy() {
        let mut params = LaunchParams::new("unused", "/plugins", "x.so");
        params.not_found_policy = NotFoundPolicy::Ignore;
        let mut h = harness_with(params, config(Duration::from_secs(5)));
        let mut child = connect_and_load(&mut h);

        inject_not_found(&h.host);
        h.host.idle();
        assert!(h.host.is_running());
        assert!(h.host.can_send_message());
        assert!(!h.events.lock().unwrap().died);

        // Other transport errors stay fatal.
        let _sleep_time = receive(&mut child);
        h.host
            .endpoint
            .io()
            .record_error(PipeError::Io(io::ErrorKind::ConnectionReset.into()));
        h.host.idle();
        assert!(h.host.is_done());
        assert!(h.events.lock().unwrap().died);
    }

    #[test]
    fn debug_mode_launches_inline_and_never_times_out() {
        let mut params = LaunchParams::new("unused", "/plugins", "x.so");
        params.debug = true;
        let mut h = harness_with(params, config(Duration::from_millis(100)));
        let _child = connect_and_load(&mut h);
        assert_eq!(*h.launched_on.lock().unwrap(), Some(thread::current().id()));

        thread::sleep(Duration::from_millis(250));
        h.host.idle();
        assert!(h.host.is_running());
        assert!(!h.events.lock().unwrap().died);
    }

    #[test]
    fn normal_launch_runs_off_the_owner_thread() {
        let mut h = harness(config(Duration::from_secs(5)));
        let _child = connect_and_load(&mut h);
        let launched_on = h.launched_on.lock().unwrap().expect("launcher was called");
        assert_ne!(launched_on, thread::current().id());
    }

    #[test]
    fn disabled_timeout_suspends_lockup_detection() {
        let mut h = harness(config(Duration::from_millis(100)));
        let _child = connect_and_load(&mut h);

        h.host.set_disable_timeout(true);
        thread::sleep(Duration::from_millis(250));
        h.host.idle();
        assert!(h.host.is_running());

        h.host.set_disable_timeout(false);
        h.host.idle();
        assert!(h.host.is_done());
        assert!(h.events.lock().unwrap().died);
    }

    #[test]
    fn sleep_time_is_cached_and_resent_only_when_changed_or_forced() {
        let mut h = harness(config(Duration::from_secs(5)));
        // Not connected yet: cached and sent once the plugin is running.
        h.host.set_sleep_time(0.25, false);
        let mut child = connect_and_load(&mut h);
        let first = InternalMessage::decode(&receive(&mut child)).unwrap();
        assert_eq!(first, InternalMessage::SleepTime { time: 0.25 });

        h.host.set_sleep_time(0.25, false);
        h.host.set_sleep_time(0.5, false);
        h.host.set_sleep_time(0.5, true);
        assert_eq!(
            receive_n(&mut child, 2),
            vec![
                InternalMessage::SleepTime { time: 0.5 },
                InternalMessage::SleepTime { time: 0.5 },
            ]
        );
    }

    #[test]
    fn unrepresentable_timeouts_mean_no_deadline() {
        let mut h = harness(HostConfig {
            launch_timeout: Duration::MAX,
            lockup_timeout: Duration::MAX,
            exit_timeout: Duration::MAX,
        });
        let _child = connect_and_load(&mut h);
        h.host.idle();
        assert!(h.host.is_running());

        h.host.request_shutdown();
        h.host.idle();
        assert_eq!(h.host.state(), HostState::Exiting);
        h.alive.store(false, Ordering::SeqCst);
        tick_until(&mut h.host, HostState::Done);
    }

    #[test]
    fn remove_without_connection_destroys_immediately() {
        let mut h = harness(config(Duration::from_secs(5)));
        assert!(matches!(
            h.host.add_shared_memory(64),
            Err(ShmError::NotConnected)
        ));
        assert!(matches!(
            h.host.remove_shared_memory("/missing"),
            Err(ShmError::Unknown { .. })
        ));
    }
}
