//! Child-side process controller.
//!
//! Runs inside the plugin process: connects back to the host, loads the
//! plugin it is told to load, and relays messages between the host and the
//! plugin instance until shutdown.
//!
//! When the plugin sends a `blocking_request` the controller suspends: every
//! message from the host is held until the matching `blocking_response`
//! arrives, which is delivered first, followed by the held messages in their
//! original order.

use crate::message::{
    BaseMessage, InternalMessage, PluginMessage, MESSAGE_CLASS_BASE, MESSAGE_CLASS_INTERNAL,
};
use crate::pipe::{MessagePipe, PipeError};
use crate::shm::SharedMemoryRegion;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Lower bound for the wait between ticks (100 Hz).
const MIN_SLEEP_TIME: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ChildError {
    #[error("failed to connect to host on port {port}: {source}")]
    Connect { port: u16, source: io::Error },
    #[error("failed to load plugin {file} from {dir}: {reason}")]
    Load {
        dir: PathBuf,
        file: String,
        reason: String,
    },
    #[error("lost connection to host: {0}")]
    Transport(#[from] PipeError),
}

/// Collects what a plugin instance sends during one call.
#[derive(Debug, Default)]
pub struct Outbox {
    messages: Vec<PluginMessage>,
}

impl Outbox {
    pub fn send(&mut self, message: PluginMessage) {
        self.messages.push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[PluginMessage] {
        &self.messages
    }

    fn take(&mut self) -> Vec<PluginMessage> {
        std::mem::take(&mut self.messages)
    }
}

/// The loaded plugin. Receives `base` control messages and everything the
/// host's owner sends; replies go through the outbox.
pub trait PluginInstance: Send {
    fn receive_message(&mut self, message: &PluginMessage, outbox: &mut Outbox);
}

pub trait PluginLoader {
    fn load(&mut self, dir: &Path, file: &str) -> Result<Box<dyn PluginInstance>, ChildError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ChildConfig {
    pub heartbeat_interval: Duration,
    /// Time slice granted to the plugin with each `idle` message.
    pub idle_slice: Duration,
    /// How long the plugin gets to say goodbye after `cleanup`.
    pub goodbye_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ChildConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            idle_slice: Duration::from_millis(10),
            goodbye_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChildState {
    Uninitialized,
    Initialized,
    Connected,
    PluginLoading,
    PluginLoaded,
    PluginInitializing,
    Running,
    ShutdownRequested,
    Unloading,
    Unloaded,
    Error,
    Done,
}

pub struct PluginProcessChild<L> {
    loader: L,
    config: ChildConfig,
    port: u16,
    state: ChildState,
    pipe: Option<MessagePipe>,
    inbox: VecDeque<String>,
    held: VecDeque<PluginMessage>,
    suspended: bool,
    instance: Option<Box<dyn PluginInstance>>,
    plugin_dir: PathBuf,
    plugin_file: Option<String>,
    shared_memory: BTreeMap<String, SharedMemoryRegion>,
    sleep_time: Duration,
    heartbeat_due: Instant,
    cpu_window_start: Instant,
    cpu_time: Duration,
    goodbye_deadline: Option<Instant>,
    failure: Option<ChildError>,
}

impl<L> std::fmt::Debug for PluginProcessChild<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginProcessChild")
            .field("port", &self.port)
            .field("state", &self.state)
            .field("suspended", &self.suspended)
            .field("held", &self.held.len())
            .finish_non_exhaustive()
    }
}

impl<L: PluginLoader> PluginProcessChild<L> {
    pub fn new(port: u16, loader: L, config: ChildConfig) -> Self {
        let now = Instant::now();
        Self {
            loader,
            config,
            port,
            state: ChildState::Initialized,
            pipe: None,
            inbox: VecDeque::new(),
            held: VecDeque::new(),
            suspended: false,
            instance: None,
            plugin_dir: PathBuf::new(),
            plugin_file: None,
            shared_memory: BTreeMap::new(),
            sleep_time: config.idle_slice.max(MIN_SLEEP_TIME),
            heartbeat_due: now + config.heartbeat_interval,
            cpu_window_start: now,
            cpu_time: Duration::ZERO,
            goodbye_deadline: None,
            failure: None,
        }
    }

    pub fn state(&self) -> ChildState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == ChildState::Done
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn sleep_time(&self) -> Duration {
        self.sleep_time
    }

    /// Drives the controller until it is done.
    pub fn run(&mut self) -> Result<(), ChildError> {
        info!(port = self.port, "plugin child starting");
        while !self.is_done() {
            self.idle();
            if self.pipe.is_some() {
                self.pump(self.sleep_time);
            } else if !self.is_done() {
                std::thread::sleep(self.sleep_time);
            }
        }
        info!(port = self.port, "plugin child finished");
        match self.failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Flushes output, waits up to `timeout` for input and handles it.
    pub fn pump(&mut self, timeout: Duration) {
        let Some(pipe) = self.pipe.as_mut() else {
            return;
        };
        if let Err(err) = pipe.pump(timeout, &mut self.inbox) {
            self.connection_lost(err);
        }
        while let Some(raw) = self.inbox.pop_front() {
            match PluginMessage::parse(&raw) {
                Ok(message) => self.handle_incoming(message),
                Err(err) => warn!(error = %err, "dropping malformed message from host"),
            }
        }
    }

    /// Advances the state machine by one step.
    pub fn idle(&mut self) {
        match self.state {
            ChildState::Uninitialized => self.set_state(ChildState::Initialized),
            ChildState::Initialized => self.connect(),
            ChildState::Connected => {
                self.send_to_host(&InternalMessage::Hello.to_message());
                self.set_state(ChildState::PluginLoading);
            }
            ChildState::PluginLoading => self.load_plugin(),
            ChildState::PluginLoaded => {
                self.set_state(ChildState::PluginInitializing);
                self.deliver(BaseMessage::Init.to_message());
            }
            ChildState::PluginInitializing => {}
            ChildState::Running => self.run_plugin(),
            ChildState::ShutdownRequested => {
                if self.instance.is_none() {
                    self.set_state(ChildState::Unloaded);
                    return;
                }
                self.goodbye_deadline = Instant::now().checked_add(self.config.goodbye_timeout);
                self.set_state(ChildState::Unloading);
                self.deliver(BaseMessage::Cleanup.to_message());
            }
            ChildState::Unloading => {
                if self.goodbye_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    warn!("plugin did not say goodbye in time");
                    self.deliver(BaseMessage::ForceExit.to_message());
                    self.set_state(ChildState::Unloaded);
                }
            }
            ChildState::Unloaded | ChildState::Error => {
                self.kill_sockets();
                self.instance = None;
                self.shared_memory.clear();
                self.set_state(ChildState::Done);
            }
            ChildState::Done => {}
        }
    }

    fn set_state(&mut self, state: ChildState) {
        debug!(from = ?self.state, to = ?state, "child state");
        self.state = state;
    }

    fn connect(&mut self) {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.port));
        let connected = TcpStream::connect_timeout(&addr, self.config.connect_timeout)
            .and_then(MessagePipe::from_stream);
        match connected {
            Ok(pipe) => {
                debug!(port = self.port, "connected to host");
                self.pipe = Some(pipe);
                self.set_state(ChildState::Connected);
            }
            Err(source) => {
                warn!(port = self.port, error = %source, "could not reach host");
                self.failure = Some(ChildError::Connect {
                    port: self.port,
                    source,
                });
                self.set_state(ChildState::Error);
            }
        }
    }

    fn load_plugin(&mut self) {
        let Some(file) = self.plugin_file.clone() else {
            return;
        };
        match self.loader.load(&self.plugin_dir, &file) {
            Ok(instance) => {
                info!(file = %file, dir = %self.plugin_dir.display(), "plugin loaded");
                self.instance = Some(instance);
                self.set_state(ChildState::PluginLoaded);
            }
            Err(err) => {
                warn!(error = %err, "plugin failed to load");
                self.failure = Some(err);
                self.set_state(ChildState::Error);
            }
        }
    }

    fn run_plugin(&mut self) {
        if !self.suspended {
            let slice = self.config.idle_slice.as_secs_f64();
            self.deliver(BaseMessage::Idle { time: slice }.to_message());
        }

        let now = Instant::now();
        if now >= self.heartbeat_due {
            let window = now.saturating_duration_since(self.cpu_window_start);
            let cpu_usage = if window.is_zero() {
                0.0
            } else {
                (self.cpu_time.as_secs_f64() / window.as_secs_f64()).min(1.0)
            };
            self.send_to_host(&InternalMessage::Heartbeat { cpu_usage }.to_message());
            self.heartbeat_due = now + self.config.heartbeat_interval;
            self.cpu_window_start = now;
            self.cpu_time = Duration::ZERO;
        }
    }

    fn connection_lost(&mut self, err: PipeError) {
        match &err {
            PipeError::Closed => info!("host closed the connection"),
            other => warn!(error = %other, "connection to host failed"),
        }
        self.pipe = None;
        if self.state < ChildState::Unloaded {
            if self.state < ChildState::ShutdownRequested {
                self.failure = Some(ChildError::Transport(err));
            }
            self.set_state(ChildState::Error);
        }
    }

    fn handle_incoming(&mut self, message: PluginMessage) {
        if self.suspended {
            if message.is_blocking_response() {
                self.suspended = false;
                self.dispatch_from_host(message);
                self.replay_held();
            } else {
                self.held.push_back(message);
            }
            return;
        }
        self.dispatch_from_host(message);
    }

    fn replay_held(&mut self) {
        while !self.suspended {
            let Some(message) = self.held.pop_front() else {
                break;
            };
            self.dispatch_from_host(message);
        }
    }

    fn dispatch_from_host(&mut self, message: PluginMessage) {
        if !message.is_class(MESSAGE_CLASS_INTERNAL) {
            self.deliver(message);
            return;
        }
        let decoded = match InternalMessage::decode(&message) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(error = %err, "malformed control message from host");
                return;
            }
        };
        match decoded {
            InternalMessage::LoadPlugin { file, dir } => {
                if self.state == ChildState::PluginLoading && self.plugin_file.is_none() {
                    self.plugin_dir = PathBuf::from(dir);
                    self.plugin_file = Some(file);
                } else {
                    warn!(state = ?self.state, "ignoring repeated load_plugin");
                }
            }
            InternalMessage::ShutdownPlugin => {
                if self.state < ChildState::ShutdownRequested {
                    info!("host requested shutdown");
                    self.set_state(ChildState::ShutdownRequested);
                }
            }
            InternalMessage::ShmAdd { name, size } => self.attach_shared_memory(name, size),
            InternalMessage::ShmRemove { name } => {
                if self.shared_memory.contains_key(&name) && self.instance.is_some() {
                    self.deliver(BaseMessage::ShmRemove { name }.to_message());
                } else {
                    self.detach_shared_memory(name);
                }
            }
            InternalMessage::SleepTime { time } => {
                self.sleep_time = Duration::try_from_secs_f64(time)
                    .unwrap_or(MIN_SLEEP_TIME)
                    .max(MIN_SLEEP_TIME);
                debug!(sleep_time = ?self.sleep_time, "sleep time changed");
            }
            InternalMessage::Unrecognized(name) => {
                warn!(name = %name, "unknown control message from host");
            }
            other => warn!(message = ?other, "unexpected control message from host"),
        }
    }

    fn attach_shared_memory(&mut self, name: String, size: usize) {
        if self.shared_memory.contains_key(&name) {
            warn!(name = %name, "shared memory already attached");
            return;
        }
        match SharedMemoryRegion::attach(&name, size) {
            Ok(region) => {
                let address = region.address();
                self.shared_memory.insert(name.clone(), region);
                self.deliver(
                    BaseMessage::ShmAdded {
                        name: name.clone(),
                        size,
                        address,
                    }
                    .to_message(),
                );
                let response = InternalMessage::ShmAddResponse { name, error: None };
                self.send_to_host(&response.to_message());
            }
            Err(err) => {
                warn!(name = %name, error = %err, "failed to attach shared memory");
                let response = InternalMessage::ShmAddResponse {
                    name,
                    error: Some(err.to_string()),
                };
                self.send_to_host(&response.to_message());
            }
        }
    }

    fn detach_shared_memory(&mut self, name: String) {
        match self.shared_memory.remove(&name) {
            Some(mut region) => {
                if let Err(err) = region.detach() {
                    warn!(name = %name, error = %err, "failed to detach shared memory");
                }
            }
            None => debug!(name = %name, "removal of segment that was never attached"),
        }
        self.send_to_host(&InternalMessage::ShmRemoveResponse { name }.to_message());
    }

    /// Hands a message to the plugin and processes whatever it sends back.
    fn deliver(&mut self, message: PluginMessage) {
        let Some(instance) = self.instance.as_mut() else {
            debug!(name = message.name(), "no plugin instance, dropping message");
            return;
        };
        let mut outbox = Outbox::default();
        let started = Instant::now();
        instance.receive_message(&message, &mut outbox);
        self.cpu_time += started.elapsed();
        for outgoing in outbox.take() {
            self.receive_plugin_message(outgoing);
        }
    }

    fn receive_plugin_message(&mut self, message: PluginMessage) {
        if message.is_blocking_request() {
            debug!(name = message.name(), "plugin is waiting for a blocking response");
            self.suspended = true;
        }
        if !message.is_class(MESSAGE_CLASS_BASE) {
            self.send_to_host(&message);
            return;
        }

        match BaseMessage::decode(&message) {
            Ok(BaseMessage::InitResponse {
                versions,
                plugin_version,
            }) => {
                if self.state != ChildState::PluginInitializing {
                    warn!(state = ?self.state, "unexpected init_response");
                    return;
                }
                self.set_state(ChildState::Running);
                let now = Instant::now();
                self.heartbeat_due = now + self.config.heartbeat_interval;
                self.cpu_window_start = now;
                self.cpu_time = Duration::ZERO;
                let response = InternalMessage::LoadPluginResponse {
                    versions,
                    plugin_version,
                };
                self.send_to_host(&response.to_message());
            }
            Ok(BaseMessage::Goodbye) => {
                info!("plugin said goodbye");
                self.send_to_host(&InternalMessage::Goodbye.to_message());
                if self.state < ChildState::Unloaded {
                    self.set_state(ChildState::Unloaded);
                }
            }
            Ok(BaseMessage::ShmRemoveResponse { name }) => self.detach_shared_memory(name),
            Ok(other) => warn!(message = ?other, "unexpected base message from plugin"),
            Err(err) => warn!(error = %err, "malformed base message from plugin"),
        }
    }

    fn send_to_host(&mut self, message: &PluginMessage) {
        let Some(pipe) = self.pipe.as_mut() else {
            debug!(name = message.name(), "not connected, dropping message");
            return;
        };
        match message.generate() {
            Ok(raw) => pipe.enqueue(&raw),
            Err(err) => warn!(error = %err, "failed to serialize message"),
        }
    }

    fn kill_sockets(&mut self) {
        if let Some(mut pipe) = self.pipe.take() {
            let deadline = Instant::now() + Duration::from_millis(500);
            while pipe.has_pending_output() && Instant::now() < deadline {
                if pipe.pump_output().is_err() {
                    break;
                }
            }
            let _ = pipe.transport().shutdown(Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    /// Records every message; answers the `base` handshake and asks a
    /// blocking question when told to.
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl PluginInstance for Recorder {
        fn receive_message(&mut self, message: &PluginMessage, outbox: &mut Outbox) {
            if message.name() != "idle" {
                self.log.lock().unwrap().push(message.name().to_string());
            }
            match (message.class(), message.name()) {
                ("base", "init") => outbox.send(
                    BaseMessage::InitResponse {
                        versions: BTreeMap::new(),
                        plugin_version: Some("0.1".to_string()),
                    }
                    .to_message(),
                ),
                ("base", "shm_remove") => {
                    let name = message.get_str("name").unwrap_or_default().to_string();
                    outbox.send(BaseMessage::ShmRemoveResponse { name }.to_message());
                }
                ("base", "cleanup") => outbox.send(BaseMessage::Goodbye.to_message()),
                ("media", "trigger") => {
                    outbox.send(PluginMessage::new("media", "question").into_blocking_request())
                }
                _ => {}
            }
        }
    }

    struct RecorderLoader {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl PluginLoader for RecorderLoader {
        fn load(
            &mut self,
            _dir: &Path,
            file: &str,
        ) -> Result<Box<dyn PluginInstance>, ChildError> {
            if file != "recorder" {
                return Err(ChildError::Load {
                    dir: PathBuf::new(),
                    file: file.to_string(),
                    reason: "unknown".to_string(),
                });
            }
            Ok(Box::new(Recorder {
                log: self.log.clone(),
            }))
        }
    }

    fn running_child() -> (PluginProcessChild<RecorderLoader>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut child = PluginProcessChild::new(
            0,
            RecorderLoader { log: log.clone() },
            ChildConfig::default(),
        );
        child.instance = Some(Box::new(Recorder { log: log.clone() }));
        child.state = ChildState::Running;
        (child, log)
    }

    fn media(name: &str) -> PluginMessage {
        PluginMessage::new("media", name)
    }

    fn host_pair() -> (MessagePipe, MessagePipe) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let (server, _) = listener.accept().unwrap();
        (
            MessagePipe::from_stream(server).unwrap(),
            MessagePipe::from_stream(client).unwrap(),
        )
    }

    /// Flushes the child and collects what the host side receives.
    fn host_receives(
        child: &mut PluginProcessChild<RecorderLoader>,
        host: &mut MessagePipe,
        count: usize,
    ) -> Vec<PluginMessage> {
        let mut raw: Vec<String> = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while raw.len() < count && Instant::now() < deadline {
            child.pump(Duration::ZERO);
            host.pump_input(Duration::from_millis(20), &mut raw).unwrap();
        }
        raw.iter().map(|r| PluginMessage::parse(r).unwrap()).collect()
    }

    #[test]
    fn held_messages_replay_after_blocking_response_in_order() {
        let (mut child, log) = running_child();

        child.handle_incoming(media("trigger"));
        assert!(child.is_suspended());

        child.handle_incoming(media("m1"));
        child.handle_incoming(InternalMessage::SleepTime { time: 0.5 }.to_message());
        child.handle_incoming(media("m2"));
        assert_eq!(*log.lock().unwrap(), vec!["trigger"]);
        assert_eq!(child.sleep_time(), Duration::from_millis(10));

        child.handle_incoming(media("answer").into_blocking_response());
        assert!(!child.is_suspended());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["trigger", "answer", "m1", "m2"]
        );
        assert_eq!(child.sleep_time(), Duration::from_millis(500));
    }

    #[test]
    fn replay_stops_when_plugin_blocks_again() {
        let (mut child, log) = running_child();
        child.handle_incoming(media("trigger"));
        child.handle_incoming(media("trigger"));
        child.handle_incoming(media("m1"));

        child.handle_incoming(media("answer").into_blocking_response());
        assert!(child.is_suspended());
        assert_eq!(*log.lock().unwrap(), vec!["trigger", "answer", "trigger"]);

        child.handle_incoming(media("answer").into_blocking_response());
        assert!(!child.is_suspended());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["trigger", "answer", "trigger", "answer", "m1"]
        );
    }

    #[test]
    fn sleep_time_is_clamped() {
        let (mut child, _log) = running_child();
        child.handle_incoming(InternalMessage::SleepTime { time: 0.0 }.to_message());
        assert_eq!(child.sleep_time(), MIN_SLEEP_TIME);
        child.handle_incoming(InternalMessage::SleepTime { time: -3.0 }.to_message());
        assert_eq!(child.sleep_time(), MIN_SLEEP_TIME);
    }

    #[test]
    fn load_and_init_produce_load_plugin_response() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut child = PluginProcessChild::new(
            0,
            RecorderLoader { log: log.clone() },
            ChildConfig::default(),
        );
        let (mut host, child_pipe) = host_pair();
        child.pipe = Some(child_pipe);
        child.state = ChildState::Connected;

        child.idle();
        assert_eq!(child.state(), ChildState::PluginLoading);
        let hello = host_receives(&mut child, &mut host, 1);
        assert_eq!(hello[0].name(), "hello");

        child.handle_incoming(
            InternalMessage::LoadPlugin {
                file: "recorder".to_string(),
                dir: "/plugins".to_string(),
            }
            .to_message(),
        );
        child.idle();
        assert_eq!(child.state(), ChildState::PluginLoaded);
        child.idle();
        assert_eq!(child.state(), ChildState::Running);

        let response = host_receives(&mut child, &mut host, 1);
        assert_eq!(
            InternalMessage::decode(&response[0]).unwrap(),
            InternalMessage::LoadPluginResponse {
                versions: BTreeMap::new(),
                plugin_version: Some("0.1".to_string()),
            }
        );
        assert_eq!(*log.lock().unwrap(), vec!["init"]);
    }

    #[test]
    fn unknown_plugin_fails_the_child() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut child = PluginProcessChild::new(0, RecorderLoader { log }, ChildConfig::default());
        child.state = ChildState::PluginLoading;
        child.handle_incoming(
            InternalMessage::LoadPlugin {
                file: "missing".to_string(),
                dir: "/plugins".to_string(),
            }
            .to_message(),
        );
        child.idle();
        assert_eq!(child.state(), ChildState::Error);
        child.idle();
        assert!(child.is_done());
        assert!(matches!(child.failure, Some(ChildError::Load { .. })));
    }

    #[test]
    fn shared_memory_is_attached_and_detached_on_request() {
        let (mut child, log) = running_child();
        let (mut host, child_pipe) = host_pair();
        child.pipe = Some(child_pipe);

        let mut region = SharedMemoryRegion::create(4096).unwrap();
        region.write_at(0, b"hi").unwrap();
        let name = region.name().to_string();

        child.handle_incoming(
            InternalMessage::ShmAdd {
                name: name.clone(),
                size: 4096,
            }
            .to_message(),
        );
        let replies = host_receives(&mut child, &mut host, 1);
        assert_eq!(
            InternalMessage::decode(&replies[0]).unwrap(),
            InternalMessage::ShmAddResponse {
                name: name.clone(),
                error: None,
            }
        );
        let mut buf = [0u8; 2];
        child.shared_memory[&name].read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hi");

        child.handle_incoming(InternalMessage::ShmRemove { name: name.clone() }.to_message());
        let replies = host_receives(&mut child, &mut host, 1);
        assert_eq!(
            InternalMessage::decode(&replies[0]).unwrap(),
            InternalMessage::ShmRemoveResponse { name: name.clone() }
        );
        assert!(child.shared_memory.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["shm_added", "shm_remove"]);
        region.destroy().unwrap();
    }

    #[test]
    fn missing_segment_reports_attach_error() {
        let (mut child, _log) = running_child();
        let (mut host, child_pipe) = host_pair();
        child.pipe = Some(child_pipe);

        child.handle_incoming(
            InternalMessage::ShmAdd {
                name: "/tether.missing.segment".to_string(),
                size: 64,
            }
            .to_message(),
        );
        let replies = host_receives(&mut child, &mut host, 1);
        match InternalMessage::decode(&replies[0]).unwrap() {
            InternalMessage::ShmAddResponse { error, .. } => assert!(error.is_some()),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn shutdown_runs_cleanup_and_says_goodbye() {
        let (mut child, log) = running_child();
        let (mut host, child_pipe) = host_pair();
        child.pipe = Some(child_pipe);

        child.handle_incoming(InternalMessage::ShutdownPlugin.to_message());
        assert_eq!(child.state(), ChildState::ShutdownRequested);
        child.idle();
        assert_eq!(child.state(), ChildState::Unloaded);
        let goodbye = host_receives(&mut child, &mut host, 1);
        assert_eq!(goodbye[0].name(), "goodbye");

        child.idle();
        assert!(child.is_done());
        assert_eq!(*log.lock().unwrap(), vec!["cleanup"]);
    }

    #[test]
    fn silent_plugin_is_forced_out_after_goodbye_timeout() {
        struct Mute;
        impl PluginInstance for Mute {
            fn receive_message(&mut self, _message: &PluginMessage, _outbox: &mut Outbox) {}
        }

        let config = ChildConfig {
            goodbye_timeout: Duration::from_millis(20),
            ..ChildConfig::default()
        };
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut child = PluginProcessChild::new(0, RecorderLoader { log }, config);
        child.instance = Some(Box::new(Mute));
        child.state = ChildState::ShutdownRequested;

        child.idle();
        assert_eq!(child.state(), ChildState::Unloading);
        std::thread::sleep(Duration::from_millis(40));
        child.idle();
        assert_eq!(child.state(), ChildState::Unloaded);
        child.idle();
        assert!(child.is_done());
    }
}
