//! Out-of-process plugin hosting for Tether.
//!
//! A host application runs each plugin in its own process and talks to it over
//! a loopback TCP connection:
//! - [`PluginProcessHost`] drives one plugin process from the host side
//! - [`PluginProcessChild`] runs inside the plugin process and hosts a
//!   [`PluginInstance`]
//! - [`MessagePipe`] frames JSON messages with a NUL delimiter on both ends
//! - [`SharedMemoryRegion`] carries bulk data outside the message stream
//! - [`PluginHostManager`] owns the registry of live connections and the
//!   optional shared poll thread
//!
//! # Protocol
//!
//! ```text
//! host                                   child
//!  |  spawn `<launcher> ... <port>`        |
//!  | <------------- connect -------------- |
//!  | <------------- hello ---------------- |
//!  | -------- load_plugin{file,dir} -----> |
//!  | <-- load_plugin_response{versions} -- |
//!  | ------------ sleep_time ------------> |
//!  | <----------- heartbeat -------------- |  every second
//!  | ---------- shutdown_plugin ---------> |
//!  | <------------ goodbye --------------- |
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use tether_plugin::{HostOwner, PluginHostManager, PluginMessage};
//!
//! struct Printer;
//! impl HostOwner for Printer {
//!     fn receive_plugin_message(&mut self, message: &PluginMessage) {
//!         println!("{}:{}", message.class(), message.name());
//!     }
//! }
//!
//! let manager = PluginHostManager::new(config.plugins.clone())?;
//! let params = manager.launch_params(std::env::current_exe()?, "/plugins", "echo");
//! let mut host = manager.create_host(params, Some(Box::new(Printer)));
//! while !host.is_done() {
//!     host.idle_for(std::time::Duration::from_millis(10));
//! }
//! ```

pub mod child;
pub mod endpoint;
pub mod host;
pub mod launcher;
pub mod manager;
pub mod message;
pub mod pipe;
pub mod poll;
pub mod shm;

pub use child::{
    ChildConfig, ChildError, ChildState, Outbox, PluginInstance, PluginLoader, PluginProcessChild,
};
pub use endpoint::{Endpoint, Registry};
pub use host::{HostConfig, HostOwner, HostState, PluginProcessHost};
pub use launcher::{
    ChildProcess, CommandLauncher, LaunchError, LaunchParams, PluginProcess, ProcessLauncher,
};
pub use manager::PluginHostManager;
pub use message::{
    BaseMessage, InternalMessage, MessageError, PluginMessage, MESSAGE_CLASS_BASE,
    MESSAGE_CLASS_INTERNAL,
};
pub use pipe::{MessagePipe, MessageSink, PipeError, Transport, MESSAGE_DELIMITER};
pub use poll::{PollSet, PollThread};
pub use shm::{RegionRole, SegmentPhase, SegmentTable, SharedMemoryRegion, ShmError};
