//! Per-connection state shared between a host controller and the poll thread.

use crate::message::PluginMessage;
use crate::pipe::{wait_readable, MessagePipe, MessageSink, PipeError};
use std::collections::VecDeque;
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// Parsed inbound messages waiting for the owning controller.
#[derive(Debug, Default)]
pub struct IncomingQueue {
    messages: VecDeque<PluginMessage>,
}

impl IncomingQueue {
    pub fn pop(&mut self) -> Option<PluginMessage> {
        self.messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn drain(&mut self) -> VecDeque<PluginMessage> {
        std::mem::take(&mut self.messages)
    }
}

impl MessageSink for IncomingQueue {
    fn receive_message_raw(&mut self, message: &str) {
        match PluginMessage::parse(message) {
            Ok(parsed) => self.messages.push_back(parsed),
            Err(err) => warn!(error = %err, "dropping malformed message"),
        }
    }
}

/// Everything guarded by the endpoint lock.
#[derive(Debug, Default)]
pub struct EndpointIo {
    pub pipe: Option<MessagePipe>,
    pub incoming: IncomingQueue,
    /// First transport failure seen by either thread.
    pub transport_error: Option<PipeError>,
}

impl EndpointIo {
    pub fn record_error(&mut self, err: PipeError) {
        if self.transport_error.is_none() {
            self.transport_error = Some(err);
        }
    }

    /// Flushes output and, unless the poll thread owns input, reads too.
    pub fn pump(&mut self, timeout: Duration, include_input: bool) {
        let Some(pipe) = self.pipe.as_mut() else {
            return;
        };
        let mut result = pipe.pump_output().map(|_| ());
        if result.is_ok() && include_input {
            result = pipe.pump_input(timeout, &mut self.incoming).map(|_| ());
        }
        if let Err(err) = result {
            self.record_error(err);
        }
    }
}

/// A live plugin connection as seen by the registry and the poll thread.
///
/// The host controller owns the endpoint; the poll thread only keeps a
/// `Weak` reference and a duplicated socket for readiness waits.
pub struct Endpoint {
    id: u64,
    io: Mutex<EndpointIo>,
    wants_polling: AtomicBool,
    polled_input: AtomicBool,
    shutdown_requested: AtomicBool,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("wants_polling", &self.wants_polling())
            .field("polled_input", &self.polled_input())
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    fn new(id: u64) -> Self {
        Self {
            id,
            io: Mutex::new(EndpointIo::default()),
            wants_polling: AtomicBool::new(false),
            polled_input: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn io(&self) -> MutexGuard<'_, EndpointIo> {
        self.io.lock().unwrap()
    }

    pub fn install_pipe(&self, pipe: MessagePipe) {
        self.io().pipe = Some(pipe);
        self.wants_polling.store(true, Ordering::SeqCst);
    }

    pub fn has_pipe(&self) -> bool {
        self.io().pipe.is_some()
    }

    /// Whether the poll thread should watch this endpoint's socket.
    pub fn wants_polling(&self) -> bool {
        self.wants_polling.load(Ordering::SeqCst)
    }

    /// Whether the poll thread currently pumps this endpoint's input.
    pub fn polled_input(&self) -> bool {
        self.polled_input.load(Ordering::SeqCst)
    }

    pub(crate) fn set_polled_input(&self, polled: bool) {
        self.polled_input.store(polled, Ordering::SeqCst);
    }

    pub(crate) fn stop_polling(&self) {
        self.wants_polling.store(false, Ordering::SeqCst);
        self.polled_input.store(false, Ordering::SeqCst);
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn take_shutdown_request(&self) -> bool {
        self.shutdown_requested.swap(false, Ordering::SeqCst)
    }

    /// A socket handle for readiness waits that does not borrow the pipe.
    pub(crate) fn poll_handle(&self) -> Option<TcpStream> {
        let io = self.io();
        let pipe = io.pipe.as_ref()?;
        match pipe.transport().try_clone() {
            Ok(stream) => Some(stream),
            Err(err) => {
                warn!(endpoint = self.id, error = %err, "failed to duplicate socket for polling");
                None
            }
        }
    }

    /// Input pump run by the poll thread once the socket is readable.
    /// Returns false when the endpoint should leave the poll set.
    pub(crate) fn service_poll(&self) -> bool {
        let mut guard = self.io();
        let io = &mut *guard;
        let Some(pipe) = io.pipe.as_mut() else {
            return false;
        };
        match pipe.pump_input(Duration::ZERO, &mut io.incoming) {
            Ok(_) => true,
            Err(err) => {
                debug!(endpoint = self.id, error = %err, "poll thread saw transport failure");
                io.record_error(err);
                false
            }
        }
    }

    /// Flushes output and, unless the poll thread owns input, waits up to
    /// `timeout` for input. The wait happens on a duplicated socket with the
    /// endpoint unlocked.
    pub fn pump(&self, timeout: Duration, include_input: bool) {
        if !include_input || timeout.is_zero() {
            self.io().pump(Duration::ZERO, include_input);
            return;
        }
        self.io().pump(Duration::ZERO, false);
        if let Some(handle) = self.poll_handle() {
            if let Err(err) = wait_readable(handle.as_fd(), timeout) {
                debug!(endpoint = self.id, error = %err, "readiness wait failed");
            }
        }
        self.io().pump(Duration::ZERO, true);
    }

    /// Drops the pipe after a best-effort flush and shuts the socket down.
    pub fn close(&self) {
        self.stop_polling();
        let pipe = self.io().pipe.take();
        if let Some(mut pipe) = pipe {
            let _ = pipe.pump_output();
            if let Err(err) = pipe.transport().shutdown(Shutdown::Both) {
                debug!(endpoint = self.id, error = %err, "socket shutdown failed");
            }
        }
    }
}

/// All live endpoints of one manager.
#[derive(Debug, Default)]
pub struct Registry {
    endpoints: Mutex<Vec<Arc<Endpoint>>>,
    dirty: AtomicBool,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> Arc<Endpoint> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let endpoint = Arc::new(Endpoint::new(id));
        self.endpoints.lock().unwrap().push(endpoint.clone());
        self.mark_dirty();
        endpoint
    }

    pub fn deregister(&self, id: u64) {
        self.endpoints.lock().unwrap().retain(|endpoint| endpoint.id() != id);
        self.mark_dirty();
    }

    /// Flags a membership or socket change for the poll thread.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.endpoints.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Asks every live connection to shut down on its next tick.
    pub fn shutdown_all(&self) {
        let endpoints = self.snapshot();
        debug!(count = endpoints.len(), "requesting shutdown of all plugin connections");
        for endpoint in endpoints {
            endpoint.request_shutdown();
        }
    }
}
