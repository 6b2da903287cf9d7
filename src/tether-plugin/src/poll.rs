//! Shared poll thread that waits on every plugin socket with one syscall.

use crate::endpoint::{Endpoint, Registry};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use std::io;
use std::net::TcpStream;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const BUSY_PAUSE: Duration = Duration::from_millis(1);
const IDLE_PAUSE: Duration = Duration::from_millis(10);

/// Sockets the poll thread currently watches.
#[derive(Debug, Default)]
pub struct PollSet {
    entries: Vec<(Weak<Endpoint>, TcpStream)>,
}

impl PollSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replaces the watched set with every endpoint that wants polling.
    pub fn rebuild(&mut self, registry: &Registry) {
        self.clear();
        for endpoint in registry.snapshot() {
            if !endpoint.wants_polling() {
                continue;
            }
            if let Some(handle) = endpoint.poll_handle() {
                endpoint.set_polled_input(true);
                self.entries.push((Arc::downgrade(&endpoint), handle));
            }
        }
        debug!(sockets = self.entries.len(), "rebuilt poll set");
    }

    /// Hands input pumping back to the owning controllers.
    pub fn clear(&mut self) {
        for (weak, _) in self.entries.drain(..) {
            if let Some(endpoint) = weak.upgrade() {
                endpoint.set_polled_input(false);
            }
        }
    }

    /// Waits up to `timeout` and services every readable endpoint.
    ///
    /// Returns how many endpoints were serviced and whether the set needs a
    /// rebuild because an endpoint failed or went away.
    pub fn poll(&mut self, timeout: Duration) -> io::Result<(usize, bool)> {
        if self.entries.is_empty() {
            thread::sleep(timeout);
            return Ok((0, false));
        }

        let ready: Vec<usize> = {
            let mut fds: Vec<PollFd<'_>> = self
                .entries
                .iter()
                .map(|(_, stream)| PollFd::new(stream.as_fd(), PollFlags::POLLIN))
                .collect();
            let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
            match poll(&mut fds, millis) {
                Ok(0) | Err(Errno::EINTR) => return Ok((0, false)),
                Ok(_) => {}
                Err(errno) => return Err(errno.into()),
            }
            fds.iter()
                .enumerate()
                .filter(|(_, fd)| fd.revents().is_some_and(|events| !events.is_empty()))
                .map(|(index, _)| index)
                .collect()
        };

        let mut serviced = 0;
        let mut dirty = false;
        for index in ready {
            match self.entries[index].0.upgrade() {
                Some(endpoint) => {
                    serviced += 1;
                    if !endpoint.service_poll() {
                        endpoint.stop_polling();
                        dirty = true;
                    }
                }
                None => dirty = true,
            }
        }
        Ok((serviced, dirty))
    }
}

/// Background thread driving a [`PollSet`] from a [`Registry`].
pub struct PollThread {
    stop_flag: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PollThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollThread")
            .field("running", &self.join.is_some())
            .finish_non_exhaustive()
    }
}

impl PollThread {
    pub fn spawn(registry: Arc<Registry>) -> io::Result<Self> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();
        registry.mark_dirty();

        let join = thread::Builder::new()
            .name("plugin-poll".to_string())
            .spawn(move || run(&registry, &stop_clone))?;
        info!("plugin poll thread started");
        Ok(Self {
            stop_flag,
            join: Some(join),
        })
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("plugin poll thread panicked");
            }
            info!("plugin poll thread stopped");
        }
    }
}

impl Drop for PollThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(registry: &Registry, stop_flag: &AtomicBool) {
    let mut set = PollSet::new();
    while !stop_flag.load(Ordering::SeqCst) {
        if registry.take_dirty() {
            set.rebuild(registry);
        }
        let serviced = match set.poll(POLL_TIMEOUT) {
            Ok((serviced, dirty)) => {
                if dirty {
                    registry.mark_dirty();
                }
                serviced
            }
            Err(err) => {
                warn!(error = %err, "poll failed; rebuilding");
                registry.mark_dirty();
                0
            }
        };
        thread::sleep(if serviced > 0 { BUSY_PAUSE } else { IDLE_PAUSE });
    }
    set.clear();
    // Controllers go back to pumping their own sockets.
    registry.mark_dirty();
}
