//! Delimiter framing over a byte-stream transport.
//!
//! The same [`MessagePipe`] runs on both ends of a plugin connection. Outbound
//! messages are appended to an output buffer and flushed by non-blocking
//! [`MessagePipe::pump_output`] calls; inbound bytes accumulate until a
//! delimiter is seen, and every complete message is handed to a
//! [`MessageSink`] before scanning continues.

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Terminates every message on the wire. JSON never contains a raw NUL.
pub const MESSAGE_DELIMITER: u8 = b'\0';

const READ_CHUNK: usize = 8192;
/// Upper bound on reads per `pump_input` call so a chatty peer cannot starve the caller.
const MAX_READS_PER_PUMP: usize = 64;
/// Compact the output buffer once this many sent bytes sit in front of the cursor.
const OUTPUT_COMPACT_THRESHOLD: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum PipeError {
    /// The peer closed the stream cleanly.
    #[error("connection closed by peer")]
    Closed,
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl PipeError {
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            PipeError::Closed => None,
            PipeError::Io(err) => Some(err.kind()),
        }
    }
}

/// A byte stream the pipe can drive without ever blocking on writes.
pub trait Transport {
    /// Writes as much of `buf` as the transport accepts right now.
    /// Returns `WouldBlock` when nothing can be written.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Waits up to `timeout` for data, then reads without blocking.
    /// Returns `WouldBlock` when nothing arrived; `Ok(0)` means end of stream.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

impl Transport for TcpStream {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write(buf)
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if !timeout.is_zero() && !wait_readable(self.as_fd(), timeout)? {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.read(buf)
    }
}

/// Blocks until `fd` is readable (or hung up) or `timeout` passes.
pub(crate) fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, millis) {
        Ok(ready) => Ok(ready > 0),
        Err(Errno::EINTR) => Ok(false),
        Err(errno) => Err(errno.into()),
    }
}

/// Receives each complete inbound message, in wire order.
pub trait MessageSink {
    fn receive_message_raw(&mut self, message: &str);
}

impl MessageSink for Vec<String> {
    fn receive_message_raw(&mut self, message: &str) {
        self.push(message.to_string());
    }
}

impl MessageSink for VecDeque<String> {
    fn receive_message_raw(&mut self, message: &str) {
        self.push_back(message.to_string());
    }
}

#[derive(Debug)]
pub struct MessagePipe<T = TcpStream> {
    transport: T,
    input: Vec<u8>,
    output: Vec<u8>,
    /// Bytes of `output` already handed to the transport.
    output_cursor: usize,
}

impl MessagePipe<TcpStream> {
    /// Wraps a connected socket, switching it to non-blocking mode.
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<T: Transport> MessagePipe<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            input: Vec::new(),
            output: Vec::new(),
            output_cursor: 0,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Queues one serialized message; never touches the transport.
    pub fn enqueue(&mut self, message: &str) {
        self.output.extend_from_slice(message.as_bytes());
        self.output.push(MESSAGE_DELIMITER);
    }

    pub fn has_pending_output(&self) -> bool {
        self.output_cursor < self.output.len()
    }

    /// Sends as much queued output as the transport takes without blocking.
    ///
    /// Unsent bytes stay queued for the next call.
    pub fn pump_output(&mut self) -> Result<usize, PipeError> {
        let mut sent = 0;
        while self.output_cursor < self.output.len() {
            match self.transport.send(&self.output[self.output_cursor..]) {
                Ok(0) => return Err(PipeError::Closed),
                Ok(n) => {
                    self.output_cursor += n;
                    sent += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        if self.output_cursor == self.output.len() {
            self.output.clear();
            self.output_cursor = 0;
        } else if self.output_cursor >= OUTPUT_COMPACT_THRESHOLD {
            self.output.drain(..self.output_cursor);
            self.output_cursor = 0;
        }
        Ok(sent)
    }

    /// Reads what is available (waiting at most `timeout` for the first
    /// bytes) and dispatches every complete message to `sink`.
    pub fn pump_input<S>(&mut self, timeout: Duration, sink: &mut S) -> Result<usize, PipeError>
    where
        S: MessageSink + ?Sized,
    {
        let mut chunk = [0u8; READ_CHUNK];
        let mut received = 0;
        let mut wait = timeout;
        for _ in 0..MAX_READS_PER_PUMP {
            match self.transport.recv(&mut chunk, wait) {
                Ok(0) => return Err(PipeError::Closed),
                Ok(n) => {
                    self.input.extend_from_slice(&chunk[..n]);
                    received += n;
                    self.dispatch(sink);
                    wait = Duration::ZERO;
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    break
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(received)
    }

    /// Flushes output, then waits up to `timeout` for input.
    pub fn pump<S>(&mut self, timeout: Duration, sink: &mut S) -> Result<(), PipeError>
    where
        S: MessageSink + ?Sized,
    {
        self.pump_output()?;
        self.pump_input(timeout, sink)?;
        Ok(())
    }

    fn dispatch<S: MessageSink + ?Sized>(&mut self, sink: &mut S) {
        let mut start = 0;
        while let Some(offset) = self.input[start..]
            .iter()
            .position(|&byte| byte == MESSAGE_DELIMITER)
        {
            let end = start + offset;
            match std::str::from_utf8(&self.input[start..end]) {
                Ok(message) => sink.receive_message_raw(message),
                Err(err) => warn!(len = end - start, error = %err, "dropping non-UTF-8 message"),
            }
            start = end + 1;
        }
        if start > 0 {
            self.input.drain(..start);
        }
    }
}
