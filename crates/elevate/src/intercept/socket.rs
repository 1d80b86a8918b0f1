//! Rendezvous socket between the supervisor and an interception helper
//!
//! The supervisor creates a connected pair before fork. The child's end is
//! made inheritable so a helper loaded into the executed command can find
//! it through [`INTERCEPT_FD_ENV`]; the supervisor's end stays close-on-exec
//! and is switched to non-blocking mode, since it is read from dispatcher
//! callbacks.
//!
//! The protocol uses length-prefixed JSON messages:
//! ```text
//! [4 bytes: u32 big-endian length][N bytes: JSON payload]
//! ```
//!
//! Incoming bytes accumulate in a per-socket buffer; a message is decoded
//! only once its whole frame has arrived.

use crate::error::{ElevateError, Result};
use crate::intercept::types::{InterceptMessage, InterceptResponse};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// Environment variable carrying the helper's descriptor number.
pub const INTERCEPT_FD_ENV: &str = "ELEVATE_INTERCEPT_FD";

const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest accepted payload.
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// Result of one read from the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// Bytes were added to the receive buffer.
    Data,
    /// Nothing to read yet on a non-blocking end.
    Empty,
    /// The peer closed its end.
    Closed,
}

/// One end of the rendezvous socket.
#[derive(Debug)]
pub struct InterceptSocket {
    stream: UnixStream,
    inbound: Vec<u8>,
}

impl InterceptSocket {
    /// Create a connected pair, returned as `(supervisor_end, child_end)`.
    ///
    /// Both ends are close-on-exec and blocking; the child clears the flag
    /// on its end after fork.
    #[must_use = "both socket ends must be used"]
    pub fn pair() -> Result<(Self, Self)> {
        let (s1, s2) = UnixStream::pair().map_err(|e| {
            ElevateError::Socket(format!("unable to create intercept socket pair: {e}"))
        })?;
        Ok((Self::wrap(s1), Self::wrap(s2)))
    }

    fn wrap(stream: UnixStream) -> Self {
        Self {
            stream,
            inbound: Vec::new(),
        }
    }

    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Never block on this end again.
    pub fn set_nonblocking(&self) -> Result<()> {
        self.stream.set_nonblocking(true).map_err(|e| {
            ElevateError::Socket(format!("unable to make intercept socket non-blocking: {e}"))
        })
    }

    /// Number of received bytes not yet consumed as a message.
    pub fn buffered(&self) -> usize {
        self.inbound.len()
    }

    /// Read once from the socket into the receive buffer.
    ///
    /// On a non-blocking socket with nothing to read this returns
    /// [`Fill::Empty`].
    pub fn fill(&mut self) -> Result<Fill> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(Fill::Closed),
                Ok(n) => {
                    self.inbound.extend_from_slice(&chunk[..n]);
                    return Ok(Fill::Data);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Fill::Empty),
                Err(e) => {
                    return Err(ElevateError::Socket(format!("read from intercept socket: {e}")))
                }
            }
        }
    }

    /// Take the next complete payload out of the receive buffer.
    fn take_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(prefix) = self.inbound.get(..LENGTH_PREFIX_SIZE) else {
            return Ok(None);
        };
        let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
        len_bytes.copy_from_slice(prefix);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(ElevateError::Socket(format!(
                "intercept frame of {len} bytes exceeds {MAX_MESSAGE_SIZE}"
            )));
        }
        let end = LENGTH_PREFIX_SIZE + len;
        if self.inbound.len() < end {
            return Ok(None);
        }
        let payload = self.inbound[LENGTH_PREFIX_SIZE..end].to_vec();
        self.inbound.drain(..end);
        Ok(Some(payload))
    }

    fn take<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.take_frame()? {
            Some(payload) => serde_json::from_slice(&payload)
                .map(Some)
                .map_err(|e| ElevateError::Socket(format!("malformed intercept frame: {e}"))),
            None => Ok(None),
        }
    }

    /// Next fully buffered message from the helper, if any. Never reads.
    pub fn next_message(&mut self) -> Result<Option<InterceptMessage>> {
        self.take()
    }

    /// Read until one whole value arrives. Blocks on a blocking socket.
    fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        loop {
            if let Some(value) = self.take()? {
                return Ok(value);
            }
            match self.fill()? {
                Fill::Data => {}
                Fill::Empty => {
                    return Err(ElevateError::Socket(
                        "no complete intercept frame available".to_string(),
                    ))
                }
                Fill::Closed => {
                    return Err(ElevateError::Socket(format!(
                        "intercept socket closed with {} bytes pending",
                        self.inbound.len()
                    )))
                }
            }
        }
    }

    /// Receive a message from the helper on a blocking end.
    pub fn recv_message(&mut self) -> Result<InterceptMessage> {
        self.recv()
    }

    /// Receive a response from the supervisor (helper side).
    pub fn recv_response(&mut self) -> Result<InterceptResponse> {
        self.recv()
    }

    fn send<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| ElevateError::Socket(format!("unable to encode intercept frame: {e}")))?;
        self.write_frame(&payload)
    }

    /// Send a message from helper to supervisor.
    pub fn send_message(&mut self, msg: &InterceptMessage) -> Result<()> {
        self.send(msg)
    }

    /// Send a response from supervisor to helper.
    pub fn send_response(&mut self, resp: &InterceptResponse) -> Result<()> {
        self.send(resp)
    }

    fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len as usize <= MAX_MESSAGE_SIZE)
            .ok_or_else(|| {
                ElevateError::Socket(format!(
                    "intercept frame of {} bytes exceeds {MAX_MESSAGE_SIZE}",
                    payload.len()
                ))
            })?;
        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(payload);
        self.stream
            .write_all(&frame)
            .map_err(|e| ElevateError::Socket(format!("write to intercept socket: {e}")))
    }

    /// Raw access for tests that need to send malformed or partial frames.
    #[cfg(test)]
    pub(crate) fn stream_mut(&mut self) -> &mut UnixStream {
        &mut self.stream
    }
}
