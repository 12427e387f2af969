//! Length-prefixed message framing over a local socket pair.
//!
//! Frame layout: an 8-byte ASCII header holding the payload length in
//! lowercase hexadecimal (left-padded with zeros), followed by the payload
//! bytes. The channel is trusted (same host, parent/worker), so there is no
//! magic, version, or checksum.

use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// Size of the hex length header in bytes.
pub const HEADER_LEN: usize = 8;

/// Largest payload a frame can describe (8 hex digits).
pub const MAX_PAYLOAD: usize = u32::MAX as usize;

/// Error from channel operations.
#[derive(Debug)]
pub enum ChannelError {
    /// Peer closed the stream (EOF).
    Closed,
    /// Malformed frame header.
    Protocol(String),
    /// Underlying stream failure.
    Broken(io::Error),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "channel closed by peer"),
            Self::Protocol(msg) => write!(f, "channel protocol error: {msg}"),
            Self::Broken(e) => write!(f, "channel broken: {e}"),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        if e.kind() == ErrorKind::UnexpectedEof {
            Self::Closed
        } else {
            Self::Broken(e)
        }
    }
}

/// One end of a framed duplex byte stream.
#[derive(Debug)]
pub struct Channel {
    stream: UnixStream,
}

impl Channel {
    /// Create a connected pair of channels (parent end, worker end).
    pub fn pair() -> io::Result<(Channel, Channel)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Channel { stream: a }, Channel { stream: b }))
    }

    /// Write one frame, looping until all bytes are flushed.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(ChannelError::Protocol(format!(
                "payload of {} bytes exceeds frame limit",
                payload.len()
            )));
        }
        let header = format!("{:08x}", payload.len());
        self.stream.write_all(header.as_bytes())?;
        self.stream.write_all(payload)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Read one frame, blocking until it is complete.
    ///
    /// EOF before the header completes is [`ChannelError::Closed`]; a
    /// non-hex header is [`ChannelError::Protocol`].
    pub fn read_blocking(&mut self) -> Result<Vec<u8>, ChannelError> {
        let mut header = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header)?;
        let text = std::str::from_utf8(&header)
            .map_err(|_| ChannelError::Protocol("header is not ASCII".into()))?;
        let len = usize::from_str_radix(text, 16)
            .map_err(|_| ChannelError::Protocol(format!("header {text:?} is not hex")))?;
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Read one frame if data is already available.
    ///
    /// Returns `None` immediately when nothing is buffered; once the first
    /// byte is present the rest of the frame is read as in
    /// [`read_blocking`](Self::read_blocking).
    pub fn read_nonblocking(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        self.stream.set_nonblocking(true).map_err(ChannelError::Broken)?;
        let mut probe = [0u8; 1];
        let peeked = self.stream.peek(&mut probe);
        self.stream.set_nonblocking(false).map_err(ChannelError::Broken)?;

        match peeked {
            Ok(0) => Err(ChannelError::Closed),
            Ok(_) => self.read_blocking().map(Some),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(ChannelError::Broken(e)),
        }
    }

    /// Wait until the channel has readable data, up to `timeout`.
    ///
    /// A zero timeout degrades to an immediate poll. EOF counts as readable
    /// so a closed peer is noticed promptly.
    pub fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut probe = [0u8; 1];

        if timeout.is_zero() {
            self.stream.set_nonblocking(true)?;
            let peeked = self.stream.peek(&mut probe);
            self.stream.set_nonblocking(false)?;
            return match peeked {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
                Err(e) => Err(e),
            };
        }

        self.stream.set_read_timeout(Some(timeout))?;
        let peeked = self.stream.peek(&mut probe);
        self.stream.set_read_timeout(None)?;
        match peeked {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
