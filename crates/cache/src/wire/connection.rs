//! Socket plus receive buffer, and the three receive disciplines
//!
//! Everything is built on [`Connection::read_chunk`], one bounded read of at
//! most `RECV_CHUNK_SIZE` bytes appended to the receive buffer. The timeout
//! applies to each blocking wait, not to a whole reply: a reply trickling in
//! slowly may span several timeout windows.

use bytes::{Buf, BytesMut};
use kvcache_core::{Error, Result, RECV_CHUNK_SIZE};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, trace};

use super::reply::find_crlf;

/// How long a single read may wait for data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Up to the configured timeout; expiry raises [`Error::Timeout`]
    Blocking,
    /// Not at all; no data available reads as zero bytes
    Immediate,
}

/// One established connection to the server
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    buffer: BytesMut,
    endpoint: String,
    timeout: Duration,
}

impl Connection {
    /// Connect to `host:port`, trying each resolved address in turn
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let endpoint = format!("{host}:{port}");
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::connectivity(&endpoint, "resolve", e))?
            .collect();

        let mut last_error =
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Self::from_stream(stream, endpoint, timeout),
                Err(e) => {
                    debug!(endpoint = %endpoint, addr = %addr, error = %e, "connect attempt failed");
                    last_error = e;
                }
            }
        }
        Err(Error::connectivity(endpoint, "connect", last_error))
    }

    fn from_stream(stream: TcpStream, endpoint: String, timeout: Duration) -> Result<Self> {
        stream
            .set_read_timeout(Some(timeout))
            .and_then(|()| stream.set_write_timeout(Some(timeout)))
            .and_then(|()| stream.set_nodelay(true))
            .map_err(|e| Error::connectivity(&endpoint, "configure socket", e))?;
        debug!(endpoint = %endpoint, "connected");
        Ok(Self {
            stream,
            buffer: BytesMut::with_capacity(RECV_CHUNK_SIZE),
            endpoint,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Write all of `bytes` to the socket
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .write_all(bytes)
            .and_then(|()| self.stream.flush())
            .map_err(|e| Error::connectivity(&self.endpoint, "send", e))
    }

    /// Bytes received but not yet consumed
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Drop the first `n` buffered bytes
    pub fn consume(&mut self, n: usize) {
        self.buffer.advance(n.min(self.buffer.len()));
    }

    /// Drop everything buffered
    pub fn discard_buffer(&mut self) {
        if !self.buffer.is_empty() {
            debug!(endpoint = %self.endpoint, bytes = self.buffer.len(), "discarding receive buffer");
        }
        self.buffer.clear();
    }

    /// Whether a full line is buffered
    pub fn has_line(&self) -> bool {
        find_crlf(&self.buffer).is_some()
    }

    /// Read fixed chunk: one bounded read appended to the buffer
    ///
    /// Returns the number of bytes read; zero only for [`Wait::Immediate`]
    /// with nothing available.
    pub fn read_chunk(&mut self, wait: Wait) -> Result<usize> {
        let mut chunk = [0u8; RECV_CHUNK_SIZE];
        let read = match wait {
            Wait::Blocking => self.read_blocking(&mut chunk)?,
            Wait::Immediate => self.read_immediate(&mut chunk)?,
        };
        self.buffer.extend_from_slice(&chunk[..read]);
        trace!(endpoint = %self.endpoint, read, buffered = self.buffer.len(), "received chunk");
        Ok(read)
    }

    fn read_blocking(&mut self, chunk: &mut [u8]) -> Result<usize> {
        loop {
            match self.stream.read(chunk) {
                Ok(0) => {
                    return Err(Error::connectivity(
                        &self.endpoint,
                        "receive",
                        io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by server"),
                    ))
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    return Err(Error::timeout("receive reply", self.timeout))
                }
                Err(e) => return Err(Error::connectivity(&self.endpoint, "receive", e)),
            }
        }
    }

    fn read_immediate(&mut self, chunk: &mut [u8]) -> Result<usize> {
        self.stream
            .set_nonblocking(true)
            .map_err(|e| Error::connectivity(&self.endpoint, "poll socket", e))?;
        let read = loop {
            match self.stream.read(chunk) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        self.stream
            .set_nonblocking(false)
            .map_err(|e| Error::connectivity(&self.endpoint, "poll socket", e))?;

        match read {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(Error::connectivity(&self.endpoint, "receive", e)),
        }
    }

    /// Read until terminator: accumulate chunks until a CRLF is buffered
    pub fn read_until_terminator(&mut self) -> Result<()> {
        while !self.has_line() {
            self.read_chunk(Wait::Blocking)?;
        }
        Ok(())
    }

    /// Read greedy: one blocking read, then drain whatever else is already
    /// available without waiting
    pub fn read_greedy(&mut self) -> Result<usize> {
        let mut total = self.read_chunk(Wait::Blocking)?;
        loop {
            let read = self.read_chunk(Wait::Immediate)?;
            if read == 0 {
                return Ok(total);
            }
            total += read;
        }
    }
}
