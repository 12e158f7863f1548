use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

use crate::net::reactor::{PollRegistry, Readiness, Selectable};
use crate::net::Endpoint;

/// What a round of socket IO produced.
#[derive(Debug, Default, Clone, Copy)]
pub struct IoEvents {
    /// New bytes landed in the read buffer.
    pub read_any: bool,
    /// The peer closed the connection (or the socket errored); the channel is
    /// now disconnected.
    pub closed: bool,
}

/// A buffered, non-blocking TCP connection.
///
/// The channel itself is not a [`Selectable`]; protocol transports embed one
/// and drive it from their own `register`/`process` implementations. All
/// reads land in [`TcpChannel::read_buffer`] and writes drain from an
/// internal queue, so protocol code never blocks on the socket.
pub struct TcpChannel {
    stream: Option<TcpStream>,
    peer: Option<Endpoint>,
    /// Bytes received and not yet consumed by the protocol layer.
    pub read_buffer: Vec<u8>,
    write_buffer: Vec<u8>,
}

impl TcpChannel {
    /// Opens a connection with a bounded blocking connect, then switches the
    /// socket to non-blocking for reactor use. Must not be called on the
    /// reactor thread.
    pub fn connect(endpoint: Endpoint, timeout: Duration) -> std::io::Result<TcpChannel> {
        let stream = TcpStream::connect_timeout(&endpoint.into(), timeout)?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(TcpChannel {
            stream: Some(stream),
            peer: Some(endpoint),
            read_buffer: Vec::new(),
            write_buffer: Vec::new(),
        })
    }

    /// Wraps an accepted connection.
    pub fn from_stream(stream: TcpStream, peer: SocketAddr) -> std::io::Result<TcpChannel> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = match peer {
            SocketAddr::V4(v4) => Some(v4.into()),
            SocketAddr::V6(_) => None,
        };
        Ok(TcpChannel {
            stream: Some(stream),
            peer,
            read_buffer: Vec::new(),
            write_buffer: Vec::new(),
        })
    }

    /// A channel with no socket, used by protocol unit tests that feed the
    /// read buffer directly.
    pub fn detached() -> TcpChannel {
        TcpChannel {
            stream: None,
            peer: None,
            read_buffer: Vec::new(),
            write_buffer: Vec::new(),
        }
    }

    /// Whether a socket is currently attached.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// The remote endpoint, when known.
    pub fn peer(&self) -> Option<Endpoint> {
        self.peer
    }

    /// Queues bytes for transmission. The caller is responsible for waking
    /// the reactor if this happens off the reactor thread.
    pub fn queue(&mut self, bytes: &[u8]) {
        self.write_buffer.extend_from_slice(bytes);
    }

    /// Bytes queued and not yet handed to the kernel.
    pub fn pending_write_len(&self) -> usize {
        self.write_buffer.len()
    }

    /// Drains and returns everything queued for transmission. Lets protocol
    /// unit tests assert on outbound bytes without a socket.
    #[cfg(test)]
    pub(crate) fn take_queued(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.write_buffer)
    }

    /// Drops the socket. Buffered read bytes stay readable; queued writes are
    /// discarded.
    pub fn close(&mut self) {
        self.stream = None;
        self.write_buffer.clear();
    }

    /// Registers this channel's descriptor. Returns `false` when there is no
    /// socket to register.
    pub fn register(&self, registry: &mut PollRegistry) -> bool {
        match &self.stream {
            Some(stream) => {
                registry.add(stream.as_raw_fd(), true, !self.write_buffer.is_empty());
                true
            }
            None => false,
        }
    }

    /// Performs the reads and writes the readiness results allow.
    pub fn handle_io(&mut self, readiness: &Readiness<'_>) -> IoEvents {
        let mut events = IoEvents::default();
        let Some(fd) = self.stream.as_ref().map(TcpStream::as_raw_fd) else {
            return events;
        };

        if readiness.error(fd) {
            tracing::trace!(peer = ?self.peer, "socket error, closing");
            self.close();
            events.closed = true;
            return events;
        }

        if readiness.readable(fd) {
            let mut scratch = [0u8; 4096];
            loop {
                let Some(stream) = self.stream.as_mut() else { break };
                match stream.read(&mut scratch) {
                    Ok(0) => {
                        self.close();
                        events.closed = true;
                        return events;
                    }
                    Ok(count) => {
                        self.read_buffer.extend_from_slice(&scratch[..count]);
                        events.read_any = true;
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        tracing::trace!(peer = ?self.peer, %err, "read failed, closing");
                        self.close();
                        events.closed = true;
                        return events;
                    }
                }
            }
        }

        if readiness.writable(fd) && !self.write_buffer.is_empty() {
            let result = self
                .stream
                .as_mut()
                .map(|stream| stream.write(&self.write_buffer));
            match result {
                None => {}
                Some(Ok(count)) => {
                    self.write_buffer.drain(..count);
                }
                Some(Err(err)) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Some(Err(err)) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Some(Err(err)) => {
                    tracing::trace!(peer = ?self.peer, %err, "write failed, closing");
                    self.close();
                    events.closed = true;
                }
            }
        }

        events
    }
}

/// A listening socket that hands accepted connections to a callback on the
/// reactor thread.
pub struct TcpServer {
    name: String,
    listener: Option<TcpListener>,
    on_accept: Box<dyn FnMut(TcpStream, SocketAddr) + Send>,
}

impl TcpServer {
    /// Binds `addr` and prepares to accept. `on_accept` runs on the reactor
    /// thread and must not block.
    pub fn bind(
        name: impl Into<String>,
        addr: SocketAddr,
        on_accept: impl FnMut(TcpStream, SocketAddr) + Send + 'static,
    ) -> std::io::Result<TcpServer> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(TcpServer {
            name: name.into(),
            listener: Some(listener),
            on_accept: Box::new(on_accept),
        })
    }

    /// The port the listener actually bound (relevant for port 0 binds).
    pub fn local_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
            .map(|addr| addr.port())
    }

    /// Stops listening.
    pub fn close(&mut self) {
        self.listener = None;
    }
}

impl Selectable for TcpServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&mut self, registry: &mut PollRegistry) -> bool {
        match &self.listener {
            Some(listener) => {
                registry.add(listener.as_raw_fd(), true, false);
                true
            }
            None => false,
        }
    }

    fn process(&mut self, readiness: &Readiness<'_>) -> bool {
        let Some(listener) = &self.listener else {
            return false;
        };
        if !readiness.readable(listener.as_raw_fd()) {
            return true;
        }
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!(server = %self.name, %peer, "accepted connection");
                    (self.on_accept)(stream, peer);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    tracing::warn!(server = %self.name, %err, "accept failed");
                    break;
                }
            }
        }
        true
    }
}
