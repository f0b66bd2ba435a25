//! Transport layer for HART-IP communication.
//!
//! The transport only moves whole HART-IP messages as bytes; it knows the
//! header layout just well enough to frame a TCP stream. Two transports
//! implement the [`Transport`] trait:
//!
//! - [`TcpTransport`] - connected stream, framed by the header byte count
//! - [`UdpTransport`] - datagrams; learns the server's reply port from the
//!   first response
//!
//! # Constants
//!
//! - [`HART_IP_PORT`] - Well-known HART-IP port (5094)
//! - [`DEFAULT_SOCKET_TIMEOUT`] - Default socket timeout (60 seconds)
//! - [`MIN_SOCKET_TIMEOUT`] - Socket timeouts are never set below this
//!
//! # Example
//!
//! ```no_run
//! use hart_ip::transport::{self, TransportKind, HART_IP_PORT};
//! use std::time::Duration;
//!
//! let addr = transport::resolve_host("192.168.1.20", HART_IP_PORT).unwrap();
//! let link = transport::connect(TransportKind::Udp, addr, Duration::from_secs(60)).unwrap();
//! link.send(&[1, 0, 2, 0, 0, 1, 0, 8]).unwrap();
//! let reply = link.receive().unwrap();
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{
    IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{HartError, Result};
use crate::header::HEADER_SIZE;

/// Well-known HART-IP port.
pub const HART_IP_PORT: u16 = 5094;

/// Default socket send/receive timeout.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(60);

/// Lower bound applied to socket timeouts.
pub const MIN_SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

/// Receive buffer size for datagrams.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Kind of transport used for a HART-IP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportKind {
    /// UDP datagrams.
    Udp,
    /// TCP stream.
    Tcp,
    /// TLS over TCP; reserved.
    SecuredTcp,
}

impl TransportKind {
    /// Returns whether the transport keeps a connection (TCP flavours).
    pub fn is_connection_oriented(self) -> bool {
        !matches!(self, Self::Udp)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Udp => "UDP",
            Self::Tcp => "TCP",
            Self::SecuredTcp => "Secured TCP",
        })
    }
}

/// Byte transport carrying complete HART-IP messages.
///
/// Implementations are shared between the background reader, which calls
/// [`receive`](Transport::receive), and caller threads, which call
/// [`send`](Transport::send).
pub trait Transport: Send + Sync + fmt::Debug {
    /// Transport kind.
    fn kind(&self) -> TransportKind;

    /// Address requests are sent to.
    fn peer_addr(&self) -> SocketAddr;

    /// Sends one complete message.
    fn send(&self, data: &[u8]) -> Result<()>;

    /// Blocks until one complete message arrives.
    ///
    /// Returns `HartError::Timeout` when the socket timeout expires and
    /// `HartError::ConnectionClosed` once the peer or [`shutdown`](Transport::shutdown)
    /// closed the transport.
    fn receive(&self) -> Result<Vec<u8>>;

    /// Closes the transport and wakes a blocked [`receive`](Transport::receive).
    fn shutdown(&self);

    /// Returns whether [`shutdown`](Transport::shutdown) was called.
    fn is_closed(&self) -> bool;
}

/// Socket timeout actually applied for a requested value.
pub fn effective_socket_timeout(requested: Duration) -> Duration {
    requested.max(MIN_SOCKET_TIMEOUT)
}

/// Opens a transport of the given kind to `addr`.
///
/// # Errors
///
/// - `HartError::UnsupportedTransport` for [`TransportKind::SecuredTcp`]
/// - `HartError::Io` / `HartError::Timeout` if the socket cannot be set up
pub fn connect(kind: TransportKind, addr: SocketAddr, timeout: Duration) -> Result<Arc<dyn Transport>> {
    let timeout = effective_socket_timeout(timeout);
    match kind {
        TransportKind::Udp => Ok(Arc::new(UdpTransport::connect(addr, timeout)?)),
        TransportKind::Tcp => Ok(Arc::new(TcpTransport::connect(addr, timeout)?)),
        TransportKind::SecuredTcp => Err(HartError::UnsupportedTransport("secured TCP")),
    }
}

/// Parses `host` as a dotted-quad IPv4 literal whose first octet is 1-255.
pub fn parse_dotted_quad(host: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut parts = host.split('.');
    for octet in octets.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *octet = part.parse().ok()?;
    }
    if parts.next().is_some() || octets[0] == 0 {
        return None;
    }
    Some(Ipv4Addr::from(octets))
}

/// Resolves a host name or dotted-quad literal to a socket address.
///
/// Dotted-quad literals are used as-is; anything else goes through the
/// system resolver, preferring an IPv4 result.
///
/// # Errors
///
/// Returns `HartError::Resolve` if the name cannot be resolved.
///
/// # Example
///
/// ```
/// use hart_ip::transport::resolve_host;
///
/// let addr = resolve_host("10.0.0.7", 5094).unwrap();
/// assert_eq!(addr.to_string(), "10.0.0.7:5094");
/// ```
pub fn resolve_host(host: &str, port: u16) -> Result<SocketAddr> {
    if let Some(ip) = parse_dotted_quad(host) {
        return Ok(SocketAddr::new(IpAddr::V4(ip), port));
    }

    let resolve_error = |reason: String| HartError::Resolve {
        host: host.to_string(),
        reason,
    };
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| resolve_error(e.to_string()))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| resolve_error("no address found".to_string()))
}

fn map_io_error(err: io::Error, closed: &AtomicBool) -> HartError {
    if closed.load(Ordering::Acquire) {
        return HartError::ConnectionClosed;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => HartError::Timeout,
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected => HartError::ConnectionClosed,
        _ => HartError::Io(err),
    }
}

/// TCP transport.
pub struct TcpTransport {
    writer: Mutex<TcpStream>,
    reader: Mutex<TcpStream>,
    control: TcpStream,
    peer: SocketAddr,
    closed: AtomicBool,
}

impl TcpTransport {
    /// Connects to `addr` with `timeout` as connect, send and receive timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let closed = AtomicBool::new(false);
        let stream =
            TcpStream::connect_timeout(&addr, timeout).map_err(|e| map_io_error(e, &closed))?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;

        Ok(Self {
            reader: Mutex::new(stream.try_clone()?),
            control: stream.try_clone()?,
            writer: Mutex::new(stream),
            peer: addr,
            closed,
        })
    }

    /// Reads exactly `buf.len()` bytes. A timeout once part of a frame was
    /// consumed leaves the stream unframed and is reported as closed.
    fn read_frame_part(&self, reader: &mut TcpStream, buf: &mut [u8], mid_frame: bool) -> Result<()> {
        read_full(reader, buf).map_err(|(err, filled)| match map_io_error(err, &self.closed) {
            HartError::Timeout if mid_frame || filled > 0 => {
                log::warn!(
                    "TCP receive timed out inside a message from {}, stream framing lost",
                    self.peer
                );
                HartError::ConnectionClosed
            }
            other => other,
        })
    }
}

/// Fills `buf` from `reader`. On failure returns the error together with the
/// number of bytes that did arrive.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::result::Result<(), (io::Error, usize)> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err((io::ErrorKind::UnexpectedEof.into(), filled)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err((e, filled)),
        }
    }
    Ok(())
}

impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(HartError::ConnectionClosed);
        }
        let mut writer = self.writer.lock();
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| map_io_error(e, &self.closed))
    }

    fn receive(&self) -> Result<Vec<u8>> {
        if self.is_closed() {
            return Err(HartError::ConnectionClosed);
        }
        let mut reader = self.reader.lock();

        let mut message = vec![0u8; HEADER_SIZE];
        self.read_frame_part(&mut reader, &mut message, false)?;

        let byte_count = usize::from(u16::from_be_bytes([message[6], message[7]]));
        let body_len = byte_count.saturating_sub(HEADER_SIZE);
        message.resize(HEADER_SIZE + body_len, 0);
        self.read_frame_part(&mut reader, &mut message[HEADER_SIZE..], true)?;
        Ok(message)
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        // NotConnected here only means the peer went first
        let _ = self.control.shutdown(Shutdown::Both);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peer", &self.peer)
            .field("local_addr", &self.control.local_addr().ok())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// UDP transport.
pub struct UdpTransport {
    socket: UdpSocket,
    destination: Mutex<SocketAddr>,
    port_learned: AtomicBool,
    closed: AtomicBool,
}

impl UdpTransport {
    /// Binds an ephemeral local port and records `addr` as the destination.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket cannot be created or configured.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.set_read_timeout(Some(timeout))?;
        socket.set_write_timeout(Some(timeout))?;

        Ok(Self {
            socket,
            destination: Mutex::new(addr),
            port_learned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn peer_addr(&self) -> SocketAddr {
        *self.destination.lock()
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(HartError::ConnectionClosed);
        }
        let destination = self.peer_addr();
        self.socket
            .send_to(data, destination)
            .map(|_| ())
            .map_err(|e| map_io_error(e, &self.closed))
    }

    fn receive(&self) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            if self.is_closed() {
                return Err(HartError::ConnectionClosed);
            }
            let (size, from) = self
                .socket
                .recv_from(&mut buffer)
                .map_err(|e| map_io_error(e, &self.closed))?;
            if self.is_closed() {
                return Err(HartError::ConnectionClosed);
            }
            if size == 0 {
                continue;
            }

            if !self.port_learned.swap(true, Ordering::AcqRel) {
                let mut destination = self.destination.lock();
                if destination.port() != from.port() {
                    log::debug!(
                        "HART-IP server replied from port {}, redirecting requests",
                        from.port()
                    );
                    destination.set_port(from.port());
                }
            }

            buffer.truncate(size);
            return Ok(buffer);
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // an empty datagram to ourselves unblocks recv_from
        if let Ok(local) = self.socket.local_addr() {
            let wake: SocketAddr = if local.is_ipv4() {
                (Ipv4Addr::LOCALHOST, local.port()).into()
            } else {
                (Ipv6Addr::LOCALHOST, local.port()).into()
            };
            let _ = self.socket.send_to(&[], wake);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpTransport")
            .field("destination", &self.peer_addr())
            .field("local_addr", &self.socket.local_addr().ok())
            .field("closed", &self.is_closed())
            .finish()
    }
}
