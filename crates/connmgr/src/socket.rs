//! The transport boundary (spec §6). The connection manager never touches a
//! raw file descriptor directly; it only calls through `SocketOps`.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use socket2::{Domain, Socket, Type};

use crate::addr::PeerAddr;

/// I/O primitives the connection manager needs from a transport.
///
/// `Socket` must support being shut down from a thread other than the one
/// blocked reading/writing it — that is how cancellation (spec §5) is
/// delivered to a handler stuck in blocking I/O.
pub trait SocketOps: Send + Sync + 'static {
    type Addr: PeerAddr;
    type Socket: Send + 'static;

    /// Open an unconnected socket suitable for dialing `addr`.
    fn open_to_connect(&self, addr: &Self::Addr) -> io::Result<Self::Socket>;

    /// Bind to a specific local address before connecting, when the caller
    /// knows one (spec §6 `bind`).
    fn bind(&self, socket: &Self::Socket, local: SocketAddr) -> io::Result<()>;

    /// Connect a socket opened with `open_to_connect`.
    fn connect(&self, socket: &Self::Socket, addr: &Self::Addr) -> io::Result<()>;

    /// Prepare an already-connected/accepted socket for handing to a
    /// `Handler` (spec §6 `toBearer`): apply read/write timeouts.
    fn prepare_bearer(&self, socket: &Self::Socket, timeout: Duration) -> io::Result<()>;

    /// Unblock any thread currently reading/writing `socket`. Used for
    /// cancellation; must be safe to call concurrently with another thread
    /// doing I/O on the same socket.
    fn shutdown(&self, socket: &Self::Socket) -> io::Result<()>;

    /// Release the socket's resources. Takes a reference rather than
    /// ownership: the connection thread shares the socket with the
    /// cancellation path (`shutdown`) behind an `Arc`, so the underlying fd
    /// is actually released once the last `Arc` is dropped. This just
    /// ensures it is shut down first.
    fn close(&self, socket: &Self::Socket) -> io::Result<()>;

    fn local_addr(&self, socket: &Self::Socket) -> io::Result<SocketAddr>;
}

/// Default binding over `std::net::TcpStream`/`TcpListener`.
///
/// Grounded in the teacher's own transport boundary (`net::mod::Link` sits
/// between the protocol and a `popol`-driven raw-socket reactor); since that
/// reactor is a poll loop and this spec is thread-per-connection, the actual
/// binding here goes straight to blocking `std::net` plus `socket2` for the
/// handful of options (`SO_REUSEADDR`) `std::net` does not expose.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpSocketOps;

impl SocketOps for TcpSocketOps {
    type Addr = SocketAddr;
    type Socket = TcpStream;

    fn open_to_connect(&self, addr: &SocketAddr) -> io::Result<TcpStream> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        Ok(socket.into())
    }

    fn bind(&self, socket: &TcpStream, local: SocketAddr) -> io::Result<()> {
        // Operate on a dup'd fd: `Socket`'s `Drop` closes only the duplicate,
        // leaving `socket` itself untouched.
        let socket2: Socket = socket.try_clone()?.into();
        socket2.bind(&local.into())
    }

    fn connect(&self, socket: &TcpStream, addr: &SocketAddr) -> io::Result<()> {
        let socket2: Socket = socket.try_clone()?.into();
        socket2.connect(&(*addr).into())
    }

    fn prepare_bearer(&self, socket: &TcpStream, timeout: Duration) -> io::Result<()> {
        socket.set_read_timeout(Some(timeout))?;
        socket.set_write_timeout(Some(timeout))?;
        socket.set_nodelay(true)
    }

    fn shutdown(&self, socket: &TcpStream) -> io::Result<()> {
        socket.shutdown(std::net::Shutdown::Both)
    }

    fn close(&self, socket: &TcpStream) -> io::Result<()> {
        socket.shutdown(std::net::Shutdown::Both)
    }

    fn local_addr(&self, socket: &TcpStream) -> io::Result<SocketAddr> {
        socket.local_addr()
    }
}
