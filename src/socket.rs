//! Socket option configuration the core needs that `mio`'s own types don't
//! expose (`SO_REUSEPORT`, `SO_KEEPALIVE`): a thin layer over `socket2`,
//! grounded in muduo's `Socket.cc`/`Socket.h`.
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::error::ReactorError;

/// Backlog passed to `listen(2)`, matching muduo's `Socket::listen`.
pub const LISTEN_BACKLOG: i32 = 1024;

/// Builds, configures, binds and starts listening on a non-blocking TCP
/// socket for `addr`.
///
/// Sets `SO_REUSEADDR` unconditionally and `SO_REUSEPORT` when `reuse_port`
/// is set, mirroring `Socket::setReuseAddr`/`setReusePort`. Every failure
/// here is a fatal, construction-time condition.
pub fn bind_listener(addr: SocketAddr, reuse_port: bool) -> Result<TcpListener, ReactorError> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket =
        Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(ReactorError::SocketCreate)?;

    socket
        .set_nonblocking(true)
        .map_err(ReactorError::SocketCreate)?;
    socket
        .set_reuse_address(true)
        .map_err(ReactorError::SocketCreate)?;
    if reuse_port {
        set_reuse_port(&socket, true).map_err(ReactorError::SocketCreate)?;
    }
    socket.bind(&addr.into()).map_err(ReactorError::Bind)?;
    socket.listen(LISTEN_BACKLOG).map_err(ReactorError::Listen)?;

    let std_listener: StdTcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener))
}

#[cfg(target_os = "linux")]
fn set_reuse_port(socket: &Socket, on: bool) -> io::Result<()> {
    socket.set_reuse_port(on)
}

#[cfg(not(target_os = "linux"))]
fn set_reuse_port(_socket: &Socket, _on: bool) -> io::Result<()> {
    Ok(())
}

/// Enables `SO_KEEPALIVE` on a freshly accepted stream, mirroring
/// `TcpConnection`'s constructor calling `socket_->setKeepAlive(true)`.
/// Borrows the stream via `SockRef` rather than taking ownership, so the
/// `mio::net::TcpStream` remains the sole owner of the underlying fd.
pub fn enable_keepalive(stream: &TcpStream) -> io::Result<()> {
    SockRef::from(stream).set_keepalive(true)
}

/// Sets or clears `TCP_NODELAY` on a connected stream.
pub fn set_nodelay(stream: &TcpStream, on: bool) -> io::Result<()> {
    stream.set_nodelay(on)
}

/// Half-closes the write side of `stream`, used by `TcpConnection::shutdown`
/// once its output buffer has drained, matching `Socket::shutdownWrite`.
pub fn shutdown_write(stream: &TcpStream) -> io::Result<()> {
    use std::net::Shutdown;
    stream.shutdown(Shutdown::Write)
}

/// Reads the pending `SO_ERROR` value for a socket, used by
/// `TcpConnection::handle_error` to mirror `Socket::getSocketError`.
pub fn socket_error(stream: &TcpStream) -> io::Result<Option<io::Error>> {
    stream.take_error()
}
