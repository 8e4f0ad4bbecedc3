//! The byte-stream capability that a [`SocksConn`](crate::SocksConn) wraps.

use futures::io::{AsyncRead, AsyncWrite};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::net::SocketAddr;
use std::time::Duration;

/// A bidirectional byte stream that SOCKS5 can be negotiated over.
///
/// Reading and writing come from [`AsyncRead`] and [`AsyncWrite`].  The
/// other operations are optional: the defaults report them as
/// unsupported.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Return the local address of this stream.
    fn local_addr(&self) -> IoResult<SocketAddr> {
        Err(unsupported("local_addr"))
    }
    /// Return the address of the remote end of this stream.
    fn peer_addr(&self) -> IoResult<SocketAddr> {
        Err(unsupported("peer_addr"))
    }
    /// Set a timeout for reads.  `None` means no timeout.
    fn set_read_timeout(&self, _dur: Option<Duration>) -> IoResult<()> {
        Err(unsupported("set_read_timeout"))
    }
    /// Set a timeout for writes.  `None` means no timeout.
    fn set_write_timeout(&self, _dur: Option<Duration>) -> IoResult<()> {
        Err(unsupported("set_write_timeout"))
    }
}

/// An owned, type-erased [`Stream`].
pub type BoxStream = Box<dyn Stream>;

/// Return an error for an operation that a stream can't do.
fn unsupported(op: &str) -> IoError {
    IoError::new(
        ErrorKind::Other,
        format!("{} is not supported by this stream", op),
    )
}

/// async-std sockets have no per-socket timeouts; callers that need them
/// should wrap the socket in a [`Stream`] of their own.
impl Stream for async_std::net::TcpStream {
    fn local_addr(&self) -> IoResult<SocketAddr> {
        async_std::net::TcpStream::local_addr(self)
    }
    fn peer_addr(&self) -> IoResult<SocketAddr> {
        async_std::net::TcpStream::peer_addr(self)
    }
}
