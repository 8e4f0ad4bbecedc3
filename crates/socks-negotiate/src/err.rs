//! Declare an error type for socks-negotiate
use crate::msg::SocksStatus;

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// An error that occurs while negotiating a SOCKS5 connection.
///
/// Errors are `Clone` so that a failed handshake can hand back the same
/// error to every later caller.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A handshake message carried a version number we weren't
    /// expecting.
    #[error("Unexpected SOCKS protocol version {0}")]
    BadVersion(u8),

    /// The peer told us that none of the offered authentication
    /// methods were acceptable.
    #[error("No acceptable SOCKS authentication method")]
    MethodRejected,

    /// The username/password sub-negotiation ended with a non-success
    /// status.
    #[error("SOCKS authentication failed (status {0})")]
    AuthFailed(u8),

    /// The server answered our request with a failure status.
    #[error("SOCKS request failed: {0}")]
    RequestFailed(SocksStatus),

    /// A handshake message was cut off before it was complete.
    #[error("SOCKS message truncated")]
    Truncated,

    /// The peer didn't implement SOCKS correctly.
    #[error("SOCKS protocol syntax violation")]
    Syntax,

    /// Tried to use a SOCKS feature that can't be expressed on the wire.
    #[error("SOCKS feature not supported")]
    NoSupport,

    /// The underlying stream failed.
    #[error("I/O error on SOCKS connection: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(Arc::new(e))
    }
}

impl From<tor_bytes::Error> for Error {
    fn from(e: tor_bytes::Error) -> Error {
        use tor_bytes::Error as E;
        match e {
            E::Truncated => Error::Truncated,
            _ => Error::Syntax,
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        let kind = match &e {
            Error::Io(inner) => inner.kind(),
            Error::Truncated => io::ErrorKind::UnexpectedEof,
            Error::AuthFailed(_) => io::ErrorKind::PermissionDenied,
            Error::MethodRejected => io::ErrorKind::ConnectionRefused,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, e)
    }
}
