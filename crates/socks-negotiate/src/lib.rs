//! Lazily negotiated SOCKS5 connections.
//!
//! SOCKS5 starts every connection with a short negotiation: the client
//! lists the authentication methods it supports, the server picks one,
//! and (for username/password) the two run a small sub-negotiation.  Only
//! then does the connection carry a request and, eventually, data.
//!
//! This crate wraps an ordinary stream in a [`SocksConn`] that performs
//! that negotiation the first time it is read from or written to, in
//! whichever role (client or server) it was built for.  Callers that
//! expect a plain stream can use it unchanged.  A [`Selector`] decides
//! which methods to offer or accept and runs the chosen method; it may
//! also hand back a different stream to use from then on.
//!
//! For more information about SOCKS5:
//!
//!   * SOCKS5 is specified in
//!     [RFC 1928](https://tools.ietf.org/html/rfc1928), and see also
//!     [RFC 1929](https://tools.ietf.org/html/rfc1929) for
//!     Username/Password authentication in SOCKS5.
//!
//! # Example
//!
//! ```no_run
//! use futures::io::AsyncWriteExt;
//! use socks_negotiate::{ClientSelector, Credentials, SocksConn};
//! use socks_negotiate::msg::{AuthMethod, Request, SocksAddr, SocksCmd};
//! use std::convert::TryInto;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! async_std::task::block_on(async {
//!     let tcp = async_std::net::TcpStream::connect("127.0.0.1:1080").await?;
//!     let selector = ClientSelector::new(
//!         Some(Credentials::new("alice", "secret")),
//!         &[AuthMethod::USERNAME_PASSWORD],
//!     );
//!     let mut conn = SocksConn::client(Box::new(tcp), Some(Arc::new(selector)));
//!
//!     let host: socks_negotiate::msg::SocksHostname = "example.com".to_string().try_into()?;
//!     let req = Request::new(SocksCmd::CONNECT, SocksAddr::Hostname(host), 80);
//!     conn.write_all(&req.encode()).await?;
//!     conn.expect_reply();
//!     conn.handshake(true).await?;
//!     Ok::<_, Box<dyn std::error::Error>>(())
//! })
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![warn(clippy::clone_on_ref_ptr)]

mod config;
mod conn;
mod err;
pub mod msg;
mod selector;
mod stream;
#[cfg(test)]
mod testing;

pub use config::{ClientConfig, ServerConfig};
pub use conn::{Role, SocksConn};
pub use err::Error;
pub use selector::{ClientSelector, Credentials, Selector, ServerSelector};
pub use stream::{BoxStream, Stream};

/// A Result type for the socks_negotiate crate.
pub type Result<T> = std::result::Result<T, Error>;
