//! A stream that performs SOCKS5 negotiation on first use.
//!
//! A [`SocksConn`] wraps an ordinary [`Stream`] and a [`Selector`].  It
//! looks like a plain stream to its user, but the first read or write on
//! it runs the SOCKS5 method negotiation (and whatever authentication the
//! selector asks for) before any application data moves.
//!
//! The handshake runs once, whichever direction gets there first.  Two
//! async locks keep the directions apart: `read_lock` guards the messages
//! that only the read side has to consume (the server's method choice on
//! a client, and replies announced with [`SocksConn::expect_reply`]), and
//! `handshake_lock` guards the handshake itself.  The read side always
//! takes `read_lock` before `handshake_lock`.
//!
//! Once the handshake is done, reads and writes poll the underlying
//! stream directly, holding its mutex only for the length of one poll.

use crate::msg::{send, AuthMethod, MethodRequest, MethodSelection};
use crate::msg::{Reply, SocksStatus, UserPassResponse};
use crate::selector::Selector;
use crate::stream::{BoxStream, Stream};
use crate::{Error, Result};

use futures::future::{BoxFuture, FutureExt};
use futures::io::{AsyncRead, AsyncWrite};
use futures::lock::Mutex as AsyncMutex;
use futures::ready;
use once_cell::sync::OnceCell;
use std::fmt;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, trace};

/// Which end of the SOCKS conversation a [`SocksConn`] is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Role {
    /// We dialed a SOCKS server and will send the method request.
    Client,
    /// We accepted a SOCKS client and will answer its method request.
    Server,
}

/// Protocol messages that the read side still has to consume before it
/// can hand any bytes to the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Owed {
    /// Client only: the server's method selection, and the
    /// username/password response if the selector sent a request.
    selection: bool,
    /// Number of generic SOCKS5 replies announced with `expect_reply`.
    replies: usize,
}

impl Owed {
    /// Return true if reads can go straight to the stream.
    fn is_nothing(&self) -> bool {
        !self.selection && self.replies == 0
    }
}

/// State shared by every handle to one connection.
struct Shared {
    /// The stream we're negotiating over.  A selector may replace it
    /// during the handshake; it is `None` while a selector holds it, or
    /// after a selector failed and dropped it.
    stream: Mutex<Option<BoxStream>>,
    /// Strategy used to pick and run an authentication method.
    selector: Option<Arc<dyn Selector>>,
    /// Which end of the handshake we are.
    role: Role,
    /// True once the handshake has finished successfully.
    handshaked: AtomicBool,
    /// The first error that made this connection unusable.  Once set,
    /// every later read and write gives back this error.
    failure: OnceCell<Error>,
    /// The method that was negotiated.
    method: OnceCell<AuthMethod>,
    /// What the read side still owes.
    owed: Mutex<Owed>,
    /// Held while reads consume what they owe.
    read_lock: AsyncMutex<()>,
    /// Held while the handshake runs.
    handshake_lock: AsyncMutex<()>,
}

/// A future that must finish before a handle can do its I/O.
type Pending = BoxFuture<'static, Result<()>>;

/// A stream that negotiates SOCKS5 on first use.
///
/// Clones are handles to the same connection and share its handshake:
/// one task can read through one handle while another writes through a
/// clone, the way a bidirectional relay does.  [`AsyncReadExt::split`]
/// works too.
///
/// [`AsyncReadExt::split`]: futures::io::AsyncReadExt::split
pub struct SocksConn {
    /// The connection itself.
    shared: Arc<Shared>,
    /// A read-side handshake this handle is waiting on.
    read_pending: Option<Pending>,
    /// A write-side handshake this handle is waiting on.
    write_pending: Option<Pending>,
}

/// Lock `m`, ignoring poison.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Error for I/O on a connection whose stream is gone.
fn not_connected() -> IoError {
    IoError::new(ErrorKind::NotConnected, "SOCKS stream is not available")
}

/// Borrowed access to the current stream, locking it for each poll.
struct Raw<'a>(&'a Shared);

impl AsyncRead for Raw<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        match lock(&self.0.stream).as_mut() {
            Some(s) => Pin::new(s).poll_read(cx, buf),
            None => Poll::Ready(Err(not_connected())),
        }
    }
}

impl AsyncWrite for Raw<'_> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<IoResult<usize>> {
        match lock(&self.0.stream).as_mut() {
            Some(s) => Pin::new(s).poll_write(cx, buf),
            None => Poll::Ready(Err(not_connected())),
        }
    }
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        match lock(&self.0.stream).as_mut() {
            Some(s) => Pin::new(s).poll_flush(cx),
            None => Poll::Ready(Err(not_connected())),
        }
    }
    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        match lock(&self.0.stream).as_mut() {
            Some(s) => Pin::new(s).poll_close(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl Shared {
    /// Return the error that this connection failed with, if any.
    fn check_failed(&self) -> Result<()> {
        match self.failure.get() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Record `e` as this connection's failure, and return whichever
    /// failure was recorded first.
    fn fail(&self, e: Error) -> Error {
        debug!("SOCKS {:?} handshake failed: {}", self.role, e);
        let _ = self.failure.set(e.clone());
        self.failure.get().cloned().unwrap_or(e)
    }

    /// Return true if a write can go straight to the stream.
    fn write_ready(&self) -> bool {
        self.handshaked.load(Ordering::SeqCst) && self.failure.get().is_none()
    }

    /// Return true if a read can go straight to the stream.
    fn read_ready(&self) -> bool {
        self.write_ready() && lock(&self.owed).is_nothing()
    }

    /// Return true if the server's method selection is still unread.
    fn owes_selection(&self) -> bool {
        lock(&self.owed).selection
    }

    /// Return the number of announced replies still unread.
    fn owed_replies(&self) -> usize {
        lock(&self.owed).replies
    }

    /// Run `f` on the current stream.
    fn with_stream<T, F>(&self, f: F) -> IoResult<T>
    where
        F: FnOnce(&BoxStream) -> IoResult<T>,
    {
        match lock(&self.stream).as_ref() {
            Some(s) => f(s),
            None => Err(not_connected()),
        }
    }

    /// Hand the stream to `selector` for `method`, and keep whatever
    /// stream it gives back.
    async fn run_selector(&self, selector: &dyn Selector, method: AuthMethod) -> Result<()> {
        let stream = lock(&self.stream).take().ok_or_else(not_connected)?;
        let stream = selector.on_selected(method, stream).await?;
        *lock(&self.stream) = Some(stream);
        Ok(())
    }

    /// Run the handshake if nobody has yet.
    async fn prepare_write(&self) -> Result<()> {
        let _guard = self.handshake_lock.lock().await;
        self.check_failed()?;
        if self.handshaked.load(Ordering::SeqCst) {
            return Ok(());
        }

        debug!("Starting SOCKS {:?} handshake", self.role);
        let outcome = match self.role {
            Role::Client => self.client_handshake().await,
            Role::Server => self.server_handshake().await,
        };
        match outcome {
            Ok(()) => {
                self.handshaked.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Run the handshake if nobody has yet, then consume whatever the
    /// read side owes.
    async fn prepare_read(&self) -> Result<()> {
        let _guard = self.read_lock.lock().await;
        self.check_failed()?;
        if !self.handshaked.load(Ordering::SeqCst) {
            self.prepare_write().await?;
        }

        if self.owes_selection() {
            let outcome = self.client_read_selection().await;
            if let Some(selector) = &self.selector {
                selector.set_authentication_read();
            }
            lock(&self.owed).selection = false;
            if let Err(e) = outcome {
                return Err(self.fail(e));
            }
        }

        while self.owed_replies() > 0 {
            let reply = Reply::read_from(&mut Raw(self)).await;
            lock(&self.owed).replies -= 1;
            let reply = reply?;
            trace!("Read SOCKS reply {}:{}", reply.addr(), reply.port());
            if reply.status() != SocksStatus::SUCCEEDED {
                return Err(Error::RequestFailed(reply.status()));
            }
        }
        Ok(())
    }

    /// Client: send our method request, and let the selector start its
    /// sub-negotiation right away.
    async fn client_handshake(&self) -> Result<()> {
        let methods = match &self.selector {
            Some(selector) => selector.methods(),
            None => Vec::new(),
        };
        let request = MethodRequest::new(&methods);
        send(&mut Raw(self), &request.encode()).await?;
        trace!("Sent SOCKS method request {:?}", request.methods());

        if let Some(selector) = &self.selector {
            self.run_selector(selector.as_ref(), AuthMethod::NO_AUTH)
                .await?;
        }
        Ok(())
    }

    /// Client: read the server's method selection, and the answer to
    /// our credentials if we sent any.
    async fn client_read_selection(&self) -> Result<()> {
        let mut raw = Raw(self);
        let method = MethodSelection::read_from(&mut raw).await?.method();
        let _ = self.method.set(method);
        debug!("SOCKS server selected method {}", method);
        if method == AuthMethod::NO_ACCEPTABLE {
            return Err(Error::MethodRejected);
        }

        let auth_pending = match &self.selector {
            Some(selector) => selector.is_authentication_to_read(),
            None => false,
        };
        if auth_pending {
            let response = UserPassResponse::read_from(&mut raw).await?;
            if !response.is_success() {
                return Err(Error::AuthFailed(response.status()));
            }
        }
        Ok(())
    }

    /// Server: read the client's method request, answer it, and run the
    /// chosen method's sub-negotiation.
    async fn server_handshake(&self) -> Result<()> {
        let mut raw = Raw(self);
        let request = MethodRequest::read_from(&mut raw).await?;
        let method = match &self.selector {
            Some(selector) => selector.select(request.methods()),
            None => AuthMethod::NO_AUTH,
        };
        debug!(
            "SOCKS client offered {:?}; selected {}",
            request.methods(),
            method
        );
        send(&mut raw, &MethodSelection::new(method).encode()).await?;

        if let Some(selector) = &self.selector {
            self.run_selector(selector.as_ref(), method).await?;
        }
        if method == AuthMethod::NO_ACCEPTABLE {
            return Err(Error::MethodRejected);
        }
        let _ = self.method.set(method);
        Ok(())
    }
}

impl SocksConn {
    /// Wrap `stream` for use by a SOCKS client.
    pub fn client(stream: BoxStream, selector: Option<Arc<dyn Selector>>) -> Self {
        Self::new(Role::Client, stream, selector)
    }

    /// Wrap `stream` for use by a SOCKS server.
    ///
    /// Without a selector, the server always picks
    /// [`AuthMethod::NO_AUTH`].
    pub fn server(stream: BoxStream, selector: Option<Arc<dyn Selector>>) -> Self {
        Self::new(Role::Server, stream, selector)
    }

    /// Wrap `stream` for use by the given `role`.
    pub fn new(role: Role, stream: BoxStream, selector: Option<Arc<dyn Selector>>) -> Self {
        let owed = Owed {
            selection: role == Role::Client,
            replies: 0,
        };
        let shared = Shared {
            stream: Mutex::new(Some(stream)),
            selector,
            role,
            handshaked: AtomicBool::new(false),
            failure: OnceCell::new(),
            method: OnceCell::new(),
            owed: Mutex::new(owed),
            read_lock: AsyncMutex::new(()),
            handshake_lock: AsyncMutex::new(()),
        };
        SocksConn {
            shared: Arc::new(shared),
            read_pending: None,
            write_pending: None,
        }
    }

    /// Return which end of the handshake this connection is.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Return the negotiated authentication method, if we know it yet.
    ///
    /// A server learns it during the handshake; a client learns it when
    /// it reads the server's answer.
    pub fn method(&self) -> Option<AuthMethod> {
        self.shared.method.get().copied()
    }

    /// Return true if the handshake has finished successfully.
    pub fn is_handshaked(&self) -> bool {
        self.shared.write_ready()
    }

    /// Announce that the peer is going to send a SOCKS5 reply that a
    /// read has to consume first.
    ///
    /// A client calls this after writing a request through this
    /// connection, so that the reply doesn't show up as data.  Each call
    /// announces one more reply: a BIND request, which gets two, needs
    /// two calls.
    pub fn expect_reply(&self) {
        lock(&self.shared.owed).replies += 1;
    }

    /// Make sure the handshake has happened, and that the read side (if
    /// `for_read`) has consumed everything it owes.
    ///
    /// Gives back the same error forever once the handshake has failed.
    pub async fn handshake(&self, for_read: bool) -> Result<()> {
        if for_read {
            self.shared.prepare_read().await
        } else {
            self.shared.prepare_write().await
        }
    }

    /// Return the local address of the underlying stream.
    pub fn local_addr(&self) -> IoResult<SocketAddr> {
        self.shared.with_stream(|s| s.local_addr())
    }

    /// Return the remote address of the underlying stream.
    pub fn peer_addr(&self) -> IoResult<SocketAddr> {
        self.shared.with_stream(|s| s.peer_addr())
    }

    /// Set the read timeout of the underlying stream.
    pub fn set_read_timeout(&self, dur: Option<Duration>) -> IoResult<()> {
        self.shared.with_stream(|s| s.set_read_timeout(dur))
    }

    /// Set the write timeout of the underlying stream.
    pub fn set_write_timeout(&self, dur: Option<Duration>) -> IoResult<()> {
        self.shared.with_stream(|s| s.set_write_timeout(dur))
    }

    /// Set both timeouts of the underlying stream.
    pub fn set_timeout(&self, dur: Option<Duration>) -> IoResult<()> {
        self.shared.with_stream(|s| {
            s.set_read_timeout(dur)?;
            s.set_write_timeout(dur)
        })
    }
}

impl Clone for SocksConn {
    fn clone(&self) -> Self {
        SocksConn {
            shared: Arc::clone(&self.shared),
            read_pending: None,
            write_pending: None,
        }
    }
}

impl fmt::Debug for SocksConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocksConn")
            .field("role", &self.role())
            .field("handshaked", &self.is_handshaked())
            .field("method", &self.method())
            .field("failure", &self.shared.failure.get())
            .finish()
    }
}

/// Poll `pending` to completion, if there is one.
fn poll_pending(pending: &mut Option<Pending>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
    if let Some(fut) = pending.as_mut() {
        let outcome = ready!(fut.poll_unpin(cx));
        *pending = None;
        if let Err(e) = outcome {
            return Poll::Ready(Err(e.into()));
        }
    }
    Poll::Ready(Ok(()))
}

impl AsyncRead for SocksConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        let this = self.get_mut();
        if this.read_pending.is_none() && !this.shared.read_ready() {
            let shared = Arc::clone(&this.shared);
            this.read_pending = Some(async move { shared.prepare_read().await }.boxed());
        }
        ready!(poll_pending(&mut this.read_pending, cx))?;
        Pin::new(&mut Raw(&this.shared)).poll_read(cx, buf)
    }
}

impl AsyncWrite for SocksConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<IoResult<usize>> {
        let this = self.get_mut();
        if this.write_pending.is_none() && !this.shared.write_ready() {
            let shared = Arc::clone(&this.shared);
            this.write_pending = Some(async move { shared.prepare_write().await }.boxed());
        }
        ready!(poll_pending(&mut this.write_pending, cx))?;
        Pin::new(&mut Raw(&this.shared)).poll_write(cx, buf)
    }
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        Pin::new(&mut Raw(&self.shared)).poll_flush(cx)
    }
    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        Pin::new(&mut Raw(&self.shared)).poll_close(cx)
    }
}

impl Stream for SocksConn {
    fn local_addr(&self) -> IoResult<SocketAddr> {
        SocksConn::local_addr(self)
    }
    fn peer_addr(&self) -> IoResult<SocketAddr> {
        SocksConn::peer_addr(self)
    }
    fn set_read_timeout(&self, dur: Option<Duration>) -> IoResult<()> {
        SocksConn::set_read_timeout(self, dur)
    }
    fn set_write_timeout(&self, dur: Option<Duration>) -> IoResult<()> {
        SocksConn::set_write_timeout(self, dur)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::selector::{ClientSelector, Credentials, ServerSelector};
    use crate::testing::{MockStream, WrappedStream};
    use async_trait::async_trait;
    use futures::future::join_all;
    use futures::io::{AsyncReadExt, AsyncWriteExt};
    use futures_await_test::async_test;
    use hex_literal::hex;
    use std::sync::atomic::AtomicUsize;

    fn client_with(
        input: &[u8],
        creds: Option<Credentials>,
        methods: &[AuthMethod],
    ) -> (MockStream, Arc<ClientSelector>, SocksConn) {
        let s = MockStream::new(input);
        let sel = Arc::new(ClientSelector::new(creds, methods));
        let conn = SocksConn::client(s.boxed(), Some(Arc::clone(&sel) as Arc<dyn Selector>));
        (s, sel, conn)
    }

    /// Check the method request that a client with `methods` sends.
    async fn check_hello(methods: &[AuthMethod], expected: &[u8]) {
        let (s, _, conn) = client_with(&[], None, methods);
        conn.handshake(false).await.unwrap();
        assert_eq!(&s.written()[..], expected);
    }

    #[async_test]
    async fn hello_encoding() {
        check_hello(&[], &hex!("05 01 00")).await;
        check_hello(&[AuthMethod::NO_AUTH], &hex!("05 01 00")).await;
        check_hello(
            &[AuthMethod::NO_AUTH, AuthMethod::USERNAME_PASSWORD],
            &hex!("05 02 00 02"),
        )
        .await;
        check_hello(&[AuthMethod::GSSAPI], &hex!("05 01 01")).await;

        // Without any selector at all, we still offer "no auth".
        let s = MockStream::new(&[]);
        let conn = SocksConn::client(s.boxed(), None);
        conn.handshake(false).await.unwrap();
        assert_eq!(s.written(), hex!("05 01 00"));
    }

    #[async_test]
    async fn client_noauth() {
        let (s, _, mut conn) = client_with(&hex!("05 00 6869"), None, &[]);
        assert_eq!(conn.write(b"hello").await.unwrap(), 5);
        assert_eq!(s.written(), hex!("05 01 00 68656c6c6f"));
        assert!(conn.is_handshaked());
        assert_eq!(conn.method(), None);

        let mut buf = [0_u8; 16];
        let n = conn.read(&mut buf[..]).await.unwrap();
        assert_eq!(&buf[..n], b"hi");
        assert_eq!(conn.method(), Some(AuthMethod::NO_AUTH));
        // No credential frames either way.
        assert_eq!(s.written().len(), 3 + 5);
    }

    #[async_test]
    async fn client_read_first() {
        // A read on a fresh client sends the hello, then eats the
        // server's choice before handing out any data.
        let (s, _, mut conn) = client_with(&hex!("05 00 6869"), None, &[]);
        let mut buf = [0_u8; 16];
        let n = conn.read(&mut buf[..]).await.unwrap();
        assert_eq!(&buf[..n], b"hi");
        assert_eq!(s.written(), hex!("05 01 00"));
    }

    #[async_test]
    async fn client_userpass_ok() {
        let (s, sel, mut conn) = client_with(
            &hex!("05 02 01 00 6f6b"),
            Some(Credentials::new("alice", "secret")),
            &[AuthMethod::USERNAME_PASSWORD],
        );
        conn.write(b"x").await.unwrap();
        assert_eq!(
            s.written(),
            hex!("05 01 02  01 05 616c696365 06 736563726574  78")
        );
        assert!(sel.is_authentication_to_read());

        let mut buf = [0_u8; 16];
        let n = conn.read(&mut buf[..]).await.unwrap();
        assert_eq!(&buf[..n], b"ok");
        assert_eq!(conn.method(), Some(AuthMethod::USERNAME_PASSWORD));

        // Nothing more is sent on later writes but the data.
        conn.write(b"y").await.unwrap();
        assert_eq!(s.written().len(), 3 + 14 + 2);
    }

    #[async_test]
    async fn client_userpass_rejected() {
        let (s, _, mut conn) = client_with(
            &hex!("05 02 01 01 6f6b"),
            Some(Credentials::new("alice", "secret")),
            &[AuthMethod::USERNAME_PASSWORD],
        );
        conn.write(b"x").await.unwrap();
        let mut buf = [0_u8; 16];
        let e = conn.read(&mut buf[..]).await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::PermissionDenied);
        assert!(matches!(
            conn.handshake(true).await,
            Err(Error::AuthFailed(1))
        ));
        assert!(!conn.is_handshaked());

        // Sticky: no more I/O happens at all.
        let calls = s.io_calls();
        let written = s.written();
        assert!(conn.write(b"more").await.is_err());
        assert!(conn.read(&mut buf[..]).await.is_err());
        assert!(matches!(
            conn.handshake(false).await,
            Err(Error::AuthFailed(1))
        ));
        assert_eq!(s.io_calls(), calls);
        assert_eq!(s.written(), written);
        assert_eq!(s.unread(), 2);
    }

    #[async_test]
    async fn client_bad_version() {
        let (s, sel, mut conn) = client_with(&hex!("04 00 6869"), None, &[]);
        let mut buf = [0_u8; 16];
        assert!(conn.read(&mut buf[..]).await.is_err());
        assert!(matches!(
            conn.handshake(false).await,
            Err(Error::BadVersion(4))
        ));
        // The authentication flag is raised even though the read failed.
        assert!(sel.is_authentication_to_read());

        let calls = s.io_calls();
        assert!(conn.write(b"x").await.is_err());
        assert_eq!(s.io_calls(), calls);
        assert_eq!(s.written(), hex!("05 01 00"));
    }

    #[async_test]
    async fn client_no_acceptable() {
        let (_, _, mut conn) = client_with(&hex!("05 ff"), None, &[]);
        let mut buf = [0_u8; 4];
        let e = conn.read(&mut buf[..]).await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ConnectionRefused);
        assert!(matches!(
            conn.handshake(true).await,
            Err(Error::MethodRejected)
        ));
        assert_eq!(conn.method(), Some(AuthMethod::NO_ACCEPTABLE));
    }

    #[async_test]
    async fn client_eof() {
        let (_, _, mut conn) = client_with(&hex!("05"), None, &[]);
        let mut buf = [0_u8; 4];
        let e = conn.read(&mut buf[..]).await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::UnexpectedEof);
        assert!(matches!(conn.handshake(false).await, Err(Error::Io(_))));
    }

    #[async_test]
    async fn pending_reply() {
        let (s, _, mut conn) = client_with(&hex!("05 00"), None, &[]);
        conn.write(b"req").await.unwrap();
        conn.expect_reply();
        s.push_input(&hex!("05 00 00 01 7f000001 0438"));
        s.push_input(b"data");

        let mut buf = [0_u8; 16];
        let n = conn.read(&mut buf[..]).await.unwrap();
        assert_eq!(&buf[..n], b"data");

        // A failed reply is reported once, but doesn't poison the
        // connection.
        conn.expect_reply();
        s.push_input(&hex!("05 05 00 01 00000000 0000"));
        s.push_input(b"more");
        let e = conn.handshake(true).await;
        assert!(matches!(
            e,
            Err(Error::RequestFailed(SocksStatus::CONNECTION_REFUSED))
        ));
        let n = conn.read(&mut buf[..]).await.unwrap();
        assert_eq!(&buf[..n], b"more");
        assert!(conn.is_handshaked());
    }

    #[async_test]
    async fn two_replies() {
        // BIND gets two replies; neither one may show up as data.
        let (s, _, mut conn) = client_with(&hex!("05 00"), None, &[]);
        conn.write(b"bind").await.unwrap();
        conn.expect_reply();
        conn.expect_reply();
        s.push_input(&hex!("05 00 00 01 7f000001 0438"));
        s.push_input(&hex!("05 00 00 01 0a000001 d431"));
        s.push_input(b"peer");

        let mut buf = [0_u8; 16];
        let n = conn.read(&mut buf[..]).await.unwrap();
        assert_eq!(&buf[..n], b"peer");
        assert_eq!(s.unread(), 0);
    }

    #[async_test]
    async fn reply_before_handshake() {
        // Announcing a reply before anything was sent queues it behind
        // the method selection.
        let (_, _, mut conn) =
            client_with(&hex!("05 00 05 00 00 01 00000000 0000 21"), None, &[]);
        conn.expect_reply();
        let mut buf = [0_u8; 16];
        let n = conn.read(&mut buf[..]).await.unwrap();
        assert_eq!(&buf[..n], b"!");
    }

    #[async_test]
    async fn server_default() {
        let s = MockStream::new(&hex!("05 02 01 02 6869"));
        let mut conn = SocksConn::server(s.boxed(), None);
        let mut buf = [0_u8; 16];
        let n = conn.read(&mut buf[..]).await.unwrap();
        assert_eq!(&buf[..n], b"hi");
        assert_eq!(s.written(), hex!("05 00"));
        assert_eq!(conn.method(), Some(AuthMethod::NO_AUTH));
        assert_eq!(conn.role(), Role::Server);
    }

    #[async_test]
    async fn server_selector() {
        let mut sel = ServerSelector::new(&[AuthMethod::USERNAME_PASSWORD, AuthMethod::NO_AUTH]);
        sel.add_user("alice", "secret");
        let s = MockStream::new(&hex!("05 02 00 02  01 05 616c696365 06 736563726574"));
        let mut conn = SocksConn::server(s.boxed(), Some(Arc::new(sel)));
        conn.write(b"ok").await.unwrap();
        assert_eq!(s.written(), hex!("05 02  01 00  6f6b"));
        assert_eq!(conn.method(), Some(AuthMethod::USERNAME_PASSWORD));
    }

    #[async_test]
    async fn server_rejects() {
        let sel = ServerSelector::new(&[AuthMethod::USERNAME_PASSWORD]);
        let s = MockStream::new(&hex!("05 01 00 6869"));
        let mut conn = SocksConn::server(s.boxed(), Some(Arc::new(sel)));
        assert!(conn.write(b"x").await.is_err());
        assert_eq!(s.written(), hex!("05 ff"));
        let mut buf = [0_u8; 4];
        assert!(conn.read(&mut buf[..]).await.is_err());
        assert!(matches!(
            conn.handshake(true).await,
            Err(Error::MethodRejected)
        ));
        assert_eq!(s.unread(), 2);
    }

    /// A selector that wraps the stream it's given.
    struct Wrapping(Arc<AtomicUsize>);

    #[async_trait]
    impl Selector for Wrapping {
        fn methods(&self) -> Vec<AuthMethod> {
            vec![AuthMethod::NO_AUTH]
        }
        async fn on_selected(&self, _method: AuthMethod, stream: BoxStream) -> Result<BoxStream> {
            Ok(Box::new(WrappedStream::new(stream, Arc::clone(&self.0))))
        }
        fn is_authentication_to_read(&self) -> bool {
            false
        }
        fn set_authentication_read(&self) {}
    }

    #[async_test]
    async fn replaced_stream() {
        let writes = Arc::new(AtomicUsize::new(0));
        let s = MockStream::new(&hex!("05 00"));
        let mut conn = SocksConn::client(s.boxed(), Some(Arc::new(Wrapping(Arc::clone(&writes)))));
        conn.write(b"a").await.unwrap();
        conn.write(b"b").await.unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 2);
        assert_eq!(s.written(), hex!("05 01 00 61 62"));
    }

    #[async_test]
    async fn concurrent_writes() {
        let (s, _, conn) = client_with(&hex!("05 00"), None, &[]);
        let writers = (0..8).map(|_| {
            let mut conn = conn.clone();
            async move { conn.write_all(b"x").await.map_err(|e| e.kind()) }
        });
        for r in join_all(writers).await {
            assert_eq!(r, Ok(()));
        }
        let written = s.written();
        assert_eq!(&written[..3], &hex!("05 01 00"));
        assert_eq!(&written[3..], b"xxxxxxxx");
    }

    #[async_test]
    async fn concurrent_failure() {
        let s = MockStream::new(&hex!("07 01 00"));
        let conn = SocksConn::server(s.boxed(), None);
        let tasks = (0..4).map(|i| {
            let mut conn = conn.clone();
            async move {
                let mut buf = [0_u8; 4];
                let r = if i % 2 == 0 {
                    conn.write(b"x").await.map(|_| ())
                } else {
                    conn.read(&mut buf).await.map(|_| ())
                };
                r.map_err(|e| e.to_string())
            }
        });
        for r in join_all(tasks).await {
            assert_eq!(r, Err("Unexpected SOCKS protocol version 7".to_string()));
        }
        assert!(s.written().is_empty());
        assert_eq!(s.unread(), 1);
    }

    #[async_test]
    async fn clones_share_handshake() {
        let (s, _, conn) = client_with(&hex!("05 00 6869"), None, &[]);
        let (mut reader, mut writer) = (conn.clone(), conn);
        writer.write_all(b"abc").await.unwrap();
        let mut buf = [0_u8; 2];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert_eq!(s.written(), hex!("05 01 00 616263"));
    }

    #[async_test]
    async fn delegation() {
        let s = MockStream::new(&[]);
        let mut conn = SocksConn::client(s.boxed(), None);
        assert_eq!(conn.local_addr().unwrap().port(), 1080);
        assert_eq!(conn.peer_addr().unwrap().port(), 40000);
        conn.set_timeout(Some(Duration::from_secs(3))).unwrap();
        assert_eq!(s.read_timeout(), Some(Duration::from_secs(3)));
        conn.close().await.unwrap();
        assert!(s.is_closed());
        // None of that counts as using the connection.
        assert!(!conn.is_handshaked());
        assert_eq!(s.io_calls(), 0);
    }

    #[async_test]
    async fn io_traits() {
        let (s, _, conn) = client_with(&hex!("05 00 6869"), None, &[]);
        let (mut r, mut w) = conn.split();
        w.write_all(b"abc").await.unwrap();
        let mut got = String::new();
        r.read_to_string(&mut got).await.unwrap();
        assert_eq!(got, "hi");
        assert_eq!(s.written(), hex!("05 01 00 616263"));
    }
}
