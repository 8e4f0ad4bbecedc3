//! Testing stubs for the negotiation code.  Only enabled with
//! `cfg(test)`.

#![allow(missing_docs)]
#![allow(clippy::missing_docs_in_private_items)]
#![allow(clippy::exhaustive_structs)]

use crate::stream::{BoxStream, Stream};

use futures::io::{AsyncRead, AsyncWrite};
use std::collections::VecDeque;
use std::io::Result as IoResult;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

#[derive(Debug, Default)]
struct MockState {
    input: VecDeque<u8>,
    output: Vec<u8>,
    reads: usize,
    writes: usize,
    closed: bool,
    read_timeout: Option<Duration>,
}

/// An in-memory stream with a scripted input and a recorded output.
///
/// Every poll is ready at once.  Reading past the end of the script
/// gives EOF.  Clones share their state, so a test can keep one and
/// hand another to a connection.
#[derive(Clone, Debug, Default)]
pub struct MockStream {
    state: Arc<Mutex<MockState>>,
}

impl MockStream {
    pub fn new(input: &[u8]) -> Self {
        let s = MockStream::default();
        s.push_input(input);
        s
    }
    pub fn boxed(&self) -> BoxStream {
        Box::new(self.clone())
    }
    pub fn push_input(&self, more: &[u8]) {
        self.state.lock().unwrap().input.extend(more.iter().copied());
    }
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().output.clone()
    }
    pub fn unread(&self) -> usize {
        self.state.lock().unwrap().input.len()
    }
    /// Total number of read and write calls made on this stream.
    pub fn io_calls(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.reads + st.writes
    }
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
    pub fn read_timeout(&self) -> Option<Duration> {
        self.state.lock().unwrap().read_timeout
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        let mut st = self.state.lock().unwrap();
        st.reads += 1;
        let n = std::cmp::min(buf.len(), st.input.len());
        for (dst, src) in buf.iter_mut().zip(st.input.drain(..n)) {
            *dst = src;
        }
        Poll::Ready(Ok(n))
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<IoResult<usize>> {
        let mut st = self.state.lock().unwrap();
        st.writes += 1;
        st.output.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        Poll::Ready(Ok(()))
    }
    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        self.state.lock().unwrap().closed = true;
        Poll::Ready(Ok(()))
    }
}

impl Stream for MockStream {
    fn local_addr(&self) -> IoResult<SocketAddr> {
        Ok("127.0.0.1:1080".parse().unwrap())
    }
    fn peer_addr(&self) -> IoResult<SocketAddr> {
        Ok("127.0.0.1:40000".parse().unwrap())
    }
    fn set_read_timeout(&self, dur: Option<Duration>) -> IoResult<()> {
        self.state.lock().unwrap().read_timeout = dur;
        Ok(())
    }
    fn set_write_timeout(&self, _dur: Option<Duration>) -> IoResult<()> {
        Ok(())
    }
}

/// A stream that wraps another and counts the writes made through it,
/// to check that a replacement stream returned by a selector is the
/// one that gets used.
pub struct WrappedStream {
    inner: BoxStream,
    writes: Arc<AtomicUsize>,
}

impl WrappedStream {
    pub fn new(inner: BoxStream, writes: Arc<AtomicUsize>) -> Self {
        WrappedStream { inner, writes }
    }
}

impl AsyncRead for WrappedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for WrappedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<IoResult<usize>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }
    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        Pin::new(&mut self.inner).poll_close(cx)
    }
}

impl Stream for WrappedStream {
    fn local_addr(&self) -> IoResult<SocketAddr> {
        self.inner.local_addr()
    }
    fn peer_addr(&self) -> IoResult<SocketAddr> {
        self.inner.peer_addr()
    }
}
