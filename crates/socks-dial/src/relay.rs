//! Copy data between stdin/stdout and a negotiated SOCKS connection.

use socks_negotiate::SocksConn;

use anyhow::{Context, Result};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Result as IoResult};
use tracing::{debug, info};

/// Relay stdin to `conn` and `conn` to stdout until both sides are done.
pub(crate) async fn splice(conn: SocksConn) -> Result<()> {
    let (conn_r, conn_w) = conn.split();
    let (upstream, downstream) = futures::join!(
        copy_interactive(async_std::io::stdin(), conn_w),
        copy_interactive(conn_r, async_std::io::stdout()),
    );
    let upstream = upstream.context("relaying stdin")?;
    debug!("stdin closed after {} bytes", upstream);
    let downstream = downstream.context("relaying to stdout")?;
    info!("Done: sent {} bytes, received {}", upstream, downstream);
    Ok(())
}

/// Copy all the data from `reader` into `writer` until we encounter an EOF
/// or an error, and return the number of bytes copied.
///
/// Unlike `futures::io::copy()`, this flushes `writer` whenever `reader`
/// has nothing ready, so that interactive data isn't held back.
async fn copy_interactive<R, W>(mut reader: R, mut writer: W) -> IoResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    use futures::{poll, task::Poll};

    let mut buf = [0_u8; 1024];
    let mut total = 0_u64;

    let loop_result: IoResult<()> = loop {
        let mut read_future = reader.read(&mut buf[..]);
        let n = match poll!(&mut read_future) {
            Poll::Ready(r) => r,
            Poll::Pending => {
                writer.flush().await?;
                read_future.await
            }
        };
        match n {
            Err(e) => break Err(e),
            Ok(0) => break Ok(()),
            Ok(n) => {
                writer.write_all(&buf[..n]).await?;
                total += n as u64;
            }
        }
    };

    // Only close the writer if the reader finished cleanly.
    let flush_result = if loop_result.is_ok() {
        writer.close().await
    } else {
        writer.flush().await
    };

    loop_result.and(flush_result).map(|()| total)
}
