//! Client-side end of an intercepted server.
//!
//! The rewritten config launches `tripwire bridge`, which pipes the agent's
//! stdio to the proxy's TCP endpoint. The proxy spawns the real server per
//! connection. If the proxy is not running the bridge fails instead of
//! starting the server unguarded.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{CoreError, Result};

/// Bridges process stdio to `endpoint` until either side closes.
pub async fn run_bridge(endpoint: SocketAddr, server: &str) -> Result<()> {
    let stream = TcpStream::connect(endpoint).await.map_err(|e| {
        CoreError::connect(
            server,
            format!("interception endpoint {endpoint} is not listening ({e}); is `tripwire proxy` running?"),
        )
    })?;
    info!(server, %endpoint, "bridge connected");
    bridge(tokio::io::stdin(), tokio::io::stdout(), stream).await
}

/// Copies `input` to `stream` and `stream` to `output`.
///
/// Returns when the proxy side closes, or when `input` ends and the proxy
/// has finished answering.
pub async fn bridge<I, O>(mut input: I, mut output: O, stream: TcpStream) -> Result<()>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let (mut from_proxy, mut to_proxy) = stream.into_split();

    let upstream = async {
        let sent = tokio::io::copy(&mut input, &mut to_proxy).await?;
        to_proxy.shutdown().await?;
        Ok::<_, std::io::Error>(sent)
    };
    let downstream = async {
        let received = tokio::io::copy(&mut from_proxy, &mut output).await?;
        output.flush().await?;
        Ok::<_, std::io::Error>(received)
    };
    tokio::pin!(downstream);

    tokio::select! {
        received = &mut downstream => {
            debug!(bytes = received?, "proxy closed");
            return Ok(());
        }
        sent = upstream => {
            debug!(bytes = sent?, "input closed");
        }
    }
    let received = downstream.await?;
    debug!(bytes = received, "proxy closed");
    Ok(())
}
