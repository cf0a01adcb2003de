//! CONNECT tunnels.
//!
//! The proxy opens a TCP connection to `host:port`, answers
//! `200 Connection Established` and splices bytes both ways until either
//! side closes. TLS is passed through untouched, and established tunnels
//! have no idle timeout.
//!
//! Connect failures get `502` (refused, DNS) or `504` (timeout) with an
//! `X-Error` hint naming the error code. A client that hangs up while the
//! upstream is still dialing cancels the dial.

use crate::audit::{self, ProxyMode};
use crate::error::{NetErrorCode, ProxyError, Result};
use crate::handler::{send_status, unless_client_closed};
use crate::server::ProxyState;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Open and relay a tunnel for an allowed CONNECT request
pub(crate) async fn tunnel<S>(client: &mut S, host: &str, port: u16, state: &ProxyState) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut early = BytesMut::new();
    let dial = state
        .connector
        .connect(host, port, state.config.connect_timeout());
    let Some(dialed) = unless_client_closed(&mut *client, &mut early, dial).await else {
        debug!(host, port, "Client closed while the tunnel was dialing");
        return Err(ProxyError::ClientClosed);
    };

    let mut upstream = match dialed {
        Ok(stream) => stream,
        Err(e) => {
            let code = e.net_code();
            let status = code.map_or(502, NetErrorCode::gateway_status);
            let hint = code.map_or("EPROXY", NetErrorCode::as_str);
            audit::log_gateway_error(ProxyMode::Tunnel, host, port, status, hint);
            // The client may have given up already
            let _ = send_status(client, status, Some(hint)).await;
            return Err(e);
        }
    };

    send_status(client, 200, None).await?;
    if !early.is_empty() {
        upstream.write_all(&early).await?;
    }

    match tokio::io::copy_bidirectional(client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            debug!(host, port, to_upstream, to_client, "Tunnel closed");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
