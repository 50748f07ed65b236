use std::{io, time::Duration};
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Error as TungsteniteError,
};
use tracing::debug;

use crate::error::GateError;

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens a WebSocket connection to the upstream node. `wss://` URLs are
/// verified against the platform's native root certificates.
///
/// `limit` covers the TCP connect and the opening handshake together.
pub async fn dial(url: &str, limit: Duration) -> Result<UpstreamSocket, GateError> {
    debug!(upstream = %url, "Dialing upstream WebSocket");
    let dialed = timeout(limit, connect_async(url)).await.unwrap_or_else(|_| {
        Err(TungsteniteError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no handshake response within {}s", limit.as_secs()),
        )))
    });
    let (socket, response) = dialed.map_err(|source| GateError::UpstreamDial {
        url: url.to_string(),
        source,
    })?;
    debug!(upstream = %url, status = %response.status(), "Upstream WebSocket connected");
    Ok(socket)
}
