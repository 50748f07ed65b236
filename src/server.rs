use anyhow::{Context, Result};
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::router::{GateState, handle_request};

/// Accepts connections forever, one task per connection. Per-connection
/// failures are logged and never stop the loop.
pub async fn serve(listener: TcpListener, state: Arc<GateState>) -> Result<()> {
    let local_addr = listener
        .local_addr()
        .context("Failed to read listener address")?;
    info!(
        listen_addr = %local_addr,
        path = %state.config.listen.path,
        "RPC gate listening"
    );

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        if !state.admission.is_allowed(addr.ip()) {
            warn!(client_addr = %addr, "Connection from disallowed address dropped");
            continue;
        }

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, state).await {
                debug!(client_addr = %addr, error = %e, "Connection ended with error");
            }
        });
    }
}

/// Serves HTTP/1.1 on one connection, with upgrades enabled so WebSocket
/// sessions can take over the socket.
#[tracing::instrument(skip(stream, state))]
pub async fn handle_connection(
    stream: TcpStream,
    client_addr: SocketAddr,
    state: Arc<GateState>,
) -> Result<()> {
    let service = service_fn(move |req| handle_request(req, Arc::clone(&state), client_addr));
    http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
        .context("Failed to serve HTTP connection")
}
