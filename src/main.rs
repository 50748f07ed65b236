use anyhow::{Context, Result};
use rpc_gate::{DEFAULT_CONFIG_FILE, GateState, load_config_from, serve};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_file = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
    let config = load_config_from(&config_file)?;
    info!(
        config_file = %config_file,
        listen_ip = %config.listen.ip,
        listen_port = config.listen.port,
        upstream_http = %config.upstream.http,
        upstream_ws = %config.upstream.ws,
        keys_file = %config.keys.file,
        "Configuration loaded"
    );

    let addr = config.listen.addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address {addr}"))?;

    info!(
        ws_rpc = %format!("ws://{addr}{}?auth=API_KEY", config.listen.path),
        http_rpc = %format!("http://{addr}{}?auth=API_KEY", config.listen.path),
        "Accepting clients"
    );

    let state = Arc::new(GateState::from_config(config)?);
    serve(listener, state).await
}
