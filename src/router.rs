use anyhow::{Context, Result};
use bytes::Bytes;
use hyper::{Request, Response, StatusCode, body::Body};
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use tracing::{error, info, warn};

use crate::auth::authorize;
use crate::config::Config;
use crate::error::GateError;
use crate::http_relay;
use crate::keys::KeyStore;
use crate::response::{ResponseBody, error_response, text_response};
use crate::security::{Admission, TrustedProxies, client_ip};
use crate::session;

/// Everything a request handler needs, built once at startup and shared by
/// reference with every connection.
pub struct GateState {
    pub config: Config,
    pub keys: KeyStore,
    pub http: reqwest::Client,
    pub admission: Admission,
    pub trusted_proxies: TrustedProxies,
}

impl GateState {
    pub fn from_config(config: Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build upstream HTTP client")?;
        let admission = Admission::from_config(config.listen.allowed_ips.as_deref())?;
        let trusted_proxies =
            TrustedProxies::from_config(config.listen.trusted_proxies.as_deref())?;
        let keys = KeyStore::new(&config.keys.file);

        Ok(Self {
            config,
            keys,
            http,
            admission,
            trusted_proxies,
        })
    }
}

/// hyper service entry point. Every failure becomes an HTTP response here so
/// nothing escapes the request that caused it.
pub async fn handle_request<B>(
    req: Request<B>,
    state: Arc<GateState>,
    peer: SocketAddr,
) -> Result<Response<ResponseBody>, Infallible>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let client_ip = client_ip(req.headers(), peer, &state.trusted_proxies);
    let method = req.method().clone();

    match route(req, &state, client_ip.clone()).await {
        Ok(response) => Ok(response),
        Err(err) => {
            match &err {
                GateError::MissingCredential
                | GateError::InvalidCredential
                | GateError::BadUpgrade(_)
                | GateError::RequestBody(_) => {
                    warn!(
                        client_ip = %client_ip,
                        method = %method,
                        error = %err,
                        "Request rejected"
                    );
                }
                _ => {
                    error!(
                        client_ip = %client_ip,
                        method = %method,
                        error = %err,
                        "Request failed"
                    );
                }
            }
            Ok(error_response(&err))
        }
    }
}

/// Authorizes the request, then dispatches on the `Upgrade` header.
pub async fn route<B>(
    req: Request<B>,
    state: &GateState,
    client_ip: String,
) -> Result<Response<ResponseBody>, GateError>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.uri().path() != state.config.listen.path {
        return Ok(text_response(StatusCode::NOT_FOUND, "404 Not Found"));
    }

    let key = authorize(req.uri(), &state.keys).await?;

    if session::is_websocket_upgrade(req.headers()) {
        info!(client_ip = %client_ip, key = %key, "WebSocket client connected");
        session::accept(
            req,
            &state.config.upstream.ws,
            state.config.upstream.dial_timeout(),
            state.config.listen.handshake_timeout(),
            client_ip,
        )
        .await
    } else {
        info!(client_ip = %client_ip, key = %key, method = %req.method(), "Relaying HTTP request");
        http_relay::forward(
            &state.http,
            &state.config.upstream.http,
            state.config.upstream.request_timeout(),
            req,
        )
        .await
    }
}
