use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::{HeaderMap, Request, Response, body::Body, body::Frame, header};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::GateError;
use crate::response::ResponseBody;

/// Headers that only describe a single transport hop.
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Removes the hop-by-hop set plus anything the `Connection` header nominates.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let nominated: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
    for name in nominated {
        headers.remove(name.as_str());
    }
}

/// Replays `req`'s method, end-to-end headers and body against the fixed
/// upstream URL and streams the upstream response back.
///
/// The inbound path and query (including `auth`) are not forwarded.
/// `header_timeout` bounds the wait for the upstream status line and headers;
/// the body streams for as long as the upstream keeps sending.
pub async fn forward<B>(
    client: &reqwest::Client,
    upstream: &str,
    header_timeout: Duration,
    req: Request<B>,
) -> Result<Response<ResponseBody>, GateError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| GateError::RequestBody(e.into()))?
        .to_bytes();

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    debug!(
        method = %parts.method,
        upstream = %upstream,
        bytes = body.len(),
        "Forwarding HTTP request"
    );

    let sent = client
        .request(parts.method, upstream)
        .headers(headers)
        .body(body)
        .send();
    let upstream_response = timeout(header_timeout, sent)
        .await
        .map_err(|_| GateError::UpstreamTimeout(header_timeout))?
        .inspect_err(|e| warn!(upstream = %upstream, error = %e, "Upstream HTTP request failed"))?;

    let status = upstream_response.status();
    let mut response_headers = upstream_response.headers().clone();
    strip_hop_by_hop(&mut response_headers);

    debug!(status = %status, "Relaying upstream response");

    let stream = upstream_response
        .bytes_stream()
        .map_ok(Frame::data)
        .map_err(std::io::Error::other);
    let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}
