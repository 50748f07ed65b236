//! WebSocket sessions: one upgraded client connection paired with one
//! upstream connection, relayed by two pumps until either side goes away.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use hyper::{HeaderMap, Method, Request, Response, StatusCode, header};
use hyper_util::rt::TokioIo;
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
    time::timeout,
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        Error as TungsteniteError, Message, Utf8Bytes,
        error::ProtocolError,
        handshake::derive_accept_key,
        protocol::{CloseFrame, Role, frame::coding::CloseCode},
    },
};
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::dialer;
use crate::error::GateError;
use crate::response::{ResponseBody, empty_body};

/// How long a pump keeps trying to deliver its close frame once the session
/// is over. A peer that stopped reading would otherwise hold the pump open.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// True when any `Upgrade` header carries the `websocket` token, compared
/// case-insensitively.
#[must_use]
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
}

/// Validates the client half of the opening handshake and returns the
/// `Sec-WebSocket-Accept` value to answer with.
pub fn handshake_accept_key<B>(req: &Request<B>) -> Result<String, GateError> {
    if req.method() != Method::GET {
        return Err(GateError::BadUpgrade("upgrade requires GET"));
    }

    let version = req
        .headers()
        .get(header::SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok());
    if version.map(str::trim) != Some("13") {
        return Err(GateError::BadUpgrade("unsupported Sec-WebSocket-Version"));
    }

    let key = req
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(GateError::BadUpgrade("missing Sec-WebSocket-Key"))?;

    Ok(derive_accept_key(key.as_bytes()))
}

/// Answers an authorized upgrade request.
///
/// The upstream is dialed before the `101` goes out so a dead upstream still
/// gets a proper `500`. The relay itself runs on a spawned task once hyper
/// hands over the upgraded connection.
pub async fn accept<B>(
    mut req: Request<B>,
    upstream_url: &str,
    dial_timeout: Duration,
    handshake_timeout: Duration,
    client_ip: String,
) -> Result<Response<ResponseBody>, GateError> {
    let accept_key = handshake_accept_key(&req)?;
    let upstream = dialer::dial(upstream_url, dial_timeout).await?;
    let on_upgrade = hyper::upgrade::on(&mut req);

    let span = info_span!("session", client_ip = %client_ip, upstream = %upstream_url);
    tokio::spawn(
        async move {
            let upgraded = match timeout(handshake_timeout, on_upgrade).await {
                Ok(Ok(upgraded)) => upgraded,
                Ok(Err(e)) => {
                    let err = GateError::Upgrade(e.to_string());
                    warn!(error = %err, "Abandoning session");
                    return;
                }
                Err(_) => {
                    let err = GateError::Upgrade(format!(
                        "handshake not completed within {}s",
                        handshake_timeout.as_secs()
                    ));
                    warn!(error = %err, "Abandoning session");
                    return;
                }
            };

            let client =
                WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
            Session::new(client, upstream).run().await;
        }
        .instrument(span),
    );

    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(header::UPGRADE, header::HeaderValue::from_static("websocket"));
    headers.insert(header::CONNECTION, header::HeaderValue::from_static("Upgrade"));
    headers.insert(
        header::SEC_WEBSOCKET_ACCEPT,
        header::HeaderValue::from_str(&accept_key)
            .map_err(|_| GateError::BadUpgrade("unencodable accept key"))?,
    );
    Ok(response)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    UpstreamToClient,
    ClientToUpstream,
}

/// Why a pump stopped.
#[derive(Debug)]
pub enum PumpExit {
    /// The source sent a close frame or hung up.
    SourceClosed,
    /// The sibling pump tore the session down first.
    Sibling,
    Failed(GateError),
    /// The pump task panicked or was cancelled.
    Aborted,
}

impl PumpExit {
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Aborted)
    }
}

#[derive(Debug)]
pub struct SessionReport {
    pub client_to_upstream: PumpExit,
    pub upstream_to_client: PumpExit,
}

/// Idempotent shutdown signal shared by both pumps of a session.
#[derive(Debug)]
pub struct Teardown {
    closed: watch::Sender<bool>,
}

impl Teardown {
    #[must_use]
    pub fn new() -> Self {
        Self {
            closed: watch::Sender::new(false),
        }
    }

    /// Marks the session closed. Returns `true` only for the first caller.
    pub fn trigger(&self) -> bool {
        self.closed
            .send_if_modified(|closed| !std::mem::replace(closed, true))
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.closed.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

impl Default for Teardown {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns both legs of a relayed connection until [`Session::run`] splits them
/// between the two pumps.
pub struct Session<C, U> {
    client: WebSocketStream<C>,
    upstream: WebSocketStream<U>,
    teardown: Arc<Teardown>,
}

impl<C, U> Session<C, U>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(client: WebSocketStream<C>, upstream: WebSocketStream<U>) -> Self {
        Self {
            client,
            upstream,
            teardown: Arc::new(Teardown::new()),
        }
    }

    #[must_use]
    pub fn teardown(&self) -> Arc<Teardown> {
        Arc::clone(&self.teardown)
    }

    /// Relays until either leg closes or fails. Both connections are closed
    /// and both pumps have finished when this returns.
    pub async fn run(self) -> SessionReport {
        let (client_tx, client_rx) = self.client.split();
        let (upstream_tx, upstream_rx) = self.upstream.split();

        info!("Session relaying");

        let downstream = tokio::spawn(
            pump(
                upstream_rx,
                client_tx,
                Direction::UpstreamToClient,
                Arc::clone(&self.teardown),
            )
            .in_current_span(),
        );

        let client_to_upstream = pump(
            client_rx,
            upstream_tx,
            Direction::ClientToUpstream,
            Arc::clone(&self.teardown),
        )
        .await;

        let upstream_to_client = downstream.await.unwrap_or_else(|e| {
            error!(error = %e, "Upstream pump task did not finish cleanly");
            PumpExit::Aborted
        });

        let report = SessionReport {
            client_to_upstream,
            upstream_to_client,
        };
        if report.client_to_upstream.is_failure() || report.upstream_to_client.is_failure() {
            warn!(?report, "Session closed with errors");
        } else {
            info!(?report, "Session closed");
        }
        report
    }
}

/// Moves messages from `source` to `sink` one at a time until the source
/// ends, an I/O error occurs, or the sibling pump tears the session down.
async fn pump<R, W>(
    mut source: R,
    mut sink: W,
    direction: Direction,
    teardown: Arc<Teardown>,
) -> PumpExit
where
    R: Stream<Item = Result<Message, TungsteniteError>> + Unpin,
    W: Sink<Message, Error = TungsteniteError> + Unpin,
{
    let mut closed = teardown.subscribe();

    let exit = loop {
        let next = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => break PumpExit::Sibling,
            next = source.next() => next,
        };

        let message = match next {
            None => break PumpExit::SourceClosed,
            Some(Ok(Message::Close(frame))) => {
                debug!(?direction, ?frame, "Close frame received");
                break PumpExit::SourceClosed;
            }
            Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => message,
            // Control frames are answered by each hop's WebSocket layer.
            Some(Ok(_)) => continue,
            Some(Err(
                e @ (TungsteniteError::ConnectionClosed
                | TungsteniteError::Protocol(ProtocolError::ResetWithoutClosingHandshake)),
            )) => {
                debug!(?direction, "Peer disconnected: {e}");
                break PumpExit::SourceClosed;
            }
            Some(Err(e)) => {
                error!(?direction, error = %e, "Read failed");
                break PumpExit::Failed(GateError::Relay(e));
            }
        };

        let bytes = message.len();
        let sent = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => break PumpExit::Sibling,
            sent = sink.send(message) => sent,
        };
        if let Err(e) = sent {
            error!(?direction, error = %e, bytes, "Write failed");
            break PumpExit::Failed(GateError::Relay(e));
        }
        trace!(?direction, bytes, "Message relayed");
    };

    if teardown.trigger() {
        debug!(?direction, ?exit, "Tearing down session");
    }
    close_sink(&mut sink, direction).await;
    exit
}

/// Best-effort close of the leg this pump writes to, abandoned after
/// [`CLOSE_TIMEOUT`]. The client is always told the session ended
/// abnormally; the upstream gets a normal close.
async fn close_sink<W>(sink: &mut W, direction: Direction)
where
    W: Sink<Message, Error = TungsteniteError> + Unpin,
{
    let closing = async {
        if direction == Direction::UpstreamToClient {
            let frame = CloseFrame {
                code: CloseCode::Error,
                reason: Utf8Bytes::from_static(""),
            };
            if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                trace!(error = %e, "Client close frame not sent");
            }
        }
        if let Err(e) = sink.close().await {
            trace!(?direction, error = %e, "Sink close failed");
        }
    };
    if timeout(CLOSE_TIMEOUT, closing).await.is_err() {
        debug!(?direction, "Peer not reading, dropping leg without close handshake");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, duplex};

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);
    const PIPE_CAPACITY: usize = 64 * 1024;

    type Peer = WebSocketStream<DuplexStream>;

    fn text(s: &str) -> Message {
        Message::text(s.to_string())
    }

    struct Harness {
        /// The remote client, as seen from its own side.
        client: Peer,
        /// The upstream node, as seen from its own side.
        upstream: Peer,
        session: tokio::task::JoinHandle<SessionReport>,
        teardown: Arc<Teardown>,
    }

    async fn start_session() -> Harness {
        start_session_with_client_pipe(PIPE_CAPACITY).await
    }

    async fn start_session_with_client_pipe(capacity: usize) -> Harness {
        let (client_remote, client_local) = duplex(capacity);
        let (upstream_remote, upstream_local) = duplex(PIPE_CAPACITY);

        let client = WebSocketStream::from_raw_socket(client_remote, Role::Client, None).await;
        let upstream = WebSocketStream::from_raw_socket(upstream_remote, Role::Server, None).await;

        let session = Session::new(
            WebSocketStream::from_raw_socket(client_local, Role::Server, None).await,
            WebSocketStream::from_raw_socket(upstream_local, Role::Client, None).await,
        );
        let teardown = session.teardown();

        Harness {
            client,
            upstream,
            session: tokio::spawn(session.run()),
            teardown,
        }
    }

    async fn recv(peer: &mut Peer) -> Message {
        timeout(TEST_TIMEOUT, peer.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .expect("websocket error")
    }

    /// Drains `peer` until it reports a close frame or ends.
    async fn recv_close(peer: &mut Peer) -> Option<CloseFrame> {
        timeout(TEST_TIMEOUT, async {
            loop {
                match peer.next().await {
                    Some(Ok(Message::Close(frame))) => return frame,
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => return None,
                }
            }
        })
        .await
        .expect("timed out waiting for close")
    }

    async fn finished(session: tokio::task::JoinHandle<SessionReport>) -> SessionReport {
        timeout(TEST_TIMEOUT, session)
            .await
            .expect("session did not shut down")
            .expect("session task panicked")
    }

    mod detection {
        use super::*;

        fn headers(upgrade: &'static str) -> HeaderMap {
            let mut headers = HeaderMap::new();
            headers.insert(header::UPGRADE, header::HeaderValue::from_static(upgrade));
            headers
        }

        #[test]
        fn matches_websocket_token_in_any_case() {
            assert!(is_websocket_upgrade(&headers("websocket")));
            assert!(is_websocket_upgrade(&headers("WebSocket")));
            assert!(is_websocket_upgrade(&headers("h2c, websocket")));
        }

        #[test]
        fn ignores_other_protocols() {
            assert!(!is_websocket_upgrade(&HeaderMap::new()));
            assert!(!is_websocket_upgrade(&headers("h2c")));
            assert!(!is_websocket_upgrade(&headers("websockets")));
        }
    }

    mod handshake {
        use super::*;

        fn upgrade_request() -> hyper::http::request::Builder {
            Request::builder()
                .method(Method::GET)
                .uri("/geth?auth=abc123")
                .header(header::UPGRADE, "websocket")
                .header(header::CONNECTION, "Upgrade")
        }

        #[test]
        fn derives_rfc_accept_key() {
            let req = upgrade_request()
                .header(header::SEC_WEBSOCKET_VERSION, "13")
                .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
                .body(())
                .unwrap();
            assert_eq!(
                handshake_accept_key(&req).unwrap(),
                "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
            );
        }

        #[test]
        fn requires_key_and_version() {
            let no_key = upgrade_request()
                .header(header::SEC_WEBSOCKET_VERSION, "13")
                .body(())
                .unwrap();
            assert!(matches!(handshake_accept_key(&no_key), Err(GateError::BadUpgrade(_))));

            let old_version = upgrade_request()
                .header(header::SEC_WEBSOCKET_VERSION, "8")
                .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
                .body(())
                .unwrap();
            assert!(matches!(handshake_accept_key(&old_version), Err(GateError::BadUpgrade(_))));
        }

        #[test]
        fn requires_get() {
            let post = upgrade_request()
                .method(Method::POST)
                .header(header::SEC_WEBSOCKET_VERSION, "13")
                .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
                .body(())
                .unwrap();
            assert!(matches!(handshake_accept_key(&post), Err(GateError::BadUpgrade(_))));
        }
    }

    mod teardown {
        use super::*;

        #[test]
        fn triggers_once() {
            let teardown = Teardown::new();
            assert!(!teardown.is_triggered());
            assert!(teardown.trigger());
            assert!(!teardown.trigger());
            assert!(teardown.is_triggered());
        }
    }

    mod relaying {
        use super::*;

        #[tokio::test]
        async fn client_messages_reach_upstream_in_order() {
            let mut h = start_session().await;

            h.client.send(text("first")).await.unwrap();
            h.client.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
            h.client.send(text("third")).await.unwrap();

            assert_eq!(recv(&mut h.upstream).await, text("first"));
            assert_eq!(recv(&mut h.upstream).await, Message::binary(vec![1u8, 2, 3]));
            assert_eq!(recv(&mut h.upstream).await, text("third"));
        }

        #[tokio::test]
        async fn upstream_messages_reach_client_in_order() {
            let mut h = start_session().await;

            h.upstream.send(Message::binary(vec![0xABu8; 4096])).await.unwrap();
            h.upstream.send(text(r#"{"jsonrpc":"2.0"}"#)).await.unwrap();

            assert_eq!(recv(&mut h.client).await, Message::binary(vec![0xABu8; 4096]));
            assert_eq!(recv(&mut h.client).await, text(r#"{"jsonrpc":"2.0"}"#));
        }

        #[tokio::test]
        async fn request_response_round_trip() {
            let mut h = start_session().await;

            h.client.send(text(r#"{"id":1}"#)).await.unwrap();
            assert_eq!(recv(&mut h.upstream).await, text(r#"{"id":1}"#));

            h.upstream
                .send(text(r#"{"id":1,"result":"ok"}"#))
                .await
                .unwrap();
            assert_eq!(recv(&mut h.client).await, text(r#"{"id":1,"result":"ok"}"#));
        }
    }

    mod shutdown {
        use super::*;

        #[tokio::test]
        async fn upstream_close_closes_client_with_internal_error() {
            let mut h = start_session().await;

            h.upstream.close(None).await.unwrap();

            let frame = recv_close(&mut h.client).await.expect("close frame");
            assert_eq!(frame.code, CloseCode::Error);

            let report = finished(h.session).await;
            assert!(matches!(report.upstream_to_client, PumpExit::SourceClosed));
            assert!(matches!(report.client_to_upstream, PumpExit::Sibling));
            assert!(h.teardown.is_triggered());
        }

        #[tokio::test]
        async fn upstream_drop_closes_client() {
            let mut h = start_session().await;

            drop(h.upstream);

            assert!(recv_close(&mut h.client).await.is_some());
            finished(h.session).await;
        }

        #[tokio::test]
        async fn client_close_closes_upstream() {
            let mut h = start_session().await;

            h.client.close(None).await.unwrap();

            recv_close(&mut h.upstream).await;
            let report = finished(h.session).await;
            assert!(matches!(report.client_to_upstream, PumpExit::SourceClosed));
            assert!(matches!(report.upstream_to_client, PumpExit::Sibling));
        }

        #[tokio::test]
        async fn client_drop_closes_upstream() {
            let mut h = start_session().await;

            drop(h.client);

            recv_close(&mut h.upstream).await;
            finished(h.session).await;
        }

        #[tokio::test]
        async fn stalled_client_does_not_hold_session_open() {
            let mut h = start_session_with_client_pipe(1024).await;

            for _ in 0..8 {
                h.upstream.send(Message::binary(vec![7u8; 4096])).await.unwrap();
            }
            // The client never reads, so the pipe towards it stays full.
            h.client.close(None).await.unwrap();

            recv_close(&mut h.upstream).await;
            let report = timeout(CLOSE_TIMEOUT * 3, h.session)
                .await
                .expect("session stuck behind a stalled client")
                .expect("session task panicked");
            assert!(matches!(report.client_to_upstream, PumpExit::SourceClosed));
            assert!(matches!(report.upstream_to_client, PumpExit::Sibling));
        }

        #[tokio::test]
        async fn external_teardown_stops_both_pumps() {
            let mut h = start_session().await;

            assert!(h.teardown.trigger());

            let frame = recv_close(&mut h.client).await.expect("close frame");
            assert_eq!(frame.code, CloseCode::Error);
            recv_close(&mut h.upstream).await;

            let report = finished(h.session).await;
            assert!(matches!(report.client_to_upstream, PumpExit::Sibling));
            assert!(matches!(report.upstream_to_client, PumpExit::Sibling));
        }
    }
}
