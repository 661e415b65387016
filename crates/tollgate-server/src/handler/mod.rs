//! Per-connection request pipeline.
//!
//! A client connection moves through `reading → authenticating →
//! (tunneling | forwarding | closing)`. Tunneling is terminal; forwarding
//! returns to reading while both sides keep the connection alive.

mod auth;
mod forward;
mod tunnel;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tollgate_auth::AuthorizedUser;
use tollgate_egress::EgressError;
use tollgate_metrics::{
    REJECT_UNAUTHORIZED, record_connect_request, record_connection_rejected,
    record_forward_request, record_upstream_connect_failure,
};
use tracing::{debug, trace};

use crate::codec::read_head;
use crate::error::ServerError;
use crate::http::{PROXY_AUTHORIZATION, RequestHead};
use crate::state::ServerState;
use crate::traffic::TrafficReporter;

pub(crate) const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub(crate) const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Identity of an authenticated connection.
struct Session {
    user: AuthorizedUser,
    /// Raw `Proxy-Authorization` value that produced `user`.
    credential: Vec<u8>,
    traffic: TrafficReporter,
}

/// Serve one client connection until it closes, tunnels, or fails.
pub async fn handle_conn<S>(
    mut stream: S,
    state: Arc<ServerState>,
    peer: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut buf = state.buffers.acquire();
    let mut session: Option<Session> = None;

    loop {
        let Some(mut head) =
            next_request(&mut stream, &mut buf, &state, &shutdown, session.is_some()).await?
        else {
            return Ok(());
        };
        debug!(peer = %peer, method = %head.method, target = %head.target, "request");

        let credential = head.take_header(PROXY_AUTHORIZATION);
        let current = match session.take() {
            Some(s) if credential.as_ref().is_none_or(|c| *c == s.credential) => s,
            previous => {
                drop(previous);
                let Some(credential) = credential else {
                    debug!(peer = %peer, "no credentials, challenging");
                    record_connection_rejected(REJECT_UNAUTHORIZED);
                    auth::challenge(&mut stream, &mut buf, &head, &state).await;
                    return Ok(());
                };
                let Some(user) =
                    auth::authorize(&mut stream, &mut buf, &head, &credential, &state, peer)
                        .await?
                else {
                    return Ok(());
                };
                let traffic = state.traffic.reporter(user.user_id.get());
                Session {
                    user,
                    credential,
                    traffic,
                }
            }
        };

        if head.is_connect() {
            record_connect_request();
            let early = buf.split().freeze();
            return tunnel::handle_connect(stream, early, &head, &current, &state, peer).await;
        }

        record_forward_request();
        let keep_alive =
            forward::handle_forward(&mut stream, &mut buf, head, &current, &state, peer).await?;
        if !keep_alive {
            return Ok(());
        }
        session = Some(current);
    }
}

/// Read the next request head.
///
/// Between keep-alive requests the wait also ends on shutdown. A client that
/// goes quiet before starting a request is closed without error.
async fn next_request<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    state: &ServerState,
    shutdown: &CancellationToken,
    idle: bool,
) -> Result<Option<RequestHead>, ServerError>
where
    S: AsyncRead + Unpin,
{
    let between_requests = idle && buf.is_empty();
    let read = tokio::time::timeout(
        state.request_timeout,
        read_head::<RequestHead, _>(stream, buf, state.max_header_bytes),
    );

    let outcome = if between_requests {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            r = read => Some(r),
        }
    } else {
        Some(read.await)
    };

    match outcome {
        None => {
            trace!("shutting down idle keep-alive connection");
            Ok(None)
        }
        Some(Ok(head)) => head,
        Some(Err(_)) if buf.is_empty() => Ok(None),
        Some(Err(_)) => Err(ServerError::Timeout),
    }
}

/// Dial `host:port` from the user's egress address.
///
/// A binding that raced a pool replacement is retried once with a fresh pick.
async fn dial(
    state: &ServerState,
    user_id: i64,
    host: &str,
    port: u16,
) -> Result<TcpStream, EgressError> {
    let dialer = match state.dialers.get_dialer(user_id) {
        Err(EgressError::UnknownAddress(_)) => state.dialers.get_dialer(user_id)?,
        other => other?,
    };
    match dialer.connect(host, port).await {
        Ok(stream) => Ok(stream),
        Err(err) => {
            record_upstream_connect_failure();
            Err(err)
        }
    }
}

/// Best-effort `502`; the connection is closing anyway.
async fn bad_gateway<S>(stream: &mut S)
where
    S: AsyncWrite + Unpin,
{
    if stream.write_all(BAD_GATEWAY).await.is_ok() {
        let _ = stream.flush().await;
    }
}
