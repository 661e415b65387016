//! Plain HTTP forwarding.
//!
//! Every request gets its own upstream connection. The request is rewritten
//! to origin-form without proxy headers; the response travels back verbatim.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tollgate_core::io::PrefixedStream;
use tollgate_metrics::{
    REJECT_RATE_LIMIT, record_bytes_received, record_bytes_sent, record_connection_rejected,
};
use tracing::{debug, instrument};

use super::{Session, bad_gateway, dial};
use crate::codec::{copy_body, read_head_raw};
use crate::error::ServerError;
use crate::http::Head;
use crate::http::{BodyKind, ForwardTarget, HttpError, PROXY_CONNECTION, RequestHead, ResponseHead};
use crate::relay::relay_with_accounting;
use crate::state::ServerState;
use crate::traffic::TrafficReporter;

/// Forward one request and relay its response.
///
/// Returns whether the client connection can carry another request.
#[instrument(
    level = "debug",
    skip_all,
    fields(peer = %peer, user_id = %session.user.user_id, method = %head.method)
)]
pub(super) async fn handle_forward<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    mut head: RequestHead,
    session: &Session,
    state: &ServerState,
    peer: SocketAddr,
) -> Result<bool, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = ForwardTarget::from_request(&head)?;
    let request_body = head.take_body_kind()?;
    let client_keep_alive = head.keep_alive();
    let user_id = session.user.user_id.get();

    let _permit = match &state.rate_limiter {
        Some(limiter) => {
            let authority = target.authority();
            match limiter.acquire(user_id, &authority, head.wire_len() as u64) {
                Some(permit) => Some(permit),
                None => {
                    debug!(target = %authority, "rate limited");
                    record_connection_rejected(REJECT_RATE_LIMIT);
                    bad_gateway(stream).await;
                    return Err(ServerError::RateLimited);
                }
            }
        }
        None => None,
    };

    let mut upstream = match dial(state, user_id, &target.host, target.port).await {
        Ok(upstream) => upstream,
        Err(err) => {
            bad_gateway(stream).await;
            return Err(err.into());
        }
    };

    head.take_header(PROXY_CONNECTION);
    if head.header("host").is_none() {
        head.set_header("Host", target.host_header());
    }

    let traffic = &session.traffic;
    let sent = send_request(stream, buf, &mut upstream, &head, &target, request_body, traffic);
    if let Err(err) = sent.await {
        bad_gateway(stream).await;
        return Err(err);
    }

    let mut upstream_buf = state.buffers.acquire();
    let (response, raw) = loop {
        let read = read_head_raw::<ResponseHead, _>(
            &mut upstream,
            &mut upstream_buf,
            state.max_header_bytes,
        );
        let err = match tokio::time::timeout(state.request_timeout, read).await {
            Ok(Ok(Some((response, raw)))) if response.is_interim() => {
                write_counted(stream, &raw, traffic).await?;
                continue;
            }
            Ok(Ok(Some(read))) => break read,
            Ok(Ok(None)) => HttpError::UnexpectedEof.into(),
            Ok(Err(err)) => err,
            Err(_) => ServerError::Timeout,
        };
        bad_gateway(stream).await;
        return Err(err);
    };
    debug!(status = response.status, "upstream responded");

    if response.status == 101 {
        write_counted(stream, &raw, traffic).await?;
        let pending = upstream_buf.split();
        write_counted(stream, &pending, traffic).await?;
        let early = buf.split().freeze();
        let stats = relay_with_accounting(
            PrefixedStream::new(early, &mut *stream),
            upstream,
            state.tcp_idle_timeout,
            state.relay_buffer_size,
            traffic,
        )
        .await?;
        debug!(
            uploaded = stats.uploaded,
            downloaded = stats.downloaded,
            "upgraded connection closed"
        );
        return Ok(false);
    }

    let response_body = response.body_kind(&head.method)?;
    write_counted(stream, &raw, traffic).await?;
    copy_body(&mut upstream, &mut upstream_buf, stream, response_body, |n| {
        traffic.add_in(n);
        record_bytes_sent(n);
    })
    .await?;

    Ok(client_keep_alive && response.keep_alive() && response_body != BodyKind::UntilClose)
}

async fn send_request<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    upstream: &mut TcpStream,
    head: &RequestHead,
    target: &ForwardTarget,
    body: BodyKind,
    traffic: &TrafficReporter,
) -> Result<(), ServerError>
where
    S: AsyncRead + Unpin,
{
    let encoded = head.encode(&target.path);
    upstream.write_all(&encoded).await?;
    traffic.add_out(encoded.len() as u64);
    record_bytes_received(encoded.len() as u64);

    copy_body(stream, buf, upstream, body, |n| {
        traffic.add_out(n);
        record_bytes_received(n);
    })
    .await?;
    Ok(())
}

async fn write_counted<S>(
    stream: &mut S,
    bytes: &[u8],
    traffic: &TrafficReporter,
) -> Result<(), ServerError>
where
    S: AsyncWrite + Unpin,
{
    if bytes.is_empty() {
        return Ok(());
    }
    stream.write_all(bytes).await?;
    stream.flush().await?;
    traffic.add_in(bytes.len() as u64);
    record_bytes_sent(bytes.len() as u64);
    Ok(())
}
