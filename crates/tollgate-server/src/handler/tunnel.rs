//! CONNECT tunnels.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tollgate_core::io::PrefixedStream;
use tollgate_metrics::{REJECT_RATE_LIMIT, record_connection_rejected};
use tracing::{debug, instrument};

use super::{CONNECTION_ESTABLISHED, Session, bad_gateway, dial};
use crate::error::ServerError;
use crate::http::Head;
use crate::http::{RequestHead, format_authority, parse_authority};
use crate::relay::relay_with_accounting;
use crate::state::ServerState;

/// Open a tunnel to the CONNECT target and splice until either side ends.
///
/// `early` holds bytes the client sent after the request head; they are
/// delivered upstream ahead of the rest of the stream.
#[instrument(
    level = "debug",
    skip_all,
    fields(peer = %peer, user_id = %session.user.user_id, target = %head.target)
)]
pub(super) async fn handle_connect<S>(
    mut stream: S,
    early: Bytes,
    head: &RequestHead,
    session: &Session,
    state: &ServerState,
    peer: SocketAddr,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (host, port) = parse_authority(&head.target, 443)?;
    let user_id = session.user.user_id.get();

    let _permit = match &state.rate_limiter {
        Some(limiter) => {
            let target = format_authority(&host, port);
            match limiter.acquire(user_id, &target, head.wire_len() as u64) {
                Some(permit) => Some(permit),
                None => {
                    debug!("rate limited");
                    record_connection_rejected(REJECT_RATE_LIMIT);
                    bad_gateway(&mut stream).await;
                    return Err(ServerError::RateLimited);
                }
            }
        }
        None => None,
    };

    let upstream = match dial(state, user_id, &host, port).await {
        Ok(upstream) => upstream,
        Err(err) => {
            bad_gateway(&mut stream).await;
            return Err(err.into());
        }
    };
    debug!(local = ?upstream.local_addr().ok(), "upstream connected");

    stream.write_all(CONNECTION_ESTABLISHED).await?;
    stream.flush().await?;

    // After the 200 an upstream failure just ends the tunnel.
    match relay_with_accounting(
        PrefixedStream::new(early, stream),
        upstream,
        state.tcp_idle_timeout,
        state.relay_buffer_size,
        &session.traffic,
    )
    .await
    {
        Ok(stats) => debug!(
            uploaded = stats.uploaded,
            downloaded = stats.downloaded,
            "tunnel closed"
        ),
        Err(err) => debug!(error = %err, "tunnel ended with error"),
    }
    Ok(())
}
