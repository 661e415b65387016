//! Proxy authentication step.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tollgate_auth::{AuthError, AuthorizedUser, BasicCredentials, Credentials};
use tollgate_metrics::{
    ERROR_AUTH, REJECT_RESTRICTED, REJECT_UNAUTHORIZED, record_auth_failure, record_auth_success,
    record_connection_rejected, record_error,
};
use tracing::{debug, warn};

use crate::codec::copy_body;
use crate::error::ServerError;
use crate::http::{BodyKind, RequestHead};
use crate::state::ServerState;

/// Authorize the `Proxy-Authorization` value of `head`.
///
/// Refused clients have been answered with `407` when this returns
/// `Ok(None)`. Undecodable credentials are an error: the connection is
/// closed without a response.
pub(super) async fn authorize<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    head: &RequestHead,
    credential: &[u8],
    state: &ServerState,
    peer: SocketAddr,
) -> Result<Option<AuthorizedUser>, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let decoded = std::str::from_utf8(credential)
        .map_err(|_| AuthError::Malformed("header is not utf-8".into()))
        .and_then(BasicCredentials::from_header_value);
    let credentials = match decoded {
        Ok(basic) => Credentials::Basic(basic),
        Err(err) => {
            record_auth_failure();
            debug!(peer = %peer, error = %err, "malformed credentials");
            return Err(err.into());
        }
    };

    match state.auth.authorize(&credentials).await {
        Ok(user) => {
            record_auth_success();
            debug!(peer = %peer, user_id = %user.user_id, "authorized");
            Ok(Some(user))
        }
        Err(err) => {
            record_auth_failure();
            let reason = match err {
                AuthError::Restricted => REJECT_RESTRICTED,
                _ => REJECT_UNAUTHORIZED,
            };
            record_connection_rejected(reason);
            if err.is_rejection() {
                debug!(peer = %peer, username = credentials.username(), reason = %err, "auth refused");
            } else {
                record_error(ERROR_AUTH);
                warn!(peer = %peer, username = credentials.username(), error = %err, "auth backend failed");
            }
            challenge(stream, buf, head, state).await;
            Ok(None)
        }
    }
}

/// Answer `407`, drain the request body and close the write side.
pub(super) async fn challenge<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    head: &RequestHead,
    state: &ServerState,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = stream.write_all(&state.challenge).await {
        debug!(error = %e, "failed to send challenge");
        return;
    }
    let _ = stream.flush().await;

    if !head.is_connect()
        && let Ok(kind) = head.body_kind()
        && kind != BodyKind::Empty
    {
        let mut sink = tokio::io::sink();
        let drain = copy_body(stream, buf, &mut sink, kind, |_| {});
        let _ = tokio::time::timeout(state.request_timeout, drain).await;
    }
    let _ = stream.shutdown().await;
}
