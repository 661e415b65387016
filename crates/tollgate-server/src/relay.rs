//! Tunnel splicing with Prometheus byte counters.
//!
//! Wraps the counting relay from `tollgate-core`: global byte counters are
//! always recorded, and the connection's [`TrafficReporter`] sees the same
//! counts for per-user accounting.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tollgate_core::io::{RelayMetrics, RelayStats, relay_bidirectional};
use tollgate_metrics::{record_bytes_received, record_bytes_sent};

use crate::error::ServerError;
use crate::traffic::TrafficReporter;

/// Process-wide byte counters.
pub(crate) struct GlobalMetrics;

impl RelayMetrics for GlobalMetrics {
    #[inline]
    fn record_upload(&self, bytes: u64) {
        record_bytes_received(bytes);
    }
    #[inline]
    fn record_download(&self, bytes: u64) {
        record_bytes_sent(bytes);
    }
}

/// Splice `client` and `upstream`, attributing bytes to `reporter`.
pub async fn relay_with_accounting<A, B>(
    client: A,
    upstream: B,
    idle_timeout: Duration,
    buffer_size: usize,
    reporter: &TrafficReporter,
) -> Result<RelayStats, ServerError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    relay_bidirectional(
        client,
        upstream,
        idle_timeout,
        buffer_size,
        &(GlobalMetrics, reporter),
    )
    .await
    .map_err(ServerError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::TrafficEmitter;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn tunnel_bytes_reach_reporter() {
        let (emitter, mut rx) = TrafficEmitter::channel(u64::MAX, Duration::from_secs(3600));
        let reporter = emitter.reporter(7);

        let (client, mut client_peer) = tokio::io::duplex(4096);
        let (upstream, mut upstream_peer) = tokio::io::duplex(4096);

        let peers = async {
            client_peer.write_all(&[1u8; 1000]).await.unwrap();
            client_peer.shutdown().await.unwrap();
            let mut got = vec![0u8; 1000];
            upstream_peer.read_exact(&mut got).await.unwrap();
            upstream_peer.write_all(&[2u8; 2000]).await.unwrap();
            upstream_peer.shutdown().await.unwrap();
            let mut back = Vec::new();
            client_peer.read_to_end(&mut back).await.unwrap();
            back.len()
        };
        let relay = relay_with_accounting(
            client,
            upstream,
            Duration::from_secs(5),
            1024,
            &reporter,
        );
        let (stats, received) = tokio::join!(relay, peers);
        let stats = stats.unwrap();

        assert_eq!(received, 2000);
        assert_eq!((stats.uploaded, stats.downloaded), (1000, 2000));
        reporter.send_final();
        let event = rx.try_recv().unwrap();
        assert_eq!((event.in_bytes, event.out_bytes), (2000, 1000));
        assert!(rx.try_recv().is_err());
    }
}
