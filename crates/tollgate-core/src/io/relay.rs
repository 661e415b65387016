//! Counting bidirectional splice between a client and its upstream.
//!
//! Both directions are driven as independent poll-based pumps inside one
//! future, so back-pressure on one side never stalls the other. Every flushed
//! chunk is reported through [`RelayMetrics`] before the next read, which is
//! what lets per-connection traffic accounting match the bytes on the wire.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant as TokioInstant;

/// Observer of bytes moved by the relay.
pub trait RelayMetrics {
    /// Bytes flushed from the client towards the upstream.
    fn record_upload(&self, bytes: u64);
    /// Bytes flushed from the upstream back to the client.
    fn record_download(&self, bytes: u64);
}

/// No-op metrics implementation for cases where accounting isn't needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl RelayMetrics for NoOpMetrics {
    #[inline]
    fn record_upload(&self, _bytes: u64) {}
    #[inline]
    fn record_download(&self, _bytes: u64) {}
}

impl<T: RelayMetrics + ?Sized> RelayMetrics for &T {
    #[inline]
    fn record_upload(&self, bytes: u64) {
        (**self).record_upload(bytes)
    }
    #[inline]
    fn record_download(&self, bytes: u64) {
        (**self).record_download(bytes)
    }
}

impl<T: RelayMetrics + ?Sized> RelayMetrics for Arc<T> {
    #[inline]
    fn record_upload(&self, bytes: u64) {
        (**self).record_upload(bytes)
    }
    #[inline]
    fn record_download(&self, bytes: u64) {
        (**self).record_download(bytes)
    }
}

/// Fan a single observation out to two recorders.
impl<A: RelayMetrics, B: RelayMetrics> RelayMetrics for (A, B) {
    #[inline]
    fn record_upload(&self, bytes: u64) {
        self.0.record_upload(bytes);
        self.1.record_upload(bytes);
    }
    #[inline]
    fn record_download(&self, bytes: u64) {
        self.0.record_download(bytes);
        self.1.record_download(bytes);
    }
}

/// Totals moved by one relay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Client to upstream.
    pub uploaded: u64,
    /// Upstream to client.
    pub downloaded: u64,
}

enum PumpState {
    Read,
    Write { pos: usize, len: usize },
    Flush(usize),
    Shutdown,
    Done,
}

enum Progress {
    Moved(usize),
    Finished,
}

/// One direction of the splice: read, write, flush, repeat; shutdown on EOF.
struct Pump {
    buf: Box<[u8]>,
    state: PumpState,
}

impl Pump {
    fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size.max(1)].into_boxed_slice(),
            state: PumpState::Read,
        }
    }

    fn is_done(&self) -> bool {
        matches!(self.state, PumpState::Done)
    }

    fn poll<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        reader: &mut R,
        writer: &mut W,
    ) -> Poll<io::Result<Progress>>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            match self.state {
                PumpState::Read => {
                    let mut read_buf = ReadBuf::new(&mut self.buf);
                    std::task::ready!(Pin::new(&mut *reader).poll_read(cx, &mut read_buf))?;
                    let n = read_buf.filled().len();
                    self.state = if n == 0 {
                        PumpState::Shutdown
                    } else {
                        PumpState::Write { pos: 0, len: n }
                    };
                }
                PumpState::Write { pos, len } => {
                    let n =
                        std::task::ready!(Pin::new(&mut *writer).poll_write(cx, &self.buf[pos..len]))?;
                    if n == 0 {
                        return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                    }
                    self.state = if pos + n >= len {
                        PumpState::Flush(len)
                    } else {
                        PumpState::Write { pos: pos + n, len }
                    };
                }
                PumpState::Flush(len) => {
                    std::task::ready!(Pin::new(&mut *writer).poll_flush(cx))?;
                    self.state = PumpState::Read;
                    return Poll::Ready(Ok(Progress::Moved(len)));
                }
                PumpState::Shutdown => {
                    // The peer may already be gone; a failed half-close still ends this direction.
                    let _ = std::task::ready!(Pin::new(&mut *writer).poll_shutdown(cx));
                    self.state = PumpState::Done;
                    return Poll::Ready(Ok(Progress::Finished));
                }
                PumpState::Done => return Poll::Ready(Ok(Progress::Finished)),
            }
        }
    }
}

/// Splice `client` and `upstream` until both directions reach EOF, either side
/// errors, or neither direction moves data for `idle_timeout`.
///
/// EOF on one side is propagated as a write shutdown to the other, so HTTP
/// clients that half-close still receive the full response. Both streams are
/// dropped exactly once when this function returns.
pub async fn relay_bidirectional<A, B, M>(
    client: A,
    upstream: B,
    idle_timeout: Duration,
    buffer_size: usize,
    metrics: &M,
) -> io::Result<RelayStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
    M: RelayMetrics + ?Sized,
{
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

    let mut up = Pump::new(buffer_size);
    let mut down = Pump::new(buffer_size);
    let mut stats = RelayStats::default();

    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    while !(up.is_done() && down.is_done()) {
        let step = std::future::poll_fn(|cx| {
            let mut ready = false;
            let mut moved = false;

            if !up.is_done() {
                match up.poll(cx, &mut client_r, &mut upstream_w) {
                    Poll::Ready(Ok(Progress::Moved(n))) => {
                        stats.uploaded += n as u64;
                        metrics.record_upload(n as u64);
                        ready = true;
                        moved = true;
                    }
                    Poll::Ready(Ok(Progress::Finished)) => ready = true,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => {}
                }
            }

            if !down.is_done() {
                match down.poll(cx, &mut upstream_r, &mut client_w) {
                    Poll::Ready(Ok(Progress::Moved(n))) => {
                        stats.downloaded += n as u64;
                        metrics.record_download(n as u64);
                        ready = true;
                        moved = true;
                    }
                    Poll::Ready(Ok(Progress::Finished)) => ready = true,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => {}
                }
            }

            if ready {
                Poll::Ready(Ok(moved))
            } else {
                Poll::Pending
            }
        });

        tokio::select! {
            moved = step => {
                if moved? {
                    idle.as_mut().reset(TokioInstant::now() + idle_timeout);
                }
            }
            _ = &mut idle => break,
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[derive(Default)]
    struct Counting {
        up: AtomicU64,
        down: AtomicU64,
    }

    impl RelayMetrics for Counting {
        fn record_upload(&self, bytes: u64) {
            self.up.fetch_add(bytes, Ordering::Relaxed);
        }
        fn record_download(&self, bytes: u64) {
            self.down.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn splices_both_directions_and_counts() {
        let (client, proxy_client_side) = duplex(256);
        let (proxy_upstream_side, upstream) = duplex(256);
        let metrics = Arc::new(Counting::default());

        let m = metrics.clone();
        let relay = tokio::spawn(async move {
            relay_bidirectional(
                proxy_client_side,
                proxy_upstream_side,
                Duration::from_secs(5),
                128,
                &m,
            )
            .await
        });

        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

        let upload = vec![b'u'; 1000];
        let download = vec![b'd'; 2000];

        let writer = tokio::spawn(async move {
            client_w.write_all(&upload).await.unwrap();
            client_w.shutdown().await.unwrap();
        });
        let mut received_up = Vec::new();
        upstream_r.read_to_end(&mut received_up).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received_up.len(), 1000);

        let writer = tokio::spawn(async move {
            upstream_w.write_all(&download).await.unwrap();
            upstream_w.shutdown().await.unwrap();
        });
        let mut received_down = Vec::new();
        client_r.read_to_end(&mut received_down).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received_down.len(), 2000);

        let stats = relay.await.unwrap().unwrap();
        assert_eq!(
            stats,
            RelayStats {
                uploaded: 1000,
                downloaded: 2000
            }
        );
        assert_eq!(metrics.up.load(Ordering::Relaxed), 1000);
        assert_eq!(metrics.down.load(Ordering::Relaxed), 2000);
    }

    #[tokio::test]
    async fn half_close_keeps_other_direction_open() {
        let (client, proxy_client_side) = duplex(64);
        let (proxy_upstream_side, upstream) = duplex(64);

        let relay = tokio::spawn(async move {
            relay_bidirectional(
                proxy_client_side,
                proxy_upstream_side,
                Duration::from_secs(5),
                64,
                &NoOpMetrics,
            )
            .await
        });

        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

        client_w.write_all(b"ping").await.unwrap();
        client_w.shutdown().await.unwrap();

        let mut buf = Vec::new();
        upstream_r.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ping");

        upstream_w.write_all(b"pong").await.unwrap();
        drop(upstream_w);
        drop(upstream_r);

        let mut buf = Vec::new();
        client_r.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"pong");

        relay.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_ends_relay() {
        let (_client, proxy_client_side) = duplex(64);
        let (proxy_upstream_side, _upstream) = duplex(64);

        let start = TokioInstant::now();
        let stats = relay_bidirectional(
            proxy_client_side,
            proxy_upstream_side,
            Duration::from_secs(30),
            64,
            &NoOpMetrics,
        )
        .await
        .unwrap();

        assert_eq!(stats, RelayStats::default());
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[test]
    fn tuple_metrics_fan_out() {
        let a = Counting::default();
        let b = Counting::default();
        let both = (&a, &b);
        both.record_upload(3);
        both.record_download(5);
        assert_eq!(a.up.load(Ordering::Relaxed), 3);
        assert_eq!(b.down.load(Ordering::Relaxed), 5);
    }
}
