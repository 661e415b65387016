//! Per-connection traffic accounting.
//!
//! A [`TrafficReporter`] accumulates the bytes one connection moves and turns
//! them into `UserConsumedTraffic` events whenever the byte threshold is
//! reached or the report interval has passed, plus once more when the
//! connection ends. Events are queued to a [`TrafficEmitter`] task so the data
//! path never waits on the bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tollgate_bus::{MessageBus, MessageBusExt, UserConsumedTraffic};
use tollgate_core::io::RelayMetrics;
use tollgate_metrics::{record_traffic_event_dropped, record_traffic_event_emitted};
use tracing::{debug, warn};

/// Queue of traffic events towards the bus.
///
/// This struct is cheap to clone and can be shared across threads.
#[derive(Clone)]
pub struct TrafficEmitter {
    sender: mpsc::UnboundedSender<UserConsumedTraffic>,
    threshold: u64,
    interval: Duration,
}

impl TrafficEmitter {
    /// Spawn the task producing queued events on `topic`.
    ///
    /// The task ends once every emitter and reporter is dropped and the
    /// queue is drained.
    pub fn spawn(
        bus: Arc<dyn MessageBus>,
        topic: impl Into<String>,
        threshold: u64,
        interval: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (emitter, rx) = Self::channel(threshold, interval);
        let handle = tokio::spawn(run_emitter(rx, bus, topic.into()));
        (emitter, handle)
    }

    /// An emitter whose events land in the returned receiver.
    pub fn channel(
        threshold: u64,
        interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<UserConsumedTraffic>) {
        let (sender, rx) = mpsc::unbounded_channel();
        let emitter = Self {
            sender,
            threshold: threshold.max(1),
            interval,
        };
        (emitter, rx)
    }

    /// Queue `event`; `false` when the emitter task is gone.
    #[inline]
    pub fn emit(&self, event: UserConsumedTraffic) -> bool {
        self.sender.send(event).is_ok()
    }

    /// Start accounting a connection of `user_id`.
    pub fn reporter(&self, user_id: i64) -> TrafficReporter {
        TrafficReporter {
            user_id,
            in_bytes: AtomicU64::new(0),
            out_bytes: AtomicU64::new(0),
            last_sent: Mutex::new(Instant::now()),
            emitter: self.clone(),
        }
    }
}

async fn run_emitter(
    mut rx: mpsc::UnboundedReceiver<UserConsumedTraffic>,
    bus: Arc<dyn MessageBus>,
    topic: String,
) {
    while let Some(event) = rx.recv().await {
        match bus.produce_event(&topic, &event).await {
            Ok(()) => record_traffic_event_emitted(),
            Err(e) => {
                record_traffic_event_dropped();
                warn!(
                    user_id = event.user_id,
                    in_bytes = event.in_bytes,
                    out_bytes = event.out_bytes,
                    error = %e,
                    "traffic event dropped"
                );
            }
        }
    }
    debug!(%topic, "traffic emitter stopped");
}

/// Byte counters of one client connection.
///
/// `in` counts upstream to client, `out` client to upstream. Counters are
/// zeroed by every emission whether or not the bus accepts the event, so a
/// report is sent at most once.
pub struct TrafficReporter {
    user_id: i64,
    in_bytes: AtomicU64,
    out_bytes: AtomicU64,
    last_sent: Mutex<Instant>,
    emitter: TrafficEmitter,
}

impl TrafficReporter {
    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    #[inline]
    pub fn add_in(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.in_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.check_and_send();
    }

    #[inline]
    pub fn add_out(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.out_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.check_and_send();
    }

    /// Unreported `(in, out)` bytes.
    pub fn pending(&self) -> (u64, u64) {
        (
            self.in_bytes.load(Ordering::Relaxed),
            self.out_bytes.load(Ordering::Relaxed),
        )
    }

    fn check_and_send(&self) {
        let mut last_sent = self.last_sent.lock();
        let now = Instant::now();
        let (inb, outb) = self.pending();
        if inb + outb >= self.emitter.threshold
            || now.duration_since(*last_sent) >= self.emitter.interval
        {
            self.flush(&mut last_sent, now);
        }
    }

    /// Report whatever is left. Called when the connection ends.
    pub fn send_final(&self) {
        let mut last_sent = self.last_sent.lock();
        self.flush(&mut last_sent, Instant::now());
    }

    fn flush(&self, last_sent: &mut Instant, now: Instant) {
        let in_bytes = self.in_bytes.swap(0, Ordering::Relaxed);
        let out_bytes = self.out_bytes.swap(0, Ordering::Relaxed);
        *last_sent = now;
        if in_bytes == 0 && out_bytes == 0 {
            return;
        }

        let event = UserConsumedTraffic {
            user_id: self.user_id,
            timestamp: OffsetDateTime::now_utc(),
            in_bytes,
            out_bytes,
        };
        if !self.emitter.emit(event) {
            record_traffic_event_dropped();
            debug!(user_id = self.user_id, in_bytes, out_bytes, "traffic emitter gone, report lost");
        }
    }
}

impl Drop for TrafficReporter {
    fn drop(&mut self) {
        self.send_final();
    }
}

impl RelayMetrics for TrafficReporter {
    #[inline]
    fn record_upload(&self, bytes: u64) {
        self.add_out(bytes);
    }

    #[inline]
    fn record_download(&self, bytes: u64) {
        self.add_in(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tollgate_bus::{BusError, EventEnvelope, MemoryBroker};

    const HOUR: Duration = Duration::from_secs(3600);

    fn drain(rx: &mut mpsc::UnboundedReceiver<UserConsumedTraffic>) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push((e.in_bytes, e.out_bytes));
        }
        out
    }

    #[tokio::test]
    async fn below_threshold_reports_only_on_final() {
        let (emitter, mut rx) = TrafficEmitter::channel(10_000, HOUR);
        let reporter = emitter.reporter(7);
        reporter.add_out(1000);
        reporter.add_in(2000);
        assert!(drain(&mut rx).is_empty());

        reporter.send_final();
        reporter.send_final();
        let events = drain(&mut rx);
        assert_eq!(events, vec![(2000, 1000)]);
    }

    #[tokio::test]
    async fn threshold_triggers_and_zeroes() {
        let (emitter, mut rx) = TrafficEmitter::channel(100, HOUR);
        let reporter = emitter.reporter(1);
        reporter.add_in(60);
        reporter.add_out(50);
        assert_eq!(reporter.pending(), (0, 0));
        reporter.add_in(5);
        assert_eq!(drain(&mut rx), vec![(60, 50)]);
        drop(reporter);
        assert_eq!(drain(&mut rx), vec![(5, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_triggers_small_reports() {
        let (emitter, mut rx) = TrafficEmitter::channel(u64::MAX, Duration::from_secs(30));
        let reporter = emitter.reporter(1);
        reporter.add_in(1);
        assert!(drain(&mut rx).is_empty());
        tokio::time::advance(Duration::from_secs(30)).await;
        reporter.add_out(1);
        assert_eq!(drain(&mut rx), vec![(1, 1)]);
        reporter.add_out(1);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn zero_adds_are_ignored() {
        let (emitter, mut rx) = TrafficEmitter::channel(1, HOUR);
        let reporter = emitter.reporter(1);
        reporter.add_in(0);
        reporter.add_out(0);
        drop(reporter);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn concurrent_adders_are_counted_once() {
        let (emitter, mut rx) = TrafficEmitter::channel(997, HOUR);
        let reporter = Arc::new(emitter.reporter(1));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let r = reporter.clone();
                std::thread::spawn(move || {
                    for i in 0..1000u64 {
                        r.add_in(i % 7);
                        r.add_out(i % 5);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        reporter.send_final();

        let (inb, outb) = drain(&mut rx)
            .into_iter()
            .fold((0, 0), |(a, b), (i, o)| (a + i, b + o));
        let per_thread_in: u64 = (0..1000u64).map(|i| i % 7).sum();
        let per_thread_out: u64 = (0..1000u64).map(|i| i % 5).sum();
        assert_eq!(inb, 4 * per_thread_in);
        assert_eq!(outb, 4 * per_thread_out);
    }

    #[tokio::test]
    async fn relay_directions_map_to_in_and_out() {
        let (emitter, mut rx) = TrafficEmitter::channel(u64::MAX, HOUR);
        let reporter = emitter.reporter(1);
        reporter.record_upload(10);
        reporter.record_download(20);
        reporter.send_final();
        assert_eq!(drain(&mut rx), vec![(20, 10)]);
    }

    #[tokio::test]
    async fn emitter_produces_on_topic() {
        let broker = MemoryBroker::new();
        let consumer = broker.bus();
        consumer.subscribe(&["PROXY".to_string()]).await.unwrap();

        let (emitter, handle) = TrafficEmitter::spawn(Arc::new(broker.bus()), "PROXY", 1, HOUR);
        emitter.reporter(7).add_out(3);
        drop(emitter);
        handle.await.unwrap();

        let env = consumer.consume().await.unwrap();
        let event = env.decode::<UserConsumedTraffic>().unwrap();
        assert_eq!((event.user_id, event.in_bytes, event.out_bytes), (7, 0, 3));
    }

    struct DownBus;

    #[async_trait]
    impl MessageBus for DownBus {
        async fn subscribe(&self, _topics: &[String]) -> Result<(), BusError> {
            Ok(())
        }
        async fn consume(&self) -> Result<EventEnvelope, BusError> {
            Err(BusError::Closed)
        }
        async fn produce(&self, _topic: &str, _envelope: EventEnvelope) -> Result<(), BusError> {
            Err(BusError::backend("unreachable broker"))
        }
        async fn close(&self) -> Result<(), BusError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn bus_outage_drops_reports_but_keeps_running() {
        let (emitter, handle) = TrafficEmitter::spawn(Arc::new(DownBus), "PROXY", 1, HOUR);
        let reporter = emitter.reporter(1);
        reporter.add_in(5);
        reporter.add_in(6);
        assert_eq!(reporter.pending(), (0, 0));
        drop(reporter);
        drop(emitter);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
