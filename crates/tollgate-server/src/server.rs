//! Accept loop and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tollgate_auth::AuthBackend;
use tollgate_bus::MessageBus;
use tollgate_config::{Config, ProxyConfig};
use tollgate_core::defaults;
use tollgate_egress::{DialOptions, DialerPool};
use tollgate_metrics::{
    REJECT_MAX_CONNECTIONS, record_connection_accepted, record_connection_closed,
    record_connection_rejected, record_error,
};
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::handler::handle_conn;
use crate::pool::BufferPool;
use crate::rate_limit::RateLimiter;
use crate::state::{ServerState, challenge_response};
use crate::traffic::TrafficEmitter;
use crate::util::{ConnectionTracker, create_listener};

/// Default graceful shutdown timeout.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration =
    Duration::from_secs(defaults::DEFAULT_SHUTDOWN_TIMEOUT_SECS);

/// How long shutdown waits for queued traffic reports to reach the bus.
const TRAFFIC_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Collaborators the proxy is wired to.
pub struct ProxyComponents {
    pub auth: Arc<dyn AuthBackend>,
    pub dialers: Arc<DialerPool>,
    /// Bus receiving `UserConsumedTraffic` reports.
    pub bus: Arc<dyn MessageBus>,
    pub traffic_topic: String,
    /// `None` disables per-user rate limiting.
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

/// Outbound socket options derived from the proxy section.
pub fn dial_options(config: &ProxyConfig) -> DialOptions {
    DialOptions {
        connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        no_delay: config.tcp.no_delay,
        keepalive: (config.tcp.keepalive_secs > 0)
            .then(|| Duration::from_secs(config.tcp.keepalive_secs)),
    }
}

/// A bound proxy listener, ready to [`run`](Self::run).
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    traffic_task: JoinHandle<()>,
    max_connections: usize,
    no_delay: bool,
    shutdown_timeout: Duration,
}

impl ProxyServer {
    /// Bind the listener and start the background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: &Config, components: ProxyComponents) -> Result<Self, ServerError> {
        let proxy = &config.proxy;
        let listen_addr = proxy.listen_addr();
        let listen: SocketAddr = listen_addr
            .parse()
            .map_err(|_| ServerError::Config(format!("invalid listen address {listen_addr}")))?;

        let (traffic, traffic_task) = TrafficEmitter::spawn(
            components.bus,
            components.traffic_topic,
            config.traffic.threshold_bytes,
            Duration::from_secs(config.traffic.interval_secs),
        );

        if let Some(limiter) = &components.rate_limiter {
            let settings = limiter.settings();
            info!(
                capacity_bytes = settings.capacity_bytes,
                fill_rate = settings.fill_rate_bytes_per_sec,
                max_connections = settings.max_connections,
                shards = settings.shard_count,
                "rate limiting enabled"
            );
            limiter.start_cleanup_task(settings.cleanup_interval);
        }

        let state = Arc::new(ServerState {
            auth: components.auth,
            dialers: components.dialers,
            rate_limiter: components.rate_limiter,
            traffic,
            buffers: BufferPool::new(proxy.read_buffer_size, proxy.buffer_pool_size),
            challenge: challenge_response(&proxy.realm),
            max_header_bytes: proxy.max_header_bytes,
            request_timeout: Duration::from_secs(proxy.request_timeout_secs),
            tcp_idle_timeout: Duration::from_secs(proxy.tcp_idle_timeout_secs),
            relay_buffer_size: proxy.relay_buffer_size,
        });

        let listener = create_listener(listen, proxy.connection_backlog)?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, backlog = proxy.connection_backlog, "listening");

        Ok(Self {
            listener,
            local_addr,
            state,
            traffic_task,
            max_connections: proxy.max_connections,
            no_delay: proxy.tcp.no_delay,
            shutdown_timeout: Duration::from_secs(proxy.shutdown_timeout_secs),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Accept connections until `shutdown` fires, then drain.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let Self {
            listener,
            state,
            traffic_task,
            max_connections,
            no_delay,
            shutdown_timeout,
            ..
        } = self;

        let tracker = ConnectionTracker::new();
        // 0 = unlimited
        let conn_limit = (max_connections > 0).then(|| {
            info!(max_connections, "connection limit set");
            Arc::new(Semaphore::new(max_connections))
        });

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("shutdown signal received, stopping accept loop");
                    break;
                }

                result = listener.accept() => {
                    let (tcp, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            record_error(tollgate_core::ERROR_IO);
                            warn!(error = %err, "accept failed");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };

                    let permit: Option<OwnedSemaphorePermit> = match &conn_limit {
                        Some(sem) => match sem.clone().try_acquire_owned() {
                            Ok(p) => Some(p),
                            Err(_) => {
                                debug!(peer = %peer, reason = REJECT_MAX_CONNECTIONS, "connection rejected");
                                record_connection_rejected(REJECT_MAX_CONNECTIONS);
                                continue;
                            }
                        },
                        None => None,
                    };

                    if let Err(err) = tcp.set_nodelay(no_delay) {
                        debug!(peer = %peer, error = %err, "failed to set TCP_NODELAY");
                    }
                    debug!(peer = %peer, "new connection");

                    let state = state.clone();
                    let shutdown = shutdown.clone();
                    let guard = tracker.track();

                    tokio::spawn(async move {
                        let _guard = guard;
                        let _permit = permit;
                        record_connection_accepted();
                        let start = Instant::now();

                        let result = handle_conn(tcp, state, peer, shutdown).await;

                        let duration_secs = start.elapsed().as_secs_f64();
                        record_connection_closed(duration_secs);
                        match result {
                            Ok(()) => debug!(peer = %peer, duration_secs, "connection closed"),
                            Err(err) => {
                                record_error(err.error_type());
                                debug!(peer = %peer, duration_secs, error = %err, "connection closed with error");
                            }
                        }
                    });
                }
            }
        }
        drop(listener);

        if let Some(limiter) = &state.rate_limiter {
            limiter.shutdown();
        }

        let active = tracker.count();
        if active > 0 {
            info!(active, "waiting for active connections to drain");
            if tracker.wait_for_zero(shutdown_timeout).await {
                info!("all connections drained");
            } else {
                warn!(active = tracker.count(), "shutdown timeout, connections still active");
            }
        }

        // The report task ends once the last emitter handle is gone.
        drop(state);
        if tokio::time::timeout(TRAFFIC_FLUSH_TIMEOUT, traffic_task).await.is_err() {
            warn!("traffic reports still pending at shutdown");
        }

        info!("proxy stopped");
        Ok(())
    }
}

/// Bind and run until `shutdown` fires.
pub async fn run_with_shutdown(
    config: &Config,
    components: ProxyComponents,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    ProxyServer::bind(config, components)?.run(shutdown).await
}
