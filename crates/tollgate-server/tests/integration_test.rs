//! End-to-end tests of the proxy listener.
//!
//! Each test runs a full [`ProxyServer`] on an ephemeral port with in-memory
//! users, caches and bus, against mock upstreams on std threads.
#![allow(clippy::tests_outside_test_module)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tollgate_auth::{
    Argon2Hasher, AuthService, AuthVerdicts, Authorizer, MemoryUserStore, PasswordHasher,
    RestrictionService, User,
};
use tollgate_bus::{
    MemoryBroker, MemoryBus, MessageBus, MessageBusExt, UserConsumedTraffic,
    UserPasswordChangedEvent,
};
use tollgate_cache::{Cache, MemoryCache};
use tollgate_config::{Config, RateLimitSettings};
use tollgate_controller::{PasswordChangeInvalidator, invalidation_processor};
use tollgate_egress::DialerPool;
use tollgate_server::{
    CancellationToken, ProxyComponents, ProxyServer, RateLimiter, ServerError, dial_options,
};

const USER_PASS: &str = "Basic dXNlcjpwYXNz";
const USER_OTHER: &str = "Basic dXNlcjpvdGhlcg==";
const FOO_BAR: &str = "Basic Zm9vOmJhcg==";
const ALICE_SECRET: &str = "Basic YWxpY2U6c2VjcmV0";
const BOB_PASS: &str = "Basic Ym9iOnBhc3M=";

const CHALLENGE: &str =
    "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"Proxy\"\r\n\r\n";

// ============================================================================
// Mock upstreams
// ============================================================================

/// Reads `expect` bytes, answers with `reply` bytes, then waits for EOF.
fn tunnel_upstream(expect: usize, reply: usize) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for mut stream in listener.incoming().flatten() {
            thread::spawn(move || {
                let mut got = vec![0u8; expect];
                if stream.read_exact(&mut got).is_err() {
                    return;
                }
                if stream.write_all(&vec![b'd'; reply]).is_err() {
                    return;
                }
                let mut sink = [0u8; 1024];
                while matches!(stream.read(&mut sink), Ok(n) if n > 0) {}
            });
        }
    });
    addr
}

/// Echoes everything back.
fn echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for mut stream in listener.incoming().flatten() {
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Answers every request with a 200 carrying `body_len` bytes and reports
/// each received request head.
fn http_upstream(body_len: usize) -> (SocketAddr, mpsc::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for mut stream in listener.incoming().flatten() {
            let tx = tx.clone();
            thread::spawn(move || {
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    match stream.read(&mut byte) {
                        Ok(1) => head.push(byte[0]),
                        _ => return,
                    }
                }
                let _ = tx.send(String::from_utf8_lossy(&head).into_owned());
                let mut response =
                    format!("HTTP/1.1 200 OK\r\nContent-Length: {body_len}\r\n\r\n").into_bytes();
                response.extend(std::iter::repeat_n(b'b', body_len));
                let _ = stream.write_all(&response);
            });
        }
    });
    (addr, rx)
}

// ============================================================================
// Proxy harness
// ============================================================================

struct Harness {
    addr: SocketAddr,
    broker: MemoryBroker,
    /// Subscribed to the traffic topic before the proxy started.
    traffic: MemoryBus,
    authorizer: Arc<Authorizer>,
    verdicts: Arc<MemoryCache<AuthVerdicts>>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), ServerError>>,
}

impl Harness {
    async fn start(rate_limiter: Option<Arc<RateLimiter>>) -> Self {
        let hasher = Arc::new(Argon2Hasher::with_params(8, 1, 1).unwrap());
        let users = MemoryUserStore::from_users([
            User::new(7, "user", "user@example.com", hasher.hash("pass").unwrap()),
            User::new(8, "foo", "foo@example.com", hasher.hash("baz").unwrap()),
            User::new(9, "bob", "bob@example.com", hasher.hash("pass").unwrap()),
            User::new(10, "alice", "alice@example.com", hasher.hash("secret").unwrap()),
        ]);
        let verdicts = Arc::new(MemoryCache::<AuthVerdicts>::new(None));
        let authorizer = Arc::new(Authorizer::new(
            Arc::new(users),
            AuthService::new(hasher, verdicts.clone(), Duration::from_secs(300)),
            RestrictionService::new(Arc::new(MemoryCache::<bool>::new(None))),
        ));

        let mut config = Config::default();
        config.proxy.listen_host = "127.0.0.1".into();
        config.proxy.listen_port = 0;
        config.proxy.request_timeout_secs = 5;
        config.proxy.shutdown_timeout_secs = 2;
        config.traffic.threshold_bytes = 1 << 30;
        config.traffic.interval_secs = 3600;

        let broker = MemoryBroker::new();
        let traffic = broker.bus();
        traffic.subscribe(&["PROXY".to_string()]).await.unwrap();

        let server = ProxyServer::bind(
            &config,
            ProxyComponents {
                auth: authorizer.clone(),
                dialers: Arc::new(DialerPool::new(
                    Duration::from_secs(60),
                    dial_options(&config.proxy),
                )),
                bus: Arc::new(broker.bus()),
                traffic_topic: "PROXY".into(),
                rate_limiter,
            },
        )
        .unwrap();
        let addr = server.local_addr();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(shutdown.clone()));

        Self {
            addr,
            broker,
            traffic,
            authorizer,
            verdicts,
            shutdown,
            task,
        }
    }

    fn hasher_calls(&self) -> u64 {
        self.authorizer.auth_service().stats().hasher_calls
    }

    async fn next_traffic(&self, wait: Duration) -> Option<UserConsumedTraffic> {
        let envelope = tokio::time::timeout(wait, self.traffic.consume())
            .await
            .ok()?
            .ok()?;
        Some(envelope.decode::<UserConsumedTraffic>().unwrap())
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("proxy did not stop")
            .unwrap()
            .unwrap();
    }
}

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "closed mid-head: {:?}", String::from_utf8_lossy(&head));
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

async fn read_to_end(stream: &mut TcpStream) -> String {
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("proxy kept the connection open")
        .unwrap();
    String::from_utf8(out).unwrap()
}

async fn open_tunnel(proxy: SocketAddr, target: SocketAddr, auth: &str) -> (TcpStream, String) {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {target} HTTP/1.1\r\nProxy-Authorization: {auth}\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut client).await;
    (client, head)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn connect_tunnel_reports_traffic_once() {
    let proxy = Harness::start(None).await;
    let upstream = tunnel_upstream(1000, 2000);

    let (mut client, head) = open_tunnel(proxy.addr, upstream, USER_PASS).await;
    assert_eq!(head, "HTTP/1.1 200 Connection Established\r\n\r\n");

    client.write_all(&[b'u'; 1000]).await.unwrap();
    let mut down = vec![0u8; 2000];
    client.read_exact(&mut down).await.unwrap();
    assert!(down.iter().all(|b| *b == b'd'));
    drop(client);

    let event = proxy
        .next_traffic(Duration::from_secs(5))
        .await
        .expect("no traffic report");
    assert_eq!(
        (event.user_id, event.in_bytes, event.out_bytes),
        (7, 2000, 1000)
    );
    assert!(proxy.next_traffic(Duration::from_millis(200)).await.is_none());

    proxy.stop().await;
}

#[tokio::test]
async fn tunnel_carries_bytes_sent_with_the_request() {
    let proxy = Harness::start(None).await;
    let upstream = echo_upstream();

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let request =
        format!("CONNECT {upstream} HTTP/1.1\r\nProxy-Authorization: {USER_PASS}\r\n\r\nhello");
    client.write_all(request.as_bytes()).await.unwrap();
    assert_eq!(
        read_head(&mut client).await,
        "HTTP/1.1 200 Connection Established\r\n\r\n"
    );
    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello");
    drop(client);

    proxy.stop().await;
}

#[tokio::test]
async fn forward_strips_credentials_and_keeps_identity() {
    let proxy = Harness::start(None).await;
    let (upstream, heads) = http_upstream(500);

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let first = format!(
        "GET http://{upstream}/x HTTP/1.1\r\nHost: {upstream}\r\nProxy-Authorization: {USER_PASS}\r\n\r\n"
    );
    client.write_all(first.as_bytes()).await.unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    let mut body = vec![0u8; 500];
    client.read_exact(&mut body).await.unwrap();
    assert!(body.iter().all(|b| *b == b'b'));

    let seen = heads.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(seen.starts_with("GET /x HTTP/1.1\r\n"), "{seen}");
    assert!(!seen.to_ascii_lowercase().contains("proxy-authorization"));

    // Same connection, no credentials: the earlier identity still applies.
    let second = format!("GET http://{upstream}/y HTTP/1.1\r\nHost: {upstream}\r\n\r\n");
    client.write_all(second.as_bytes()).await.unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    client.read_exact(&mut body).await.unwrap();
    let seen = heads.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(seen.starts_with("GET /y HTTP/1.1\r\n"), "{seen}");

    drop(client);
    let event = proxy
        .next_traffic(Duration::from_secs(5))
        .await
        .expect("no traffic report");
    assert_eq!(event.user_id, 7);
    assert!(event.in_bytes > 1000);
    assert!(event.out_bytes > 0);

    proxy.stop().await;
}

#[tokio::test]
async fn different_credential_on_keep_alive_is_rechecked() {
    let proxy = Harness::start(None).await;
    let (upstream, _heads) = http_upstream(10);

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let first = format!(
        "GET http://{upstream}/ HTTP/1.1\r\nHost: {upstream}\r\nProxy-Authorization: {USER_PASS}\r\n\r\n"
    );
    client.write_all(first.as_bytes()).await.unwrap();
    assert!(read_head(&mut client).await.starts_with("HTTP/1.1 200"));
    let mut body = [0u8; 10];
    client.read_exact(&mut body).await.unwrap();

    let second = format!(
        "GET http://{upstream}/ HTTP/1.1\r\nHost: {upstream}\r\nProxy-Authorization: {USER_OTHER}\r\n\r\n"
    );
    client.write_all(second.as_bytes()).await.unwrap();
    assert_eq!(read_to_end(&mut client).await, CHALLENGE);

    proxy.stop().await;
}

#[tokio::test]
async fn missing_credentials_get_exact_challenge() {
    let proxy = Harness::start(None).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(read_to_end(&mut client).await, CHALLENGE);
    assert_eq!(proxy.hasher_calls(), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn bad_password_is_challenged_and_cached() {
    let proxy = Harness::start(None).await;

    for _ in 0..2 {
        let mut client = TcpStream::connect(proxy.addr).await.unwrap();
        let request = format!(
            "GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nProxy-Authorization: {FOO_BAR}\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();
        assert_eq!(read_to_end(&mut client).await, CHALLENGE);
    }
    assert_eq!(proxy.hasher_calls(), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn unknown_user_is_challenged() {
    let proxy = Harness::start(None).await;
    let upstream = echo_upstream();

    // ghost:pass
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let request =
        format!("CONNECT {upstream} HTTP/1.1\r\nProxy-Authorization: Basic Z2hvc3Q6cGFzcw==\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();
    assert_eq!(read_to_end(&mut client).await, CHALLENGE);

    proxy.stop().await;
}

#[tokio::test]
async fn concurrency_cap_refuses_then_recovers() {
    let limiter = Arc::new(RateLimiter::new(RateLimitSettings {
        capacity_bytes: 1_000_000,
        fill_rate_bytes_per_sec: 1_000_000,
        max_connections: 1,
        shard_count: 4,
        block_duration: Duration::from_secs(1),
        cleanup_interval: Duration::from_secs(60),
        idle_timeout: Duration::from_secs(300),
    }));
    let proxy = Harness::start(Some(limiter.clone())).await;
    let upstream = echo_upstream();
    let target = upstream.to_string();

    let (first, head) = open_tunnel(proxy.addr, upstream, BOB_PASS).await;
    assert_eq!(head, "HTTP/1.1 200 Connection Established\r\n\r\n");
    assert_eq!(limiter.active(9, &target), 1);

    let (mut second, head) = open_tunnel(proxy.addr, upstream, BOB_PASS).await;
    assert_eq!(head, "HTTP/1.1 502 Bad Gateway\r\n\r\n");
    assert_eq!(read_to_end(&mut second).await, "");

    drop(first);
    for _ in 0..100 {
        if limiter.active(9, &target) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(limiter.active(9, &target), 0);
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let (mut third, head) = open_tunnel(proxy.addr, upstream, BOB_PASS).await;
    assert_eq!(head, "HTTP/1.1 200 Connection Established\r\n\r\n");
    third.write_all(b"ping").await.unwrap();
    let mut pong = [0u8; 4];
    third.read_exact(&mut pong).await.unwrap();
    assert_eq!(&pong, b"ping");
    drop(third);

    proxy.stop().await;
}

#[tokio::test]
async fn password_change_evicts_cached_verdict() {
    let proxy = Harness::start(None).await;
    let upstream = echo_upstream();

    let (client, head) = open_tunnel(proxy.addr, upstream, ALICE_SECRET).await;
    assert_eq!(head, "HTTP/1.1 200 Connection Established\r\n\r\n");
    drop(client);
    assert_eq!(proxy.hasher_calls(), 1);
    assert!(proxy.verdicts.get("alice").await.is_some());

    let (client, _) = open_tunnel(proxy.addr, upstream, ALICE_SECRET).await;
    drop(client);
    assert_eq!(proxy.hasher_calls(), 1);

    let shutdown = CancellationToken::new();
    let invalidator = PasswordChangeInvalidator::default().attach(proxy.verdicts.clone());
    let processor =
        invalidation_processor("auth-invalidator", Arc::new(proxy.broker.bus()), "USERS", invalidator);
    let task = processor.start(shutdown.clone()).await.unwrap();

    proxy
        .broker
        .bus()
        .produce_event(
            "USERS",
            &UserPasswordChangedEvent {
                username: "alice".into(),
            },
        )
        .await
        .unwrap();
    for _ in 0..100 {
        if proxy.verdicts.get("alice").await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(proxy.verdicts.get("alice").await.is_none());

    let (client, head) = open_tunnel(proxy.addr, upstream, ALICE_SECRET).await;
    assert_eq!(head, "HTTP/1.1 200 Connection Established\r\n\r\n");
    drop(client);
    assert_eq!(proxy.hasher_calls(), 2);

    shutdown.cancel();
    task.await.unwrap();
    proxy.stop().await;
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let proxy = Harness::start(None).await;
    let addr = proxy.addr;
    proxy.stop().await;
    assert!(TcpStream::connect(addr).await.is_err());
}
