//! Integration tests for bwprobe

use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use bwprobe::client::{Client, ClientConfig};
use bwprobe::net::AddressFamily;
use bwprobe::protocol::{Protocol, ServerAck, TestConfig, data_preamble, decode_line};
use bwprobe::serve::{DispatchMode, Server, ServerConfig, ServerEvent};
use bwprobe::session::ExpiryReason;
use bwprobe::worker::WorkerState;
use bwprobe::{Result, StopHandle};

// Use different ports for each test to avoid conflicts
static PORT_COUNTER: AtomicU16 = AtomicU16::new(16000);

fn get_test_port() -> u16 {
    PORT_COUNTER.fetch_add(10, Ordering::SeqCst)
}

fn server_config(port: u16) -> ServerConfig {
    ServerConfig {
        port,
        bind: Some(IpAddr::from([127, 0, 0, 1])),
        address_family: AddressFamily::V4Only,
        ..Default::default()
    }
}

async fn start_server(
    config: ServerConfig,
    events: Option<mpsc::UnboundedSender<ServerEvent>>,
) -> (StopHandle, JoinHandle<Result<()>>) {
    let server = Server::new(config);
    let stop = server.stop_handle();
    let handle = tokio::spawn(async move { server.run(events).await });

    // Give server time to start
    tokio::time::sleep(Duration::from_millis(100)).await;
    (stop, handle)
}

async fn start_test_server(port: u16) -> (StopHandle, JoinHandle<Result<()>>) {
    start_server(server_config(port), None).await
}

fn client_config(port: u16, protocol: Protocol, streams: u16, duration: Duration) -> ClientConfig {
    ClientConfig {
        test: TestConfig {
            host: "127.0.0.1".to_string(),
            port,
            protocol,
            duration,
            parallel_streams: streams,
            ..Default::default()
        },
        address_family: AddressFamily::V4Only,
        ..Default::default()
    }
}

/// Collect events until `done` says so or the deadline passes.
async fn collect_events<F>(
    rx: &mut mpsc::UnboundedReceiver<ServerEvent>,
    within: Duration,
    mut done: F,
) -> Vec<ServerEvent>
where
    F: FnMut(&[ServerEvent]) -> bool,
{
    let mut events = Vec::new();
    let _ = timeout(within, async {
        while let Some(event) = rx.recv().await {
            events.push(event);
            if done(&events) {
                break;
            }
        }
    })
    .await;
    events
}

#[tokio::test]
async fn test_tcp_single_stream() {
    let port = get_test_port();
    let (stop, _server) = start_test_server(port).await;

    let mut config = client_config(port, Protocol::Tcp, 1, Duration::from_secs(2));
    config.test.buffer_size = 1024 * 1024;

    let client = Client::new(config);
    let result = timeout(Duration::from_secs(10), client.run(None)).await;
    assert!(result.is_ok(), "Test should complete");
    let report = result.unwrap().expect("test should succeed");

    assert_eq!(report.protocol, Protocol::Tcp);
    assert_eq!(report.streams.len(), 1);
    assert_eq!(report.failed_streams, 0);
    assert!(report.total_bytes > 0);
    assert!(report.server.is_some(), "ack should be attached");

    let stream = &report.streams[0];
    assert!(
        (1.8..2.5).contains(&stream.duration_secs),
        "duration was {}",
        stream.duration_secs
    );
    let peer = stream.peer_report.as_ref().expect("receiver should report");
    assert!(peer.end);
    assert_eq!(peer.bytes, stream.total_bytes);

    stop.stop();
}

#[tokio::test]
async fn test_tcp_multi_stream() {
    let port = get_test_port();
    let (stop, _server) = start_test_server(port).await;

    let client = Client::new(client_config(port, Protocol::Tcp, 4, Duration::from_secs(1)));
    let report = timeout(Duration::from_secs(10), client.run(None))
        .await
        .expect("Test should complete")
        .expect("Test should succeed");

    assert_eq!(report.streams.len(), 4, "Should have 4 streams");
    let ids: Vec<u32> = report.streams.iter().map(|s| s.stream_id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
    assert_eq!(
        report.total_bytes,
        report.streams.iter().map(|s| s.total_bytes).sum::<u64>()
    );
    assert!(report.streams.iter().all(|s| s.peer_report.is_some()));

    stop.stop();
}

#[tokio::test]
async fn test_raw_streams_refused() {
    // Nothing listens here
    let port = get_test_port();
    let mut config = client_config(port, Protocol::Tcp, 3, Duration::from_secs(1));
    config.control = false;
    config.stagger = Duration::ZERO;

    let client = Client::new(config);
    let report = timeout(Duration::from_secs(10), client.run(None))
        .await
        .expect("Test should complete")
        .expect("stream failures are not fatal");

    assert!(report.streams.is_empty());
    assert_eq!(report.failed_streams, 3);
    assert_eq!(report.total_bytes, 0);
    assert_eq!(report.aggregate_throughput_mbps, 0.0);
}

#[tokio::test]
async fn test_control_refused_is_error() {
    let port = get_test_port();
    let client = Client::new(client_config(port, Protocol::Tcp, 1, Duration::from_secs(1)));
    let result = timeout(Duration::from_secs(10), client.run(None))
        .await
        .expect("Test should complete");
    assert!(result.is_err(), "control connect failure should fail the run");
}

#[tokio::test]
async fn test_raw_tcp_without_control() {
    let port = get_test_port();
    let (stop, _server) = start_test_server(port).await;

    let mut config = client_config(port, Protocol::Tcp, 2, Duration::from_secs(1));
    config.control = false;

    let client = Client::new(config);
    let report = timeout(Duration::from_secs(10), client.run(None))
        .await
        .expect("Test should complete")
        .expect("Test should succeed");

    assert_eq!(report.streams.len(), 2);
    assert!(report.server.is_none());
    for stream in &report.streams {
        let peer = stream.peer_report.as_ref().expect("receiver should report");
        assert_eq!(peer.bytes, stream.total_bytes);
    }

    stop.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_udp_paced_rate() {
    let port = get_test_port();
    let (stop, _server) = start_test_server(port).await;

    let mut config = client_config(port, Protocol::Udp, 1, Duration::from_secs(3));
    config.test.udp_rate_mbps = Some(10.0);

    let client = Client::new(config);
    let report = timeout(Duration::from_secs(15), client.run(None))
        .await
        .expect("Test should complete")
        .expect("Test should succeed");

    // 10 Mbps of 1400-byte datagrams is ~893 per second
    let packets = report.total_packets().expect("UDP reports packets");
    assert!(
        (2140..=2820).contains(&packets),
        "expected ~2678 packets, got {}",
        packets
    );
    assert_eq!(report.total_bytes, packets * 1400);
    assert!(report.aggregate_throughput_mbps <= 10.5);

    stop.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_udp_session_expires_on_server() {
    let port = get_test_port();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (stop, _server) = start_server(
        ServerConfig {
            session_timeout: Duration::from_millis(500),
            sweep_interval: Duration::from_millis(100),
            ..server_config(port)
        },
        Some(tx),
    )
    .await;

    let mut config = client_config(port, Protocol::Udp, 1, Duration::from_secs(1));
    config.control = false;
    config.test.udp_rate_mbps = Some(1.0);

    let client = Client::new(config);
    let report = timeout(Duration::from_secs(10), client.run(None))
        .await
        .expect("Test should complete")
        .expect("Test should succeed");
    let sent = report.total_packets().unwrap_or(0);
    assert!(sent > 0);

    let events = collect_events(&mut rx, Duration::from_secs(5), |events| {
        events
            .iter()
            .any(|e| matches!(e, ServerEvent::SessionExpired { .. }))
    })
    .await;

    let (reason, summary) = events
        .iter()
        .find_map(|e| match e {
            ServerEvent::SessionExpired {
                reason, summary, ..
            } => Some((*reason, summary.clone())),
            _ => None,
        })
        .expect("session should expire after the sender goes quiet");
    assert_eq!(reason, ExpiryReason::Idle);
    let received = summary.total_packets.unwrap_or(0);
    assert!(received > 0 && received <= sent);
    assert!(summary.duration_secs <= 1.5);

    stop.stop();
}

#[tokio::test]
async fn test_cancel_mid_run() {
    let port = get_test_port();
    let (stop_server, _server) = start_test_server(port).await;

    let client = Client::new(client_config(port, Protocol::Tcp, 2, Duration::from_secs(30)));
    let stop_client = client.stop_handle();
    let handle = tokio::spawn(async move { client.run(None).await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    stop_client.stop();

    let report = timeout(Duration::from_secs(5), handle)
        .await
        .expect("cancel should end the run promptly")
        .expect("task should not panic")
        .expect("cancelled run still reports");
    assert_eq!(report.cancelled_streams, 2);
    assert!(report.streams.is_empty());
    assert_eq!(report.total_bytes, 0);

    stop_server.stop();
}

#[tokio::test]
async fn test_arrival_order_single_stream() {
    let port = get_test_port();
    let (stop, _server) = start_server(
        ServerConfig {
            dispatch: DispatchMode::ArrivalOrder,
            ..server_config(port)
        },
        None,
    )
    .await;

    let client = Client::new(client_config(port, Protocol::Tcp, 1, Duration::from_secs(1)));
    let report = timeout(Duration::from_secs(10), client.run(None))
        .await
        .expect("Test should complete")
        .expect("Test should succeed");

    assert_eq!(report.streams.len(), 1);
    let ack = report.server.as_ref().expect("ack should be attached");
    assert!(ack.session.is_none(), "arrival order hands out no token");
    assert!(report.streams[0].peer_report.is_some());

    stop.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients_keep_sessions_apart() {
    let port = get_test_port();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (stop, _server) = start_server(server_config(port), Some(tx)).await;

    let a = Client::new(client_config(port, Protocol::Tcp, 2, Duration::from_secs(1)));
    let b = Client::new(client_config(port, Protocol::Tcp, 2, Duration::from_secs(1)));
    let (ra, rb) = timeout(Duration::from_secs(15), async { tokio::join!(a.run(None), b.run(None)) })
        .await
        .expect("Tests should complete");
    let (ra, rb) = (ra.expect("client a"), rb.expect("client b"));
    assert_eq!(ra.streams.len(), 2);
    assert_eq!(rb.streams.len(), 2);

    let token_a = ra.server.as_ref().and_then(|s| s.session.clone()).unwrap();
    let token_b = rb.server.as_ref().and_then(|s| s.session.clone()).unwrap();
    assert_ne!(token_a, token_b);

    let events = collect_events(&mut rx, Duration::from_secs(5), |events| {
        events
            .iter()
            .filter(|e| matches!(e, ServerEvent::StreamFinished { .. }))
            .count()
            >= 4
    })
    .await;

    let finished_for = |token: &str| {
        events
            .iter()
            .filter(|e| matches!(
                e,
                ServerEvent::StreamFinished { session: Some(s), state: WorkerState::Completed, .. } if s == token
            ))
            .count()
    };
    assert_eq!(finished_for(&token_a), 2);
    assert_eq!(finished_for(&token_b), 2);

    stop.stop();
}

#[tokio::test]
async fn test_malformed_control_line() {
    let port = get_test_port();
    let (stop, _server) = start_test_server(port).await;

    let mut bad = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    bad.write_all(b"{not json\n").await.unwrap();

    // Server drops the connection without an ack
    let mut buf = Vec::new();
    let read = timeout(Duration::from_secs(5), bad.read_to_end(&mut buf)).await;
    assert!(read.is_ok(), "server should close the malformed connection");
    assert!(buf.is_empty());

    // Listener is still serving
    let client = Client::new(client_config(port, Protocol::Tcp, 1, Duration::from_secs(1)));
    let report = timeout(Duration::from_secs(10), client.run(None))
        .await
        .expect("Test should complete")
        .expect("Test should succeed");
    assert_eq!(report.streams.len(), 1);

    stop.stop();
}

#[tokio::test]
async fn test_out_of_range_params_rejected() {
    let port = get_test_port();
    let (stop, server) = start_test_server(port).await;

    let requests: [&[u8]; 2] = [
        b"{\"tcp\":true,\"time\":1,\"parallel\":1,\"len\":4398046511104}\n",
        b"{\"tcp\":true,\"time\":18446744073709551615,\"parallel\":1,\"len\":1024}\n",
    ];
    for request in requests {
        let mut conn = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        conn.write_all(request).await.unwrap();

        // Closed without handing out a token
        let mut buf = Vec::new();
        let read = timeout(Duration::from_secs(5), conn.read_to_end(&mut buf)).await;
        assert!(read.is_ok(), "server should close the connection");
        assert!(buf.is_empty(), "got ack: {}", String::from_utf8_lossy(&buf));
    }

    assert!(!server.is_finished(), "server should survive bad parameters");
    let client = Client::new(client_config(port, Protocol::Tcp, 1, Duration::from_secs(1)));
    let report = timeout(Duration::from_secs(10), client.run(None))
        .await
        .expect("Test should complete")
        .expect("Test should succeed");
    assert_eq!(report.streams.len(), 1);

    stop.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_token_valid_as_soon_as_acked() {
    let port = get_test_port();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (stop, _server) = start_server(server_config(port), Some(tx)).await;

    let control = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (read_half, mut write_half) = control.into_split();
    write_half
        .write_all(b"{\"tcp\":true,\"time\":1,\"parallel\":1,\"len\":1024}\n")
        .await
        .unwrap();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("ack should arrive")
        .unwrap();
    let ack: ServerAck = decode_line(&line).unwrap();
    let token = ack.session.expect("token dispatch hands out a session");

    // No pause between the ack and the first data connection
    let mut data = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    data.write_all(data_preamble(&token).as_bytes()).await.unwrap();
    data.write_all(&[b'X'; 4096]).await.unwrap();
    data.shutdown().await.unwrap();
    let mut end = Vec::new();
    let _ = timeout(Duration::from_secs(5), data.read_to_end(&mut end)).await;

    let events = collect_events(&mut rx, Duration::from_secs(5), |events| {
        events.iter().any(|e| {
            matches!(e, ServerEvent::StreamFinished { .. } | ServerEvent::StreamFailed { .. })
        })
    })
    .await;
    let finished = events.iter().find_map(|e| match e {
        ServerEvent::StreamFinished {
            session, summary, ..
        } => Some((session.clone(), summary.total_bytes)),
        _ => None,
    });
    let (session, bytes) = finished.expect("data connection should be accepted");
    assert_eq!(session.as_deref(), Some(token.as_str()));
    assert_eq!(bytes, 4096);

    drop(write_half);
    stop.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_graceful_shutdown() {
    let port = get_test_port();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (stop, server) = start_server(server_config(port), Some(tx)).await;

    let mut config = client_config(port, Protocol::Tcp, 1, Duration::from_secs(30));
    config.control = false;
    let client = Client::new(config);
    let stop_client = client.stop_handle();
    let client_task = tokio::spawn(async move { client.run(None).await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    stop.stop();

    let result = timeout(Duration::from_secs(5), server)
        .await
        .expect("server should stop within its grace period")
        .expect("server task should not panic");
    assert!(result.is_ok());

    let events = collect_events(&mut rx, Duration::from_secs(2), |events| {
        events
            .iter()
            .any(|e| matches!(e, ServerEvent::StreamFinished { .. }))
    })
    .await;
    let state = events.iter().find_map(|e| match e {
        ServerEvent::StreamFinished { state, summary, .. } => Some((*state, summary.total_bytes)),
        _ => None,
    });
    let (state, bytes) = state.expect("in-flight stream should be summarized");
    assert_eq!(state, WorkerState::Cancelled);
    assert!(bytes > 0);

    stop_client.stop();
    let _ = timeout(Duration::from_secs(5), client_task).await;
}
