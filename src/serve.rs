//! Server mode
//!
//! One TCP listener and one UDP socket share the configured port. Each
//! accepted TCP connection gets its own task and is classified as control,
//! keyed data or raw data. All datagrams go through a single dispatch task
//! that owns the UDP session registry.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::{StopHandle, cancelled};
use crate::control::{self, ConnectionKind, DEFAULT_CONTROL_TIMEOUT, read_bounded_line};
use crate::error::{Error, Result};
use crate::net::{self, AddressFamily};
use crate::protocol::{DEFAULT_PORT, Protocol, TestConfig, parse_data_preamble};
use crate::session::{DEFAULT_SESSION_TIMEOUT, ExpiryReason, SessionEvent, SessionRegistry};
use crate::stats::{IntervalSample, IntervalSampler, StreamSummary, bytes_to_human, mbps_to_human};
use crate::tcp::{self, DEFAULT_BUFFER_SIZE};
use crate::udp::{self, DEFAULT_SWEEP_INTERVAL};
use crate::worker::{LoopExit, WorkerState};

/// How long past its requested duration a control session stays associated.
const CONTROL_HOLD_SLACK: Duration = Duration::from_secs(30);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How data connections are matched to the control session that set them up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchMode {
    /// The ack carries a session token; data connections present it first.
    #[default]
    Token,
    /// Odd-numbered connections are control, even-numbered are data, keyed by
    /// client IP. Breaks down as soon as two clients or more than one stream
    /// interleave their connections.
    ArrivalOrder,
}

impl std::str::FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "token" => Ok(DispatchMode::Token),
            "arrival-order" | "arrival" | "legacy" => Ok(DispatchMode::ArrivalOrder),
            _ => Err(format!("Invalid dispatch mode: {} (expected token or arrival-order)", s)),
        }
    }
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchMode::Token => write!(f, "token"),
            DispatchMode::ArrivalOrder => write!(f, "arrival-order"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Explicit bind address; otherwise the family's wildcard
    pub bind: Option<IpAddr>,
    pub address_family: AddressFamily,
    pub tcp: bool,
    pub udp: bool,
    /// Read buffer for raw data connections and the UDP receive buffer
    pub buffer_size: usize,
    pub dispatch: DispatchMode,
    pub session_timeout: Duration,
    pub sweep_interval: Duration,
    pub control_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: None,
            address_family: AddressFamily::default(),
            tcp: true,
            udp: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            dispatch: DispatchMode::default(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Progress and results reported while the server runs.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ControlAccepted {
        peer: SocketAddr,
        session: Option<String>,
        config: TestConfig,
    },
    Interval {
        peer: SocketAddr,
        sample: IntervalSample,
    },
    StreamFinished {
        peer: SocketAddr,
        session: Option<String>,
        state: WorkerState,
        summary: StreamSummary,
    },
    StreamFailed {
        peer: SocketAddr,
        stream_id: u32,
        error: String,
    },
    SessionExpired {
        peer: SocketAddr,
        reason: ExpiryReason,
        summary: StreamSummary,
    },
}

impl From<SessionEvent> for ServerEvent {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::Sample { remote, sample } => ServerEvent::Interval {
                peer: remote,
                sample,
            },
            SessionEvent::Expired(session) => ServerEvent::SessionExpired {
                peer: session.remote,
                reason: session.reason,
                summary: session.summary,
            },
        }
    }
}

/// Parameters negotiated on a control connection, shared with its data
/// connections.
struct DataSession {
    key: String,
    token: Option<String>,
    config: TestConfig,
    next_stream_id: AtomicU32,
}

impl DataSession {
    fn next_stream_id(&self) -> u32 {
        self.next_stream_id.fetch_add(1, Ordering::Relaxed)
    }
}

type SessionTable = Arc<Mutex<HashMap<String, Arc<DataSession>>>>;

/// Keeps a session in the table until dropped.
struct Registration {
    sessions: SessionTable,
    session: Arc<DataSession>,
}

impl Registration {
    fn insert(sessions: &SessionTable, session: Arc<DataSession>) -> Self {
        sessions
            .lock()
            .insert(session.key.clone(), session.clone());
        Self {
            sessions: sessions.clone(),
            session,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut sessions = self.sessions.lock();
        // A later control connection from the same IP may own the key now
        if sessions
            .get(&self.session.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.session))
        {
            sessions.remove(&self.session.key);
        }
    }
}

struct ServerContext {
    config: ServerConfig,
    sessions: SessionTable,
    events: Option<mpsc::UnboundedSender<ServerEvent>>,
    stop: StopHandle,
    raw_stream_ids: AtomicU32,
}

impl ServerContext {
    fn emit(&self, event: ServerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

pub struct Server {
    config: ServerConfig,
    stop: StopHandle,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            stop: StopHandle::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handle that stops the server from another task.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Serve until stopped. In-flight handlers get `shutdown_grace` to emit
    /// their final summaries before they are aborted.
    pub async fn run(&self, events: Option<mpsc::UnboundedSender<ServerEvent>>) -> Result<()> {
        let config = &self.config;
        if !config.tcp && !config.udp {
            return Err(Error::Config(
                "at least one of TCP or UDP must be enabled".to_string(),
            ));
        }

        let addr = config.address_family.listen_addr(config.bind, config.port);
        let listener = config
            .tcp
            .then(|| net::create_tcp_listener(addr, config.address_family))
            .transpose()?;
        let udp_socket = config
            .udp
            .then(|| net::create_udp_socket(addr, config.address_family, Some(config.buffer_size)))
            .transpose()?;
        info!("Dispatch mode: {}", config.dispatch);

        let ctx = Arc::new(ServerContext {
            config: config.clone(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            events,
            stop: self.stop.clone(),
            raw_stream_ids: AtomicU32::new(0),
        });
        let mut tasks = JoinSet::new();

        if let Some(socket) = udp_socket {
            let ctx = ctx.clone();
            tasks.spawn(async move {
                let mut registry = SessionRegistry::new(ctx.config.session_timeout);
                udp::serve_datagrams(
                    &socket,
                    &mut registry,
                    ctx.config.sweep_interval,
                    ctx.stop.subscribe(),
                    |event| ctx.emit(event.into()),
                )
                .await;
            });
        }

        let mut cancel = self.stop.subscribe();
        if let Some(listener) = listener {
            let mut ordinal: u64 = 0;
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            ordinal += 1;
                            debug!("Accepted {} (connection #{})", peer, ordinal);
                            let ctx = ctx.clone();
                            tasks.spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, ordinal, ctx).await {
                                    warn!("Connection from {} dropped: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    },
                    _ = cancelled(&mut cancel) => break,
                }
                while tasks.try_join_next().is_some() {}
            }
        } else {
            cancelled(&mut cancel).await;
        }

        info!("Server stopping, waiting up to {:?} for {} task(s)", config.shutdown_grace, tasks.len());
        let drained = tokio::time::timeout(config.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Aborting {} task(s) still running after grace period", tasks.len());
            tasks.shutdown().await;
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ordinal: u64,
    ctx: Arc<ServerContext>,
) -> Result<()> {
    let peer = net::normalize_addr(peer);
    let kind = match ctx.config.dispatch {
        DispatchMode::ArrivalOrder if ordinal % 2 == 1 => ConnectionKind::Control,
        DispatchMode::ArrivalOrder => ConnectionKind::RawData,
        DispatchMode::Token => {
            control::classify_connection(&stream, ctx.config.control_timeout).await?
        }
    };
    debug!("Connection #{} from {} classified as {:?}", ordinal, peer, kind);

    match kind {
        ConnectionKind::Control => handle_control(stream, peer, ctx).await,
        ConnectionKind::KeyedData => handle_keyed_data(stream, peer, ctx).await,
        ConnectionKind::RawData => {
            // Only arrival-order sessions are keyed by client IP
            let session = match ctx.config.dispatch {
                DispatchMode::ArrivalOrder => ctx.sessions.lock().get(&peer.ip().to_string()).cloned(),
                DispatchMode::Token => None,
            };
            let (read_half, write_half) = stream.into_split();
            handle_data(read_half, write_half, peer, session, ctx).await
        }
        ConnectionKind::Closed => {
            debug!("{} closed before sending anything", peer);
            Ok(())
        }
    }
}

async fn handle_control(stream: TcpStream, peer: SocketAddr, ctx: Arc<ServerContext>) -> Result<()> {
    let token = match ctx.config.dispatch {
        DispatchMode::Token => Some(Uuid::new_v4().to_string()),
        DispatchMode::ArrivalOrder => None,
    };
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let timeout = ctx.config.control_timeout;
    let config = control::receive_params(&mut reader, peer, ctx.config.port, timeout).await?;

    info!(
        "Control session from {}: {} x{} for {}s, {} byte buffer",
        peer,
        config.protocol,
        config.parallel_streams,
        config.duration.as_secs(),
        config.buffer_size
    );

    let key = token.clone().unwrap_or_else(|| peer.ip().to_string());
    // Registered before the token goes out so a fast data connection finds it
    let _registration = Registration::insert(
        &ctx.sessions,
        Arc::new(DataSession {
            key: key.clone(),
            token: token.clone(),
            config: config.clone(),
            next_stream_id: AtomicU32::new(0),
        }),
    );
    control::send_ack(&mut write_half, token.clone(), timeout).await?;
    ctx.emit(ServerEvent::ControlAccepted {
        peer,
        session: token,
        config: config.clone(),
    });

    // Hold the association until the client hangs up
    let hold = config.duration.saturating_add(CONTROL_HOLD_SLACK);
    let mut cancel = ctx.stop.subscribe();
    let mut sink = [0u8; 256];
    tokio::select! {
        _ = async {
            while let Ok(n) = reader.read(&mut sink).await {
                if n == 0 {
                    break;
                }
            }
        } => debug!("Control connection from {} closed", peer),
        _ = tokio::time::sleep(hold) => debug!("Control session {} exceeded {:?}", key, hold),
        _ = cancelled(&mut cancel) => {}
    }

    Ok(())
}

async fn handle_keyed_data(stream: TcpStream, peer: SocketAddr, ctx: Arc<ServerContext>) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let timeout = ctx.config.control_timeout;
    tokio::time::timeout(timeout, read_bounded_line(&mut reader, &mut line))
        .await
        .map_err(|_| Error::Timeout {
            what: "data preamble",
            after: timeout,
        })??;

    let token = parse_data_preamble(&line).ok_or_else(|| Error::protocol("malformed data preamble"))?;
    let session = ctx
        .sessions
        .lock()
        .get(token)
        .cloned()
        .ok_or_else(|| Error::protocol(format!("unknown session token {}", token)))?;

    handle_data(reader, write_half, peer, Some(session), ctx).await
}

async fn handle_data<R>(
    mut reader: R,
    mut writer: OwnedWriteHalf,
    peer: SocketAddr,
    session: Option<Arc<DataSession>>,
    ctx: Arc<ServerContext>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let (stream_id, buffer_size) = match &session {
        Some(s) => (s.next_stream_id(), s.config.buffer_size),
        None => (
            ctx.raw_stream_ids.fetch_add(1, Ordering::Relaxed),
            ctx.config.buffer_size,
        ),
    };
    match &session {
        Some(s) => info!("Data connection from {} (session {}, stream {})", peer, s.key, stream_id),
        None => info!("Data connection from {} (stream {}, no session)", peer, stream_id),
    }

    let mut sampler = IntervalSampler::new(stream_id, Protocol::Tcp, Instant::now());
    let result = tcp::receive_data(
        &mut reader,
        &mut sampler,
        buffer_size,
        ctx.stop.subscribe(),
        |sample| {
            debug!(
                "[{}] stream {}: {} in last interval, {}",
                peer,
                sample.stream_id,
                bytes_to_human(sample.bytes),
                mbps_to_human(sample.throughput_mbps)
            );
            ctx.emit(ServerEvent::Interval {
                peer,
                sample: sample.clone(),
            });
        },
    )
    .await;
    let summary = sampler.finish(Instant::now());

    match result {
        Ok(exit) => {
            if exit == LoopExit::Finished {
                tcp::send_end_summary(&mut writer, &summary).await;
            }
            info!(
                "Data connection {} closed: {} in {:.2}s, avg {}",
                peer,
                bytes_to_human(summary.total_bytes),
                summary.duration_secs,
                mbps_to_human(summary.average_throughput_mbps)
            );
            ctx.emit(ServerEvent::StreamFinished {
                peer,
                session: session.as_ref().and_then(|s| s.token.clone()),
                state: exit.state(),
                summary,
            });
            Ok(())
        }
        Err(source) => {
            ctx.emit(ServerEvent::StreamFailed {
                peer,
                stream_id,
                error: source.to_string(),
            });
            Err(Error::Transfer { stream_id, source })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_mode_from_str() {
        assert_eq!("token".parse::<DispatchMode>(), Ok(DispatchMode::Token));
        assert_eq!(
            "arrival-order".parse::<DispatchMode>(),
            Ok(DispatchMode::ArrivalOrder)
        );
        assert!("parity".parse::<DispatchMode>().is_err());
        assert_eq!(DispatchMode::ArrivalOrder.to_string(), "arrival-order");
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.tcp && config.udp);
        assert_eq!(config.dispatch, DispatchMode::Token);
        assert_eq!(config.session_timeout, Duration::from_secs(5));
        assert_eq!(config.shutdown_grace, Duration::from_secs(2));
    }

    #[test]
    fn test_session_event_conversion() {
        let start = Instant::now();
        let remote: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let summary = IntervalSampler::new(0, Protocol::Udp, start).finish(start);
        let event: ServerEvent = SessionEvent::Expired(crate::session::ExpiredSession {
            remote,
            reason: ExpiryReason::Idle,
            summary,
        })
        .into();
        assert!(matches!(
            event,
            ServerEvent::SessionExpired {
                reason: ExpiryReason::Idle,
                ..
            }
        ));
    }

    fn data_session(key: &str) -> Arc<DataSession> {
        Arc::new(DataSession {
            key: key.to_string(),
            token: Some(key.to_string()),
            config: TestConfig::default(),
            next_stream_id: AtomicU32::new(0),
        })
    }

    #[test]
    fn test_registration_removed_on_drop() {
        let sessions = SessionTable::default();
        let registration = Registration::insert(&sessions, data_session("tok"));
        assert!(sessions.lock().contains_key("tok"));
        drop(registration);
        assert!(sessions.lock().is_empty());
    }

    #[test]
    fn test_registration_keeps_newer_owner() {
        let sessions = SessionTable::default();
        let first = Registration::insert(&sessions, data_session("10.0.0.1"));
        let second = Registration::insert(&sessions, data_session("10.0.0.1"));
        drop(first);
        assert!(sessions.lock().contains_key("10.0.0.1"));
        drop(second);
        assert!(sessions.lock().is_empty());
    }

    #[tokio::test]
    async fn test_run_requires_a_protocol() {
        let server = Server::new(ServerConfig {
            tcp: false,
            udp: false,
            ..Default::default()
        });
        assert!(matches!(server.run(None).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_stop_before_traffic() {
        let server = Server::new(ServerConfig {
            port: 0,
            bind: Some(IpAddr::from([127, 0, 0, 1])),
            address_family: AddressFamily::V4Only,
            ..Default::default()
        });
        let stop = server.stop_handle();
        let handle = tokio::spawn(async move { server.run(None).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.stop();

        let result = tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
