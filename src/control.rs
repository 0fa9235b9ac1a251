//! Control channel
//!
//! A single request/response exchange on its own TCP connection before the
//! data phase. The client sends [`TestParams`], the server answers with a
//! [`ServerAck`]. Every read and write is bounded by a timeout.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::net::{self, AddressFamily};
use crate::protocol::{
    DATA_PREAMBLE, PROTOCOL_VERSION, ServerAck, TestConfig, TestParams, decode_line, encode_line,
    versions_compatible,
};

/// Upper bound on a single control line.
pub const MAX_LINE_LENGTH: usize = 8192;
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
/// Streams a single control session may request.
pub const MAX_STREAMS: u16 = 128;
/// Largest per-read buffer a client may ask the server to allocate.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;
/// Longest run a client may request.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

const CLASSIFY_POLL: Duration = Duration::from_millis(5);

/// Read a line with bounded length to prevent memory DoS
pub async fn read_bounded_line<R>(reader: &mut R, buf: &mut String) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut total = 0;
    loop {
        let bytes = reader.fill_buf().await?;
        if bytes.is_empty() {
            return Ok(total);
        }

        if let Some(newline_pos) = bytes.iter().position(|&b| b == b'\n') {
            let to_read = newline_pos + 1;
            if total + to_read > MAX_LINE_LENGTH {
                return Err(Error::protocol("line exceeds maximum length"));
            }
            buf.push_str(utf8(&bytes[..to_read])?);
            reader.consume(to_read);
            return Ok(total + to_read);
        }

        let len = bytes.len();
        if total + len > MAX_LINE_LENGTH {
            return Err(Error::protocol("line exceeds maximum length"));
        }
        buf.push_str(utf8(bytes)?);
        reader.consume(len);
        total += len;
    }
}

fn utf8(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|_| Error::protocol("control line is not UTF-8"))
}

async fn bounded<T, F>(what: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| Error::Timeout { what, after })?
}

/// Client end of an established control session.
///
/// Keep it alive for the whole data phase: the server drops the session's
/// association when this connection closes.
#[derive(Debug)]
pub struct ControlConnection {
    stream: TcpStream,
    peer: SocketAddr,
    ack: ServerAck,
}

impl ControlConnection {
    pub fn ack(&self) -> &ServerAck {
        &self.ack
    }

    /// Resolved server address; data connections reuse its IP.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn session(&self) -> Option<&str> {
        self.ack.session.as_deref()
    }

    pub async fn close(mut self) -> ServerAck {
        let _ = self.stream.shutdown().await;
        self.ack
    }
}

/// Open the control connection and exchange parameters for a run.
pub async fn negotiate(
    config: &TestConfig,
    family: AddressFamily,
    timeout: Duration,
) -> Result<ControlConnection> {
    let endpoint = format!("{}:{}", config.host, config.port);
    let (mut stream, peer) = bounded(
        "control connection",
        timeout,
        async {
            net::connect_tcp(&config.host, config.port, family)
                .await
                .map_err(|e| Error::connect(&endpoint, e))
        },
    )
    .await?;
    debug!("Control connection established to {}", peer);

    let ack = bounded("control handshake", timeout, async {
        let (read_half, mut write_half) = stream.split();
        write_half
            .write_all(encode_line(&config.to_params())?.as_bytes())
            .await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        if read_bounded_line(&mut reader, &mut line).await? == 0 {
            return Err(Error::protocol("server closed control connection"));
        }
        decode_line::<ServerAck>(&line)
    })
    .await?;

    if !versions_compatible(&ack.version, PROTOCOL_VERSION) {
        return Err(Error::protocol(format!(
            "incompatible server version {} (client {})",
            ack.version, PROTOCOL_VERSION
        )));
    }

    info!("Connected to {} ({}, version {})", peer, ack.system, ack.version);
    Ok(ControlConnection { stream, peer, ack })
}

/// Server side of the handshake: read parameters, answer with an ack.
///
/// The returned config uses the client's IP as host and `local_port` as port.
pub async fn accept_control<R, W>(
    reader: &mut R,
    writer: &mut W,
    peer: SocketAddr,
    local_port: u16,
    session: Option<String>,
    timeout: Duration,
) -> Result<TestConfig>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let config = receive_params(reader, peer, local_port, timeout).await?;
    send_ack(writer, session, timeout).await?;
    Ok(config)
}

/// Read and check the client's parameter frame without answering it.
pub async fn receive_params<R>(
    reader: &mut R,
    peer: SocketAddr,
    local_port: u16,
    timeout: Duration,
) -> Result<TestConfig>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = bounded("control parameters", timeout, read_bounded_line(reader, &mut line)).await?;
    if n == 0 {
        return Err(Error::protocol("connection closed before parameters"));
    }

    let params: TestParams = decode_line(&line)?;
    if !params.client_version.is_empty()
        && !versions_compatible(&params.client_version, PROTOCOL_VERSION)
    {
        return Err(Error::protocol(format!(
            "incompatible client version {} (server {})",
            params.client_version, PROTOCOL_VERSION
        )));
    }
    check_limits(&params)?;
    params.to_test_config(net::normalize_ip(peer.ip()).to_string(), local_port)
}

/// Reject requests the server will not allocate or hold a session for.
fn check_limits(params: &TestParams) -> Result<()> {
    if params.parallel > u32::from(MAX_STREAMS) {
        return Err(Error::protocol(format!(
            "too many streams requested: {} (max {})",
            params.parallel, MAX_STREAMS
        )));
    }
    if params.len > MAX_BUFFER_SIZE {
        return Err(Error::protocol(format!(
            "buffer too large: {} bytes (max {})",
            params.len, MAX_BUFFER_SIZE
        )));
    }
    if params.time > MAX_DURATION.as_secs() {
        return Err(Error::protocol(format!(
            "duration too long: {}s (max {}s)",
            params.time,
            MAX_DURATION.as_secs()
        )));
    }
    Ok(())
}

pub async fn send_ack<W>(writer: &mut W, session: Option<String>, timeout: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let ack = ServerAck::new(session);
    bounded("control acknowledgement", timeout, async {
        writer.write_all(encode_line(&ack)?.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    })
    .await
}

/// What an accepted TCP connection turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Starts with a JSON object
    Control,
    /// Starts with the session preamble
    KeyedData,
    /// Anything else: filler from a client that skipped the handshake
    RawData,
    /// Peer closed before sending anything
    Closed,
}

/// Classify from the first bytes seen. `None` means the bytes so far are a
/// strict prefix of the preamble and more are needed.
pub fn classify_prefix(prefix: &[u8]) -> Option<ConnectionKind> {
    let first = *prefix.first()?;
    if first == b'{' {
        return Some(ConnectionKind::Control);
    }
    let preamble = DATA_PREAMBLE.as_bytes();
    let n = prefix.len().min(preamble.len());
    if prefix[..n] != preamble[..n] {
        Some(ConnectionKind::RawData)
    } else if n == preamble.len() {
        Some(ConnectionKind::KeyedData)
    } else {
        None
    }
}

/// Peek at a fresh connection without consuming anything.
pub async fn classify_connection(stream: &TcpStream, timeout: Duration) -> Result<ConnectionKind> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = [0u8; 16];
    loop {
        let n = tokio::time::timeout_at(deadline, stream.peek(&mut buf))
            .await
            .map_err(|_| Error::Timeout {
                what: "connection classification",
                after: timeout,
            })??;
        if n == 0 {
            return Ok(ConnectionKind::Closed);
        }
        if let Some(kind) = classify_prefix(&buf[..n]) {
            return Ok(kind);
        }
        if tokio::time::Instant::now() + CLASSIFY_POLL >= deadline {
            return Err(Error::Timeout {
                what: "connection classification",
                after: timeout,
            });
        }
        tokio::time::sleep(CLASSIFY_POLL).await;
    }
}
