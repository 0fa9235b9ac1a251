//! Control-channel wire format and test parameters
//!
//! Every control frame is a single JSON object terminated by `\n`. The client
//! sends [`TestParams`], the server answers with [`ServerAck`]. After a TCP
//! receiver sees the sender close, it writes one [`EndSummary`] back on the
//! data connection.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Version advertised in `client_version` and the server's `version` field.
pub const PROTOCOL_VERSION: &str = "3.9";
pub const DEFAULT_PORT: u16 = 5201;
/// First bytes of a data connection that belongs to a negotiated session.
pub const DATA_PREAMBLE: &str = "SESSION ";

/// Check if two protocol versions are compatible.
///
/// Major versions must match exactly; minor differences are tolerated.
pub fn versions_compatible(version_a: &str, version_b: &str) -> bool {
    let major_a = version_a.split('.').next().unwrap_or("0");
    let major_b = version_b.split('.').next().unwrap_or("0");
    major_a == major_b
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(format!("Invalid protocol: {} (expected tcp or udp)", s)),
        }
    }
}

/// Parameters of one measurement run. Shared read-only once the run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct TestConfig {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub duration: Duration,
    pub parallel_streams: u16,
    pub buffer_size: usize,
    /// Per-stream UDP target rate; `None` or zero sends unpaced.
    pub udp_rate_mbps: Option<f64>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            protocol: Protocol::Tcp,
            duration: Duration::from_secs(10),
            parallel_streams: 1,
            buffer_size: 128 * 1024,
            udp_rate_mbps: None,
        }
    }
}

impl TestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".to_string()));
        }
        if self.parallel_streams == 0 {
            return Err(Error::Config(
                "at least one parallel stream is required".to_string(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(Error::Config("buffer size must be non-zero".to_string()));
        }
        if self.duration.is_zero() {
            return Err(Error::Config("duration must be non-zero".to_string()));
        }
        if let Some(rate) = self.udp_rate_mbps
            && (!rate.is_finite() || rate < 0.0)
        {
            return Err(Error::Config(format!("invalid UDP rate: {}", rate)));
        }
        Ok(())
    }

    pub fn to_params(&self) -> TestParams {
        TestParams {
            tcp: self.protocol == Protocol::Tcp,
            udp: self.protocol == Protocol::Udp,
            omit: 0,
            time: self.duration.as_secs().max(1),
            parallel: u32::from(self.parallel_streams),
            len: self.buffer_size,
            client_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// Client → server parameter frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestParams {
    #[serde(default)]
    pub tcp: bool,
    #[serde(default)]
    pub udp: bool,
    #[serde(default)]
    pub omit: i64,
    pub time: u64,
    pub parallel: u32,
    pub len: usize,
    #[serde(default)]
    pub client_version: String,
}

impl TestParams {
    pub fn protocol(&self) -> Protocol {
        if self.udp && !self.tcp {
            Protocol::Udp
        } else {
            Protocol::Tcp
        }
    }

    /// Rebuild the run configuration on the server side. The client's address
    /// and the server's own port stand in for host and port.
    pub fn to_test_config(&self, host: String, port: u16) -> Result<TestConfig> {
        if self.tcp && self.udp {
            return Err(Error::protocol("both tcp and udp requested"));
        }
        let config = TestConfig {
            host,
            port,
            protocol: self.protocol(),
            duration: Duration::from_secs(self.time),
            parallel_streams: u16::try_from(self.parallel)
                .map_err(|_| Error::protocol(format!("too many streams: {}", self.parallel)))?,
            buffer_size: self.len,
            udp_rate_mbps: None,
        };
        config
            .validate()
            .map_err(|e| Error::protocol(format!("rejected parameters: {}", e)))?;
        Ok(config)
    }
}

/// Server → client acknowledgement frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerAck {
    pub version: String,
    pub system: String,
    pub timestamp: i64,
    /// Token that data connections present in their preamble.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl ServerAck {
    pub fn new(session: Option<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            system: format!(
                "bwprobe/{} ({})",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS
            ),
            timestamp: chrono::Utc::now().timestamp(),
            session,
        }
    }
}

/// Receiver's end-of-test report, written on the data connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndSummary {
    pub end: bool,
    pub bytes: u64,
    pub duration: f64,
    pub bits_per_second: f64,
}

impl EndSummary {
    pub fn new(bytes: u64, duration: Duration) -> Self {
        let secs = duration.as_secs_f64();
        let bits_per_second = if secs > 0.0 {
            bytes as f64 * 8.0 / secs
        } else {
            0.0
        };
        Self {
            end: true,
            bytes,
            duration: secs,
            bits_per_second,
        }
    }
}

/// Serialize a frame as a single newline-terminated JSON line.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Parse a single frame. Malformed input is a protocol error.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim())
        .map_err(|e| Error::protocol(format!("malformed frame: {}", e)))
}

pub fn data_preamble(token: &str) -> String {
    format!("{}{}\n", DATA_PREAMBLE, token)
}

/// Extract the session token from a preamble line.
pub fn parse_data_preamble(line: &str) -> Option<&str> {
    line.trim_end_matches(['\r', '\n'])
        .strip_prefix(DATA_PREAMBLE)
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
