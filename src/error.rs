//! Error taxonomy for the measurement engine
//!
//! Stream-level errors (`Connect`, `Transfer`) are isolated to the stream
//! that raised them. `Protocol` errors drop a single control or data
//! connection. `Timeout` covers bounded waits on the control channel. `Task`
//! is a stream worker that panicked or was aborted.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transfer failed on stream {stream_id}: {source}")]
    Transfer {
        stream_id: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("stream {stream_id} task did not finish: {source}")]
    Task {
        stream_id: u32,
        #[source]
        source: tokio::task::JoinError,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn connect(addr: impl ToString, source: std::io::Error) -> Self {
        Error::Connect {
            addr: addr.to_string(),
            source,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
