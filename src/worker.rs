//! Client-side stream workers
//!
//! One worker owns one data connection (TCP) or one send loop (UDP) and walks
//! `Connecting -> Active -> {Completed, Failed, Cancelled}`. Leaving `Active`
//! produces exactly one outcome; only `Failed` carries no summary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::Error;
use crate::net;
use crate::protocol::{Protocol, TestConfig, data_preamble};
use crate::rate_limit::RateLimiter;
use crate::stats::{IntervalSample, IntervalSampler, StreamSummary};
use crate::tcp::{self, TcpConfig};
use crate::udp::{self, UDP_PAYLOAD_SIZE};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkerState::Completed | WorkerState::Failed | WorkerState::Cancelled
        )
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::Connecting => "connecting",
            WorkerState::Active => "active",
            WorkerState::Completed => "completed",
            WorkerState::Failed => "failed",
            WorkerState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// How a transfer loop ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Duration elapsed or the peer closed
    Finished,
    /// Stop flag observed
    Cancelled,
}

impl LoopExit {
    pub fn state(self) -> WorkerState {
        match self {
            LoopExit::Finished => WorkerState::Completed,
            LoopExit::Cancelled => WorkerState::Cancelled,
        }
    }
}

#[derive(Debug)]
pub enum StreamOutcome {
    Completed(StreamSummary),
    Cancelled(StreamSummary),
    Failed { stream_id: u32, error: Error },
}

impl StreamOutcome {
    pub fn state(&self) -> WorkerState {
        match self {
            StreamOutcome::Completed(_) => WorkerState::Completed,
            StreamOutcome::Cancelled(_) => WorkerState::Cancelled,
            StreamOutcome::Failed { .. } => WorkerState::Failed,
        }
    }

    pub fn stream_id(&self) -> u32 {
        match self {
            StreamOutcome::Completed(s) | StreamOutcome::Cancelled(s) => s.stream_id,
            StreamOutcome::Failed { stream_id, .. } => *stream_id,
        }
    }

    pub fn summary(&self) -> Option<&StreamSummary> {
        match self {
            StreamOutcome::Completed(s) | StreamOutcome::Cancelled(s) => Some(s),
            StreamOutcome::Failed { .. } => None,
        }
    }
}

pub struct StreamWorker {
    stream_id: u32,
    config: Arc<TestConfig>,
    target: SocketAddr,
    tcp: TcpConfig,
    session: Option<String>,
    connect_timeout: Duration,
    cancel: watch::Receiver<bool>,
    progress: Option<mpsc::UnboundedSender<IntervalSample>>,
    state: WorkerState,
}

impl StreamWorker {
    pub fn new(
        stream_id: u32,
        config: Arc<TestConfig>,
        target: SocketAddr,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let tcp = TcpConfig {
            buffer_size: config.buffer_size,
            ..TcpConfig::default()
        };
        Self {
            stream_id,
            config,
            target,
            tcp,
            session: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            cancel,
            progress: None,
            state: WorkerState::Connecting,
        }
    }

    /// Session token to present in the data preamble.
    pub fn with_session(mut self, token: Option<String>) -> Self {
        self.session = token;
        self
    }

    pub fn with_tcp_config(mut self, tcp: TcpConfig) -> Self {
        self.tcp = tcp;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_progress(mut self, progress: Option<mpsc::UnboundedSender<IntervalSample>>) -> Self {
        self.progress = progress;
        self
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub async fn run(mut self) -> StreamOutcome {
        let outcome = match self.config.protocol {
            Protocol::Tcp => self.run_tcp().await,
            Protocol::Udp => self.run_udp().await,
        };
        self.transition(outcome.state());
        if let StreamOutcome::Failed { error, .. } = &outcome {
            warn!("Stream {} failed: {}", self.stream_id, error);
        }
        outcome
    }

    fn transition(&mut self, next: WorkerState) {
        if self.state != next {
            debug!("Stream {}: {} -> {}", self.stream_id, self.state, next);
            self.state = next;
        }
    }

    fn failed(&self, error: Error) -> StreamOutcome {
        StreamOutcome::Failed {
            stream_id: self.stream_id,
            error,
        }
    }

    fn concluded(exit: LoopExit, summary: StreamSummary) -> StreamOutcome {
        match exit {
            LoopExit::Finished => StreamOutcome::Completed(summary),
            LoopExit::Cancelled => StreamOutcome::Cancelled(summary),
        }
    }

    fn sample_sink(&self) -> impl FnMut(&IntervalSample) + use<> {
        let progress = self.progress.clone();
        move |sample: &IntervalSample| {
            if let Some(tx) = &progress {
                let _ = tx.send(sample.clone());
            }
        }
    }

    async fn connect_tcp(&self) -> Result<TcpStream, Error> {
        let stream = match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(self.target),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::connect(self.target, e)),
            Err(_) => {
                return Err(Error::Timeout {
                    what: "data connection",
                    after: self.connect_timeout,
                });
            }
        };
        tcp::configure_stream(&stream, &self.tcp).map_err(|e| Error::connect(self.target, e))?;
        Ok(stream)
    }

    async fn run_tcp(&mut self) -> StreamOutcome {
        if *self.cancel.borrow() {
            return StreamOutcome::Cancelled(self.empty_summary());
        }

        let mut stream = match self.connect_tcp().await {
            Ok(stream) => stream,
            Err(e) => return self.failed(e),
        };
        if let Some(token) = &self.session
            && let Err(e) = stream.write_all(data_preamble(token).as_bytes()).await
        {
            return self.failed(Error::connect(self.target, e));
        }

        self.transition(WorkerState::Active);
        let mut sampler = IntervalSampler::new(self.stream_id, Protocol::Tcp, Instant::now());
        let result = tcp::send_data(
            &mut stream,
            &mut sampler,
            self.config.duration,
            self.tcp.buffer_size,
            self.cancel.clone(),
            self.sample_sink(),
        )
        .await;
        let finished_at = Instant::now();

        match result {
            Ok(exit) => {
                let mut summary = sampler.finish(finished_at);
                summary.peer_report =
                    tcp::finish_send(stream, self.stream_id, exit == LoopExit::Finished).await;
                Self::concluded(exit, summary)
            }
            Err(source) => self.failed(Error::Transfer {
                stream_id: self.stream_id,
                source,
            }),
        }
    }

    async fn run_udp(&mut self) -> StreamOutcome {
        if *self.cancel.borrow() {
            return StreamOutcome::Cancelled(self.empty_summary());
        }

        let socket = match net::create_udp_socket_for_remote(self.target) {
            Ok(socket) => socket,
            Err(e) => return self.failed(Error::connect(self.target, e)),
        };

        self.transition(WorkerState::Active);
        let limiter = RateLimiter::new(self.config.udp_rate_mbps.unwrap_or(0.0), UDP_PAYLOAD_SIZE);
        let mut sampler = IntervalSampler::new(self.stream_id, Protocol::Udp, Instant::now());
        let result = udp::send_paced(
            &socket,
            self.target,
            &mut sampler,
            self.config.duration,
            limiter,
            self.cancel.clone(),
            self.sample_sink(),
        )
        .await;

        match result {
            Ok(exit) => Self::concluded(exit, sampler.finish(Instant::now())),
            Err(source) => self.failed(Error::Transfer {
                stream_id: self.stream_id,
                source,
            }),
        }
    }

    fn empty_summary(&self) -> StreamSummary {
        let now = Instant::now();
        IntervalSampler::new(self.stream_id, self.config.protocol, now).finish(now)
    }
}
