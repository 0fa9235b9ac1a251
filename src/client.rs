//! Client mode
//!
//! Optionally negotiates on a control connection, then runs N stream workers
//! with staggered starts and folds their outcomes into one report.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, error, info};

use crate::cancel::{StopHandle, cancelled};
use crate::control::{self, DEFAULT_CONTROL_TIMEOUT};
use crate::error::{Error, Result};
use crate::net::{self, AddressFamily};
use crate::protocol::TestConfig;
use crate::stats::{AggregateReport, IntervalSample, mbps_to_human};
use crate::tcp::TcpConfig;
use crate::worker::{DEFAULT_CONNECT_TIMEOUT, StreamOutcome, StreamWorker};

pub const DEFAULT_STAGGER: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub test: TestConfig,
    /// Negotiate on a control connection first. Off for raw streaming peers.
    pub control: bool,
    /// Delay between consecutive stream starts
    pub stagger: Duration,
    pub connect_timeout: Duration,
    pub control_timeout: Duration,
    pub tcp_nodelay: bool,
    pub window_size: Option<usize>,
    pub address_family: AddressFamily,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            test: TestConfig::default(),
            control: true,
            stagger: DEFAULT_STAGGER,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            tcp_nodelay: false,
            window_size: None,
            address_family: AddressFamily::default(),
        }
    }
}

pub struct Client {
    config: ClientConfig,
    stop: StopHandle,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            stop: StopHandle::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Stop every stream. A stopped client stays stopped.
    pub fn cancel(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run the test to completion and aggregate what the streams produced.
    ///
    /// Control-channel failures abort the run. Stream failures do not: they
    /// are counted in the report and the survivors are aggregated.
    pub async fn run(
        &self,
        progress_tx: Option<mpsc::UnboundedSender<IntervalSample>>,
    ) -> Result<AggregateReport> {
        let test = &self.config.test;
        test.validate()?;

        let control_conn = if self.config.control {
            Some(
                control::negotiate(test, self.config.address_family, self.config.control_timeout)
                    .await?,
            )
        } else {
            None
        };
        let target = match &control_conn {
            Some(conn) => SocketAddr::new(conn.peer().ip(), test.port),
            None => self.resolve_target()?,
        };
        let session = control_conn
            .as_ref()
            .and_then(|c| c.session().map(str::to_string));

        info!(
            "Starting {} test to {}: {} stream(s), {}s",
            test.protocol,
            target,
            test.parallel_streams,
            test.duration.as_secs_f64()
        );

        let shared = Arc::new(test.clone());
        let tcp_config = TcpConfig {
            buffer_size: test.buffer_size,
            nodelay: self.config.tcp_nodelay,
            window_size: self.config.window_size,
        };
        let mut cancel = self.stop.subscribe();
        let started = Instant::now();

        let mut handles = Vec::with_capacity(usize::from(test.parallel_streams));
        for stream_id in 0..u32::from(test.parallel_streams) {
            if stream_id > 0 && !self.config.stagger.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.stagger) => {}
                    _ = cancelled(&mut cancel) => {}
                }
            }
            let worker = StreamWorker::new(stream_id, shared.clone(), target, self.stop.subscribe())
                .with_session(session.clone())
                .with_tcp_config(tcp_config.clone())
                .with_connect_timeout(self.config.connect_timeout)
                .with_progress(progress_tx.clone());
            debug!("Spawning stream {}", stream_id);
            handles.push(tokio::spawn(worker.run()));
        }

        let outcomes = collect_outcomes(futures::future::join_all(handles).await);
        let wall_clock = started.elapsed();

        let ack = match control_conn {
            Some(conn) => Some(conn.close().await),
            None => None,
        };
        let mut report = aggregate(test, wall_clock, outcomes);
        report.server = ack;

        info!(
            "Test finished: {} of {} stream(s) completed, {} total",
            report.streams.len(),
            report.parallel_streams,
            mbps_to_human(report.aggregate_throughput_mbps)
        );
        Ok(report)
    }

    fn resolve_target(&self) -> Result<SocketAddr> {
        let test = &self.config.test;
        let endpoint = format!("{}:{}", test.host, test.port);
        net::resolve_host(&test.host, test.port, self.config.address_family)
            .map_err(|e| Error::connect(&endpoint, e))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::connect(
                    &endpoint,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
                )
            })
    }
}

/// Joined worker tasks, in stream order. A task that panicked or was aborted
/// becomes a failed stream.
fn collect_outcomes(joined: Vec<std::result::Result<StreamOutcome, JoinError>>) -> Vec<StreamOutcome> {
    joined
        .into_iter()
        .zip(0u32..)
        .map(|(joined, stream_id)| {
            joined.unwrap_or_else(|e| {
                error!("Stream {} task panicked: {}", stream_id, e);
                StreamOutcome::Failed {
                    stream_id,
                    error: Error::Task {
                        stream_id,
                        source: e,
                    },
                }
            })
        })
        .collect()
}

/// Fold stream outcomes into a report. Only completed streams contribute to
/// the totals; failed and cancelled ones are counted.
pub fn aggregate(test: &TestConfig, wall_clock: Duration, outcomes: Vec<StreamOutcome>) -> AggregateReport {
    let mut completed = Vec::new();
    let mut failed = 0;
    let mut cancelled = 0;
    for outcome in outcomes {
        match outcome {
            StreamOutcome::Completed(summary) => completed.push(summary),
            StreamOutcome::Cancelled(_) => cancelled += 1,
            StreamOutcome::Failed { .. } => failed += 1,
        }
    }

    let mut report = AggregateReport::from_summaries(
        test.protocol,
        u32::from(test.parallel_streams),
        wall_clock,
        completed,
    );
    report.failed_streams = failed;
    report.cancelled_streams = cancelled;
    report
}
