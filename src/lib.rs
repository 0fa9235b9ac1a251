//! bwprobe - TCP/UDP bandwidth measurement engine
//!
//! One engine for both test styles: iperf-style runs that negotiate on a JSON
//! control connection before the data streams start, and nuttcp-style runs
//! that stream straight at a receiver with no handshake.
//!
//! # Library Usage
//!
//! ```no_run
//! use bwprobe::{Client, ClientConfig, TestConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig {
//!         test: TestConfig {
//!             host: "192.168.1.1".to_string(),
//!             parallel_streams: 4,
//!             duration: Duration::from_secs(10),
//!             ..Default::default()
//!         },
//!         ..Default::default()
//!     };
//!
//!     let client = Client::new(config);
//!     let report = client.run(None).await?;
//!
//!     println!("Throughput: {:.2} Mbps", report.aggregate_throughput_mbps);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`client`] - Client-side orchestration of parallel stream workers
//! - [`serve`] - TCP/UDP server and connection dispatch
//! - [`control`] - Control-channel negotiation
//! - [`protocol`] - Wire messages and test parameters
//! - [`tcp`], [`udp`] - Transfer loops
//! - [`session`] - Per-sender UDP session tracking
//! - [`stats`] - Interval sampling and aggregation

pub mod cancel;
pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod net;
pub mod output;
pub mod protocol;
pub mod rate_limit;
pub mod serve;
pub mod session;
pub mod stats;
pub mod tcp;
pub mod udp;
pub mod worker;

pub use cancel::StopHandle;
pub use client::{Client, ClientConfig};
pub use error::{Error, Result};
pub use protocol::{Protocol, TestConfig};
pub use serve::{DispatchMode, Server, ServerConfig, ServerEvent};
pub use stats::{AggregateReport, IntervalSample, StreamSummary};
