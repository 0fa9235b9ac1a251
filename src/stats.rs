use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{EndSummary, Protocol, ServerAck};

/// Fixed reporting interval for throughput samples.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

pub fn throughput_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (bytes as f64 * 8.0) / (secs * 1_000_000.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntervalSample {
    pub stream_id: u32,
    pub timestamp: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packets: Option<u64>,
    pub throughput_mbps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamSummary {
    pub stream_id: u32,
    pub total_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_packets: Option<u64>,
    pub duration_secs: f64,
    pub average_throughput_mbps: f64,
    pub intervals: Vec<IntervalSample>,
    /// End-of-test report the receiving peer sent back, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_report: Option<EndSummary>,
}

/// Per-stream accumulator. Owned by exactly one worker (or one UDP session),
/// so it needs no synchronisation.
#[derive(Debug)]
pub struct IntervalSampler {
    stream_id: u32,
    protocol: Protocol,
    start: Instant,
    wall_start: DateTime<Utc>,
    last_emit: Instant,
    interval_bytes: u64,
    interval_packets: u64,
    total_bytes: u64,
    total_packets: u64,
    samples: Vec<IntervalSample>,
}

impl IntervalSampler {
    pub fn new(stream_id: u32, protocol: Protocol, start: Instant) -> Self {
        Self {
            stream_id,
            protocol,
            start,
            wall_start: Utc::now(),
            last_emit: start,
            interval_bytes: 0,
            interval_packets: 0,
            total_bytes: 0,
            total_packets: 0,
            samples: Vec::new(),
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn total_packets(&self) -> u64 {
        self.total_packets
    }

    pub fn record(&mut self, bytes: u64, packets: u64) {
        self.interval_bytes += bytes;
        self.interval_packets += packets;
        self.total_bytes += bytes;
        self.total_packets += packets;
    }

    /// Emit a sample if a full interval has passed since the last one.
    ///
    /// Throughput uses the real elapsed span, not the nominal interval. A
    /// window without traffic produces nothing and keeps accumulating.
    pub fn tick(&mut self, now: Instant) -> Option<IntervalSample> {
        let since_last = now.saturating_duration_since(self.last_emit);
        if since_last.is_zero() || since_last < SAMPLE_INTERVAL {
            return None;
        }
        if self.interval_bytes == 0 && self.interval_packets == 0 {
            return None;
        }

        let elapsed = now.saturating_duration_since(self.start);
        let sample = IntervalSample {
            stream_id: self.stream_id,
            timestamp: self.wall_clock(elapsed),
            elapsed_secs: elapsed.as_secs_f64(),
            bytes: self.interval_bytes,
            packets: self.packet_count(self.interval_packets),
            throughput_mbps: throughput_mbps(self.interval_bytes, since_last),
        };

        self.interval_bytes = 0;
        self.interval_packets = 0;
        self.last_emit = now;
        self.samples.push(sample.clone());
        Some(sample)
    }

    pub fn finish(self, now: Instant) -> StreamSummary {
        let duration = now.saturating_duration_since(self.start);
        StreamSummary {
            stream_id: self.stream_id,
            total_bytes: self.total_bytes,
            total_packets: self.packet_count(self.total_packets),
            duration_secs: duration.as_secs_f64(),
            average_throughput_mbps: throughput_mbps(self.total_bytes, duration),
            intervals: self.samples,
            peer_report: None,
        }
    }

    fn packet_count(&self, packets: u64) -> Option<u64> {
        (self.protocol == Protocol::Udp).then_some(packets)
    }

    fn wall_clock(&self, elapsed: Duration) -> DateTime<Utc> {
        let offset = TimeDelta::from_std(elapsed).unwrap_or(TimeDelta::zero());
        self.wall_start + offset
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateReport {
    pub protocol: Protocol,
    pub duration_secs: f64,
    pub parallel_streams: u32,
    pub total_bytes: u64,
    /// Sum of the per-stream averages.
    pub aggregate_throughput_mbps: f64,
    pub streams: Vec<StreamSummary>,
    pub failed_streams: u32,
    pub cancelled_streams: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerAck>,
}

impl AggregateReport {
    pub fn from_summaries(
        protocol: Protocol,
        parallel_streams: u32,
        wall_clock: Duration,
        mut streams: Vec<StreamSummary>,
    ) -> Self {
        streams.sort_by_key(|s| s.stream_id);
        let total_bytes = streams.iter().map(|s| s.total_bytes).sum();
        let aggregate_throughput_mbps = streams.iter().map(|s| s.average_throughput_mbps).sum();
        Self {
            protocol,
            duration_secs: wall_clock.as_secs_f64(),
            parallel_streams,
            total_bytes,
            aggregate_throughput_mbps,
            streams,
            failed_streams: 0,
            cancelled_streams: 0,
            server: None,
        }
    }

    pub fn total_packets(&self) -> Option<u64> {
        (self.protocol == Protocol::Udp)
            .then(|| self.streams.iter().filter_map(|s| s.total_packets).sum())
    }
}

pub fn bytes_to_human(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

pub fn mbps_to_human(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{:.1} Mbps", mbps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn test_no_sample_before_interval() {
        let start = Instant::now();
        let mut sampler = IntervalSampler::new(0, Protocol::Tcp, start);
        sampler.record(1000, 1);
        assert!(sampler.tick(start).is_none());
        assert!(sampler.tick(start + secs(0.999)).is_none());
        assert!(sampler.tick(start + secs(1.0)).is_some());
    }

    #[test]
    fn test_throughput_uses_actual_elapsed() {
        let start = Instant::now();
        let mut sampler = IntervalSampler::new(3, Protocol::Tcp, start);
        sampler.record(250_000, 1);
        let sample = sampler.tick(start + secs(2.0)).unwrap();
        assert_eq!(sample.stream_id, 3);
        assert_eq!(sample.bytes, 250_000);
        assert!((sample.throughput_mbps - 1.0).abs() < 1e-9);
        assert!(sample.packets.is_none());
    }

    #[test]
    fn test_idle_window_emits_nothing() {
        let start = Instant::now();
        let mut sampler = IntervalSampler::new(0, Protocol::Udp, start);
        assert!(sampler.tick(start + secs(1.5)).is_none());

        // Traffic arriving later is averaged over the whole quiet span
        sampler.record(1400, 1);
        let sample = sampler.tick(start + secs(2.0)).unwrap();
        assert_eq!(sample.packets, Some(1));
        assert!((sample.throughput_mbps - throughput_mbps(1400, secs(2.0))).abs() < 1e-12);
    }

    #[test]
    fn test_accumulator_resets_after_emit() {
        let start = Instant::now();
        let mut sampler = IntervalSampler::new(0, Protocol::Tcp, start);
        sampler.record(100, 1);
        sampler.tick(start + secs(1.0)).unwrap();
        sampler.record(50, 1);
        assert!(sampler.tick(start + secs(1.5)).is_none());
        let second = sampler.tick(start + secs(2.0)).unwrap();
        assert_eq!(second.bytes, 50);
        assert_eq!(sampler.total_bytes(), 150);
    }

    #[test]
    fn test_elapsed_is_monotonic() {
        let start = Instant::now();
        let mut sampler = IntervalSampler::new(0, Protocol::Tcp, start);
        let mut last = 0.0;
        for step in 1..=5 {
            sampler.record(10, 1);
            let sample = sampler.tick(start + secs(step as f64 * 1.1)).unwrap();
            assert!(sample.elapsed_secs >= last);
            last = sample.elapsed_secs;
        }
        // An earlier `now` never produces a sample
        sampler.record(10, 1);
        assert!(sampler.tick(start + secs(1.0)).is_none());
    }

    #[test]
    fn test_timestamps_follow_elapsed() {
        let start = Instant::now();
        let mut sampler = IntervalSampler::new(0, Protocol::Tcp, start);
        sampler.record(10, 1);
        let first = sampler.tick(start + secs(1.0)).unwrap();
        sampler.record(10, 1);
        let second = sampler.tick(start + secs(3.0)).unwrap();
        assert_eq!(
            second.timestamp - first.timestamp,
            TimeDelta::try_seconds(2).unwrap()
        );
    }

    #[test]
    fn test_finish() {
        let start = Instant::now();
        let mut sampler = IntervalSampler::new(1, Protocol::Udp, start);
        sampler.record(1400, 1);
        sampler.record(1400, 1);
        sampler.tick(start + secs(1.0));
        let summary = sampler.finish(start + secs(2.0));
        assert_eq!(summary.total_bytes, 2800);
        assert_eq!(summary.total_packets, Some(2));
        assert_eq!(summary.intervals.len(), 1);
        assert!((summary.duration_secs - 2.0).abs() < 1e-9);
        assert!((summary.average_throughput_mbps - throughput_mbps(2800, secs(2.0))).abs() < 1e-12);
    }

    #[test]
    fn test_finish_zero_span() {
        let start = Instant::now();
        let mut sampler = IntervalSampler::new(0, Protocol::Tcp, start);
        sampler.record(500, 1);
        let summary = sampler.finish(start);
        assert_eq!(summary.average_throughput_mbps, 0.0);
        assert_eq!(summary.total_packets, None);
    }

    #[test]
    fn test_aggregate_sums_streams() {
        let start = Instant::now();
        let summaries: Vec<_> = [(2, 3000u64), (0, 1000), (1, 2000)]
            .into_iter()
            .map(|(id, bytes)| {
                let mut sampler = IntervalSampler::new(id, Protocol::Tcp, start);
                sampler.record(bytes, 1);
                sampler.finish(start + secs(1.0))
            })
            .collect();
        let expected_rate: f64 = summaries.iter().map(|s| s.average_throughput_mbps).sum();

        let report = AggregateReport::from_summaries(Protocol::Tcp, 3, secs(1.2), summaries);
        assert_eq!(report.total_bytes, 6000);
        assert_eq!(
            report.streams.iter().map(|s| s.stream_id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!((report.aggregate_throughput_mbps - expected_rate).abs() < 1e-12);
        assert!(report.total_packets().is_none());
    }

    #[test]
    fn test_bytes_to_human() {
        assert_eq!(bytes_to_human(500), "500 B");
        assert_eq!(bytes_to_human(1024), "1.00 KB");
        assert_eq!(bytes_to_human(1024 * 1024), "1.00 MB");
        assert_eq!(bytes_to_human(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_mbps_to_human() {
        assert_eq!(mbps_to_human(500.0), "500.0 Mbps");
        assert_eq!(mbps_to_human(1500.0), "1.50 Gbps");
    }
}
