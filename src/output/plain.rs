//! Plain text output

use crate::serve::ServerEvent;
use crate::session::ExpiryReason;
use crate::stats::{AggregateReport, IntervalSample, bytes_to_human, mbps_to_human};

pub fn output_plain(report: &AggregateReport) -> String {
    let mut output = String::new();

    output.push_str("─".repeat(60).as_str());
    output.push('\n');
    output.push_str("  bwprobe Test Results\n");
    output.push_str("─".repeat(60).as_str());
    output.push('\n');
    output.push('\n');

    output.push_str(&format!("  Protocol:    {}\n", report.protocol));
    output.push_str(&format!("  Duration:    {:.2}s\n", report.duration_secs));
    output.push_str(&format!("  Transfer:    {}\n", bytes_to_human(report.total_bytes)));
    output.push_str(&format!(
        "  Throughput:  {}\n",
        mbps_to_human(report.aggregate_throughput_mbps)
    ));
    if let Some(packets) = report.total_packets() {
        output.push_str(&format!("  Packets:     {}\n", packets));
    }
    output.push_str(&format!(
        "  Streams:     {} of {} completed",
        report.streams.len(),
        report.parallel_streams
    ));
    if report.failed_streams > 0 {
        output.push_str(&format!(", {} failed", report.failed_streams));
    }
    if report.cancelled_streams > 0 {
        output.push_str(&format!(", {} cancelled", report.cancelled_streams));
    }
    output.push('\n');
    if let Some(ref server) = report.server {
        output.push_str(&format!("  Server:      {}\n", server.system));
    }
    output.push('\n');

    if report.streams.len() > 1 {
        output.push_str("  Per-Stream Results:\n");
        for stream in &report.streams {
            output.push_str(&format!(
                "    [{}] {} @ {}",
                stream.stream_id,
                bytes_to_human(stream.total_bytes),
                mbps_to_human(stream.average_throughput_mbps)
            ));
            if let Some(packets) = stream.total_packets {
                output.push_str(&format!("  pkts: {}", packets));
            }
            output.push('\n');
        }
        output.push('\n');
    }

    output.push_str("─".repeat(60).as_str());
    output.push('\n');

    output
}

pub fn output_interval_plain(sample: &IntervalSample) -> String {
    let mut output = format!(
        "[{:>3}] [{:5.1}s]  {}  {}",
        sample.stream_id,
        sample.elapsed_secs,
        mbps_to_human(sample.throughput_mbps),
        bytes_to_human(sample.bytes)
    );

    if let Some(packets) = sample.packets {
        output.push_str(&format!("  pkts: {}", packets));
    }

    output.push('\n');
    output
}

/// One line per server event worth showing. Interval samples are left to
/// the caller since they are noisy with many peers.
pub fn output_server_event(event: &ServerEvent) -> Option<String> {
    let line = match event {
        ServerEvent::ControlAccepted { peer, config, .. } => format!(
            "{} test from {}: {} stream(s), {}s",
            config.protocol,
            peer,
            config.parallel_streams,
            config.duration.as_secs_f64()
        ),
        ServerEvent::Interval { .. } => return None,
        ServerEvent::StreamFinished {
            peer,
            state,
            summary,
            ..
        } => format!(
            "[{}] TCP stream from {} {}: {} @ {}",
            summary.stream_id,
            peer,
            state,
            bytes_to_human(summary.total_bytes),
            mbps_to_human(summary.average_throughput_mbps)
        ),
        ServerEvent::StreamFailed {
            peer,
            stream_id,
            error,
        } => format!("[{}] stream from {} failed: {}", stream_id, peer, error),
        ServerEvent::SessionExpired {
            peer,
            reason,
            summary,
        } => {
            let why = match reason {
                ExpiryReason::Idle => "expired",
                ExpiryReason::Shutdown => "closed at shutdown",
            };
            format!(
                "UDP session {} {}: {} in {} packets over {:.2}s @ {}",
                peer,
                why,
                bytes_to_human(summary.total_bytes),
                summary.total_packets.unwrap_or(0),
                summary.duration_secs,
                mbps_to_human(summary.average_throughput_mbps)
            )
        }
    };
    Some(line)
}
