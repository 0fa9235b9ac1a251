//! TCP data transfer
//!
//! The sender writes a fixed filler buffer until the deadline or stop flag;
//! the receiver reads until EOF and answers with an [`EndSummary`] line.

use std::io;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

use crate::cancel::cancelled;
use crate::control::MAX_LINE_LENGTH;
use crate::net::set_socket_buffers;
use crate::protocol::{EndSummary, decode_line, encode_line};
use crate::stats::{IntervalSample, IntervalSampler, StreamSummary};
use crate::worker::LoopExit;

pub const DEFAULT_BUFFER_SIZE: usize = 128 * 1024;
pub const FILLER_BYTE: u8 = b'X';
/// How long a sender waits for the receiver's end-of-test report.
pub const PEER_REPORT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub buffer_size: usize,
    pub nodelay: bool,
    /// SO_SNDBUF/SO_RCVBUF override
    pub window_size: Option<usize>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            nodelay: false,
            window_size: None,
        }
    }
}

pub fn configure_stream(stream: &TcpStream, config: &TcpConfig) -> io::Result<()> {
    stream.set_nodelay(config.nodelay)?;
    if let Some(window) = config.window_size {
        set_socket_buffers(stream, window);
    }
    Ok(())
}

/// Write filler until `duration` has elapsed since `sampler.start()`.
///
/// Partial writes count only the bytes the kernel accepted. The write is raced
/// against the deadline and the stop flag, so a stalled peer cannot hold the
/// stream past its duration.
pub async fn send_data<W, F>(
    writer: &mut W,
    sampler: &mut IntervalSampler,
    duration: Duration,
    buffer_size: usize,
    mut cancel: watch::Receiver<bool>,
    mut on_sample: F,
) -> io::Result<LoopExit>
where
    W: AsyncWrite + Unpin,
    F: FnMut(&IntervalSample),
{
    let buffer = vec![FILLER_BYTE; buffer_size.max(1)];
    let elapsed_at_entry = sampler.start().elapsed();
    let deadline = tokio::time::Instant::now() + duration.saturating_sub(elapsed_at_entry);

    loop {
        if *cancel.borrow() {
            debug!("Send cancelled for stream {}", sampler.stream_id());
            return Ok(LoopExit::Cancelled);
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(LoopExit::Finished);
        }

        tokio::select! {
            result = writer.write(&buffer) => {
                let n = result?;
                if n == 0 {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "peer stopped accepting data"));
                }
                sampler.record(n as u64, 1);
                if let Some(sample) = sampler.tick(Instant::now()) {
                    on_sample(&sample);
                }
            }
            _ = tokio::time::sleep_until(deadline) => return Ok(LoopExit::Finished),
            _ = cancelled(&mut cancel) => {
                debug!("Send cancelled for stream {}", sampler.stream_id());
                return Ok(LoopExit::Cancelled);
            }
        }
    }
}

/// Half-close the sender and optionally collect the receiver's report.
///
/// A missing or malformed report is not an error; the caller just gets `None`.
pub async fn finish_send(
    mut stream: TcpStream,
    stream_id: u32,
    wait_for_report: bool,
) -> Option<EndSummary> {
    if let Err(e) = stream.shutdown().await {
        debug!("Shutdown of stream {} failed: {}", stream_id, e);
        return None;
    }
    if !wait_for_report {
        return None;
    }

    let mut reader = BufReader::new(stream.take(MAX_LINE_LENGTH as u64));
    let mut line = String::new();
    match tokio::time::timeout(PEER_REPORT_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(Ok(n)) if n > 0 => match decode_line::<EndSummary>(&line) {
            Ok(report) => Some(report),
            Err(e) => {
                debug!("Ignoring peer report on stream {}: {}", stream_id, e);
                None
            }
        },
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            debug!("Reading peer report on stream {} failed: {}", stream_id, e);
            None
        }
        Err(_) => {
            debug!("No peer report on stream {} within {:?}", stream_id, PEER_REPORT_TIMEOUT);
            None
        }
    }
}

/// Read until EOF or the stop flag, counting every byte.
pub async fn receive_data<R, F>(
    reader: &mut R,
    sampler: &mut IntervalSampler,
    buffer_size: usize,
    mut cancel: watch::Receiver<bool>,
    mut on_sample: F,
) -> io::Result<LoopExit>
where
    R: AsyncRead + Unpin,
    F: FnMut(&IntervalSample),
{
    let mut buffer = vec![0u8; buffer_size.max(1)];

    loop {
        if *cancel.borrow() {
            debug!("Receive cancelled for stream {}", sampler.stream_id());
            return Ok(LoopExit::Cancelled);
        }

        tokio::select! {
            result = reader.read(&mut buffer) => {
                match result {
                    Ok(0) => {
                        debug!("Stream {} EOF", sampler.stream_id());
                        return Ok(LoopExit::Finished);
                    }
                    Ok(n) => {
                        sampler.record(n as u64, 1);
                        if let Some(sample) = sampler.tick(Instant::now()) {
                            on_sample(&sample);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            }
            _ = cancelled(&mut cancel) => {
                debug!("Receive cancelled for stream {}", sampler.stream_id());
                return Ok(LoopExit::Cancelled);
            }
        }
    }
}

/// Write the receiver's end-of-test line. Best effort: the sender may already
/// be gone.
pub async fn send_end_summary<W>(writer: &mut W, summary: &StreamSummary)
where
    W: AsyncWrite + Unpin,
{
    let report = EndSummary::new(
        summary.total_bytes,
        Duration::from_secs_f64(summary.duration_secs),
    );
    let line = match encode_line(&report) {
        Ok(line) => line,
        Err(e) => {
            debug!("Failed to encode end summary: {}", e);
            return;
        }
    };
    if let Err(e) = writer.write_all(line.as_bytes()).await {
        debug!("Failed to send end summary for stream {}: {}", summary.stream_id, e);
        return;
    }
    let _ = writer.shutdown().await;
}
