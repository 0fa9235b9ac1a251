//! UDP data transfer
//!
//! Datagrams are fixed-size filler with no header, so the receiver can count
//! bytes and packets but cannot detect loss or reordering.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cancel::cancelled;
use crate::rate_limit::{Pacer, RateLimiter};
use crate::session::{SessionEvent, SessionRegistry};
use crate::stats::{IntervalSample, IntervalSampler};
use crate::tcp::FILLER_BYTE;
use crate::worker::LoopExit;

pub const UDP_PAYLOAD_SIZE: usize = 1400;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const MAX_DATAGRAM_SIZE: usize = 65535;

/// Send paced datagrams to `target` until the duration elapses.
///
/// Totals are bytes handed to the kernel; nothing confirms delivery.
pub async fn send_paced<F>(
    socket: &UdpSocket,
    target: SocketAddr,
    sampler: &mut IntervalSampler,
    duration: Duration,
    limiter: RateLimiter,
    mut cancel: watch::Receiver<bool>,
    mut on_sample: F,
) -> io::Result<LoopExit>
where
    F: FnMut(&IntervalSample),
{
    let packet = vec![FILLER_BYTE; UDP_PAYLOAD_SIZE];
    let elapsed_at_entry = sampler.start().elapsed();
    let deadline = tokio::time::Instant::now() + duration.saturating_sub(elapsed_at_entry);
    let mut pacer = Pacer::new(limiter);
    debug!(
        "UDP pacing for stream {}: tick every {:?}, {} datagram(s) per tick",
        sampler.stream_id(),
        limiter.tick_period(),
        pacer.burst()
    );

    loop {
        if *cancel.borrow() {
            debug!("UDP send cancelled for stream {}", sampler.stream_id());
            return Ok(LoopExit::Cancelled);
        }

        tokio::select! {
            _ = pacer.next_slot() => {}
            _ = tokio::time::sleep_until(deadline) => return Ok(LoopExit::Finished),
            _ = cancelled(&mut cancel) => return Ok(LoopExit::Cancelled),
        }

        for _ in 0..pacer.burst() {
            if tokio::time::Instant::now() >= deadline {
                return Ok(LoopExit::Finished);
            }
            tokio::select! {
                result = socket.send_to(&packet, target) => {
                    let n = result?;
                    sampler.record(n as u64, 1);
                    if let Some(sample) = sampler.tick(Instant::now()) {
                        on_sample(&sample);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return Ok(LoopExit::Finished),
                _ = cancelled(&mut cancel) => return Ok(LoopExit::Cancelled),
            }
        }
    }
}

/// Server-side datagram dispatch.
///
/// Owns the registry for its whole life. Sweeps run on their own ticker so
/// idle sessions expire even when nothing arrives. On stop, every remaining
/// session is flushed as a final summary.
pub async fn serve_datagrams<F>(
    socket: &UdpSocket,
    registry: &mut SessionRegistry,
    sweep_interval: Duration,
    mut cancel: watch::Receiver<bool>,
    mut on_event: F,
) where
    F: FnMut(SessionEvent),
{
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *cancel.borrow() {
            break;
        }

        tokio::select! {
            result = socket.recv_from(&mut buffer) => {
                match result {
                    Ok((n, remote)) => {
                        if let Some(sample) = registry.on_datagram(remote, n, Instant::now()) {
                            on_event(SessionEvent::Sample { remote, sample });
                        }
                    }
                    Err(e) => warn!("UDP receive error: {}", e),
                }
            }
            _ = sweep.tick() => {
                for expired in registry.sweep(Instant::now()) {
                    on_event(SessionEvent::Expired(expired));
                }
            }
            _ = cancelled(&mut cancel) => break,
        }
    }

    let remaining = registry.drain();
    if !remaining.is_empty() {
        info!("Flushing {} UDP session(s) on shutdown", remaining.len());
    }
    for session in remaining {
        on_event(SessionEvent::Expired(session));
    }
}
