//! Server-side UDP session tracking
//!
//! Datagrams carry no header, so a session is simply "everything from one
//! remote endpoint". The registry is owned by the single dispatch task; there
//! is exactly one mutation path and no locking.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::net::normalize_addr;
use crate::protocol::Protocol;
use crate::stats::{IntervalSample, IntervalSampler, StreamSummary, mbps_to_human};

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    /// Silent for longer than the inactivity timeout
    Idle,
    /// Flushed because the server is stopping
    Shutdown,
}

#[derive(Debug)]
pub struct SessionState {
    remote: SocketAddr,
    session_start: Instant,
    last_activity: Instant,
    sampler: IntervalSampler,
}

impl SessionState {
    fn new(remote: SocketAddr, stream_id: u32, now: Instant) -> Self {
        Self {
            remote,
            session_start: now,
            last_activity: now,
            sampler: IntervalSampler::new(stream_id, Protocol::Udp, now),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn session_start(&self) -> Instant {
        self.session_start
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn total_bytes(&self) -> u64 {
        self.sampler.total_bytes()
    }

    pub fn total_packets(&self) -> u64 {
        self.sampler.total_packets()
    }

    /// The session's active span ends at its last datagram, not at eviction.
    fn close(self) -> StreamSummary {
        let last_activity = self.last_activity;
        self.sampler.finish(last_activity)
    }
}

#[derive(Debug, Clone)]
pub struct ExpiredSession {
    pub remote: SocketAddr,
    pub reason: ExpiryReason,
    pub summary: StreamSummary,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Sample {
        remote: SocketAddr,
        sample: IntervalSample,
    },
    Expired(ExpiredSession),
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<SocketAddr, SessionState>,
    timeout: Duration,
    next_stream_id: u32,
}

impl SessionRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            timeout,
            next_stream_id: 0,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, remote: &SocketAddr) -> bool {
        self.sessions.contains_key(&normalize_addr(*remote))
    }

    pub fn get(&self, remote: &SocketAddr) -> Option<&SessionState> {
        self.sessions.get(&normalize_addr(*remote))
    }

    /// Account one datagram, creating the session on first contact.
    pub fn on_datagram(
        &mut self,
        remote: SocketAddr,
        payload_size: usize,
        now: Instant,
    ) -> Option<IntervalSample> {
        let remote = normalize_addr(remote);
        let next_id = &mut self.next_stream_id;
        let session = self.sessions.entry(remote).or_insert_with(|| {
            let id = *next_id;
            *next_id = next_id.wrapping_add(1);
            info!("New UDP session from {} (stream {})", remote, id);
            SessionState::new(remote, id, now)
        });

        session.last_activity = now;
        session.sampler.record(payload_size as u64, 1);
        let sample = session.sampler.tick(now);
        if let Some(sample) = &sample {
            debug!(
                "[{}] {} in last interval, {}",
                remote,
                sample.bytes,
                mbps_to_human(sample.throughput_mbps)
            );
        }
        sample
    }

    /// Evict every session idle for strictly longer than the timeout.
    pub fn sweep(&mut self, now: Instant) -> Vec<ExpiredSession> {
        let timeout = self.timeout;
        let stale: Vec<SocketAddr> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_activity) > timeout)
            .map(|(addr, _)| *addr)
            .collect();

        let mut expired = self.remove_all(stale, ExpiryReason::Idle);
        for session in &expired {
            info!(
                "UDP session {} expired: {} packets, {:.2}s, avg {}",
                session.remote,
                session.summary.total_packets.unwrap_or(0),
                session.summary.duration_secs,
                mbps_to_human(session.summary.average_throughput_mbps)
            );
        }
        expired.sort_by_key(|s| s.summary.stream_id);
        expired
    }

    /// Flush every session regardless of activity.
    pub fn drain(&mut self) -> Vec<ExpiredSession> {
        let all: Vec<SocketAddr> = self.sessions.keys().copied().collect();
        let mut flushed = self.remove_all(all, ExpiryReason::Shutdown);
        flushed.sort_by_key(|s| s.summary.stream_id);
        flushed
    }

    fn remove_all(&mut self, keys: Vec<SocketAddr>, reason: ExpiryReason) -> Vec<ExpiredSession> {
        keys.into_iter()
            .filter_map(|addr| self.sessions.remove(&addr))
            .map(|state| ExpiredSession {
                remote: state.remote,
                reason,
                summary: state.close(),
            })
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TIMEOUT)
    }
}
