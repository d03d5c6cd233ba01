//! Keepalive bookkeeping with correlation IDs and RTT measurement.
//!
//! A client has at most one PING outstanding. Its PING_ACK only counts when
//! it echoes the correlation ID of that PING; anything else is stale.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Generate a correlation ID based on monotonic time
///
/// IDs are strictly increasing within a process, even when two calls land
/// on the same nanosecond.
pub fn now_corr_id() -> u64 {
    static START: once_cell::sync::Lazy<std::time::Instant> =
        once_cell::sync::Lazy::new(std::time::Instant::now);
    static LAST: AtomicU64 = AtomicU64::new(0);

    let elapsed_ns = (START.elapsed().as_nanos() & 0xFFFF_FFFF_FFFF_FFFF) as u64;
    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let next = elapsed_ns.max(last + 1);
        match LAST.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

#[derive(Debug)]
struct OutstandingPing {
    corr_id: u64,
    sent_at: Instant,
    acked: Arc<Notify>,
}

/// The PING currently awaiting its PING_ACK, if any
#[derive(Debug, Default)]
pub struct KeepaliveState {
    outstanding: Option<OutstandingPing>,
    last_rtt: Option<Duration>,
}

impl KeepaliveState {
    /// Create an idle keepalive state
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a PING that was just sent. Returns the handle notified when the
    /// matching PING_ACK arrives; a previous outstanding PING is forgotten.
    pub fn record_ping(&mut self, corr_id: u64) -> Arc<Notify> {
        let acked = Arc::new(Notify::new());
        self.outstanding = Some(OutstandingPing {
            corr_id,
            sent_at: Instant::now(),
            acked: acked.clone(),
        });
        acked
    }

    /// Match a PING_ACK against the outstanding PING.
    ///
    /// Returns the round-trip time when the ack is current. Stale or
    /// unsolicited acks return `None` and leave the outstanding PING alone.
    pub fn process_ack(&mut self, corr_id: u64) -> Option<Duration> {
        match self.outstanding.take() {
            Some(ping) if ping.corr_id == corr_id => {
                let rtt = ping.sent_at.elapsed();
                self.last_rtt = Some(rtt);
                ping.acked.notify_one();
                Some(rtt)
            }
            other => {
                self.outstanding = other;
                None
            }
        }
    }

    /// The ack deadline of `corr_id` passed. Returns true when that PING is
    /// still unanswered, i.e. the connection should be considered dead.
    pub fn expire(&mut self, corr_id: u64) -> bool {
        match &self.outstanding {
            Some(ping) if ping.corr_id == corr_id => {
                self.outstanding = None;
                true
            }
            _ => false,
        }
    }

    /// Forget any outstanding PING
    pub fn clear(&mut self) {
        self.outstanding = None;
    }

    /// Correlation ID of the outstanding PING
    pub fn outstanding(&self) -> Option<u64> {
        self.outstanding.as_ref().map(|ping| ping.corr_id)
    }

    /// Most recent RTT measurement
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }
}
