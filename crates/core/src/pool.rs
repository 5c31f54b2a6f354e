use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

/// Allocator of paired RTP/RTCP UDP ports from a fixed range.
///
/// Only even ports are handed out as RTP ports; the matching RTCP port is
/// always `rtp + 1` and is never leased on its own (RFC 3550 §11). A pair is
/// issuable when both ports lie inside `[low, high]`.
///
/// Selection is lowest-free-first so allocation is deterministic. The pool is
/// cheap to clone; clones share the same lease set.
#[derive(Clone, Debug)]
pub struct PortPool {
    inner: Arc<Mutex<Leases>>,
}

#[derive(Debug)]
struct Leases {
    low: u16,
    high: u16,
    leased: BTreeSet<u16>,
}

impl Leases {
    fn candidates(&self) -> impl Iterator<Item = u16> + '_ {
        let first = self.low.saturating_add(self.low % 2);
        (first..self.high).step_by(2)
    }
}

impl PortPool {
    pub fn new(low: u16, high: u16) -> Self {
        tracing::debug!(low, high, "port pool created");
        Self {
            inner: Arc::new(Mutex::new(Leases {
                low,
                high,
                leased: BTreeSet::new(),
            })),
        }
    }

    /// Build a pool from a start port and a port count, the way the server
    /// configuration expresses it.
    pub fn with_count(start: u16, count: u16) -> Self {
        let high = start.saturating_add(count.saturating_sub(1));
        Self::new(start, high)
    }

    /// Lease the lowest free RTP port. `port + 1` is implicitly reserved for
    /// RTCP. Returns `None` once the range is exhausted.
    pub fn get_next_rtp_port(&self) -> Option<u16> {
        let mut leases = self.inner.lock();
        let port = leases.candidates().find(|p| !leases.leased.contains(p))?;
        leases.leased.insert(port);
        tracing::trace!(rtp_port = port, rtcp_port = port + 1, "leased port pair");
        Some(port)
    }

    /// Return an RTP port (and its RTCP sibling) to the pool.
    ///
    /// Returning a port that is not leased is a no-op.
    pub fn return_rtp_port_to_pool(&self, port: u16) {
        if self.inner.lock().leased.remove(&port) {
            tracing::trace!(rtp_port = port, "returned port pair");
        }
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.inner.lock().leased.contains(&port)
    }

    /// Number of RTP/RTCP pairs the range can hold.
    pub fn capacity(&self) -> usize {
        self.inner.lock().candidates().count()
    }

    /// Number of pairs currently available.
    pub fn free_count(&self) -> usize {
        let leases = self.inner.lock();
        leases.candidates().count() - leases.leased.len()
    }

    pub fn leased_count(&self) -> usize {
        self.inner.lock().leased.len()
    }
}
