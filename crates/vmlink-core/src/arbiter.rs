//! Lead/lease arbitration between the two sides of a link
//!
//! Whichever side pushes a value to the other takes a short lease. While
//! the lease is active only the holder may push again, so the echo a write
//! produces on the far side is not mistaken for a user change and written
//! back. Once the lease expires either side may take it.

use crossbeam::atomic::AtomicCell;
use std::time::{Duration, Instant};

/// Default lease length
pub const DEFAULT_LEASE: Duration = Duration::from_millis(200);

/// Side of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkSide {
    /// Mixing engine channel
    Engine,
    /// OS playback device
    Endpoint,
}

/// Lease snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkState {
    pub lead: Option<LinkSide>,
    pub deadline: Option<Instant>,
}

impl LinkState {
    const IDLE: Self = Self {
        lead: None,
        deadline: None,
    };

    /// Expired lease, or `side` already holds it
    pub fn permits(&self, side: LinkSide, now: Instant) -> bool {
        let expired = self.deadline.map_or(true, |deadline| now >= deadline);
        expired || self.lead == Some(side)
    }
}

/// Per-link lease holder, shared by the engine and endpoint paths
#[derive(Debug)]
pub struct LinkArbiter {
    state: AtomicCell<LinkState>,
    lease: Duration,
}

impl LinkArbiter {
    pub fn new(lease: Duration) -> Self {
        Self {
            state: AtomicCell::new(LinkState::IDLE),
            lease,
        }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Take (or renew) the lease unconditionally
    pub fn take_lead(&self, side: LinkSide) {
        self.state.store(LinkState {
            lead: Some(side),
            deadline: Some(Instant::now() + self.lease),
        });
    }

    /// Whether `side` may push a value right now
    pub fn can_update(&self, side: LinkSide) -> bool {
        self.state.load().permits(side, Instant::now())
    }

    /// Check and take the lease in one step
    ///
    /// Returns false without touching the lease if the other side holds it.
    /// Two sides racing for an expired lease cannot both win.
    pub fn try_take_lead(&self, side: LinkSide) -> bool {
        loop {
            let now = Instant::now();
            let current = self.state.load();
            if !current.permits(side, now) {
                return false;
            }
            let next = LinkState {
                lead: Some(side),
                deadline: Some(now + self.lease),
            };
            if self.state.compare_exchange(current, next).is_ok() {
                return true;
            }
        }
    }

    /// Side holding an unexpired lease
    pub fn lead(&self) -> Option<LinkSide> {
        let state = self.state.load();
        match state.deadline {
            Some(deadline) if Instant::now() < deadline => state.lead,
            _ => None,
        }
    }
}

impl Default for LinkArbiter {
    fn default() -> Self {
        Self::new(DEFAULT_LEASE)
    }
}
