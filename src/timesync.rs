//! Time-source synchronization collaborator interface.
//!
//! The slot engine extracts per-exchange drift measurements (from E-ACK
//! time-correction IEs and beacon arrival offsets) and hands them to an
//! adaptive filter which owns long-term compensation and keepalive policy.

use crate::queue::NeighborId;
use crate::{TickDelta, Ticks};

pub trait TimeSync {
    /// Additional ticks to add to a wait of `dt` ticks to compensate for
    /// the learned clock ratio against the time source
    fn adaptive_compensate(&mut self, dt: Ticks) -> TickDelta {
        let _ = dt;
        0
    }

    /// Record a measured drift of `correction` ticks against the time
    /// source neighbor, `since_last_sync` slots after the previous sync
    fn update(&mut self, neighbor: NeighborId, since_last_sync: i32, correction: TickDelta);

    /// (Re)arm the keepalive probe towards the time source
    fn schedule_keepalive(&mut self);
}
