//! # Engine State
//!
//! Everything the engine mutates, kept behind one lock: the canonical
//! snapshot, the dedup gate, the provisional id source and the last badge
//! count handed to the notification sink.

use crate::core::gate::DedupGate;
use crate::core::reducer::ProvisionalIds;
use crate::model::CartSnapshot;

#[derive(Debug, Default)]
pub(crate) struct CartState {
    pub snapshot: CartSnapshot,
    pub gate: DedupGate,
    pub provisional: ProvisionalIds,
    pub last_notified: Option<u32>,
}

impl CartState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the server-confirmed total quantity if it differs from the
    /// last one notified, and records it as notified. Optimistic quantities
    /// of unsettled operations never reach the badge.
    pub fn badge_change(&mut self) -> Option<u32> {
        let total = self.gate.confirmed_total(&self.snapshot);
        if self.last_notified == Some(total) {
            return None;
        }
        self.last_notified = Some(total);
        Some(total)
    }
}
