//! # Core Engine Module
//!
//! The synchronization machinery between user intents and the remote cart.
//!
//! ## Core Components:
//!
//! - **`gate`**: the dedup gate. Admits, merges or refuses intents and keeps
//!   at most one request per cart line on the wire.
//!
//! - **`reducer`**: pure optimistic apply and rollback of a line change.
//!
//! - **`reconciler`**: folds server responses, reloads and checkout results
//!   back into the canonical snapshot, keyed by operation identity.
//!
//! - **`listeners`**: ordered, re-entrant snapshot fan-out with drop-to-
//!   unsubscribe handles.
//!
//! - **`engine`**: the [`CartEngine`] facade that ties the above together and
//!   drives each accepted operation on a Tokio task.

#![forbid(unsafe_code)]

/// The public facade.
pub mod engine;
/// Admission and per-line request serialization.
pub mod gate;
/// Snapshot subscriptions.
pub mod listeners;
/// Response reconciliation.
pub(crate) mod reconciler;
/// Optimistic apply and rollback.
pub mod reducer;
pub(crate) mod state;

pub use engine::{CartEngine, MutationTicket};
pub use gate::{Admission, DedupGate, LineKey, MutationKind, OpId, OptimisticDelta, PendingOperation, Phase, Target};
pub use listeners::Subscription;
