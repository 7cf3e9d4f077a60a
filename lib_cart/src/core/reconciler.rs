//! # Reconciler
//!
//! Folds server responses back into the canonical snapshot. Every function
//! here runs under the engine's state lock and returns a [`Settlement`]
//! describing the side effects the engine must perform once the lock is
//! released.
//!
//! Responses are matched to their [`PendingOperation`] by operation id. A
//! response whose operation is no longer on record (cancelled by a reload, or
//! already settled) changes nothing.
//!
//! [`PendingOperation`]: crate::core::gate::PendingOperation

use crate::core::gate::{OpId, PendingOperation, Waiter};
use crate::core::reducer;
use crate::core::state::CartState;
use crate::error::{MutationResult, SyncError};
use crate::model::{CartLine, PlacedLine, ProductId};
use tracing::{debug, info, warn};

/// Deferred effects of one reconciliation step.
#[derive(Debug, Default)]
pub(crate) struct Settlement {
    /// The snapshot changed and must be published.
    pub publish: bool,
    /// New badge count for the notification sink.
    pub badge: Option<u32>,
    /// Callers to resolve.
    pub completions: Vec<(Waiter, MutationResult)>,
    /// A follow-up operation to drive.
    pub follow_up: Option<(ProductId, OpId)>,
}

impl Settlement {
    fn resolve_all(&mut self, waiters: Vec<Waiter>, result: &MutationResult) {
        self.completions
            .extend(waiters.into_iter().map(|waiter| (waiter, result.clone())));
    }

    fn changed(&mut self, state: &mut CartState) {
        state.snapshot.bump_version();
        self.publish = true;
        self.badge = state.badge_change();
    }
}

/// Settles the response to a line request.
///
/// `outcome` carries the line the server now holds for the product (`None`
/// after a delete), or the error that ended the request.
pub(crate) fn settle_line(
    state: &mut CartState,
    product_id: ProductId,
    op_id: OpId,
    outcome: Result<Option<CartLine>, SyncError>,
) -> Settlement {
    let mut settlement = Settlement::default();
    let Some(op) = state.gate.take(product_id, op_id) else {
        debug!(product_id, op_id, "dropping response for an operation no longer on record");
        return settlement;
    };
    if op.superseded {
        debug!(product_id, op_id, "ignoring response invalidated by a cart reload");
        return settlement;
    }

    match outcome {
        Ok(confirmed) => {
            let PendingOperation {
                waiters,
                queued,
                optimistic_delta,
                ..
            } = op;
            settlement.resolve_all(waiters, &Ok(()));
            match queued {
                None => {
                    debug!(product_id, op_id, quantity = ?confirmed.as_ref().map(CartLine::quantity), "adopting server line");
                    state.snapshot.put_line(product_id, confirmed);
                    settlement.changed(state);
                }
                Some(queued) => {
                    let index = state
                        .snapshot
                        .placed_line(product_id)
                        .map(|placed| placed.index)
                        .or(optimistic_delta.before.as_ref().map(|placed| placed.index))
                        .unwrap_or(state.snapshot.lines().len());
                    let before = confirmed.map(|line| PlacedLine { index, line });
                    let version = state.snapshot.version();
                    let next = state.gate.follow_up(product_id, queued, before, version);
                    debug!(product_id, op_id, follow_up = next, "response superseded by a queued intent");
                    settlement.badge = state.badge_change();
                    settlement.follow_up = Some((product_id, next));
                }
            }
        }
        Err(error) => {
            warn!(product_id, op_id, reason = %error.reason(), %error, "cart request failed, rolling back");
            state.snapshot = reducer::rollback(&state.snapshot, product_id, &op.optimistic_delta);
            state.snapshot.set_error(Some(error.clone()));
            settlement.publish = true;
            settlement.resolve_all(op.into_waiters(), &Err(error));
        }
    }
    settlement
}

/// Settles an operation released without a request because the server
/// already matches its target.
pub(crate) fn settle_skip(state: &mut CartState, op: PendingOperation) -> Settlement {
    let mut settlement = Settlement::default();
    let product_id = op.key;
    if let Some(placed) = &op.optimistic_delta.before {
        if state.snapshot.line_for_product(product_id) != Some(&placed.line) {
            state.snapshot.put_line(product_id, Some(placed.line.clone()));
            settlement.changed(state);
        }
    }
    debug!(product_id, op_id = op.id, "no request needed, line already at target");
    settlement.resolve_all(op.into_waiters(), &Ok(()));
    settlement
}

/// Settles a checkout.
pub(crate) fn settle_checkout(state: &mut CartState, op_id: OpId, outcome: &MutationResult) -> Settlement {
    let mut settlement = Settlement::default();
    state.gate.finish_checkout(op_id);
    match outcome {
        Ok(()) => {
            info!(op_id, "checkout completed, clearing cart");
            state.snapshot.replace_lines(Vec::new());
            state.snapshot.set_error(None);
            settlement.changed(state);
        }
        Err(error) => {
            warn!(op_id, reason = %error.reason(), %error, "checkout failed");
            state.snapshot.set_error(Some(error.clone()));
            state.snapshot.bump_version();
            settlement.publish = true;
        }
    }
    settlement
}

/// Settles a full reload. Success replaces every line and supersedes every
/// pending operation; failure only records the error.
pub(crate) fn settle_load(state: &mut CartState, outcome: Result<Vec<CartLine>, SyncError>) -> Settlement {
    let mut settlement = Settlement::default();
    state.gate.end_load();
    state.snapshot.set_loading(false);
    match outcome {
        Ok(lines) => {
            let superseded = state.gate.invalidate_all();
            if !superseded.is_empty() {
                info!(count = superseded.len(), "reload superseded pending mutations");
            }
            settlement.resolve_all(superseded, &Err(SyncError::Superseded));
            state.snapshot.replace_lines(lines);
            state.snapshot.set_error(None);
            info!(lines = state.snapshot.lines().len(), subtotal = %state.snapshot.subtotal(), "cart loaded");
            settlement.changed(state);
        }
        Err(error) => {
            warn!(reason = %error.reason(), %error, "cart load failed");
            state.snapshot.set_error(Some(error));
            state.snapshot.bump_version();
            settlement.publish = true;
        }
    }
    settlement
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gate::{Flight, LineKey, MutationKind, Target};
    use crate::error::ErrorReason;
    use crate::model::{Money, ProductRef};
    use tokio::sync::oneshot;

    fn loaded_state() -> CartState {
        let mut state = CartState::new();
        let settlement = settle_load(&mut state, Ok(vec![CartLine::new(10, 7, "tea", Money::from_cents(500), 3)]));
        assert_eq!(settlement.badge, Some(3));
        state
    }

    /// Admits an intent and applies its optimistic effect, as the engine does.
    fn admit(state: &mut CartState, product_id: ProductId, kind: MutationKind, target: Target) -> (OpId, oneshot::Receiver<MutationResult>) {
        let admission = state
            .gate
            .submit(LineKey::Product(product_id), kind, target, &state.snapshot);
        let (tx, rx) = oneshot::channel();
        state.gate.attach_waiter(product_id, tx).unwrap();
        state.snapshot = reducer::apply(
            &state.snapshot,
            &ProductRef::unpriced(product_id),
            target,
            &mut state.provisional,
        );
        (admission.op_id().unwrap(), rx)
    }

    #[test]
    fn success_adopts_the_server_line() {
        let mut state = loaded_state();
        let (op, mut rx) = admit(&mut state, 7, MutationKind::Increment, Target::Quantity(4));
        assert!(matches!(state.gate.begin_flight(7, op), Some(Flight::Send(_))));

        let confirmed = CartLine::new(10, 7, "tea", Money::from_cents(550), 4);
        let settlement = settle_line(&mut state, 7, op, Ok(Some(confirmed.clone())));
        assert!(settlement.publish);
        assert_eq!(settlement.badge, Some(4));
        assert_eq!(state.snapshot.line_for_product(7), Some(&confirmed));
        assert_eq!(state.snapshot.subtotal(), Money::from_cents(2200));
        assert!(state.gate.is_empty());

        for (waiter, result) in settlement.completions {
            waiter.send(result).unwrap();
        }
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn failure_rolls_back_without_a_badge_update() {
        let mut state = loaded_state();
        let original = state.snapshot.lines().to_vec();
        let (op, _rx) = admit(&mut state, 7, MutationKind::Decrement, Target::Quantity(2));
        state.gate.begin_flight(7, op);

        let settlement = settle_line(&mut state, 7, op, Err(SyncError::Transport("reset".into())));
        assert_eq!(settlement.badge, None);
        assert_eq!(state.snapshot.lines(), original.as_slice());
        assert_eq!(state.snapshot.last_error().map(SyncError::reason), Some(ErrorReason::Transport));
        assert_eq!(settlement.completions.len(), 1);
    }

    #[test]
    fn superseded_success_requeues_the_latest_intent() {
        let mut state = loaded_state();
        let (op, _first) = admit(&mut state, 7, MutationKind::Increment, Target::Quantity(4));
        state.gate.begin_flight(7, op);
        let (_, _second) = admit(&mut state, 7, MutationKind::Increment, Target::Quantity(5));
        let shown = state.snapshot.clone();

        let server = CartLine::new(10, 7, "tea", Money::from_cents(500), 4);
        let settlement = settle_line(&mut state, 7, op, Ok(Some(server.clone())));
        assert!(!settlement.publish, "optimism for the queued intent stays on screen");
        assert_eq!(state.snapshot, shown);
        assert_eq!(settlement.badge, Some(4), "the badge follows the confirmed baseline, not the optimism");

        let (product, next) = settlement.follow_up.unwrap();
        assert_eq!(product, 7);
        let pending = state.gate.pending(7).unwrap();
        assert_eq!(pending.id, next);
        assert_eq!(pending.optimistic_delta.before.as_ref().unwrap().line, server);
        assert_eq!(pending.optimistic_delta.target, Target::Quantity(5));
    }

    #[test]
    fn stale_responses_after_a_reload_change_nothing() {
        let mut state = loaded_state();
        let (op, _rx) = admit(&mut state, 7, MutationKind::Increment, Target::Quantity(4));
        state.gate.begin_flight(7, op);

        let reload = settle_load(&mut state, Ok(vec![CartLine::new(10, 7, "tea", Money::from_cents(500), 9)]));
        assert_eq!(reload.completions.len(), 1);
        let after_reload = state.snapshot.clone();

        let stale = CartLine::new(10, 7, "tea", Money::from_cents(500), 4);
        let settlement = settle_line(&mut state, 7, op, Ok(Some(stale)));
        assert!(!settlement.publish);
        assert_eq!(state.snapshot, after_reload);
        assert!(state.gate.is_empty(), "the drained key is free again");
    }

    #[test]
    fn failed_checkout_keeps_the_lines() {
        let mut state = loaded_state();
        let lines = state.snapshot.lines().to_vec();
        let op = state
            .gate
            .submit(LineKey::Cart, MutationKind::Checkout, Target::Absent, &state.snapshot)
            .op_id()
            .unwrap();
        let settlement = settle_checkout(
            &mut state,
            op,
            &Err(SyncError::Server {
                status: 409,
                message: "out of stock".into(),
            }),
        );
        assert!(settlement.badge.is_none());
        assert_eq!(state.snapshot.lines(), lines.as_slice());
        assert!(!state.gate.checkout_in_flight());
    }
}
