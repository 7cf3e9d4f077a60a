//! # Mutation Queue & Dedup Gate
//!
//! The gate is the single admission point for every cart mutation. It keeps
//! at most one [`PendingOperation`] per product key and guarantees that at most
//! one network request per key is outstanding at any time, no matter how fast
//! intents arrive.
//!
//! ## Lifecycle of an operation
//!
//! 1.  **Windowed**: the operation was accepted and its request has not been
//!     sent yet. Further intents for the same key merge straight into its
//!     target ([`Admission::Coalesced`]), so a burst of taps costs one request.
//! 2.  **In flight**: the request is on the wire. Further intents are parked as
//!     a single queued follow-up (latest intent wins) that is re-issued once
//!     the response has been reconciled.
//! 3.  **Superseded**: a full reload replaced the snapshot while the request
//!     was on the wire. The key stays occupied until the stale response lands,
//!     and new intents for it are refused with `BUSY`.
//!
//! Checkout is a whole-cart barrier: it is admitted only when no line
//! operation is pending, and while it runs every line intent is refused.

use crate::error::{BusyError, ErrorReason, MutationResult, SyncError, ValidationError};
use crate::model::{CartSnapshot, PlacedLine, ProductId};
use crate::service::CartRequest;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Identity of a pending operation. Responses are matched by this, never by
/// arrival order.
pub type OpId = u64;

/// What the user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Add,
    Increment,
    Decrement,
    Remove,
    Checkout,
}

/// Admission key: one product line, or the whole cart for checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineKey {
    Product(ProductId),
    Cart,
}

/// The end state an intent asks for on its line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Quantity(u32),
    Absent,
}

/// Answer of [`DedupGate::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A new pending operation was registered.
    Accepted(OpId),
    /// The intent was merged into the key's existing operation.
    Coalesced(OpId),
    /// The line already shows the requested state and nothing is pending for
    /// it; no operation was registered.
    Unchanged,
    /// The intent was refused before touching the snapshot.
    Rejected(SyncError),
}

impl Admission {
    pub fn op_id(&self) -> Option<OpId> {
        match self {
            Admission::Accepted(id) | Admission::Coalesced(id) => Some(*id),
            Admission::Rejected(_) | Admission::Unchanged => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Admission::Rejected(_))
    }

    pub fn reason(&self) -> Option<ErrorReason> {
        match self {
            Admission::Rejected(error) => Some(error.reason()),
            _ => None,
        }
    }
}

/// Where an operation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Windowed,
    InFlight,
}

/// The local effect of an operation, kept so it can be inverted exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticDelta {
    /// The last server-confirmed line for the key (and its index), or `None`
    /// when the server has no line for the product.
    pub before: Option<PlacedLine>,
    /// The state the optimistic snapshot currently shows for the key.
    pub target: Target,
}

pub(crate) type Waiter = oneshot::Sender<MutationResult>;

/// An intent parked behind an in-flight request.
#[derive(Debug)]
pub(crate) struct QueuedIntent {
    pub kind: MutationKind,
    pub target: Target,
    pub waiters: Vec<Waiter>,
}

/// # Pending Operation
///
/// Owned by the gate from admission until its response is reconciled or the
/// operation is abandoned.
#[derive(Debug)]
pub struct PendingOperation {
    pub id: OpId,
    pub key: ProductId,
    pub kind: MutationKind,
    pub submitted_snapshot_version: u64,
    pub optimistic_delta: OptimisticDelta,
    pub phase: Phase,
    pub superseded: bool,
    pub(crate) queued: Option<QueuedIntent>,
    pub(crate) waiters: Vec<Waiter>,
}

impl PendingOperation {
    pub fn has_queued_follow_up(&self) -> bool {
        self.queued.is_some()
    }

    /// Every caller still waiting on this key, current request first.
    pub(crate) fn into_waiters(self) -> Vec<Waiter> {
        let mut waiters = self.waiters;
        if let Some(queued) = self.queued {
            waiters.extend(queued.waiters);
        }
        waiters
    }
}

/// What the driver should do once an operation's window closes.
#[derive(Debug)]
pub(crate) enum Flight {
    /// Put this request on the wire.
    Send(CartRequest),
    /// The server already matches the target; the operation was released.
    Settled(PendingOperation),
}

/// Maps the server-known line and the wanted end state to the one request
/// that gets the server there, if any.
pub fn derive_request(product_id: ProductId, before: Option<&PlacedLine>, target: Target) -> Option<CartRequest> {
    match (before, target) {
        (None, Target::Absent) => None,
        (None, Target::Quantity(quantity)) => Some(CartRequest::Add { product_id, quantity }),
        (Some(placed), Target::Absent) => Some(CartRequest::Remove {
            line_id: placed.line.line_id(),
        }),
        (Some(placed), Target::Quantity(quantity)) if placed.line.quantity() == quantity => None,
        (Some(placed), Target::Quantity(quantity)) => Some(CartRequest::SetQuantity {
            line_id: placed.line.line_id(),
            quantity,
        }),
    }
}

/// # Dedup Gate
///
/// Sole writer of pending-operation state. All methods run under the engine's
/// state lock.
#[derive(Debug, Default)]
pub struct DedupGate {
    ops: HashMap<ProductId, PendingOperation>,
    next_op: OpId,
    checkout: Option<OpId>,
    loading: bool,
}

impl DedupGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits, merges or refuses an intent.
    ///
    /// `snapshot` is the canonical snapshot at admission time; it provides the
    /// rollback baseline and version stamp for new operations.
    pub fn submit(&mut self, key: LineKey, kind: MutationKind, target: Target, snapshot: &CartSnapshot) -> Admission {
        if let Err(error) = self.check_open() {
            return Admission::Rejected(error);
        }

        let product_id = match key {
            LineKey::Cart => return self.submit_checkout(snapshot),
            LineKey::Product(product_id) => product_id,
        };

        if target == Target::Quantity(0) {
            return Admission::Rejected(ValidationError::QuantityBelowOne(0).into());
        }

        if let Some(op) = self.ops.get_mut(&product_id) {
            if op.superseded {
                return Admission::Rejected(BusyError::KeyDraining.into());
            }
            match op.phase {
                Phase::Windowed => {
                    op.kind = kind;
                    op.optimistic_delta.target = target;
                }
                Phase::InFlight => {
                    let waiters = op.queued.take().map(|q| q.waiters).unwrap_or_default();
                    op.queued = Some(QueuedIntent { kind, target, waiters });
                }
            }
            return Admission::Coalesced(op.id);
        }

        let id = self.next_id();
        self.ops.insert(
            product_id,
            PendingOperation {
                id,
                key: product_id,
                kind,
                submitted_snapshot_version: snapshot.version(),
                optimistic_delta: OptimisticDelta {
                    before: snapshot.placed_line(product_id),
                    target,
                },
                phase: Phase::Windowed,
                superseded: false,
                queued: None,
                waiters: Vec::new(),
            },
        );
        Admission::Accepted(id)
    }

    /// Refuses every intent while a reload or a checkout is running.
    pub(crate) fn check_open(&self) -> Result<(), SyncError> {
        if self.loading {
            return Err(BusyError::Loading.into());
        }
        if self.checkout.is_some() {
            return Err(BusyError::CheckoutInFlight.into());
        }
        Ok(())
    }

    fn submit_checkout(&mut self, snapshot: &CartSnapshot) -> Admission {
        if !self.ops.is_empty() {
            return Admission::Rejected(
                BusyError::CartBusyCheckout {
                    pending: self.ops.len(),
                }
                .into(),
            );
        }
        if snapshot.is_empty() {
            return Admission::Rejected(ValidationError::EmptyCart.into());
        }
        let id = self.next_id();
        self.checkout = Some(id);
        Admission::Accepted(id)
    }

    fn next_id(&mut self) -> OpId {
        self.next_op += 1;
        self.next_op
    }

    /// Attaches a completion channel to the intent that was just admitted for
    /// `product_id`. Returns the waiter if no operation exists for the key.
    pub(crate) fn attach_waiter(&mut self, product_id: ProductId, waiter: Waiter) -> Result<(), Waiter> {
        match self.ops.get_mut(&product_id) {
            Some(op) => {
                match op.queued.as_mut() {
                    Some(queued) => queued.waiters.push(waiter),
                    None => op.waiters.push(waiter),
                }
                Ok(())
            }
            None => Err(waiter),
        }
    }

    /// Closes the coalescing window of `op_id`. Returns `None` when the
    /// operation is no longer current (cancelled by a reload).
    pub(crate) fn begin_flight(&mut self, product_id: ProductId, op_id: OpId) -> Option<Flight> {
        let op = self.ops.get_mut(&product_id)?;
        if op.id != op_id || op.phase != Phase::Windowed || op.superseded {
            return None;
        }
        match derive_request(product_id, op.optimistic_delta.before.as_ref(), op.optimistic_delta.target) {
            Some(request) => {
                op.phase = Phase::InFlight;
                Some(Flight::Send(request))
            }
            None => self.ops.remove(&product_id).map(Flight::Settled),
        }
    }

    /// Removes the operation for `product_id` if `op_id` is still the one on
    /// record.
    pub(crate) fn take(&mut self, product_id: ProductId, op_id: OpId) -> Option<PendingOperation> {
        match self.ops.get(&product_id) {
            Some(op) if op.id == op_id => self.ops.remove(&product_id),
            _ => None,
        }
    }

    /// Registers the queued intent of a just-settled operation as a fresh
    /// windowed operation whose baseline is the line the server confirmed.
    pub(crate) fn follow_up(
        &mut self,
        product_id: ProductId,
        queued: QueuedIntent,
        before: Option<PlacedLine>,
        version: u64,
    ) -> OpId {
        let id = self.next_id();
        self.ops.insert(
            product_id,
            PendingOperation {
                id,
                key: product_id,
                kind: queued.kind,
                submitted_snapshot_version: version,
                optimistic_delta: OptimisticDelta {
                    before,
                    target: queued.target,
                },
                phase: Phase::Windowed,
                superseded: false,
                queued: None,
                waiters: queued.waiters,
            },
        );
        id
    }

    pub(crate) fn begin_load(&mut self) -> Result<(), SyncError> {
        self.check_open()?;
        self.loading = true;
        Ok(())
    }

    pub(crate) fn end_load(&mut self) {
        self.loading = false;
    }

    /// Supersedes every pending operation after a full reload. Windowed
    /// operations are dropped outright; in-flight ones keep their key occupied
    /// until their response arrives. Returns the callers to notify.
    pub(crate) fn invalidate_all(&mut self) -> Vec<Waiter> {
        let mut waiters = Vec::new();
        let mut drained = Vec::new();
        for (product_id, op) in self.ops.iter_mut() {
            waiters.append(&mut op.waiters);
            if let Some(queued) = op.queued.take() {
                waiters.extend(queued.waiters);
            }
            match op.phase {
                Phase::Windowed => drained.push(*product_id),
                Phase::InFlight => op.superseded = true,
            }
        }
        for product_id in drained {
            self.ops.remove(&product_id);
        }
        waiters
    }

    pub(crate) fn finish_checkout(&mut self, op_id: OpId) {
        if self.checkout == Some(op_id) {
            self.checkout = None;
        }
    }

    pub fn pending(&self, product_id: ProductId) -> Option<&PendingOperation> {
        self.ops.get(&product_id)
    }

    /// Number of keys with a pending operation.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of requests currently on the wire, checkout included.
    pub fn in_flight(&self) -> usize {
        let lines = self.ops.values().filter(|op| op.phase == Phase::InFlight).count();
        lines + usize::from(self.checkout.is_some())
    }

    /// Kind of the latest intent recorded for `product_id`, queued follow-up
    /// first.
    pub fn latest_kind(&self, product_id: ProductId) -> Option<MutationKind> {
        self.ops
            .get(&product_id)
            .map(|op| op.queued.as_ref().map_or(op.kind, |queued| queued.kind))
    }

    /// Total quantity the server has confirmed. Keys with a live operation
    /// count at their baseline instead of their optimistic target; lines of
    /// superseded operations already hold reloaded server data.
    pub fn confirmed_total(&self, snapshot: &CartSnapshot) -> u32 {
        let live = |product_id: &ProductId| self.ops.get(product_id).is_some_and(|op| !op.superseded);
        let settled = snapshot
            .lines()
            .iter()
            .filter(|line| !live(&line.product_id()))
            .fold(0u32, |total, line| total.saturating_add(line.quantity()));
        self.ops
            .values()
            .filter(|op| !op.superseded)
            .filter_map(|op| op.optimistic_delta.before.as_ref())
            .fold(settled, |total, placed| total.saturating_add(placed.line.quantity()))
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn checkout_in_flight(&self) -> bool {
        self.checkout.is_some()
    }
}
