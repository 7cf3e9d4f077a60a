//! # Cart Synchronization Engine
//!
//! The public facade. It owns the canonical [`CartSnapshot`], admits intents
//! through the [`DedupGate`](crate::core::gate::DedupGate), applies their
//! optimistic effect at once, and drives each accepted operation on its own
//! Tokio task:
//!
//! ```text
//! intent ─▶ gate ─▶ reducer ─▶ publish          (synchronous, under the lock)
//!              └─▶ task: window ─▶ request ─▶ reconciler ─▶ publish + badge
//! ```
//!
//! The state lock is a plain `std::sync::Mutex` and is never held across an
//! `.await`. Listener callbacks, the notification sink and completion
//! channels are all served after the lock is released.
//!
//! Mutating calls spawn tasks and must be made from within a Tokio runtime.

use crate::configs::EngineConfig;
use crate::core::gate::{Admission, DedupGate, Flight, LineKey, MutationKind, OpId, Target};
use crate::core::listeners::{ListenerRegistry, Subscription};
use crate::core::reconciler::{self, Settlement};
use crate::core::reducer;
use crate::core::state::CartState;
use crate::error::{ErrorReason, MutationResult, SyncError, ValidationError};
use crate::model::{CartSnapshot, LineId, ProductId, ProductRef};
use crate::service::{CartService, NotificationSink, ServiceError, ServiceReply};
use std::cmp::Ordering;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// # Mutation Ticket
///
/// Returned by every line mutation and by checkout. The admission decision is
/// available immediately; the final outcome once the request is reconciled.
#[derive(Debug)]
#[must_use = "a ticket carries the admission decision and the eventual outcome"]
pub struct MutationTicket {
    admission: Admission,
    outcome: oneshot::Receiver<MutationResult>,
}

/// An intent resolved against the current state: the product it touches,
/// what the user asked for and the end state of the line. `None` when the
/// line already shows the requested state and nothing is pending for it.
type Intent = Option<(ProductRef, MutationKind, Target)>;

impl MutationTicket {
    fn unchanged() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(()));
        Self {
            admission: Admission::Unchanged,
            outcome: rx,
        }
    }

    fn rejected(error: SyncError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error.clone()));
        Self {
            admission: Admission::Rejected(error),
            outcome: rx,
        }
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    pub fn is_rejected(&self) -> bool {
        self.admission.is_rejected()
    }

    pub fn rejection_reason(&self) -> Option<ErrorReason> {
        self.admission.reason()
    }

    /// Waits for the mutation to settle.
    pub async fn outcome(self) -> MutationResult {
        self.outcome
            .await
            .unwrap_or_else(|_| Err(SyncError::Transport("cart engine dropped the operation".into())))
    }
}

struct EngineInner {
    state: Mutex<CartState>,
    service: Arc<dyn CartService>,
    sink: Arc<dyn NotificationSink>,
    listeners: Arc<ListenerRegistry>,
    config: EngineConfig,
}

impl EngineInner {
    fn lock_state(&self) -> MutexGuard<'_, CartState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// # Cart Engine
///
/// Cheap to clone; clones share the same cart.
#[derive(Clone)]
pub struct CartEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for CartEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CartEngine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl CartEngine {
    pub fn new(service: Arc<dyn CartService>, sink: Arc<dyn NotificationSink>, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                state: Mutex::new(CartState::new()),
                service,
                sink,
                listeners: Arc::new(ListenerRegistry::new()),
                config,
            }),
        }
    }

    /// The current canonical snapshot.
    pub fn snapshot(&self) -> CartSnapshot {
        self.inner.lock_state().snapshot.clone()
    }

    /// Number of line keys with a pending operation.
    pub fn pending_count(&self) -> usize {
        self.inner.lock_state().gate.len()
    }

    /// Number of requests currently on the wire.
    pub fn in_flight_count(&self) -> usize {
        self.inner.lock_state().gate.in_flight()
    }

    /// Registers `listener` for every snapshot published from now on.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&CartSnapshot) + Send + Sync + 'static,
    {
        let id = self.inner.listeners.add(Arc::new(listener));
        Subscription::new(id, &self.inner.listeners)
    }

    /// Clears `last_error` after the UI has shown it.
    pub fn dismiss_error(&self) {
        {
            let mut state = self.inner.lock_state();
            if state.snapshot.last_error().is_none() {
                return;
            }
            state.snapshot.set_error(None);
            state.snapshot.bump_version();
            self.inner.listeners.enqueue(state.snapshot.clone());
        }
        self.inner.listeners.flush();
    }

    /// Replaces the whole cart with the server's copy. A successful reload
    /// supersedes every pending mutation.
    pub async fn load_cart(&self) -> MutationResult {
        let begun = {
            let mut state = self.inner.lock_state();
            let begun = state.gate.begin_load();
            if begun.is_ok() {
                state.snapshot.set_loading(true);
                state.snapshot.set_error(None);
                state.snapshot.bump_version();
                self.inner.listeners.enqueue(state.snapshot.clone());
            }
            begun
        };
        self.inner.listeners.flush();
        if let Err(error) = begun {
            debug!(%error, "cart load refused");
            return Err(error);
        }

        info!("loading cart");
        let outcome = self
            .timed(self.inner.service.fetch_cart())
            .await
            .map(|cart| cart.into_lines());
        let result = outcome.as_ref().map(|_| ()).map_err(Clone::clone);
        self.settle(|state| reconciler::settle_load(state, outcome));
        result
    }

    /// Adds `quantity` units of a product known only by id.
    pub fn add_item(&self, product_id: ProductId, quantity: u32) -> MutationTicket {
        self.add_product(ProductRef::unpriced(product_id), quantity)
    }

    /// Adds `quantity` units of `product`. Its name and price render the
    /// provisional line until the server confirms it.
    pub fn add_product(&self, product: ProductRef, quantity: u32) -> MutationTicket {
        self.submit_line(move |snapshot, _| {
            if quantity < 1 {
                return Err(ValidationError::QuantityBelowOne(quantity).into());
            }
            let (product, current) = match snapshot.line_for_product(product.product_id) {
                Some(line) => (ProductRef::from_line(line), line.quantity()),
                None => (product, 0),
            };
            Ok(Some((product, MutationKind::Add, Target::Quantity(current.saturating_add(quantity)))))
        })
    }

    /// Sets the quantity of a line. Zero is rejected; use
    /// [`remove_item`](Self::remove_item). Setting the quantity the line
    /// already shows is [`Admission::Unchanged`] unless an operation is
    /// pending for it, in which case it joins that operation.
    pub fn change_quantity(&self, line_id: LineId, quantity: u32) -> MutationTicket {
        self.submit_line(move |snapshot, gate| {
            let line = snapshot
                .line(line_id)
                .ok_or(SyncError::Validation(ValidationError::UnknownLine(line_id)))?;
            if quantity < 1 {
                return Err(ValidationError::QuantityBelowOne(quantity).into());
            }
            let kind = match quantity.cmp(&line.quantity()) {
                Ordering::Greater => MutationKind::Increment,
                Ordering::Less => MutationKind::Decrement,
                Ordering::Equal => match gate.latest_kind(line.product_id()) {
                    Some(kind) => kind,
                    None => return Ok(None),
                },
            };
            Ok(Some((ProductRef::from_line(line), kind, Target::Quantity(quantity))))
        })
    }

    /// One "+" tap.
    pub fn increment(&self, line_id: LineId) -> MutationTicket {
        self.submit_line(move |snapshot, _| {
            let line = snapshot
                .line(line_id)
                .ok_or(SyncError::Validation(ValidationError::UnknownLine(line_id)))?;
            Ok(Some((
                ProductRef::from_line(line),
                MutationKind::Increment,
                Target::Quantity(line.quantity().saturating_add(1)),
            )))
        })
    }

    /// One "−" tap. At quantity 1 this removes the line.
    pub fn decrement(&self, line_id: LineId) -> MutationTicket {
        self.submit_line(move |snapshot, _| {
            let line = snapshot
                .line(line_id)
                .ok_or(SyncError::Validation(ValidationError::UnknownLine(line_id)))?;
            let (kind, target) = if line.quantity() <= 1 {
                (MutationKind::Remove, Target::Absent)
            } else {
                (MutationKind::Decrement, Target::Quantity(line.quantity() - 1))
            };
            Ok(Some((ProductRef::from_line(line), kind, target)))
        })
    }

    pub fn remove_item(&self, line_id: LineId) -> MutationTicket {
        self.submit_line(move |snapshot, _| {
            let line = snapshot
                .line(line_id)
                .ok_or(SyncError::Validation(ValidationError::UnknownLine(line_id)))?;
            Ok(Some((ProductRef::from_line(line), MutationKind::Remove, Target::Absent)))
        })
    }

    /// Submits the whole cart as an order. Refused while any line mutation is
    /// pending.
    pub fn checkout(&self) -> MutationTicket {
        let admission = {
            let mut state = self.inner.lock_state();
            let state = &mut *state;
            state
                .gate
                .submit(LineKey::Cart, MutationKind::Checkout, Target::Absent, &state.snapshot)
        };
        let op_id = match &admission {
            Admission::Rejected(error) => {
                debug!(%error, "checkout refused");
                return MutationTicket::rejected(error.clone());
            }
            Admission::Accepted(id) | Admission::Coalesced(id) => *id,
            Admission::Unchanged => return MutationTicket::unchanged(),
        };

        info!(op_id, "checkout started");
        let (tx, rx) = oneshot::channel();
        let engine = self.clone();
        tokio::spawn(async move {
            let outcome = engine.timed(engine.inner.service.checkout()).await;
            engine.settle(|state| reconciler::settle_checkout(state, op_id, &outcome));
            let _ = tx.send(outcome);
        });
        MutationTicket {
            admission,
            outcome: rx,
        }
    }

    /// Admits a line intent resolved against the current snapshot, applies it
    /// optimistically and schedules its request.
    fn submit_line<F>(&self, resolve: F) -> MutationTicket
    where
        F: FnOnce(&CartSnapshot, &DedupGate) -> Result<Intent, SyncError>,
    {
        let (ticket, schedule) = {
            let mut state = self.inner.lock_state();
            let state = &mut *state;
            let (product, kind, target) = match resolve(&state.snapshot, &state.gate) {
                Ok(Some(intent)) => intent,
                Ok(None) => {
                    return match state.gate.check_open() {
                        Ok(()) => MutationTicket::unchanged(),
                        Err(error) => MutationTicket::rejected(error),
                    };
                }
                Err(error) => {
                    debug!(%error, "mutation refused");
                    return MutationTicket::rejected(error);
                }
            };
            let product_id = product.product_id;
            let admission = state
                .gate
                .submit(LineKey::Product(product_id), kind, target, &state.snapshot);
            if let Admission::Rejected(error) = &admission {
                debug!(product_id, ?kind, %error, "mutation refused");
                return MutationTicket::rejected(error.clone());
            }

            let (tx, rx) = oneshot::channel();
            if let Err(tx) = state.gate.attach_waiter(product_id, tx) {
                let _ = tx.send(Ok(()));
            }
            state.snapshot = reducer::apply(&state.snapshot, &product, target, &mut state.provisional);
            self.inner.listeners.enqueue(state.snapshot.clone());
            debug!(product_id, ?kind, ?target, ?admission, version = state.snapshot.version(), "mutation admitted");

            let schedule = match admission {
                Admission::Accepted(op_id) => Some((product_id, op_id)),
                _ => None,
            };
            (
                MutationTicket {
                    admission,
                    outcome: rx,
                },
                schedule,
            )
        };
        self.inner.listeners.flush();
        if let Some((product_id, op_id)) = schedule {
            self.spawn_drive(product_id, op_id);
        }
        ticket
    }

    fn spawn_drive(&self, product_id: ProductId, op_id: OpId) {
        let engine = self.clone();
        tokio::spawn(async move { engine.drive(product_id, op_id).await });
    }

    /// Window, request, reconcile.
    async fn drive(&self, product_id: ProductId, op_id: OpId) {
        let window = self.inner.config.coalesce_window();
        if !window.is_zero() {
            tokio::time::sleep(window).await;
        }

        let flight = self.inner.lock_state().gate.begin_flight(product_id, op_id);
        let request = match flight {
            None => {
                debug!(product_id, op_id, "operation cancelled before its request was sent");
                return;
            }
            Some(Flight::Settled(op)) => {
                self.settle(|state| reconciler::settle_skip(state, op));
                return;
            }
            Some(Flight::Send(request)) => request,
        };

        debug!(product_id, op_id, ?request, "sending cart request");
        let outcome = self
            .timed(self.inner.service.execute(&request))
            .await
            .and_then(|reply| match reply {
                ServiceReply::Line(line) => Ok(Some(line.into_line())),
                ServiceReply::Removed => Ok(None),
                other => Err(SyncError::Transport(format!("unexpected reply to {request:?}: {other:?}"))),
            });
        self.settle(|state| reconciler::settle_line(state, product_id, op_id, outcome));
    }

    /// Bounds a service call by the configured request timeout.
    async fn timed<T, F>(&self, call: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, ServiceError>>,
    {
        let limit = self.inner.config.request_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(SyncError::Timeout(limit)),
        }
    }

    /// Runs a reconciliation step under the lock, then performs its deferred
    /// effects.
    fn settle<F>(&self, step: F)
    where
        F: FnOnce(&mut CartState) -> Settlement,
    {
        let settlement = {
            let mut state = self.inner.lock_state();
            let settlement = step(&mut state);
            if settlement.publish {
                self.inner.listeners.enqueue(state.snapshot.clone());
            }
            settlement
        };
        self.inner.listeners.flush();
        if let Some(total) = settlement.badge {
            self.notify(total);
        }
        for (waiter, result) in settlement.completions {
            let _ = waiter.send(result);
        }
        if let Some((product_id, op_id)) = settlement.follow_up {
            self.spawn_drive(product_id, op_id);
        }
    }

    fn notify(&self, total: u32) {
        let sink = Arc::clone(&self.inner.sink);
        match panic::catch_unwind(AssertUnwindSafe(|| sink.notify_count(total))) {
            Ok(Ok(())) => debug!(total, "badge count delivered"),
            Ok(Err(error)) => warn!(total, %error, "notification sink failed"),
            Err(_) => warn!(total, "notification sink panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Money;
    use crate::service::{CartRequest, InMemoryCartService, ServerCart, ServerLine, SinkError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<u32>>);

    impl RecordingSink {
        fn counts(&self) -> Vec<u32> {
            self.0.lock().unwrap().clone()
        }
    }

    impl NotificationSink for RecordingSink {
        fn notify_count(&self, total: u32) -> Result<(), SinkError> {
            self.0.lock().unwrap().push(total);
            Ok(())
        }
    }

    /// Delegates to an in-memory service and records the peak number of
    /// concurrent calls.
    struct ProbeService {
        inner: InMemoryCartService,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ProbeService {
        fn new(inner: InMemoryCartService) -> Self {
            Self {
                inner,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        async fn track<T>(&self, call: impl Future<Output = T>) -> T {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let out = call.await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            out
        }
    }

    #[async_trait]
    impl CartService for ProbeService {
        async fn fetch_cart(&self) -> Result<ServerCart, ServiceError> {
            self.inner.fetch_cart().await
        }
        async fn add_item(&self, product_id: ProductId, quantity: u32) -> Result<ServerLine, ServiceError> {
            self.track(self.inner.add_item(product_id, quantity)).await
        }
        async fn set_quantity(&self, line_id: LineId, quantity: u32) -> Result<ServerLine, ServiceError> {
            self.track(self.inner.set_quantity(line_id, quantity)).await
        }
        async fn remove_item(&self, line_id: LineId) -> Result<(), ServiceError> {
            self.track(self.inner.remove_item(line_id)).await
        }
        async fn checkout(&self) -> Result<(), ServiceError> {
            self.inner.checkout().await
        }
    }

    /// Never answers.
    struct SilentService;

    #[async_trait]
    impl CartService for SilentService {
        async fn fetch_cart(&self) -> Result<ServerCart, ServiceError> {
            std::future::pending().await
        }
        async fn add_item(&self, _: ProductId, _: u32) -> Result<ServerLine, ServiceError> {
            std::future::pending().await
        }
        async fn set_quantity(&self, _: LineId, _: u32) -> Result<ServerLine, ServiceError> {
            std::future::pending().await
        }
        async fn remove_item(&self, _: LineId) -> Result<(), ServiceError> {
            std::future::pending().await
        }
        async fn checkout(&self) -> Result<(), ServiceError> {
            std::future::pending().await
        }
    }

    /// Answers updates of one line late and with an error; everything else
    /// goes straight to the in-memory cart.
    struct BrokenLine {
        inner: InMemoryCartService,
        line_id: LineId,
        delay: Duration,
    }

    #[async_trait]
    impl CartService for BrokenLine {
        async fn fetch_cart(&self) -> Result<ServerCart, ServiceError> {
            self.inner.fetch_cart().await
        }
        async fn add_item(&self, product_id: ProductId, quantity: u32) -> Result<ServerLine, ServiceError> {
            self.inner.add_item(product_id, quantity).await
        }
        async fn set_quantity(&self, line_id: LineId, quantity: u32) -> Result<ServerLine, ServiceError> {
            if line_id == self.line_id {
                tokio::time::sleep(self.delay).await;
                return Err(ServiceError::Transport("connection reset".into()));
            }
            self.inner.set_quantity(line_id, quantity).await
        }
        async fn remove_item(&self, line_id: LineId) -> Result<(), ServiceError> {
            self.inner.remove_item(line_id).await
        }
        async fn checkout(&self) -> Result<(), ServiceError> {
            self.inner.checkout().await
        }
    }

    fn shop() -> InMemoryCartService {
        InMemoryCartService::with_catalog([
            (7, "tea", Money::from_cents(450)),
            (8, "mug", Money::from_cents(1200)),
        ])
    }

    fn config(window_ms: u64) -> EngineConfig {
        EngineConfig {
            coalesce_window_ms: window_ms,
            request_timeout_ms: 5_000,
        }
    }

    fn engine_with(service: Arc<dyn CartService>, window_ms: u64) -> (CartEngine, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let engine = CartEngine::new(service, sink.clone(), config(window_ms));
        (engine, sink)
    }

    fn sent_line_requests(service: &InMemoryCartService) -> Vec<CartRequest> {
        service
            .requests()
            .into_iter()
            .filter(|r| !matches!(r, CartRequest::FetchCart))
            .collect()
    }

    #[tokio::test]
    async fn adding_to_an_empty_cart_yields_one_confirmed_line() {
        let service = Arc::new(shop());
        let (engine, sink) = engine_with(service.clone(), 10);

        let ticket = engine.add_item(7, 1);
        assert!(matches!(ticket.admission(), Admission::Accepted(_)));
        let provisional = engine.snapshot();
        assert!(provisional.lines()[0].is_provisional());

        ticket.outcome().await.unwrap();
        let snap = engine.snapshot();
        assert_eq!(snap.lines().len(), 1);
        let line = &snap.lines()[0];
        assert!(!line.is_provisional());
        assert_eq!(line.quantity(), 1);
        assert_eq!(snap.subtotal(), Money::from_cents(450));
        assert_eq!(sink.counts(), vec![1]);
        assert!(snap.invariants_hold());
    }

    #[tokio::test]
    async fn rapid_taps_within_the_window_send_one_patch() {
        let service = Arc::new(shop());
        let line_id = service.seed_line(7, 3).unwrap();
        let (engine, sink) = engine_with(service.clone(), 80);
        engine.load_cart().await.unwrap();

        let tickets = [engine.increment(line_id), engine.increment(line_id), engine.increment(line_id)];
        assert!(matches!(tickets[1].admission(), Admission::Coalesced(_)));
        assert_eq!(engine.snapshot().line(line_id).unwrap().quantity(), 6);
        for ticket in tickets {
            ticket.outcome().await.unwrap();
        }

        assert_eq!(
            sent_line_requests(&service),
            vec![CartRequest::SetQuantity { line_id, quantity: 6 }]
        );
        assert_eq!(engine.snapshot().line(line_id).unwrap().quantity(), 6);
        assert_eq!(sink.counts(), vec![3, 6]);
    }

    #[tokio::test]
    async fn failed_change_reverts_and_skips_the_sink() {
        let service = Arc::new(shop());
        let line_id = service.seed_line(8, 2).unwrap();
        let (engine, sink) = engine_with(service.clone(), 5);
        engine.load_cart().await.unwrap();
        let before = engine.snapshot();

        service.fail_next(ServiceError::Transport("connection reset".into()));
        let ticket = engine.change_quantity(line_id, 5);
        assert_eq!(engine.snapshot().line(line_id).unwrap().quantity(), 5);
        let err = ticket.outcome().await.unwrap_err();
        assert_eq!(err.reason(), ErrorReason::Transport);

        let after = engine.snapshot();
        assert_eq!(after.lines(), before.lines());
        assert_eq!(after.subtotal(), before.subtotal());
        assert_eq!(after.last_error().map(SyncError::reason), Some(ErrorReason::Transport));
        assert_eq!(sink.counts(), vec![2]);

        engine.dismiss_error();
        assert!(engine.snapshot().last_error().is_none());
    }

    #[tokio::test]
    async fn checkout_waits_for_pending_lines() {
        let service = Arc::new(shop());
        let line_id = service.seed_line(7, 1).unwrap();
        let (engine, sink) = engine_with(service.clone(), 20);
        engine.load_cart().await.unwrap();

        let pending = engine.increment(line_id);
        let refused = engine.checkout();
        assert_eq!(refused.rejection_reason(), Some(ErrorReason::CartBusyCheckout));
        assert!(refused.outcome().await.is_err());

        pending.outcome().await.unwrap();
        let retried = engine.checkout();
        assert!(!retried.is_rejected());
        assert_eq!(engine.increment(line_id).rejection_reason(), Some(ErrorReason::Busy));
        retried.outcome().await.unwrap();

        assert!(engine.snapshot().is_empty());
        assert_eq!(service.orders(), 1);
        assert_eq!(sink.counts(), vec![1, 2, 0]);
    }

    #[tokio::test]
    async fn zero_quantity_is_a_validation_error() {
        let service = Arc::new(shop());
        let line_id = service.seed_line(7, 2).unwrap();
        let (engine, _sink) = engine_with(service.clone(), 5);
        engine.load_cart().await.unwrap();
        let version = engine.snapshot().version();

        let ticket = engine.change_quantity(line_id, 0);
        assert_eq!(ticket.rejection_reason(), Some(ErrorReason::InvalidQuantity));
        assert_eq!(engine.snapshot().version(), version);
        assert_eq!(engine.pending_count(), 0);

        let unknown = engine.increment(999);
        assert_eq!(unknown.rejection_reason(), Some(ErrorReason::UnknownLine));
        assert_eq!(engine.add_item(7, 0).rejection_reason(), Some(ErrorReason::InvalidQuantity));
    }

    #[tokio::test]
    async fn intents_during_flight_become_one_follow_up() {
        let inner = shop();
        let line_id = inner.seed_line(7, 3).unwrap();
        inner.set_latency(Some(Duration::from_millis(120)));
        let service = Arc::new(ProbeService::new(inner));
        let (engine, _sink) = engine_with(service.clone(), 10);
        engine.load_cart().await.unwrap();

        let first = engine.increment(line_id);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(engine.in_flight_count(), 1);
        let second = engine.increment(line_id);
        let third = engine.increment(line_id);
        assert!(matches!(second.admission(), Admission::Coalesced(_)));
        assert_eq!(engine.snapshot().line(line_id).unwrap().quantity(), 6);

        first.outcome().await.unwrap();
        second.outcome().await.unwrap();
        third.outcome().await.unwrap();

        assert_eq!(service.peak.load(Ordering::SeqCst), 1);
        assert_eq!(
            sent_line_requests(&service.inner),
            vec![
                CartRequest::SetQuantity { line_id, quantity: 4 },
                CartRequest::SetQuantity { line_id, quantity: 6 },
            ]
        );
        assert_eq!(engine.snapshot().line(line_id).unwrap().quantity(), 6);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn decrement_at_one_removes_the_line() {
        let service = Arc::new(shop());
        let line_id = service.seed_line(7, 1).unwrap();
        let (engine, sink) = engine_with(service.clone(), 5);
        engine.load_cart().await.unwrap();

        let ticket = engine.decrement(line_id);
        assert!(engine.snapshot().is_empty());
        ticket.outcome().await.unwrap();
        assert_eq!(sent_line_requests(&service), vec![CartRequest::Remove { line_id }]);
        assert!(service.lines().is_empty());
        assert_eq!(sink.counts(), vec![1, 0]);
    }

    #[tokio::test]
    async fn add_then_remove_inside_the_window_sends_nothing() {
        let service = Arc::new(shop());
        let (engine, _sink) = engine_with(service.clone(), 40);

        let added = engine.add_product(ProductRef::new(8, "mug", Money::from_cents(1200)), 2);
        assert_eq!(engine.snapshot().subtotal(), Money::from_cents(2400));
        let provisional = engine.snapshot().line_for_product(8).unwrap().line_id();
        let removed = engine.remove_item(provisional);

        added.outcome().await.unwrap();
        removed.outcome().await.unwrap();
        assert!(sent_line_requests(&service).is_empty());
        assert!(engine.snapshot().is_empty());
    }

    #[tokio::test]
    async fn reload_supersedes_in_flight_requests() {
        let service = Arc::new(shop());
        let line_id = service.seed_line(7, 3).unwrap();
        let (engine, _sink) = engine_with(service.clone(), 5);
        engine.load_cart().await.unwrap();

        service.set_latency(Some(Duration::from_millis(150)));
        let ticket = engine.increment(line_id);
        tokio::time::sleep(Duration::from_millis(40)).await;
        service.set_latency(None);

        engine.load_cart().await.unwrap();
        assert_eq!(ticket.outcome().await, Err(SyncError::Superseded));
        let reloaded = engine.snapshot();
        assert_eq!(reloaded.line(line_id).unwrap().quantity(), 3);
        assert_eq!(engine.increment(line_id).rejection_reason(), Some(ErrorReason::Busy));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.snapshot(), reloaded, "the stale response must not touch the snapshot");
        assert_eq!(engine.pending_count(), 0);
        assert!(!engine.increment(line_id).is_rejected());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_service_times_out_and_rolls_back() {
        let sink = Arc::new(RecordingSink::default());
        let engine = CartEngine::new(
            Arc::new(SilentService),
            sink.clone(),
            EngineConfig {
                coalesce_window_ms: 0,
                request_timeout_ms: 1_000,
            },
        );

        let ticket = engine.add_item(7, 2);
        assert_eq!(engine.snapshot().total_quantity(), 2);
        let err = ticket.outcome().await.unwrap_err();
        assert_eq!(err, SyncError::Timeout(Duration::from_secs(1)));
        assert!(engine.snapshot().is_empty());
        assert_eq!(engine.pending_count(), 0);
        assert!(sink.counts().is_empty());
    }

    #[tokio::test]
    async fn listeners_see_every_version_in_order() {
        let service = Arc::new(shop());
        let (engine, _sink) = engine_with(service.clone(), 5);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let subscription = engine.subscribe(move |snap| {
            let line_id = snap.lines().first().map(|l| l.line_id());
            log.lock().unwrap().push((snap.version(), line_id));
        });

        engine.add_item(8, 1).outcome().await.unwrap();
        drop(subscription);
        engine.add_item(7, 1).outcome().await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].0 < seen[1].0);
        assert!(seen[0].1.unwrap() < 0, "first delivery shows the provisional line");
        assert!(seen[1].1.unwrap() > 0, "second delivery shows the confirmed line");
    }

    #[tokio::test]
    async fn a_failing_sink_never_affects_the_cart() {
        let service = Arc::new(shop());
        let sink = |_: u32| -> Result<(), SinkError> { Err(SinkError("badge service down".into())) };
        let engine = CartEngine::new(service, Arc::new(sink), config(5));

        engine.add_item(7, 3).outcome().await.unwrap();
        let snap = engine.snapshot();
        assert_eq!(snap.total_quantity(), 3);
        assert!(snap.last_error().is_none());
    }

    #[tokio::test]
    async fn failed_load_keeps_the_lines_and_reports_the_error() {
        let service = Arc::new(shop());
        service.seed_line(7, 2).unwrap();
        let (engine, _sink) = engine_with(service.clone(), 5);
        engine.load_cart().await.unwrap();

        service.fail_next(ServiceError::Server {
            status: 503,
            message: "maintenance".into(),
        });
        let err = engine.load_cart().await.unwrap_err();
        assert_eq!(err.reason(), ErrorReason::Server);
        let snap = engine.snapshot();
        assert!(!snap.is_loading());
        assert_eq!(snap.total_quantity(), 2);
        assert_eq!(snap.last_error(), Some(&err));
    }

    #[tokio::test]
    async fn badge_only_counts_confirmed_quantities() {
        let inner = shop();
        let tea = inner.seed_line(7, 1).unwrap();
        let mug = inner.seed_line(8, 1).unwrap();
        let service = Arc::new(BrokenLine {
            inner,
            line_id: mug,
            delay: Duration::from_millis(120),
        });
        let (engine, sink) = engine_with(service, 5);
        engine.load_cart().await.unwrap();

        let failing = engine.increment(mug);
        let succeeding = engine.increment(tea);
        succeeding.outcome().await.unwrap();
        assert_eq!(sink.counts(), vec![2, 3], "the unconfirmed mug tap stays off the badge");

        failing.outcome().await.unwrap_err();
        let snap = engine.snapshot();
        assert_eq!(snap.total_quantity(), 3);
        assert_eq!(sink.counts(), vec![2, 3]);
    }

    #[tokio::test]
    async fn huge_quantities_saturate_instead_of_panicking() {
        let service = Arc::new(shop());
        let (engine, sink) = engine_with(service.clone(), 5);

        engine.add_item(7, u32::MAX).outcome().await.unwrap();
        engine.add_item(8, 1).outcome().await.unwrap();

        let snap = engine.snapshot();
        assert_eq!(snap.lines().len(), 2);
        assert_eq!(snap.total_quantity(), u32::MAX);
        assert!(snap.invariants_hold());
        assert_eq!(sink.counts(), vec![u32::MAX]);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn remove_during_an_add_becomes_one_delete_after_it() {
        let service = Arc::new(shop());
        service.set_latency(Some(Duration::from_millis(80)));
        let (engine, sink) = engine_with(service.clone(), 5);

        let added = engine.add_item(7, 2);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(engine.in_flight_count(), 1);
        let provisional = engine.snapshot().line_for_product(7).unwrap().line_id();
        assert!(provisional < 0);

        let removed = engine.remove_item(provisional);
        assert!(matches!(removed.admission(), Admission::Coalesced(_)));
        assert!(engine.snapshot().is_empty());

        added.outcome().await.unwrap();
        removed.outcome().await.unwrap();

        assert_eq!(
            sent_line_requests(&service),
            vec![
                CartRequest::Add { product_id: 7, quantity: 2 },
                CartRequest::Remove { line_id: 1 },
            ]
        );
        assert!(engine.snapshot().is_empty());
        assert!(service.lines().is_empty());
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(sink.counts().last(), Some(&0));
    }

    #[tokio::test]
    async fn setting_the_current_quantity_changes_nothing() {
        let service = Arc::new(shop());
        let line_id = service.seed_line(7, 2).unwrap();
        let (engine, _sink) = engine_with(service.clone(), 20);
        engine.load_cart().await.unwrap();
        let version = engine.snapshot().version();

        let same = engine.change_quantity(line_id, 2);
        assert_eq!(same.admission(), &Admission::Unchanged);
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.snapshot().version(), version);
        same.outcome().await.unwrap();

        let raised = engine.change_quantity(line_id, 3);
        let repeated = engine.change_quantity(line_id, 3);
        assert!(matches!(repeated.admission(), Admission::Coalesced(_)));
        raised.outcome().await.unwrap();
        repeated.outcome().await.unwrap();
        assert_eq!(
            sent_line_requests(&service),
            vec![CartRequest::SetQuantity { line_id, quantity: 3 }]
        );
    }
}
