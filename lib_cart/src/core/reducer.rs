//! # Optimistic Reducer
//!
//! Pure functions that turn an admitted intent into the next snapshot, and
//! that invert such a change when the server refuses it. Neither function
//! touches the gate or performs I/O; the engine publishes what they return.

use crate::core::gate::{OptimisticDelta, Target};
use crate::model::{with_quantity, CartLine, CartSnapshot, LineId, ProductId, ProductRef, QuantityChange};

/// Hands out negative line ids for lines the server has not confirmed yet.
#[derive(Debug)]
pub struct ProvisionalIds {
    next: LineId,
}

impl Default for ProvisionalIds {
    fn default() -> Self {
        Self { next: -1 }
    }
}

impl ProvisionalIds {
    pub fn next_id(&mut self) -> LineId {
        let id = self.next;
        self.next -= 1;
        id
    }
}

/// Returns `snapshot` with the line of `product` set to `target`.
///
/// An existing line keeps its id, name, price and position. A missing line is
/// appended as a provisional line built from `product`.
pub fn apply(snapshot: &CartSnapshot, product: &ProductRef, target: Target, ids: &mut ProvisionalIds) -> CartSnapshot {
    let mut next = snapshot.clone();
    let line = match target {
        Target::Absent => None,
        Target::Quantity(quantity) => match snapshot.line_for_product(product.product_id) {
            Some(existing) => match with_quantity(existing, i64::from(quantity)) {
                QuantityChange::Updated(line) => Some(line),
                QuantityChange::Removed => None,
            },
            None => Some(CartLine::new(
                ids.next_id(),
                product.product_id,
                product.name.clone(),
                product.unit_price,
                quantity,
            )),
        },
    };
    next.put_line(product.product_id, line);
    next.bump_version();
    next
}

/// Returns `snapshot` with the line of `product_id` restored to the state the
/// server last confirmed. Applying it twice yields the same lines.
pub fn rollback(snapshot: &CartSnapshot, product_id: ProductId, delta: &OptimisticDelta) -> CartSnapshot {
    let mut next = snapshot.clone();
    next.restore_line(product_id, delta.before.as_ref());
    next.bump_version();
    next
}
