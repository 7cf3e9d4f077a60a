//! # Cart Entity Model
//!
//! Immutable snapshot types for cart lines and totals, plus the pure
//! derivation functions every other layer builds on. Nothing in this module
//! performs I/O or knows about the engine.
//!
//! Two invariants hold for every [`CartSnapshot`] the crate hands out:
//! - `subtotal == Σ line_total`
//! - no line has a quantity of zero (a zero quantity collapses to removal)

#![forbid(unsafe_code)]

/// Integer minor-unit money.
pub mod money;

pub use money::Money;

use crate::error::SyncError;
use serde::{Deserialize, Serialize};

/// Identifier of a product in the catalog.
pub type ProductId = i64;

/// Identifier of a cart line. Negative values mark provisional lines that the
/// server has not confirmed yet.
pub type LineId = i64;

/// # Cart Line
///
/// One product entry in the cart. `line_total` is always `unit_price × quantity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    line_id: LineId,
    product_id: ProductId,
    product_name: String,
    unit_price: Money,
    quantity: u32,
    line_total: Money,
}

impl CartLine {
    /// Creates a line and derives its total.
    pub fn new(
        line_id: LineId,
        product_id: ProductId,
        product_name: impl Into<String>,
        unit_price: Money,
        quantity: u32,
    ) -> Self {
        Self {
            line_id,
            product_id,
            product_name: product_name.into(),
            unit_price,
            quantity,
            line_total: unit_price * quantity,
        }
    }

    pub fn line_id(&self) -> LineId {
        self.line_id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    pub fn unit_price(&self) -> Money {
        self.unit_price
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    pub fn line_total(&self) -> Money {
        self.line_total
    }

    /// True while the line only exists locally, waiting for the server to
    /// assign a real identifier.
    pub fn is_provisional(&self) -> bool {
        self.line_id < 0
    }
}

/// Result of [`with_quantity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuantityChange {
    /// The line with its new quantity and recomputed total.
    Updated(CartLine),
    /// The quantity reached zero; the line must be removed.
    Removed,
}

/// Returns `line` at quantity `quantity`, clamping at zero.
///
/// A result below one is never kept as a line: it is reported as
/// [`QuantityChange::Removed`].
pub fn with_quantity(line: &CartLine, quantity: i64) -> QuantityChange {
    if quantity < 1 {
        return QuantityChange::Removed;
    }
    let quantity = u32::try_from(quantity).unwrap_or(u32::MAX);
    QuantityChange::Updated(CartLine {
        quantity,
        line_total: line.unit_price * quantity,
        ..line.clone()
    })
}

/// Σ quantity, saturating at `u32::MAX`.
pub fn total_quantity(lines: &[CartLine]) -> u32 {
    lines.iter().fold(0u32, |total, line| total.saturating_add(line.quantity))
}

/// Sum of all line totals.
pub fn recompute_totals(lines: &[CartLine]) -> Money {
    lines.iter().map(CartLine::line_total).sum()
}

/// What the caller knows about a product when adding it, used to render the
/// provisional line before the server answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductRef {
    pub product_id: ProductId,
    pub name: String,
    pub unit_price: Money,
}

impl ProductRef {
    pub fn new(product_id: ProductId, name: impl Into<String>, unit_price: Money) -> Self {
        Self {
            product_id,
            name: name.into(),
            unit_price,
        }
    }

    /// A product known only by its id; the provisional line shows a zero
    /// price until the server confirms it.
    pub fn unpriced(product_id: ProductId) -> Self {
        Self::new(product_id, String::new(), Money::ZERO)
    }

    pub(crate) fn from_line(line: &CartLine) -> Self {
        Self::new(line.product_id, line.product_name.clone(), line.unit_price)
    }
}

/// A line together with the index it occupies in the snapshot, so that a
/// rollback can put it back exactly where it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedLine {
    pub index: usize,
    pub line: CartLine,
}

/// # Cart Snapshot
///
/// The canonical, versioned view of the cart. Snapshots are cheap to clone
/// and are what subscribers receive; only the engine produces new ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CartSnapshot {
    lines: Vec<CartLine>,
    subtotal: Money,
    is_loading: bool,
    last_error: Option<SyncError>,
    version: u64,
}

impl CartSnapshot {
    /// An empty cart at version zero.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> &[CartLine] {
        &self.lines
    }

    pub fn subtotal(&self) -> Money {
        self.subtotal
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn last_error(&self) -> Option<&SyncError> {
        self.last_error.as_ref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Total number of items across all lines (the badge count).
    pub fn total_quantity(&self) -> u32 {
        total_quantity(&self.lines)
    }

    pub fn line(&self, line_id: LineId) -> Option<&CartLine> {
        self.lines.iter().find(|l| l.line_id == line_id)
    }

    pub fn line_for_product(&self, product_id: ProductId) -> Option<&CartLine> {
        self.lines.iter().find(|l| l.product_id == product_id)
    }

    /// Checks the snapshot invariants. Always true for snapshots produced by
    /// the engine; exposed for tests and debug assertions in callers.
    pub fn invariants_hold(&self) -> bool {
        self.subtotal == recompute_totals(&self.lines) && self.lines.iter().all(|l| l.quantity > 0)
    }

    pub(crate) fn placed_line(&self, product_id: ProductId) -> Option<PlacedLine> {
        self.lines
            .iter()
            .position(|l| l.product_id == product_id)
            .map(|index| PlacedLine {
                index,
                line: self.lines[index].clone(),
            })
    }

    /// Sets the line for `product_id`, replacing it in place or appending it.
    /// `None` or a zero-quantity line removes it.
    pub(crate) fn put_line(&mut self, product_id: ProductId, line: Option<CartLine>) {
        let existing = self.lines.iter().position(|l| l.product_id == product_id);
        match (existing, line.filter(|l| l.quantity > 0)) {
            (Some(index), Some(line)) => self.lines[index] = line,
            (Some(index), None) => {
                self.lines.remove(index);
            }
            (None, Some(line)) => self.lines.push(line),
            (None, None) => {}
        }
        self.subtotal = recompute_totals(&self.lines);
    }

    /// Removes whatever line `product_id` has and reinserts `placed` at its
    /// recorded index.
    pub(crate) fn restore_line(&mut self, product_id: ProductId, placed: Option<&PlacedLine>) {
        self.lines.retain(|l| l.product_id != product_id);
        if let Some(placed) = placed {
            let index = placed.index.min(self.lines.len());
            self.lines.insert(index, placed.line.clone());
        }
        self.subtotal = recompute_totals(&self.lines);
    }

    pub(crate) fn replace_lines(&mut self, lines: Vec<CartLine>) {
        self.lines = lines.into_iter().filter(|l| l.quantity > 0).collect();
        self.subtotal = recompute_totals(&self.lines);
    }

    pub(crate) fn set_loading(&mut self, loading: bool) {
        self.is_loading = loading;
    }

    pub(crate) fn set_error(&mut self, error: Option<SyncError>) {
        self.last_error = error;
    }

    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }
}
