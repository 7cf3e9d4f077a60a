//! # Cart Service Contract
//!
//! The engine talks to the remote, authoritative cart through the
//! [`CartService`] trait. Implementations:
//!
//! - [`InMemoryCartService`](memory::InMemoryCartService): a process-local
//!   cart used by tests and the console's offline mode.
//! - `HttpCartService` (feature `retrieve`): the REST adapter.
//!
//! The wire DTOs accept both the current field names and the ones used by the
//! legacy cart backend (`items`, `totalPrice`, `cartItemId`, `price`,
//! `subTotal`).

/// In-memory cart service.
pub mod memory;

use crate::error::SyncError;
use crate::model::{CartLine, LineId, Money, ProductId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub use memory::InMemoryCartService;

/// One request the engine can put on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum CartRequest {
    FetchCart,
    #[serde(rename_all = "camelCase")]
    Add { product_id: ProductId, quantity: u32 },
    #[serde(rename_all = "camelCase")]
    SetQuantity { line_id: LineId, quantity: u32 },
    #[serde(rename_all = "camelCase")]
    Remove { line_id: LineId },
    Checkout,
}

/// Successful answer to a [`CartRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceReply {
    Cart(ServerCart),
    Line(ServerLine),
    Removed,
    CheckedOut,
}

/// Adapter-level failures. All of them take the engine's failure path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("server responded {status}: {message}")]
    Server { status: u16, message: String },

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<ServiceError> for SyncError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Transport(message) => SyncError::Transport(message),
            ServiceError::Decode(message) => SyncError::Transport(format!("malformed response: {message}")),
            ServiceError::Server { status, message } => SyncError::Server { status, message },
            ServiceError::Timeout(after) => SyncError::Timeout(after),
        }
    }
}

/// A cart line as the service reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerLine {
    #[serde(alias = "cartItemId")]
    pub line_id: LineId,
    pub product_id: ProductId,
    #[serde(default)]
    pub product_name: String,
    #[serde(alias = "price")]
    pub unit_price: Money,
    pub quantity: u32,
    #[serde(default, alias = "subTotal", skip_serializing_if = "Option::is_none")]
    pub line_total: Option<Money>,
}

impl ServerLine {
    pub fn from_line(line: &CartLine) -> Self {
        Self {
            line_id: line.line_id(),
            product_id: line.product_id(),
            product_name: line.product_name().to_string(),
            unit_price: line.unit_price(),
            quantity: line.quantity(),
            line_total: Some(line.line_total()),
        }
    }

    /// Converts to the engine's line type. The total is recomputed from price
    /// and quantity; a disagreeing server total is logged.
    pub fn into_line(self) -> CartLine {
        let line = CartLine::new(self.line_id, self.product_id, self.product_name, self.unit_price, self.quantity);
        if let Some(reported) = self.line_total {
            if reported != line.line_total() {
                warn!(line_id = line.line_id(), %reported, computed = %line.line_total(), "server line total disagrees with price x quantity");
            }
        }
        line
    }
}

/// The whole cart as the service reports it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cart_id: Option<i64>,
    #[serde(default, alias = "items")]
    pub lines: Vec<ServerLine>,
    #[serde(default, alias = "totalPrice", skip_serializing_if = "Option::is_none")]
    pub subtotal: Option<Money>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl ServerCart {
    pub fn from_lines(lines: &[CartLine]) -> Self {
        Self {
            cart_id: None,
            lines: lines.iter().map(ServerLine::from_line).collect(),
            subtotal: Some(lines.iter().map(CartLine::line_total).sum()),
            status: None,
        }
    }

    /// Normalizes the server cart into snapshot lines: zero-quantity lines are
    /// dropped, a product listed twice keeps its first line, and a reported
    /// subtotal that disagrees with the lines is logged.
    pub fn into_lines(self) -> Vec<CartLine> {
        let reported = self.subtotal;
        let mut seen = HashSet::new();
        let lines: Vec<CartLine> = self
            .lines
            .into_iter()
            .filter(|line| line.quantity > 0)
            .filter(|line| {
                let first = seen.insert(line.product_id);
                if !first {
                    warn!(product_id = line.product_id, line_id = line.line_id, "duplicate product line in server cart, keeping the first");
                }
                first
            })
            .map(ServerLine::into_line)
            .collect();
        let computed: Money = lines.iter().map(CartLine::line_total).sum();
        if let Some(reported) = reported {
            if reported != computed {
                warn!(%reported, %computed, "server subtotal disagrees with its lines, using the computed value");
            }
        }
        lines
    }

    pub fn line(&self, line_id: LineId) -> Option<&ServerLine> {
        self.lines.iter().find(|line| line.line_id == line_id)
    }
}

/// # Cart Service
///
/// The remote cart, keyed by the authenticated session. Every call may fail
/// with a transport or server error.
#[async_trait]
pub trait CartService: Send + Sync {
    /// `GET cart`
    async fn fetch_cart(&self) -> Result<ServerCart, ServiceError>;

    /// `POST cart/items`. Returns the line the server now holds for the
    /// product.
    async fn add_item(&self, product_id: ProductId, quantity: u32) -> Result<ServerLine, ServiceError>;

    /// `PATCH cart/items/{lineId}` with an absolute quantity.
    async fn set_quantity(&self, line_id: LineId, quantity: u32) -> Result<ServerLine, ServiceError>;

    /// `DELETE cart/items/{lineId}`
    async fn remove_item(&self, line_id: LineId) -> Result<(), ServiceError>;

    /// `POST cart/checkout`
    async fn checkout(&self) -> Result<(), ServiceError>;

    /// Dispatches a [`CartRequest`] to the matching call.
    async fn execute(&self, request: &CartRequest) -> Result<ServiceReply, ServiceError> {
        match request {
            CartRequest::FetchCart => self.fetch_cart().await.map(ServiceReply::Cart),
            CartRequest::Add { product_id, quantity } => {
                self.add_item(*product_id, *quantity).await.map(ServiceReply::Line)
            }
            CartRequest::SetQuantity { line_id, quantity } => {
                self.set_quantity(*line_id, *quantity).await.map(ServiceReply::Line)
            }
            CartRequest::Remove { line_id } => self.remove_item(*line_id).await.map(|()| ServiceReply::Removed),
            CartRequest::Checkout => self.checkout().await.map(|()| ServiceReply::CheckedOut),
        }
    }
}

/// A failed badge update. Logged by the engine, never propagated.
#[derive(Debug, Error)]
#[error("notification sink failed: {0}")]
pub struct SinkError(pub String);

/// # Notification Sink
///
/// Told the cart's total item count after reconciliations that change it.
/// Implementations must be cheap and must not call back into the engine.
pub trait NotificationSink: Send + Sync {
    fn notify_count(&self, total: u32) -> Result<(), SinkError>;
}

impl<F> NotificationSink for F
where
    F: Fn(u32) -> Result<(), SinkError> + Send + Sync,
{
    fn notify_count(&self, total: u32) -> Result<(), SinkError> {
        self(total)
    }
}

/// Discards every count.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn notify_count(&self, _total: u32) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Logs every count at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify_count(&self, total: u32) -> Result<(), SinkError> {
        if total > 0 {
            tracing::info!(total, "cart badge updated");
        } else {
            tracing::info!("cart badge cleared");
        }
        Ok(())
    }
}
