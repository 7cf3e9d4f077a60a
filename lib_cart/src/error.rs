//! # Engine Errors
//!
//! The taxonomy surfaced to callers of the engine. Validation and busy errors
//! are produced synchronously by the admission path and never touch the
//! snapshot; transport, timeout and server errors come back from the service
//! and are recovered by rolling back the affected line.

use crate::model::LineId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Stable reason codes for every [`SyncError`], suitable for UI mapping and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorReason {
    Busy,
    InvalidQuantity,
    CartBusyCheckout,
    UnknownLine,
    EmptyCart,
    Transport,
    Timeout,
    Server,
    Superseded,
}

impl ErrorReason {
    pub fn code(self) -> &'static str {
        match self {
            ErrorReason::Busy => "BUSY",
            ErrorReason::InvalidQuantity => "INVALID_QUANTITY",
            ErrorReason::CartBusyCheckout => "CART_BUSY_CHECKOUT",
            ErrorReason::UnknownLine => "UNKNOWN_LINE",
            ErrorReason::EmptyCart => "EMPTY_CART",
            ErrorReason::Transport => "TRANSPORT",
            ErrorReason::Timeout => "TIMEOUT",
            ErrorReason::Server => "SERVER",
            ErrorReason::Superseded => "SUPERSEDED",
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Intents that are malformed regardless of cart state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("quantity must be at least 1 (got {0}); use remove to drop a line")]
    QuantityBelowOne(u32),

    #[error("no cart line with id {0}")]
    UnknownLine(LineId),

    #[error("cannot check out an empty cart")]
    EmptyCart,
}

/// Admission refusals from the dedup gate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusyError {
    #[error("a reloaded line is still waiting for its previous request")]
    KeyDraining,

    #[error("a checkout is in flight")]
    CheckoutInFlight,

    #[error("the cart is reloading")]
    Loading,

    #[error("cart busy: {pending} line operation(s) still pending")]
    CartBusyCheckout { pending: usize },
}

/// # Sync Error
///
/// Every failure a caller of the engine can observe, either as a rejected
/// admission or as the eventual outcome of a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Busy(#[from] BusyError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("superseded by a full cart reload")]
    Superseded,
}

impl SyncError {
    pub fn reason(&self) -> ErrorReason {
        match self {
            SyncError::Validation(ValidationError::QuantityBelowOne(_)) => ErrorReason::InvalidQuantity,
            SyncError::Validation(ValidationError::UnknownLine(_)) => ErrorReason::UnknownLine,
            SyncError::Validation(ValidationError::EmptyCart) => ErrorReason::EmptyCart,
            SyncError::Busy(BusyError::CartBusyCheckout { .. }) => ErrorReason::CartBusyCheckout,
            SyncError::Busy(_) => ErrorReason::Busy,
            SyncError::Transport(_) => ErrorReason::Transport,
            SyncError::Timeout(_) => ErrorReason::Timeout,
            SyncError::Server { .. } => ErrorReason::Server,
            SyncError::Superseded => ErrorReason::Superseded,
        }
    }

    /// True for errors raised before any network call.
    pub fn is_rejection(&self) -> bool {
        matches!(self, SyncError::Validation(_) | SyncError::Busy(_))
    }
}

/// The eventual outcome of a mutation: `Ok(())` or the error that ended it.
pub type MutationResult = Result<(), SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_map_to_stable_codes() {
        let busy: SyncError = BusyError::CartBusyCheckout { pending: 2 }.into();
        assert_eq!(busy.reason().code(), "CART_BUSY_CHECKOUT");
        assert!(busy.is_rejection());

        let invalid: SyncError = ValidationError::QuantityBelowOne(0).into();
        assert_eq!(invalid.reason(), ErrorReason::InvalidQuantity);

        let server = SyncError::Server { status: 500, message: "boom".into() };
        assert_eq!(server.reason().to_string(), "SERVER");
        assert!(!server.is_rejection());
    }
}
