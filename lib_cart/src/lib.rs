//! # lib_cart
//!
//! A cart synchronization engine: it keeps a locally displayed shopping cart
//! consistent with a remote, authoritative cart service while the user fires
//! rapid, independent mutations and responses arrive out of order.
//!
//! Intents are applied optimistically, serialized per cart line, coalesced
//! inside a short window, and reconciled against the server by operation
//! identity. Failures roll the affected line back; a full reload supersedes
//! everything pending.
//!
//! ```no_run
//! use lib_cart::{CartEngine, EngineConfig, InMemoryCartService, TracingSink};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), lib_cart::SyncError> {
//! let engine = CartEngine::new(
//!     Arc::new(InMemoryCartService::new()),
//!     Arc::new(TracingSink),
//!     EngineConfig::default(),
//! );
//! engine.load_cart().await?;
//! let _sub = engine.subscribe(|snapshot| println!("{} items", snapshot.total_quantity()));
//! engine.add_item(7, 1).outcome().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - `retrieve`: `HttpCartService`, the REST adapter (reqwest + retries).
//! - `loggers`: `setup_logging`, console and rolling JSON file output.
//! - `full`: both.

#![forbid(unsafe_code)]

pub mod configs;
pub mod core;
pub mod error;
pub mod model;
pub mod service;

#[cfg(feature = "loggers")]
pub mod loggers;

#[cfg(feature = "retrieve")]
pub mod retrieve;

pub use configs::{CartConfig, ConfigError, ConfigOverrides, EngineConfig, LogOptions, ServiceConfig};
pub use crate::core::{Admission, CartEngine, MutationKind, MutationTicket, Subscription, Target};
pub use error::{BusyError, ErrorReason, MutationResult, SyncError, ValidationError};
pub use model::{CartLine, CartSnapshot, LineId, Money, ProductId, ProductRef};
pub use service::{
    CartRequest, CartService, InMemoryCartService, NoopSink, NotificationSink, ServerCart, ServerLine, ServiceError,
    SinkError, TracingSink,
};

#[cfg(feature = "loggers")]
pub use loggers::{prune_logs, setup_logging, LoggerError, LoggingGuard};

#[cfg(feature = "retrieve")]
pub use retrieve::{ApiClient, ClientError, HttpCartService};
