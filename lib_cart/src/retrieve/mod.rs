//! # Data Retrieval Module
//!
//! The HTTP side of the cart service contract.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: a generic `ApiClient` built on `reqwest` and
//!   `reqwest-middleware`, with exponential backoff retries for idempotent
//!   verbs and bearer authentication.
//! - **`cart_api`**: `HttpCartService`, the REST implementation of
//!   [`CartService`](crate::service::CartService) on top of `ApiClient`.

#![forbid(unsafe_code)]

/// REST cart service adapter.
pub mod cart_api;
/// Generic HTTP API client with retry middleware.
pub mod ky_http;

pub use cart_api::HttpCartService;
pub use ky_http::{ApiClient, ApiResponse, ClientError};
