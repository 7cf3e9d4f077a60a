//! # In-Memory Cart Service
//!
//! A process-local [`CartService`] with the same semantics as the REST
//! backend: adding a product already in the cart raises its quantity, quantity
//! updates are absolute, and checkout converts the cart into an order and
//! empties it. It records every request it receives and can be told to fail
//! or slow down, which makes it the backbone of the engine tests and of the
//! console's offline mode.

use super::{CartRequest, CartService, ServerCart, ServerLine, ServiceError};
use crate::model::{LineId, Money, ProductId};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default)]
struct MemoryCart {
    catalog: HashMap<ProductId, (String, Money)>,
    lines: Vec<ServerLine>,
    next_line_id: LineId,
    requests: Vec<CartRequest>,
    failures: VecDeque<ServiceError>,
    orders: Vec<Vec<ServerLine>>,
    latency: Option<Duration>,
}

impl MemoryCart {
    fn not_found(what: &str) -> ServiceError {
        ServiceError::Server {
            status: 404,
            message: format!("{what} not found"),
        }
    }

    fn priced(&self, product_id: ProductId, quantity: u32, line_id: LineId) -> Result<ServerLine, ServiceError> {
        let (name, price) = self
            .catalog
            .get(&product_id)
            .ok_or_else(|| Self::not_found("product"))?;
        Ok(ServerLine {
            line_id,
            product_id,
            product_name: name.clone(),
            unit_price: *price,
            quantity,
            line_total: Some(*price * quantity),
        })
    }

    fn apply(&mut self, request: &CartRequest) -> Result<Option<ServerLine>, ServiceError> {
        match *request {
            CartRequest::FetchCart | CartRequest::Checkout => Ok(None),
            CartRequest::Add { product_id, quantity } => {
                if quantity < 1 {
                    return Err(ServiceError::Server {
                        status: 400,
                        message: "quantity must be at least 1".into(),
                    });
                }
                if let Some(index) = self.lines.iter().position(|l| l.product_id == product_id) {
                    let line_id = self.lines[index].line_id;
                    let merged = self.lines[index].quantity.saturating_add(quantity);
                    let line = self.priced(product_id, merged, line_id)?;
                    self.lines[index] = line.clone();
                    return Ok(Some(line));
                }
                let line = self.priced(product_id, quantity, self.next_line_id + 1)?;
                self.next_line_id = line.line_id;
                self.lines.push(line.clone());
                Ok(Some(line))
            }
            CartRequest::SetQuantity { line_id, quantity } => {
                if quantity < 1 {
                    return Err(ServiceError::Server {
                        status: 400,
                        message: "quantity must be at least 1".into(),
                    });
                }
                let index = self
                    .lines
                    .iter()
                    .position(|l| l.line_id == line_id)
                    .ok_or_else(|| Self::not_found("cart item"))?;
                let line = self.priced(self.lines[index].product_id, quantity, line_id)?;
                self.lines[index] = line.clone();
                Ok(Some(line))
            }
            CartRequest::Remove { line_id } => {
                let index = self
                    .lines
                    .iter()
                    .position(|l| l.line_id == line_id)
                    .ok_or_else(|| Self::not_found("cart item"))?;
                self.lines.remove(index);
                Ok(None)
            }
        }
    }
}

/// # In-Memory Cart Service
#[derive(Debug, Default)]
pub struct InMemoryCartService {
    inner: Mutex<MemoryCart>,
}

impl InMemoryCartService {
    pub fn new() -> Self {
        Self::default()
    }

    /// A service whose catalog holds `products` as `(id, name, price)`.
    pub fn with_catalog<I, S>(products: I) -> Self
    where
        I: IntoIterator<Item = (ProductId, S, Money)>,
        S: Into<String>,
    {
        let service = Self::new();
        for (product_id, name, price) in products {
            service.add_product(product_id, name, price);
        }
        service
    }

    fn cart(&self) -> MutexGuard<'_, MemoryCart> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_product(&self, product_id: ProductId, name: impl Into<String>, price: Money) {
        self.cart().catalog.insert(product_id, (name.into(), price));
    }

    /// Puts a line straight into the server cart without recording a request.
    /// Returns the server-issued line id.
    pub fn seed_line(&self, product_id: ProductId, quantity: u32) -> Result<LineId, ServiceError> {
        let mut cart = self.cart();
        let request = CartRequest::Add { product_id, quantity };
        let line = cart.apply(&request)?.ok_or_else(|| ServiceError::Decode("seed produced no line".into()))?;
        Ok(line.line_id)
    }

    /// Makes the next call fail with `error`. Queued failures are consumed in
    /// order.
    pub fn fail_next(&self, error: ServiceError) {
        self.cart().failures.push_back(error);
    }

    /// Delays every answer by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.cart().latency = latency;
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<CartRequest> {
        self.cart().requests.clone()
    }

    pub fn lines(&self) -> Vec<ServerLine> {
        self.cart().lines.clone()
    }

    /// Number of completed checkouts.
    pub fn orders(&self) -> usize {
        self.cart().orders.len()
    }

    async fn handle(&self, request: CartRequest) -> Result<Option<ServerLine>, ServiceError> {
        let latency = {
            let mut cart = self.cart();
            debug!(?request, "in-memory cart service received request");
            cart.requests.push(request.clone());
            cart.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut cart = self.cart();
        if let Some(error) = cart.failures.pop_front() {
            return Err(error);
        }
        cart.apply(&request)
    }
}

#[async_trait]
impl CartService for InMemoryCartService {
    async fn fetch_cart(&self) -> Result<ServerCart, ServiceError> {
        self.handle(CartRequest::FetchCart).await?;
        let cart = self.cart();
        Ok(ServerCart {
            cart_id: Some(1),
            subtotal: Some(cart.lines.iter().filter_map(|l| l.line_total).sum()),
            lines: cart.lines.clone(),
            status: Some("ACTIVE".into()),
        })
    }

    async fn add_item(&self, product_id: ProductId, quantity: u32) -> Result<ServerLine, ServiceError> {
        self.handle(CartRequest::Add { product_id, quantity })
            .await?
            .ok_or_else(|| ServiceError::Decode("add produced no line".into()))
    }

    async fn set_quantity(&self, line_id: LineId, quantity: u32) -> Result<ServerLine, ServiceError> {
        self.handle(CartRequest::SetQuantity { line_id, quantity })
            .await?
            .ok_or_else(|| ServiceError::Decode("update produced no line".into()))
    }

    async fn remove_item(&self, line_id: LineId) -> Result<(), ServiceError> {
        self.handle(CartRequest::Remove { line_id }).await.map(|_| ())
    }

    async fn checkout(&self) -> Result<(), ServiceError> {
        self.handle(CartRequest::Checkout).await?;
        let mut cart = self.cart();
        if cart.lines.is_empty() {
            return Err(ServiceError::Server {
                status: 400,
                message: "cart is empty".into(),
            });
        }
        let order = std::mem::take(&mut cart.lines);
        cart.orders.push(order);
        Ok(())
    }
}
