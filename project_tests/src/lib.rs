//! # Stub Cart Service
//!
//! An axum server that speaks the cart REST protocol on a loopback port, for
//! end-to-end tests of the HTTP adapter and the engine. Cart state lives in an
//! [`InMemoryCartService`]; the stub adds what only HTTP can show:
//!
//! - a log of every request line (`"PATCH /api/cart/items/1"`);
//! - bearer token enforcement;
//! - injected HTTP failures with an arbitrary status;
//! - the alternative add-reply shapes and the legacy cart field names.

#![forbid(unsafe_code)]

use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use lib_cart::{CartService, InMemoryCartService, LineId, Money, ProductId, ServerLine, ServiceError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpListener;
use tracing::debug;

/// How the stub answers `POST cart/items`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddReplyShape {
    /// The full line object.
    #[default]
    Line,
    /// `{"cartItemId": n}`
    IdObject,
    /// A bare integer.
    BareId,
}

#[derive(Debug, Default)]
struct Knobs {
    log: Vec<String>,
    failures: VecDeque<(StatusCode, String)>,
    add_reply: AddReplyShape,
    legacy_shape: bool,
}

/// # Stub Cart
pub struct StubCart {
    cart: InMemoryCartService,
    token: Option<String>,
    knobs: Mutex<Knobs>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddBody {
    product_id: ProductId,
    quantity: u32,
}

#[derive(Deserialize)]
struct QuantityBody {
    quantity: u32,
}

impl StubCart {
    /// A stub with a three-product catalog. Requests must carry
    /// `Bearer {token}` when a token is given.
    pub fn new(token: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            cart: InMemoryCartService::with_catalog([
                (7, "Green tea", Money::from_cents(450)),
                (8, "Tea pot", Money::from_cents(2999)),
                (9, "Strainer", Money::from_cents(325)),
            ]),
            token: token.map(str::to_string),
            knobs: Mutex::new(Knobs::default()),
        })
    }

    fn knobs(&self) -> MutexGuard<'_, Knobs> {
        self.knobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Direct access to the backing cart (seeding, latency, inspection).
    pub fn cart(&self) -> &InMemoryCartService {
        &self.cart
    }

    /// Request lines received so far, e.g. `"POST /api/cart/items"`.
    pub fn log(&self) -> Vec<String> {
        self.knobs().log.clone()
    }

    /// Request lines with the given method.
    pub fn count(&self, method: &str) -> usize {
        self.log().iter().filter(|line| line.starts_with(method)).count()
    }

    /// The next request is answered with `status` and `body` before reaching
    /// the cart.
    pub fn fail_next(&self, status: StatusCode, body: &str) {
        self.knobs().failures.push_back((status, body.to_string()));
    }

    pub fn set_add_reply(&self, shape: AddReplyShape) {
        self.knobs().add_reply = shape;
    }

    /// Serve carts with `items`/`totalPrice`/`cartItemId`/`price`/`subTotal`.
    pub fn set_legacy_shape(&self, legacy: bool) {
        self.knobs().legacy_shape = legacy;
    }

    /// Logs the request, checks the token and pops an injected failure.
    fn admit(&self, method: &Method, uri: &Uri, headers: &HeaderMap) -> Result<(), Response> {
        let mut knobs = self.knobs();
        knobs.log.push(format!("{} {}", method, uri.path()));
        debug!(%method, path = uri.path(), "stub cart request");
        if let Some(token) = &self.token {
            let expected = format!("Bearer {token}");
            let presented = headers.get("authorization").and_then(|v| v.to_str().ok());
            if presented != Some(expected.as_str()) {
                return Err((StatusCode::UNAUTHORIZED, "missing or invalid token").into_response());
            }
        }
        match knobs.failures.pop_front() {
            Some((status, body)) => Err((status, body).into_response()),
            None => Ok(()),
        }
    }

    fn line_json(&self, line: &ServerLine) -> Value {
        if self.knobs().legacy_shape {
            json!({
                "cartItemId": line.line_id,
                "productId": line.product_id,
                "productName": line.product_name,
                "price": line.unit_price,
                "quantity": line.quantity,
                "subTotal": line.unit_price * line.quantity,
            })
        } else {
            json!(line)
        }
    }
}

fn service_error(err: ServiceError) -> Response {
    match err {
        ServiceError::Server { status, message } => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message,
        )
            .into_response(),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response(),
    }
}

async fn read_cart(State(stub): State<Arc<StubCart>>, method: Method, uri: Uri, headers: HeaderMap) -> Response {
    if let Err(rejection) = stub.admit(&method, &uri, &headers) {
        return rejection;
    }
    match stub.cart.fetch_cart().await {
        Ok(cart) => {
            let lines: Vec<Value> = cart.lines.iter().map(|l| stub.line_json(l)).collect();
            let subtotal: Money = cart.lines.iter().map(|l| l.unit_price * l.quantity).sum();
            let body = if stub.knobs().legacy_shape {
                json!({"cartId": 1, "userId": 1, "status": "ACTIVE", "items": lines, "totalPrice": subtotal})
            } else {
                json!({"lines": lines, "subtotal": subtotal})
            };
            Json(body).into_response()
        }
        Err(err) => service_error(err),
    }
}

async fn add_item(
    State(stub): State<Arc<StubCart>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<AddBody>,
) -> Response {
    if let Err(rejection) = stub.admit(&method, &uri, &headers) {
        return rejection;
    }
    match stub.cart.add_item(body.product_id, body.quantity).await {
        Ok(line) => {
            let shape = stub.knobs().add_reply;
            let reply = match shape {
                AddReplyShape::Line => stub.line_json(&line),
                AddReplyShape::IdObject => json!({ "cartItemId": line.line_id }),
                AddReplyShape::BareId => json!(line.line_id),
            };
            (StatusCode::CREATED, Json(reply)).into_response()
        }
        Err(err) => service_error(err),
    }
}

async fn set_quantity(
    State(stub): State<Arc<StubCart>>,
    Path(line_id): Path<LineId>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<QuantityBody>,
) -> Response {
    if let Err(rejection) = stub.admit(&method, &uri, &headers) {
        return rejection;
    }
    match stub.cart.set_quantity(line_id, body.quantity).await {
        Ok(line) => Json(stub.line_json(&line)).into_response(),
        Err(err) => service_error(err),
    }
}

async fn remove_item(
    State(stub): State<Arc<StubCart>>,
    Path(line_id): Path<LineId>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = stub.admit(&method, &uri, &headers) {
        return rejection;
    }
    match stub.cart.remove_item(line_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => service_error(err),
    }
}

async fn checkout(State(stub): State<Arc<StubCart>>, method: Method, uri: Uri, headers: HeaderMap) -> Response {
    if let Err(rejection) = stub.admit(&method, &uri, &headers) {
        return rejection;
    }
    match stub.cart.checkout().await {
        Ok(()) => Json(json!({ "orderId": stub.cart.orders() })).into_response(),
        Err(err) => service_error(err),
    }
}

/// The stub's routes, mounted under `/api`.
pub fn router(stub: Arc<StubCart>) -> Router {
    let api = Router::new()
        .route("/cart", get(read_cart))
        .route("/cart/items", post(add_item))
        .route("/cart/items/{line_id}", patch(set_quantity).delete(remove_item))
        .route("/cart/checkout", post(checkout));
    Router::new().nest("/api", api).with_state(stub)
}

/// Serves `stub` on an ephemeral loopback port and returns the base URL
/// (`http://127.0.0.1:{port}/api/`).
pub async fn spawn_stub(stub: Arc<StubCart>) -> anyhow::Result<String> {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let addr = listener.local_addr()?;
    let app = router(stub);
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(%err, "stub cart server stopped");
        }
    });
    Ok(format!("http://{addr}/api/"))
}
