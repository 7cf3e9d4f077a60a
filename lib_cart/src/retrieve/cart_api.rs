//! # REST Cart Service
//!
//! [`CartService`] over HTTP, built on [`ApiClient`].
//!
//! | call          | request                                  | 2xx body            |
//! |---------------|------------------------------------------|---------------------|
//! | fetch_cart    | `GET cart`                               | cart                |
//! | add_item      | `POST cart/items {productId, quantity}`  | line, `{lineId}` or id |
//! | set_quantity  | `PATCH cart/items/{lineId} {quantity}`   | line                |
//! | remove_item   | `DELETE cart/items/{lineId}`             | ignored             |
//! | checkout      | `POST cart/checkout`                     | ignored             |

use super::ky_http::{ApiClient, ApiResponse, ClientError};
use crate::configs::{ConfigError, ServiceConfig};
use crate::model::{LineId, ProductId};
use crate::service::{CartService, ServerCart, ServerLine, ServiceError};
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AddItemBody {
    product_id: ProductId,
    quantity: u32,
}

#[derive(Serialize)]
struct QuantityBody {
    quantity: u32,
}

/// The shapes an add response may take.
#[derive(Deserialize)]
#[serde(untagged)]
enum AddReply {
    Line(ServerLine),
    Id {
        #[serde(rename = "lineId", alias = "cartItemId")]
        line_id: LineId,
    },
    Bare(LineId),
}

/// # HTTP Cart Service
#[derive(Debug, Clone)]
pub struct HttpCartService {
    client: ApiClient,
}

impl HttpCartService {
    /// Builds the adapter from service settings.
    pub fn new(config: &ServiceConfig) -> Result<Self, ConfigError> {
        let base_url = config.normalized_base_url()?;
        let client = ApiClient::with_options(
            base_url.as_str(),
            config.auth_token.clone(),
            config.max_retries,
            config.http_timeout(),
        )
        .map_err(|err| ConfigError::InvalidValue {
            field: "service",
            reason: err.to_string(),
        })?;
        Ok(Self { client })
    }

    pub fn from_client(client: ApiClient) -> Self {
        Self { client }
    }

    fn map_client_error(&self, err: ClientError) -> ServiceError {
        if err.is_timeout() {
            ServiceError::Timeout(self.client.timeout())
        } else if err.is_decode() {
            ServiceError::Decode(err.to_string())
        } else {
            ServiceError::Transport(err.to_string())
        }
    }

    fn into_data<T>(response: ApiResponse<T>) -> Result<T, ServiceError> {
        if !response.success {
            let message = response
                .error_body
                .filter(|body| !body.trim().is_empty())
                .unwrap_or_else(|| format!("http status {}", response.status));
            return Err(ServiceError::Server {
                status: response.status,
                message,
            });
        }
        response
            .data
            .ok_or_else(|| ServiceError::Decode("empty response body".into()))
    }

    async fn call<T, B>(&self, method: Method, path: &str, body: Option<B>) -> Result<T, ServiceError>
    where
        T: serde::de::DeserializeOwned,
        B: Serialize,
    {
        let response = self
            .client
            .request::<T, B>(method, path, None, body)
            .await
            .map_err(|err| self.map_client_error(err))?;
        Self::into_data(response)
    }

    async fn call_unit(&self, method: Method, path: &str) -> Result<(), ServiceError> {
        let response = self
            .client
            .request_unit::<()>(method, path, None, None)
            .await
            .map_err(|err| self.map_client_error(err))?;
        Self::into_data(response)
    }
}

#[async_trait]
impl CartService for HttpCartService {
    async fn fetch_cart(&self) -> Result<ServerCart, ServiceError> {
        self.call::<ServerCart, ()>(Method::GET, "cart", None).await
    }

    async fn add_item(&self, product_id: ProductId, quantity: u32) -> Result<ServerLine, ServiceError> {
        let reply: AddReply = self
            .call(Method::POST, "cart/items", Some(AddItemBody { product_id, quantity }))
            .await?;
        let line_id = match reply {
            AddReply::Line(line) => return Ok(line),
            AddReply::Id { line_id } | AddReply::Bare(line_id) => line_id,
        };
        debug!(line_id, product_id, "add returned an id only, reading the cart");
        let cart = self.fetch_cart().await?;
        match cart.line(line_id).or_else(|| cart.lines.iter().find(|l| l.product_id == product_id)) {
            Some(line) => Ok(line.clone()),
            None => {
                warn!(line_id, product_id, "added line missing from the cart");
                Err(ServiceError::Decode(format!("line {line_id} missing from cart after add")))
            }
        }
    }

    async fn set_quantity(&self, line_id: LineId, quantity: u32) -> Result<ServerLine, ServiceError> {
        self.call(Method::PATCH, &format!("cart/items/{line_id}"), Some(QuantityBody { quantity }))
            .await
    }

    async fn remove_item(&self, line_id: LineId) -> Result<(), ServiceError> {
        self.call_unit(Method::DELETE, &format!("cart/items/{line_id}")).await
    }

    async fn checkout(&self) -> Result<(), ServiceError> {
        self.call_unit(Method::POST, "cart/checkout").await
    }
}
