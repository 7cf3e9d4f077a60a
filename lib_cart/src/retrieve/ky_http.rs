//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client wrapper around `reqwest`, with exponential
//! backoff retries for idempotent verbs and standardized JSON response
//! handling. Non-2xx answers are not errors at this layer: they come back as
//! an [`ApiResponse`] with `success == false` and the raw error body.

use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("request failed: {0}")]
    Middleware(#[from] reqwest_middleware::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        match self {
            ClientError::Http(err) => err.is_timeout(),
            ClientError::Middleware(reqwest_middleware::Error::Reqwest(err)) => err.is_timeout(),
            _ => false,
        }
    }

    /// True when the response arrived but its body could not be decoded.
    pub fn is_decode(&self) -> bool {
        match self {
            ClientError::Json(_) => true,
            ClientError::Http(err) => err.is_decode(),
            _ => false,
        }
    }
}

/// A standardized container for API responses.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// A flexible asynchronous HTTP client.
///
/// Handles the base URL, bearer authentication and retries. `POST` requests
/// bypass the retry middleware, since replaying a non-idempotent call could
/// apply it twice.
#[derive(Debug, Clone)]
pub struct ApiClient {
    /// Client with the retry middleware, for idempotent verbs.
    retrying: ClientWithMiddleware,
    /// Client without retries, for `POST`.
    single_shot: ClientWithMiddleware,
    /// The base URL to which all relative paths are joined.
    base_url: Url,
    /// An optional Bearer token used for authorization.
    auth_token: Option<String>,
    timeout: Duration,
}

impl ApiClient {
    /// Creates a client with 3 retries and a 15 second per-attempt timeout.
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, ClientError> {
        Self::with_options(base_url, auth_token, 3, Duration::from_secs(15))
    }

    /// Creates a client with an explicit retry budget and per-attempt timeout.
    pub fn with_options(
        base_url: &str,
        auth_token: Option<String>,
        max_retries: u32,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let url = Url::parse(base_url)?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("lib_cart/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let retrying = ClientBuilder::new(http.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        let single_shot = ClientBuilder::new(http).build();

        Ok(Self {
            retrying,
            single_shot,
            base_url: url,
            auth_token,
            timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> Result<reqwest::Response, ClientError> {
        let full_url = self.base_url.join(path)?;
        let client = if method == Method::POST {
            &self.single_shot
        } else {
            &self.retrying
        };
        debug!(%method, url = %full_url, "http request");
        let mut req = client.request(method, full_url);

        if let Some(h) = headers {
            req = req.headers(h);
        }

        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        if let Some(b) = body {
            let json_body = serde_json::to_string(&b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        Ok(req.send().await?)
    }

    /// Performs a request and deserializes a 2xx body into `T`.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> Result<ApiResponse<T>, ClientError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let response = self.send(method, path, headers, body).await?;
        let status = response.status();
        let resp_headers = response.headers().clone();

        if status.is_success() {
            let data = response.json::<T>().await?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }

    /// Performs a request whose 2xx body is ignored (`204 No Content` and
    /// friends).
    pub async fn request_unit<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> Result<ApiResponse<()>, ClientError> {
        let response = self.send(method, path, headers, body).await?;
        let status = response.status();
        let resp_headers = response.headers().clone();
        let success = status.is_success();
        let error_body = if success { None } else { response.text().await.ok() };
        Ok(ApiResponse {
            data: success.then_some(()),
            error_body,
            status: status.as_u16(),
            success,
            headers: resp_headers,
        })
    }
}
