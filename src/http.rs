//! HTTP plumbing between the dispatcher and the API.
//!
//! This module provides:
//! * [`Request`] and [`Response`], a transport-independent request model
//! * [`Transport`], the seam the [`Dispatcher`](crate::dispatcher::Dispatcher)
//!   sends requests through
//! * [`Client`], the production transport wrapping `reqwest::Client`
//!
//! # Rate Limiting
//!
//! [`Client`] throttles its own requests so that a burst of page loads does
//! not flood the API:
//! * 50 calls per 5-second interval
//! * Allows bursts up to the maximum calls per interval
//! * Requests that would exceed the limit are delayed
//!
//! # Example
//!
//! ```rust
//! use tourdesk::http::{Client, Request, Transport};
//!
//! let client = Client::new(&config)?;
//! let response = client.send(&Request::get("/api/tours")).await?;
//! ```

use std::{future::Future, num::NonZeroU32, time::Duration};

use futures_util::{FutureExt, TryFutureExt};
use governor::{DefaultDirectRateLimiter, Quota};
use http::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    HeaderMap, HeaderValue, Method, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use url::Url;

use crate::{
    config::Config,
    error::{RemoteFailure, Result},
    protocol::{self, Envelope},
    token,
};

/// A request to the API.
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    path: String,
    body: Option<serde_json::Value>,
    headers: HeaderMap,

    /// One-shot marker: set once the request has been replayed after a
    /// session refresh.
    retried: bool,
}

impl Request {
    /// Builds a request for `path`, relative to the API base URL.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: HeaderMap::new(),
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Sets a JSON body.
    ///
    /// # Errors
    ///
    /// Will return `Err` if `body` cannot be represented as JSON.
    pub fn json<T>(mut self, body: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn body(&self) -> Option<&serde_json::Value> {
        self.body.as_ref()
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The attached `Authorization` header, if any.
    #[must_use]
    pub fn authorization(&self) -> Option<&HeaderValue> {
        self.headers.get(AUTHORIZATION)
    }

    /// Whether this request targets an auth lifecycle endpoint.
    #[must_use]
    pub fn is_auth_lifecycle(&self) -> bool {
        protocol::is_auth_lifecycle(&self.path)
    }

    #[must_use]
    pub fn is_retried(&self) -> bool {
        self.retried
    }

    pub(crate) fn mark_retried(&mut self) {
        self.retried = true;
    }

    /// Attaches `access_token` as bearer credential, or removes any stale
    /// `Authorization` header if there is none.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the token is not a valid header value.
    pub fn authorize(&mut self, access_token: Option<&str>) -> Result<()> {
        match access_token.map(token::bearer).transpose()?.flatten() {
            Some(value) => {
                self.headers.insert(AUTHORIZATION, value);
            }
            None => {
                self.headers.remove(AUTHORIZATION);
            }
        }
        Ok(())
    }
}

/// An answer from the API, whatever its status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub body: String,
}

impl Response {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Extracts `results` from a 2xx envelope.
    ///
    /// Missing `results` and empty bodies are treated as `null`, so that
    /// `()` and `Option` targets work for endpoints without payload.
    ///
    /// # Errors
    ///
    /// Will return `Err` if:
    /// - the status is not 2xx, as [`ErrorKind::Remote`](crate::error::ErrorKind::Remote)
    /// - the body or its `results` cannot be decoded into `T`
    pub fn results<T>(&self, origin: &str) -> Result<T>
    where
        T: DeserializeOwned,
    {
        if !self.status.is_success() {
            return Err(self.failure().into());
        }

        let results = if self.body.trim().is_empty() {
            serde_json::Value::Null
        } else {
            protocol::json::<Envelope<serde_json::Value>>(&self.body, origin)?
                .results
                .unwrap_or_default()
        };

        serde_json::from_value(results).map_err(Into::into)
    }

    /// Describes a non-2xx answer.
    #[must_use]
    pub fn failure(&self) -> RemoteFailure {
        let message = serde_json::from_str::<Envelope<serde_json::Value>>(&self.body)
            .ok()
            .and_then(|envelope| envelope.status_message)
            .unwrap_or_else(|| self.body.trim().to_owned());

        let message = if message.is_empty() {
            self.status
                .canonical_reason()
                .unwrap_or("unknown status")
                .to_owned()
        } else {
            message
        };

        RemoteFailure {
            status: self.status,
            message,
        }
    }
}

/// Sends requests to the API.
///
/// Implementations return `Err` only for transport failures, as
/// [`ErrorKind::Network`](crate::error::ErrorKind::Network) errors. Every
/// answer, including 4xx and 5xx ones, is an `Ok(Response)`.
pub trait Transport: Send + Sync {
    fn send(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// HTTP client with built-in rate limiting.
pub struct Client {
    /// Unlimited request client for special cases.
    ///
    /// Direct access to underlying client without rate limiting.
    pub unlimited: reqwest::Client,

    /// Rate limiter for API quota compliance.
    rate_limiter: DefaultDirectRateLimiter,

    base_url: Url,
}

impl Client {
    /// Rolling window during which at most
    /// [`RATE_LIMIT_CALLS_PER_INTERVAL`](Self::RATE_LIMIT_CALLS_PER_INTERVAL)
    /// calls are made.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(5);

    /// Maximum allowed API calls per interval.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 50;

    /// Duration to keep idle connections alive.
    ///
    /// Prevents frequent reconnection overhead for subsequent requests.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Total time allowed for a request, after which it fails as a network
    /// error.
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Creates a new client for the API at `config.base_url`.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// * HTTP client creation fails
    /// * Header values are invalid
    ///
    /// # Panics
    ///
    /// Panics if rate limit parameters are zero.
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .timeout(Self::REQUEST_TIMEOUT)
            .default_headers(headers)
            .user_agent(&config.user_agent);

        // Rate limit own requests as to not DoS the API.
        let replenish_interval =
            Self::RATE_LIMIT_INTERVAL / u32::from(Self::RATE_LIMIT_CALLS_PER_INTERVAL);
        let quota = Quota::with_period(replenish_interval)
            .expect("quota time interval is zero")
            .allow_burst(
                NonZeroU32::new(Self::RATE_LIMIT_CALLS_PER_INTERVAL.into())
                    .expect("calls per interval is zero"),
            );

        Ok(Self {
            unlimited: http_client.build()?,
            rate_limiter: governor::RateLimiter::direct(quota),
            base_url: config.base_url.clone(),
        })
    }

    /// Resolves a request path against the base URL.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the path does not form a valid URL.
    pub fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(Into::into)
    }

    /// Executes a request with rate limiting.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// * Request execution fails
    /// * Network error occurs
    pub fn execute(
        &self,
        request: reqwest::Request,
    ) -> impl Future<Output = Result<reqwest::Response>> + '_ {
        // No need to await with jitter because the level of concurrency is low.
        let throttle = self.rate_limiter.until_ready();
        throttle.then(|()| self.unlimited.execute(request).map_err(Into::into))
    }

    fn build(&self, request: &Request) -> Result<reqwest::Request> {
        // Check the URL early to not needlessly hit the rate limiter.
        let url = self.url(request.path())?;

        let mut http_request = reqwest::Request::new(request.method().clone(), url);
        http_request.headers_mut().extend(request.headers().clone());

        if let Some(body) = request.body() {
            http_request
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            *http_request.body_mut() = Some(serde_json::to_vec(body)?.into());
        }

        Ok(http_request)
    }
}

impl Transport for Client {
    fn send(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
        let http_request = self.build(request);
        let origin = request.path().to_owned();

        async move {
            let response = self.execute(http_request?).await?;
            let status = response.status();
            let body = response.text().await?;
            debug!("{origin}: {status}");

            Ok(Response::new(status, body))
        }
    }
}
