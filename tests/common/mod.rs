#![allow(dead_code)]

use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use http::{Method, StatusCode};
use serde_json::{json, Value};

use tourdesk::{
    error::{Error, Result},
    http::{Request, Response, Transport},
    store::CredentialStore,
    token::TokenPair,
};

/// A request as seen by the mock API.
#[derive(Clone, Debug, PartialEq)]
pub struct Call {
    pub method: Method,
    pub path: String,
    pub bearer: Option<String>,
    pub body: Option<Value>,
}

impl From<&Request> for Call {
    fn from(request: &Request) -> Self {
        Self {
            method: request.method().clone(),
            path: request.path().to_owned(),
            bearer: request
                .authorization()
                .map(|value| value.to_str().expect("non-ascii authorization").to_owned()),
            body: request.body().cloned(),
        }
    }
}

enum Outcome {
    Answer(StatusCode, String),
    Network(String),
}

/// What the mock API answers to a call.
pub struct Reply {
    delay: Option<Duration>,
    outcome: Outcome,
}

impl Reply {
    /// A 200 envelope carrying `results`.
    pub fn ok(results: Value) -> Self {
        Self::raw(
            StatusCode::OK,
            json!({"statusCode": 200, "statusMessage": "OK", "results": results}).to_string(),
        )
    }

    /// An error envelope.
    pub fn status(status: StatusCode, message: &str) -> Self {
        Self::raw(
            status,
            json!({"statusCode": status.as_u16(), "statusMessage": message}).to_string(),
        )
    }

    pub fn unauthorized() -> Self {
        Self::status(StatusCode::UNAUTHORIZED, "Token expired")
    }

    pub fn raw(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            delay: None,
            outcome: Outcome::Answer(status, body.into()),
        }
    }

    /// The API could not be reached.
    pub fn network(message: &str) -> Self {
        Self {
            delay: None,
            outcome: Outcome::Network(message.to_owned()),
        }
    }

    /// Answers only after `delay`, so that concurrent requests pile up.
    #[must_use]
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

type Handler = dyn Fn(&Call) -> Reply + Send + Sync;

/// Scripted API recording every call it receives.
#[derive(Clone)]
pub struct MockTransport {
    handler: Arc<Handler>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl MockTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Call) -> Reply + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| call.path == path)
            .collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.calls_to(path).len()
    }

    /// Bearer credentials sent to `path`, in call order.
    pub fn bearers(&self, path: &str) -> Vec<Option<String>> {
        self.calls_to(path)
            .into_iter()
            .map(|call| call.bearer)
            .collect()
    }
}

impl Transport for MockTransport {
    fn send(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
        let call = Call::from(request);
        self.calls.lock().unwrap().push(call.clone());
        let reply = (self.handler)(&call);

        async move {
            if let Some(delay) = reply.delay {
                tokio::time::sleep(delay).await;
            }

            match reply.outcome {
                Outcome::Answer(status, body) => Ok(Response::new(status, body)),
                Outcome::Network(message) => Err(Error::network(message)),
            }
        }
    }
}

/// Builds an unsigned token carrying `payload`.
pub fn mint(payload: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// An access token for `subject` valid for another hour.
pub fn access_token(subject: &str, roles: &[&str]) -> String {
    mint(&json!({
        "sub": subject,
        "iat": unix_now(),
        "exp": unix_now() + 3600,
        "type": "ACCESS",
        "accountId": 7,
        "roles": roles,
    }))
}

/// A refresh token for `subject` valid for another week.
pub fn refresh_token(subject: &str) -> String {
    mint(&json!({
        "sub": subject,
        "iat": unix_now(),
        "exp": unix_now() + 7 * 24 * 3600,
        "type": "REFRESH",
    }))
}

/// A store holding the given tokens.
pub fn store_with(access_token: &str, refresh_token: &str) -> Arc<CredentialStore> {
    let store = CredentialStore::in_memory();
    store
        .store(&TokenPair {
            access_token: access_token.to_owned(),
            refresh_token: refresh_token.to_owned(),
        })
        .unwrap();
    Arc::new(store)
}

pub fn bearer(token: &str) -> Option<String> {
    Some(format!("Bearer {token}"))
}
