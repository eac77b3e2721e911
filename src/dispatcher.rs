//! Authenticated request dispatch with transparent session refresh.
//!
//! The [`Dispatcher`] is the single way the application talks to the API. For
//! every request it:
//!
//! 1. attaches the current access token as bearer credential
//! 2. sends the request through its [`Transport`]
//! 3. on `401 Unauthorized` from a resource endpoint, refreshes the session
//!    once and replays the request with the new access token
//!
//! Concurrent requests that fail authorization while a refresh is in flight
//! do not start their own: they wait for the outcome of the one in flight
//! and are replayed, or failed, together.
//!
//! # Errors
//!
//! Callers only need to handle three outcomes besides success:
//!
//! * [`ErrorKind::Network`] - the API is unreachable
//! * [`ErrorKind::AuthExpired`] - the user has to log in again; all stored
//!   credentials have already been cleared if a refresh failed
//! * [`ErrorKind::Remote`] - any other non-2xx answer, with its status and
//!   message
//!
//! # Example
//!
//! ```rust
//! use tourdesk::{dispatcher::Dispatcher, http::{Client, Request}};
//!
//! let dispatcher = Dispatcher::new(Client::new(&config)?, store);
//! let tours = dispatcher.dispatch(Request::get("/api/tours?page=1")).await?;
//! ```

use std::sync::Arc;

use http::StatusCode;
use serde::de::DeserializeOwned;

use crate::{
    error::{Error, ErrorKind, Result},
    http::{Request, Response, Transport},
    protocol::{
        self,
        auth::{Login, RefreshToken, Registration, Tokens},
    },
    refresh::{RefreshCoordinator, Ticket},
    session::Session,
    store::CredentialStore,
    token::TokenPair,
};

/// Sends authenticated requests and keeps the session alive.
pub struct Dispatcher<T> {
    transport: T,
    store: Arc<CredentialStore>,
    refresh: RefreshCoordinator,
}

impl<T> Dispatcher<T>
where
    T: Transport,
{
    pub fn new(transport: T, store: Arc<CredentialStore>) -> Self {
        Self {
            transport,
            store,
            refresh: RefreshCoordinator::new(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Session state derived from the stored access token.
    #[must_use]
    pub fn session(&self) -> Session {
        self.store.session()
    }

    /// Sends `request` and returns the `results` of the response envelope,
    /// or `null` if there are none.
    ///
    /// # Errors
    ///
    /// Will return `Err` if:
    /// - the API cannot be reached, as [`ErrorKind::Network`]
    /// - the session expired and could not be refreshed, or the request was
    ///   already replayed once, as [`ErrorKind::AuthExpired`]
    /// - the API answered with any other non-2xx status, as
    ///   [`ErrorKind::Remote`]
    /// - the response is not a valid envelope, as [`ErrorKind::InvalidData`]
    pub async fn dispatch(&self, request: Request) -> Result<serde_json::Value> {
        self.dispatch_as(request).await
    }

    /// Like [`dispatch`](Self::dispatch), deserializing `results` into `R`.
    ///
    /// # Errors
    ///
    /// See [`dispatch`](Self::dispatch).
    pub async fn dispatch_as<R>(&self, request: Request) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let path = request.path().to_owned();
        let response = self.send(request).await?;
        response.results(&path)
    }

    /// Logs in and stores the issued tokens.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the credentials are rejected, as
    /// [`ErrorKind::AuthExpired`], if the API cannot be reached, or if the
    /// response lacks either token.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session> {
        let request = Request::post(protocol::LOGIN_PATH).json(&Login {
            email: email.to_owned(),
            password: password.to_owned(),
        })?;

        let tokens: Tokens = self.dispatch_as(request).await?;
        let pair = TokenPair::try_from(tokens)?;
        if let Err(e) = self.store.store(&pair) {
            warn!("could not persist credentials: {e}");
        }

        let session = self.session();
        if let Some(identity) = session.identity() {
            info!("logged in as {}", identity.subject);
        }
        Ok(session)
    }

    /// Creates an account. The caller logs in separately.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the API rejects the registration or cannot be
    /// reached.
    pub async fn register(&self, registration: &Registration) -> Result<()> {
        let request = Request::post(protocol::REGISTER_PATH).json(registration)?;
        self.dispatch(request).await.map(|_| ())
    }

    /// Revokes the refresh token and clears all stored credentials.
    ///
    /// The local credentials are cleared whatever the API answers.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the API could not revoke the refresh token.
    pub async fn logout(&self) -> Result<()> {
        let revoked = match self.store.refresh_token() {
            Some(refresh_token) => {
                let request =
                    Request::post(protocol::LOGOUT_PATH).json(&RefreshToken { refresh_token })?;
                self.dispatch(request).await.map(|_| ())
            }
            None => Ok(()),
        };

        self.clear_credentials();
        info!("logged out");
        revoked
    }

    /// Sends `request`, refreshing the session and replaying it once if it
    /// fails authorization.
    async fn send(&self, mut request: Request) -> Result<Response> {
        let mut access_token = self.store.access_token();

        loop {
            request.authorize(access_token.as_deref())?;
            let response = self.transport.send(&request).await?;
            if response.status != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }

            let failure = response.failure();
            if request.is_auth_lifecycle() {
                debug!("{}: {failure}; not refreshing", request.path());
                return Err(Error::auth_expired(failure));
            }
            if request.is_retried() {
                debug!("{}: {failure} after refresh; giving up", request.path());
                return Err(Error::auth_expired(failure));
            }

            request.mark_retried();
            match self.refresh().await {
                Some(renewed) => {
                    debug!("{}: replaying with refreshed session", request.path());
                    access_token = Some(renewed);
                }
                None => return Err(Error::auth_expired(failure)),
            }
        }
    }

    /// Refreshes the session, or waits for the refresh in flight.
    ///
    /// Returns the new access token, or `None` if the session could not be
    /// refreshed. In that case all credentials have been cleared.
    async fn refresh(&self) -> Option<String> {
        match self.refresh.begin_or_join() {
            Ticket::Follower(outcome) => {
                trace!("waiting for refresh in flight");
                outcome.await.ok().flatten()
            }
            Ticket::Leader(leader) => {
                let outcome = match self.renew().await {
                    Ok(access_token) => {
                        debug!("session refreshed");
                        Some(access_token)
                    }
                    Err(e) => {
                        warn!("session refresh failed: {e}");
                        self.clear_credentials();
                        None
                    }
                };

                let notified = leader.settle(outcome.clone());
                if notified > 0 {
                    debug!("resumed {notified} requests waiting for refresh");
                }
                outcome
            }
        }
    }

    /// Calls the refresh endpoint and stores the issued tokens.
    async fn renew(&self) -> Result<String> {
        let refresh_token = self
            .store
            .refresh_token()
            .ok_or_else(|| Error::auth_expired("no refresh token available"))?;

        let mut request =
            Request::post(protocol::REFRESH_PATH).json(&RefreshToken { refresh_token })?;
        request.authorize(self.store.access_token().as_deref())?;

        let response = self.transport.send(&request).await?;
        if response.status == StatusCode::UNAUTHORIZED {
            return Err(Error::auth_expired(response.failure()));
        }

        let tokens: Tokens = response.results(protocol::REFRESH_PATH)?;
        let access_token = tokens
            .access_token()
            .ok_or_else(|| Error::invalid_data("refresh response lacks an access token"))?
            .to_owned();

        if let Err(e) = self.store.refreshed(&access_token, tokens.refresh_token()) {
            warn!("could not persist refreshed credentials: {e}");
        }
        Ok(access_token)
    }

    fn clear_credentials(&self) {
        if let Err(e) = self.store.clear() {
            warn!("could not remove stored credentials: {e}");
        }
    }
}

impl<T> std::fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("store", &self.store)
            .field("refresh", &self.refresh)
            .finish_non_exhaustive()
    }
}

/// Whether `error` means the user has to log in again.
#[must_use]
pub fn is_auth_expired(error: &Error) -> bool {
    error.kind == ErrorKind::AuthExpired
}
