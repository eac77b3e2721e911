//! Error handling for tourdesk.
//!
//! Every fallible operation returns [`struct@Error`], which pairs an
//! [`ErrorKind`] with the underlying error. The kinds callers are expected to
//! branch on are:
//!
//! * [`ErrorKind::Network`] - the API could not be reached or timed out
//! * [`ErrorKind::AuthExpired`] - the session could not be kept alive and the
//!   user has to log in again
//! * [`ErrorKind::Remote`] - the API answered with a non-2xx status other
//!   than the ones handled by the session refresh
//!
//! The remaining kinds cover configuration, decoding and persistence
//! failures.
//!
//! # Example
//!
//! ```rust
//! use tourdesk::error::{Error, ErrorKind};
//!
//! match dispatcher.dispatch(request).await {
//!     Ok(results) => println!("{results}"),
//!     Err(e) if e.kind == ErrorKind::AuthExpired => redirect_to_login(),
//!     Err(e) => eprintln!("{}: {}", e.status().unwrap_or_default(), e),
//! }
//! ```

use std::fmt;

use http::StatusCode;
use thiserror::Error;

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

/// Standard result type for tourdesk operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories.
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// Transport failure: unreachable endpoint, connection reset or timeout.
    ///
    /// Never triggers a session refresh, as no response status is available.
    #[error("network error")]
    Network,

    /// The session could not be kept alive.
    ///
    /// Raised when a refresh failed or was not attempted. Terminal for the
    /// request that raised it.
    #[error("session expired")]
    AuthExpired,

    /// Any other non-2xx response, passed through verbatim.
    #[error("remote error")]
    Remote,

    /// Invalid configuration or request parameters.
    #[error("invalid argument specified")]
    InvalidArgument,

    /// A response or credential could not be decoded.
    #[error("invalid data")]
    InvalidData,

    /// Credentials could not be loaded or persisted.
    #[error("credential storage failure")]
    Storage,

    /// Bug or broken invariant.
    #[error("internal error")]
    Internal,
}

/// A non-2xx answer from the API.
///
/// Carried by [`ErrorKind::Remote`] errors, and by [`ErrorKind::AuthExpired`]
/// errors that originate from a `401 Unauthorized` response.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{status}: {message}")]
pub struct RemoteFailure {
    /// Status code returned by the API.
    pub status: StatusCode,

    /// `statusMessage` of the response envelope, or the raw body if the
    /// response was not an envelope.
    pub message: String,
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    /// Creates an error for transport failures.
    pub fn network<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Network, error)
    }

    /// Creates an error for a session that could not be kept alive.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::auth_expired("no refresh token available");
    /// assert_eq!(err.kind, ErrorKind::AuthExpired);
    /// ```
    pub fn auth_expired<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::AuthExpired, error)
    }

    /// Creates an error for a non-2xx API response.
    pub fn remote(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Remote,
            RemoteFailure {
                status,
                message: message.into(),
            },
        )
    }

    pub fn invalid_argument<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::InvalidArgument, error)
    }

    pub fn invalid_data<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::InvalidData, error)
    }

    pub fn storage<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Storage, error)
    }

    pub fn internal<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Internal, error)
    }

    /// Attempts to downcast the underlying error to a concrete type.
    ///
    /// # Example
    /// ```
    /// if let Some(failure) = error.downcast::<RemoteFailure>() {
    ///     println!("API answered {}", failure.status);
    /// }
    /// ```
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// The upstream status code, if this error came from an API response.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        self.downcast::<RemoteFailure>().map(|failure| failure.status)
    }

    /// The upstream message, if this error came from an API response.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.downcast::<RemoteFailure>()
            .map(|failure| failure.message.as_str())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

impl From<RemoteFailure> for Error {
    fn from(failure: RemoteFailure) -> Self {
        Self::new(ErrorKind::Remote, failure)
    }
}

/// Converts credential file I/O errors.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::storage(err)
    }
}

/// Converts `reqwest` errors.
///
/// Anything that happened on the wire is a [`ErrorKind::Network`] error, so
/// that it never triggers a session refresh.
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::invalid_data(err);
        }

        if err.is_builder() {
            return Self::invalid_argument(err);
        }

        Self::network(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            return Self::internal(err);
        }
        Self::invalid_data(err)
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::storage(err)
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Self::storage(err)
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Self::invalid_data(e.to_string())
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

impl From<http::method::InvalidMethod> for Error {
    fn from(e: http::method::InvalidMethod) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}
