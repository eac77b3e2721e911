//! Wire types of the tourdesk REST API.
//!
//! Every endpoint answers with the same envelope:
//!
//! ```json
//! {
//!     "statusCode": 200,
//!     "statusMessage": "OK",
//!     "results": { ... }
//! }
//! ```
//!
//! Only `results` is handed to callers. For non-2xx answers the
//! `statusMessage` becomes the error message.
//!
//! # Submodules
//!
//! * [`auth`] - login, registration, refresh and logout payloads

pub mod auth;

use std::fmt::Debug;

use serde::Deserialize;
use url::Url;

use crate::error::Result;

/// Path of the login endpoint.
pub const LOGIN_PATH: &str = "/api/auth/login";

/// Path of the registration endpoint.
pub const REGISTER_PATH: &str = "/api/auth/register";

/// Path of the token refresh endpoint.
pub const REFRESH_PATH: &str = "/api/auth/refresh";

/// Path of the logout endpoint.
pub const LOGOUT_PATH: &str = "/api/auth/logout";

/// Endpoints that manage the session itself. A `401 Unauthorized` from one of
/// these is final: refreshing would recurse through the refresh call.
const AUTH_LIFECYCLE_PATHS: [&str; 4] = [LOGIN_PATH, REGISTER_PATH, REFRESH_PATH, LOGOUT_PATH];

/// Whether `path` targets one of the auth lifecycle endpoints.
///
/// `path` may also be an absolute URL, in which case only its path is
/// considered. Query strings, fragments and trailing slashes are ignored.
#[must_use]
pub fn is_auth_lifecycle(path: &str) -> bool {
    let url = Url::parse(path).ok();
    let path = match &url {
        Some(url) => url.path(),
        None => path.split(['?', '#']).next().unwrap_or_default(),
    };

    let path = path.trim_end_matches('/');
    AUTH_LIFECYCLE_PATHS
        .iter()
        .any(|endpoint| endpoint.eq_ignore_ascii_case(path))
}

/// Response envelope shared by all endpoints.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub status_code: Option<u16>,
    pub status_message: Option<String>,
    pub results: Option<T>,
}

/// Parses and logs a JSON response body.
///
/// Successfully parsed bodies are logged at TRACE level through their
/// `Debug` implementation, which redacts credentials. Raw bodies are only
/// logged on failure, and never for auth lifecycle endpoints.
///
/// # Errors
///
/// Returns an [`ErrorKind::InvalidData`](crate::error::ErrorKind::InvalidData)
/// error if the body is not valid JSON or does not match `T`.
pub fn json<T>(body: &str, origin: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    match serde_json::from_str(body) {
        Ok(result) => {
            trace!("{origin}: {result:#?}");
            Ok(result)
        }
        Err(e) => {
            if is_auth_lifecycle(origin) {
                error!("{origin}: failed parsing response ({e})");
            } else if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
                trace!("{origin}: {json:#?}");
            } else {
                error!("{origin}: failed parsing response ({e:?})");
                trace!("{body}");
            }
            Err(e.into())
        }
    }
}
