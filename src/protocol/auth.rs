//! Authentication payloads.
//!
//! Requests and responses of the auth lifecycle endpoints. All of them carry
//! secrets, which are redacted from `Debug` output so they can be logged.
//!
//! # Example Response
//!
//! ```json
//! {
//!     "accessToken": "eyJhbGciOi...",
//!     "refreshToken": "eyJhbGciOi..."
//! }
//! ```
//!
//! The refresh endpoint may omit `refreshToken`, in which case the current
//! refresh token stays valid.

use serde::{Deserialize, Serialize};
use veil::Redact;

use crate::{
    error::{Error, Result},
    token::{self, TokenPair},
};

/// Body of `POST /api/auth/login`.
#[derive(Clone, Eq, PartialEq, Serialize, Redact, Hash)]
pub struct Login {
    pub email: String,
    #[redact]
    pub password: String,
}

/// Body of `POST /api/auth/register`.
#[derive(Clone, Eq, PartialEq, Serialize, Redact, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub name: String,
    pub surname: String,
    pub email: String,
    pub phone_number: String,
    #[redact]
    pub password: String,
}

/// Body of `POST /api/auth/refresh` and `POST /api/auth/logout`.
#[derive(Clone, Eq, PartialEq, Serialize, Redact, Hash)]
#[serde(rename_all = "camelCase")]
pub struct RefreshToken {
    #[redact]
    pub refresh_token: String,
}

/// Tokens issued by the login and refresh endpoints.
#[derive(Clone, Default, Eq, PartialEq, Deserialize, Redact, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Tokens {
    #[redact]
    pub access_token: Option<String>,
    #[redact]
    pub refresh_token: Option<String>,
}

impl Tokens {
    /// The normalized access token, if one was issued.
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.access_token
            .as_deref()
            .map(token::normalize)
            .filter(|token| !token.is_empty())
    }

    /// The refresh token, if one was issued.
    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}

/// A login must issue both tokens.
impl TryFrom<Tokens> for TokenPair {
    type Error = Error;

    fn try_from(tokens: Tokens) -> Result<Self> {
        let access_token = tokens
            .access_token()
            .ok_or_else(|| Error::invalid_data("no access token issued"))?
            .to_owned();
        let refresh_token = tokens
            .refresh_token()
            .ok_or_else(|| Error::invalid_data("no refresh token issued"))?
            .to_owned();

        Ok(Self {
            access_token,
            refresh_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn registration_uses_camel_case() {
        let registration = Registration {
            name: "Ana".to_owned(),
            surname: "Lima".to_owned(),
            email: "ana@example.com".to_owned(),
            phone_number: "+351900000000".to_owned(),
            password: "hunter2".to_owned(),
        };

        assert_eq!(
            serde_json::to_value(&registration).unwrap(),
            json!({
                "name": "Ana",
                "surname": "Lima",
                "email": "ana@example.com",
                "phoneNumber": "+351900000000",
                "password": "hunter2",
            })
        );
        assert!(!format!("{registration:?}").contains("hunter2"));
    }

    #[test]
    fn refresh_response_may_omit_refresh_token() {
        let tokens: Tokens = serde_json::from_value(json!({"accessToken": "Bearer A2"})).unwrap();
        assert_eq!(tokens.access_token(), Some("A2"));
        assert_eq!(tokens.refresh_token(), None);
        assert!(TokenPair::try_from(tokens).is_err());
    }

    #[test]
    fn blank_tokens_count_as_missing() {
        let tokens: Tokens =
            serde_json::from_value(json!({"accessToken": "  ", "refreshToken": ""})).unwrap();
        assert_eq!(tokens.access_token(), None);
        assert_eq!(tokens.refresh_token(), None);
    }

    #[test]
    fn login_response_converts_to_pair() {
        let tokens: Tokens =
            serde_json::from_value(json!({"accessToken": "A1", "refreshToken": "R1"})).unwrap();
        let pair = TokenPair::try_from(tokens).unwrap();
        assert_eq!(pair.access_token, "A1");
        assert_eq!(pair.refresh_token, "R1");
    }
}
