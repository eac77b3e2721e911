//! Bearer credentials: normalization and payload decoding.
//!
//! The API issues signed tokens made of three dot-separated segments. The
//! middle segment is an unpadded base64url JSON payload:
//!
//! ```json
//! {
//!     "sub": "traveller@example.com",
//!     "iat": 1700000000,
//!     "exp": 1700000900,
//!     "type": "ACCESS",
//!     "accountId": 42,
//!     "roles": ["ROLE_USER"]
//! }
//! ```
//!
//! Tokens are decoded, never verified: the signature is the API's business.
//! Decoding only serves to derive the local session state.

use std::{
    str::FromStr,
    time::{Duration, SystemTime},
};

use base64::{
    alphabet,
    engine::{general_purpose, DecodePaddingMode, GeneralPurpose},
    Engine,
};
use http::HeaderValue;
use serde::{Deserialize, Serialize};
use serde_with::{formats::Flexible, serde_as, TimestampSeconds};
use veil::Redact;

use crate::error::{Error, Result};

/// Authorization scheme prepended to every attached credential.
pub const BEARER: &str = "Bearer ";

/// Payloads are sent without padding, but tolerate the odd padded one.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    general_purpose::NO_PAD.with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Strips an optional case-insensitive `Bearer ` prefix and surrounding
/// whitespace.
///
/// Credentials are always kept in this form, so that the scheme can be
/// prepended exactly once when attaching them.
///
/// # Example
///
/// ```rust
/// assert_eq!(normalize("  bEaReR abc.def.ghi "), "abc.def.ghi");
/// assert_eq!(normalize("abc.def.ghi"), "abc.def.ghi");
/// ```
#[must_use]
pub fn normalize(token: &str) -> &str {
    let token = token.trim_start();
    match token.get(..BEARER.len()) {
        Some(scheme) if scheme.eq_ignore_ascii_case(BEARER) => token[BEARER.len()..].trim(),
        _ => token.trim_end(),
    }
}

/// Builds the `Authorization` header value for `token`.
///
/// Returns `Ok(None)` when nothing is left after normalization.
///
/// # Errors
///
/// Will return `Err` if the token contains characters that are not allowed
/// in a header value.
pub fn bearer(token: &str) -> Result<Option<HeaderValue>> {
    let token = normalize(token);
    if token.is_empty() {
        return Ok(None);
    }

    let mut value = HeaderValue::from_str(&format!("{BEARER}{token}"))?;
    value.set_sensitive(true);
    Ok(Some(value))
}

/// Discriminates how a token may be used.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenKind {
    #[serde(alias = "access")]
    Access,
    #[serde(alias = "refresh")]
    Refresh,
}

/// Account identifiers are numeric on some deployments and strings on others.
#[derive(Deserialize)]
#[serde(untagged)]
enum AccountIdRepr {
    Number(i64),
    Text(String),
}

impl From<AccountIdRepr> for String {
    fn from(id: AccountIdRepr) -> Self {
        match id {
            AccountIdRepr::Number(id) => id.to_string(),
            AccountIdRepr::Text(id) => id,
        }
    }
}

#[serde_as]
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Payload {
    sub: String,
    #[serde_as(as = "Option<TimestampSeconds<i64, Flexible>>")]
    iat: Option<SystemTime>,
    #[serde_as(as = "TimestampSeconds<i64, Flexible>")]
    exp: SystemTime,
    #[serde(rename = "type")]
    kind: TokenKind,
    #[serde(default)]
    account_id: Option<AccountIdRepr>,
    #[serde(default)]
    roles: Vec<String>,
}

/// Claims carried by a token payload.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Claims {
    pub subject: String,
    pub issued_at: Option<SystemTime>,
    pub expires_at: SystemTime,
    pub kind: TokenKind,
    account_id: Option<String>,
    roles: Vec<String>,
}

impl Claims {
    /// Account the token was issued for. Always `None` for refresh tokens.
    #[must_use]
    pub fn account_id(&self) -> Option<&str> {
        match self.kind {
            TokenKind::Access => self.account_id.as_deref(),
            TokenKind::Refresh => None,
        }
    }

    /// Role claims in issue order. Always `None` for refresh tokens.
    #[must_use]
    pub fn roles(&self) -> Option<&[String]> {
        match self.kind {
            TokenKind::Access => Some(&self.roles),
            TokenKind::Refresh => None,
        }
    }

    #[must_use]
    pub fn time_to_live(&self, now: SystemTime) -> Duration {
        self.expires_at
            .duration_since(now)
            .unwrap_or(Duration::ZERO)
    }

    /// A token expiring exactly at `now` is expired.
    #[must_use]
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }
}

impl FromStr for Claims {
    type Err = Error;

    fn from_str(token: &str) -> Result<Self> {
        let mut segments = normalize(token).split('.');
        let (Some(_header), Some(payload), Some(_signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(Error::invalid_data("token must have three segments"));
        };

        let json = PAYLOAD_ENGINE.decode(payload)?;
        let payload: Payload = serde_json::from_slice(&json)?;

        Ok(Self {
            subject: payload.sub,
            issued_at: payload.iat,
            expires_at: payload.exp,
            kind: payload.kind,
            account_id: payload.account_id.map(Into::into),
            roles: payload.roles,
        })
    }
}

/// Decodes the claims of `token`, or `None` if it is malformed.
#[must_use]
pub fn decode(token: &str) -> Option<Claims> {
    match token.parse() {
        Ok(claims) => Some(claims),
        Err(e) => {
            trace!("discarding undecodable token: {e}");
            None
        }
    }
}

/// Access and refresh token as issued by the login endpoint.
#[derive(Clone, Redact, PartialEq, Eq, Hash)]
pub struct TokenPair {
    #[redact]
    pub access_token: String,
    #[redact]
    pub refresh_token: String,
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::UNIX_EPOCH;

    use serde_json::json;

    use super::*;

    /// Mints an unsigned token around `payload`.
    pub(crate) fn mint(payload: &serde_json::Value) -> String {
        let header = general_purpose::URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = general_purpose::URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{header}.{payload}.c2lnbmF0dXJl")
    }

    #[test]
    fn normalize_strips_scheme_in_any_case() {
        assert_eq!(normalize("Bearer abc"), "abc");
        assert_eq!(normalize("bearer abc"), "abc");
        assert_eq!(normalize("BEARER   abc  "), "abc");
        assert_eq!(normalize("\t abc \n"), "abc");
        assert_eq!(normalize("abc"), "abc");
        assert_eq!(normalize("Bearerabc"), "Bearerabc");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn bearer_header_is_the_same_with_or_without_scheme() {
        let plain = bearer("abc.def.ghi").unwrap().unwrap();
        for prefixed in ["Bearer abc.def.ghi", "bearer abc.def.ghi", " BeArEr abc.def.ghi "] {
            assert_eq!(bearer(prefixed).unwrap().unwrap(), plain);
        }
        assert_eq!(plain, "Bearer abc.def.ghi");
        assert!(plain.is_sensitive());
    }

    #[test]
    fn bearer_of_blank_token_is_absent() {
        assert!(bearer("   ").unwrap().is_none());
        assert!(bearer("Bearer ").unwrap().is_none());
    }

    #[test]
    fn decodes_access_claims() {
        let token = mint(&json!({
            "sub": "ana@example.com",
            "iat": 1_700_000_000,
            "exp": 1_700_000_900,
            "type": "ACCESS",
            "accountId": 42,
            "roles": ["ROLE_USER", "ROLE_ADMIN"],
        }));

        let claims = decode(&format!("Bearer {token}")).unwrap();
        assert_eq!(claims.subject, "ana@example.com");
        assert_eq!(claims.kind, TokenKind::Access);
        assert_eq!(
            claims.expires_at,
            UNIX_EPOCH + Duration::from_secs(1_700_000_900)
        );
        assert_eq!(
            claims.issued_at,
            Some(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
        );
        assert_eq!(claims.account_id(), Some("42"));
        assert_eq!(
            claims.roles(),
            Some(&["ROLE_USER".to_owned(), "ROLE_ADMIN".to_owned()][..])
        );
    }

    #[test]
    fn refresh_claims_never_yield_account_or_roles() {
        let token = mint(&json!({
            "sub": "ana@example.com",
            "exp": 1_700_000_900,
            "type": "REFRESH",
            "accountId": "a-42",
            "roles": ["ROLE_ADMIN"],
        }));

        let claims = decode(&token).unwrap();
        assert_eq!(claims.kind, TokenKind::Refresh);
        assert_eq!(claims.account_id(), None);
        assert_eq!(claims.roles(), None);
    }

    #[test]
    fn malformed_tokens_decode_to_none() {
        let valid = mint(&json!({"sub": "x", "exp": 1, "type": "ACCESS"}));
        let truncated = &valid[..valid.len() / 2];
        let not_an_object = mint(&json!("just a string"));
        let without_expiry = mint(&json!({"sub": "x", "type": "ACCESS"}));
        let unknown_kind = mint(&json!({"sub": "x", "exp": 1, "type": "ID"}));

        for token in [
            "",
            "not-a-token",
            "a.b",
            "a.b.c.d",
            "a.%%%.c",
            truncated,
            not_an_object.as_str(),
            without_expiry.as_str(),
            unknown_kind.as_str(),
        ] {
            assert!(decode(token).is_none(), "{token:?} should not decode");
        }
    }

    #[test]
    fn expiry_is_inclusive() {
        let claims = decode(&mint(&json!({"sub": "x", "exp": 100, "type": "ACCESS"}))).unwrap();
        let exp = UNIX_EPOCH + Duration::from_secs(100);

        assert!(claims.is_expired_at(exp));
        assert!(claims.is_expired_at(exp + Duration::from_secs(1)));
        assert!(!claims.is_expired_at(exp - Duration::from_secs(1)));
        assert_eq!(claims.time_to_live(exp + Duration::from_secs(5)), Duration::ZERO);
        assert_eq!(
            claims.time_to_live(exp - Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn token_pair_debug_is_redacted() {
        let pair = TokenPair {
            access_token: "secret-access".to_owned(),
            refresh_token: "secret-refresh".to_owned(),
        };
        let debug = format!("{pair:?}");
        assert!(!debug.contains("secret-access"));
        assert!(!debug.contains("secret-refresh"));
    }
}
