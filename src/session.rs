//! Session state derived from the current access token.
//!
//! A [`Session`] is never stored. It is computed on demand from whatever
//! access token the [`CredentialStore`](crate::store::CredentialStore) holds,
//! so it can never disagree with the credentials.

use std::time::SystemTime;

use crate::token::{self, TokenKind};

/// Who the access token was issued to.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub account_id: Option<String>,
    pub roles: Vec<String>,
}

impl Identity {
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|held| held == role)
    }
}

#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct Session {
    identity: Option<Identity>,
}

impl Session {
    /// Derives the session from `access_token` as of `now`.
    ///
    /// The session is authenticated only if the token decodes, is an access
    /// token, and expires strictly after `now`.
    #[must_use]
    pub fn from_access_token(access_token: Option<&str>, now: SystemTime) -> Self {
        let identity = access_token
            .and_then(token::decode)
            .filter(|claims| claims.kind == TokenKind::Access && !claims.is_expired_at(now))
            .map(|claims| Identity {
                account_id: claims.account_id().map(ToOwned::to_owned),
                roles: claims.roles().map(<[String]>::to_vec).unwrap_or_default(),
                subject: claims.subject,
            });

        Self { identity }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Route guard: whether this session may access a view restricted to
    /// `required_roles`.
    ///
    /// An empty `required_roles` only requires authentication. Otherwise
    /// holding any one of the roles suffices.
    #[must_use]
    pub fn permits(&self, required_roles: &[&str]) -> bool {
        self.identity.as_ref().is_some_and(|identity| {
            required_roles.is_empty() || required_roles.iter().any(|role| identity.has_role(role))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use serde_json::json;

    use super::*;
    use crate::token::tests::mint;

    const NOW: u64 = 1_700_000_000;

    fn now() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(NOW)
    }

    fn access_token(exp: u64) -> String {
        mint(&json!({
            "sub": "ana@example.com",
            "iat": NOW - 60,
            "exp": exp,
            "type": "ACCESS",
            "accountId": 7,
            "roles": ["ROLE_USER"],
        }))
    }

    #[test]
    fn authenticated_with_live_access_token() {
        let session = Session::from_access_token(Some(&access_token(NOW + 60)), now());

        assert!(session.is_authenticated());
        let identity = session.identity().unwrap();
        assert_eq!(identity.subject, "ana@example.com");
        assert_eq!(identity.account_id.as_deref(), Some("7"));
        assert_eq!(identity.roles, ["ROLE_USER"]);
    }

    #[test]
    fn not_authenticated_without_token() {
        let session = Session::from_access_token(None, now());
        assert!(!session.is_authenticated());
        assert_eq!(session.identity(), None);
    }

    #[test]
    fn not_authenticated_with_refresh_token() {
        let token = mint(&json!({"sub": "ana@example.com", "exp": NOW + 60, "type": "REFRESH"}));
        assert!(!Session::from_access_token(Some(&token), now()).is_authenticated());
    }

    #[test]
    fn not_authenticated_once_expired() {
        assert!(!Session::from_access_token(Some(&access_token(NOW)), now()).is_authenticated());
        assert!(
            !Session::from_access_token(Some(&access_token(NOW - 1)), now()).is_authenticated()
        );
    }

    #[test]
    fn not_authenticated_with_garbage() {
        assert!(!Session::from_access_token(Some("garbage"), now()).is_authenticated());
    }

    #[test]
    fn guard_checks_roles() {
        let session = Session::from_access_token(Some(&access_token(NOW + 60)), now());

        assert!(session.permits(&[]));
        assert!(session.permits(&["ROLE_ADMIN", "ROLE_USER"]));
        assert!(!session.permits(&["ROLE_ADMIN"]));
        assert!(!Session::default().permits(&[]));
    }
}
