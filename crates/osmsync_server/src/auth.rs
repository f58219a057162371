//! Authentication of write requests.
//!
//! Two schemes are accepted:
//! - `Basic` with a configured username and password
//! - `OAuth` signed tokens, verified against the configured grants
//!
//! Signed requests are checked for clock skew and nonce reuse.

use crate::config::{OAuthGrant, ServerConfig};
use crate::error::{ServerError, ServerResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use osmsync_protocol::signing;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// User name recorded for writes when authentication is not required.
pub const ANONYMOUS: &str = "anonymous";

/// Validates `Authorization` headers.
pub struct Authenticator {
    require_auth: bool,
    users: Vec<(String, String)>,
    grants: Vec<OAuthGrant>,
    skew: Duration,
    seen_nonces: Mutex<HashSet<String>>,
}

impl Authenticator {
    /// Creates an authenticator from the server configuration.
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            require_auth: config.require_auth,
            users: config.users.clone(),
            grants: config.grants.clone(),
            skew: config.signature_skew,
            seen_nonces: Mutex::new(HashSet::new()),
        }
    }

    /// Authenticates a request and returns the acting user.
    ///
    /// Without required authentication every request acts as [`ANONYMOUS`],
    /// whatever it carries. `url` must be the full public URL the client signed.
    pub fn authenticate(
        &self,
        method: &str,
        url: &str,
        authorization: Option<&str>,
    ) -> ServerResult<String> {
        if !self.require_auth {
            return Ok(ANONYMOUS.to_string());
        }
        let Some(header) = authorization else {
            return Err(ServerError::Unauthorized(
                "Couldn't authenticate you".into(),
            ));
        };

        if let Some(encoded) = header.strip_prefix("Basic ") {
            return self.basic(encoded.trim());
        }
        if header.starts_with("OAuth ") {
            return self.signed(method, url, header);
        }
        Err(ServerError::Unauthorized(
            "unsupported authorization scheme".into(),
        ))
    }

    fn basic(&self, encoded: &str) -> ServerResult<String> {
        let decoded = STANDARD
            .decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| ServerError::Unauthorized("malformed basic credentials".into()))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| ServerError::Unauthorized("malformed basic credentials".into()))?;
        let known = self
            .users
            .iter()
            .any(|(user, pass)| user == username && pass == password);
        if !known {
            warn!(username, "rejected basic credentials");
            return Err(ServerError::Unauthorized("Couldn't authenticate you".into()));
        }
        Ok(username.to_string())
    }

    fn signed(&self, method: &str, url: &str, header: &str) -> ServerResult<String> {
        let params = signing::parse_authorization_header(header)
            .map_err(|e| ServerError::Unauthorized(e.to_string()))?;
        let grant = self
            .grants
            .iter()
            .find(|g| g.consumer_key == params.consumer_key && g.token == params.token)
            .ok_or_else(|| ServerError::Unauthorized("Invalid access token".into()))?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if now.abs_diff(params.timestamp) > self.skew.as_secs() {
            return Err(ServerError::Unauthorized("Timestamp out of range".into()));
        }

        let valid = signing::verify(
            method,
            url,
            &params,
            &grant.consumer_secret,
            &grant.token_secret,
        )
        .map_err(|e| ServerError::Internal(e.to_string()))?;
        if !valid {
            warn!(consumer_key = %params.consumer_key, "rejected signature");
            return Err(ServerError::Unauthorized("Invalid signature".into()));
        }

        if !self.seen_nonces.lock().insert(params.nonce.clone()) {
            return Err(ServerError::Unauthorized("Nonce already used".into()));
        }
        Ok(grant.user.clone())
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("require_auth", &self.require_auth)
            .field("users", &self.users.len())
            .field("grants", &self.grants.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osmsync_protocol::signing::SignedParams;

    const URL: &str = "http://osm.test/api/0.6/changeset/create";

    fn grant() -> OAuthGrant {
        OAuthGrant {
            user: "bob".into(),
            consumer_key: "ck".into(),
            consumer_secret: "cs".into(),
            token: "tk".into(),
            token_secret: "ts".into(),
        }
    }

    fn signed_header(nonce: &str, timestamp: u64, url: &str) -> String {
        let mut params = SignedParams::new("ck", "tk", nonce, timestamp);
        signing::sign_request("PUT", url, &mut params, "cs", "ts").unwrap();
        signing::authorization_header(&params)
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    #[test]
    fn anonymous_when_not_required() {
        let auth = Authenticator::new(&ServerConfig::default());
        assert_eq!(auth.authenticate("PUT", URL, None).unwrap(), ANONYMOUS);
        assert_eq!(
            auth.authenticate("PUT", URL, Some("Basic Zm9vOmJhcg==")).unwrap(),
            ANONYMOUS
        );
    }

    #[test]
    fn basic_credentials() {
        let auth = Authenticator::new(&ServerConfig::default().with_user("alice", "secret"));
        assert!(auth.authenticate("PUT", URL, None).is_err());

        let good = format!("Basic {}", STANDARD.encode("alice:secret"));
        assert_eq!(auth.authenticate("PUT", URL, Some(&good)).unwrap(), "alice");

        let bad = format!("Basic {}", STANDARD.encode("alice:wrong"));
        assert_eq!(
            auth.authenticate("PUT", URL, Some(&bad)).unwrap_err().status(),
            401
        );
        assert!(auth.authenticate("PUT", URL, Some("Basic !!")).is_err());
    }

    #[test]
    fn signed_requests() {
        let auth = Authenticator::new(&ServerConfig::default().with_grant(grant()));
        let header = signed_header("n1", now(), URL);
        assert_eq!(auth.authenticate("PUT", URL, Some(&header)).unwrap(), "bob");

        // replayed nonce
        assert!(auth.authenticate("PUT", URL, Some(&header)).is_err());

        // signed for another URL
        let other = signed_header("n2", now(), "http://osm.test/api/0.6/changeset/9");
        assert!(auth.authenticate("PUT", URL, Some(&other)).is_err());

        // stale timestamp
        let stale = signed_header("n3", now() - 3600, URL);
        assert!(auth.authenticate("PUT", URL, Some(&stale)).is_err());
    }
}
