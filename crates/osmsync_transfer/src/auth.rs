//! Authentication methods, credentials providers and header construction.

use crate::error::{TransferError, TransferResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use osmsync_protocol::signing::{self, SignedParams};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// How requests are authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// HTTP basic authentication.
    #[default]
    Basic,
    /// Signed token header.
    OAuth,
}

impl AuthMethod {
    /// Configuration name.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::Basic => "basic",
            AuthMethod::OAuth => "oauth",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AuthMethod {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(AuthMethod::Basic),
            "oauth" => Ok(AuthMethod::OAuth),
            other => Err(format!("unknown auth method '{}'", other)),
        }
    }
}

/// Username and password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Consumer key/secret and access token/secret for signed requests.
#[derive(Clone, PartialEq, Eq)]
pub struct OAuthToken {
    /// Public consumer key.
    pub consumer_key: String,
    /// Consumer secret.
    pub consumer_secret: String,
    /// Public access token.
    pub token: String,
    /// Token secret.
    pub token_secret: String,
}

impl OAuthToken {
    /// Creates a token.
    pub fn new(
        consumer_key: impl Into<String>,
        consumer_secret: impl Into<String>,
        token: impl Into<String>,
        token_secret: impl Into<String>,
    ) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
            token: token.into(),
            token_secret: token_secret.into(),
        }
    }
}

impl fmt::Debug for OAuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthToken")
            .field("consumer_key", &self.consumer_key)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// Source of credentials, keyed by host.
pub trait CredentialsProvider: Send + Sync {
    /// Basic credentials for a host.
    fn lookup(&self, host: &str) -> Option<Credentials>;

    /// Stores basic credentials for a host.
    fn store(&self, host: &str, credentials: Credentials);

    /// Token for a host.
    fn lookup_token(&self, host: &str) -> Option<OAuthToken>;

    /// Stores a token for a host.
    fn store_token(&self, host: &str, token: OAuthToken);

    /// Forgets cached credentials for a host after the server rejected them.
    fn purge(&self, host: &str);
}

/// In-memory credentials provider.
#[derive(Debug, Default)]
pub struct MemoryCredentials {
    basic: RwLock<HashMap<String, Credentials>>,
    tokens: RwLock<HashMap<String, OAuthToken>>,
}

impl MemoryCredentials {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds basic credentials for a host.
    pub fn with_credentials(self, host: &str, credentials: Credentials) -> Self {
        self.store(host, credentials);
        self
    }

    /// Adds a token for a host.
    pub fn with_token(self, host: &str, token: OAuthToken) -> Self {
        self.store_token(host, token);
        self
    }
}

impl CredentialsProvider for MemoryCredentials {
    fn lookup(&self, host: &str) -> Option<Credentials> {
        self.basic.read().get(host).cloned()
    }

    fn store(&self, host: &str, credentials: Credentials) {
        self.basic.write().insert(host.to_string(), credentials);
    }

    fn lookup_token(&self, host: &str) -> Option<OAuthToken> {
        self.tokens.read().get(host).cloned()
    }

    fn store_token(&self, host: &str, token: OAuthToken) {
        self.tokens.write().insert(host.to_string(), token);
    }

    fn purge(&self, host: &str) {
        self.basic.write().remove(host);
        self.tokens.write().remove(host);
    }
}

fn nonce() -> String {
    let value: u128 = rand::thread_rng().gen();
    format!("{:032x}", value)
}

/// Builds the `Authorization` header value for a request.
pub(crate) fn authorization_header(
    method: AuthMethod,
    provider: &dyn CredentialsProvider,
    host: &str,
    http_method: &str,
    url: &str,
) -> TransferResult<String> {
    match method {
        AuthMethod::Basic => {
            let credentials = provider
                .lookup(host)
                .ok_or_else(|| TransferError::MissingCredentials {
                    host: host.to_string(),
                })?;
            let raw = format!("{}:{}", credentials.username, credentials.password);
            Ok(format!("Basic {}", STANDARD.encode(raw.as_bytes())))
        }
        AuthMethod::OAuth => {
            let token = provider
                .lookup_token(host)
                .ok_or_else(|| TransferError::MissingCredentials {
                    host: host.to_string(),
                })?;
            let timestamp = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0);
            let mut params =
                SignedParams::new(&token.consumer_key, &token.token, nonce(), timestamp);
            signing::sign_request(
                http_method,
                url,
                &mut params,
                &token.consumer_secret,
                &token.token_secret,
            )
            .map_err(|e| TransferError::AuthSigningFailed(e.to_string()))?;
            Ok(signing::authorization_header(&params))
        }
    }
}
