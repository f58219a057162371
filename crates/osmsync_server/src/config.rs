//! Server configuration.

use std::time::Duration;

/// A signed-token grant accepted by the server.
#[derive(Clone)]
pub struct OAuthGrant {
    /// User the grant acts for.
    pub user: String,
    /// Public consumer key.
    pub consumer_key: String,
    /// Consumer secret.
    pub consumer_secret: String,
    /// Public access token.
    pub token: String,
    /// Token secret.
    pub token_secret: String,
}

impl std::fmt::Debug for OAuthGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthGrant")
            .field("user", &self.user)
            .field("consumer_key", &self.consumer_key)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// Configuration for the reference server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public API URL, without the version segment.
    ///
    /// Its path is stripped from incoming requests and it is the URL signed
    /// requests are verified against.
    pub public_url: String,
    /// Maximum number of edits a changeset accepts before it is closed.
    pub max_changeset_elements: u64,
    /// Maximum number of nodes per way announced in the capabilities.
    pub max_way_nodes: u64,
    /// Server timeout announced in the capabilities.
    pub timeout: Duration,
    /// Allowed clock skew for signed requests.
    pub signature_skew: Duration,
    /// Whether write requests must be authenticated.
    pub require_auth: bool,
    /// Basic-auth users and passwords.
    pub users: Vec<(String, String)>,
    /// Signed-token grants.
    pub grants: Vec<OAuthGrant>,
}

impl ServerConfig {
    /// Creates a configuration for a public URL.
    pub fn new(public_url: impl Into<String>) -> Self {
        Self {
            public_url: public_url.into(),
            max_changeset_elements: 10_000,
            max_way_nodes: 2_000,
            timeout: Duration::from_secs(300),
            signature_skew: Duration::from_secs(300),
            require_auth: false,
            users: Vec::new(),
            grants: Vec::new(),
        }
    }

    /// Sets the changeset element limit.
    pub fn with_max_changeset_elements(mut self, max: u64) -> Self {
        self.max_changeset_elements = max;
        self
    }

    /// Sets the way node limit.
    pub fn with_max_way_nodes(mut self, max: u64) -> Self {
        self.max_way_nodes = max;
        self
    }

    /// Adds a basic-auth user and requires authentication for writes.
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.require_auth = true;
        self.users.push((username.into(), password.into()));
        self
    }

    /// Adds a signed-token grant and requires authentication for writes.
    pub fn with_grant(mut self, grant: OAuthGrant) -> Self {
        self.require_auth = true;
        self.grants.push(grant);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("http://localhost/api")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_changeset_elements, 10_000);
        assert!(!config.require_auth);
        assert!(config.users.is_empty());
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new("http://osm.test/api")
            .with_max_changeset_elements(5)
            .with_max_way_nodes(10)
            .with_user("alice", "secret");

        assert_eq!(config.max_changeset_elements, 5);
        assert_eq!(config.max_way_nodes, 10);
        assert!(config.require_auth);
        assert_eq!(config.users, vec![("alice".to_string(), "secret".to_string())]);
    }

    #[test]
    fn grant_debug_hides_secrets() {
        let grant = OAuthGrant {
            user: "bob".into(),
            consumer_key: "ck".into(),
            consumer_secret: "cs".into(),
            token: "tk".into(),
            token_secret: "ts".into(),
        };
        let rendered = format!("{:?}", grant);
        assert!(rendered.contains("ck"));
        assert!(!rendered.contains("cs"));
        assert!(!rendered.contains("ts"));
    }
}
