//! CLI command implementations.

pub mod capabilities;
pub mod changesets;
pub mod close;
pub mod download;
pub mod reconcile;
pub mod upload;

use osmsync_transfer::{
    AuthMethod, Credentials, MemoryCredentials, MemoryPreferences, OAuthToken, TransferConfig,
    TransferSession,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Result type shared by all commands.
pub type CommandResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Connection settings collected from the command line.
#[derive(Debug, Default, Clone)]
pub struct ConnectOptions {
    /// Preferences file with `key=value` lines.
    pub prefs: Option<PathBuf>,
    /// Server URL overriding the preferences.
    pub server: Option<String>,
    /// Auth method overriding the preferences.
    pub auth: Option<AuthMethod>,
    /// Basic-auth user.
    pub user: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
    /// Signed-token credentials as `consumer_key:consumer_secret:token:token_secret`.
    pub token: Option<String>,
    /// Minimum age of changesets queried by reconciliation.
    pub min_age: Option<Duration>,
}

impl ConnectOptions {
    /// Builds the transfer configuration.
    pub fn config(&self) -> CommandResult<TransferConfig> {
        let mut config = match &self.prefs {
            Some(path) => TransferConfig::from_preferences(&load_preferences(path)?),
            None => TransferConfig::default(),
        };
        if let Some(server) = &self.server {
            config.server_url = server.clone();
        }
        if let Some(auth) = self.auth {
            config.auth_method = auth;
        }
        if let Some(min_age) = self.min_age {
            config.reconciliation = config.reconciliation.with_min_age(min_age);
        }
        Ok(config)
    }

    /// Credentials for the configured server.
    pub fn credentials(&self, config: &TransferConfig) -> CommandResult<MemoryCredentials> {
        let host = url_host(&config.server_url)?;
        let mut credentials = MemoryCredentials::new();
        if let Some(user) = &self.user {
            let password = self.password.clone().unwrap_or_default();
            credentials = credentials.with_credentials(&host, Credentials::new(user, password));
        }
        if let Some(token) = &self.token {
            credentials = credentials.with_token(&host, parse_token(token)?);
        }
        Ok(credentials)
    }

    /// Opens a session over a real HTTP client.
    pub fn connect(&self) -> CommandResult<TransferSession> {
        let config = self.config()?;
        let credentials = self.credentials(&config)?;
        debug!(server = %config.server_url, "connecting");
        Ok(TransferSession::with_ureq(config, Arc::new(credentials))?)
    }
}

fn url_host(server_url: &str) -> CommandResult<String> {
    let url = url::Url::parse(server_url)
        .map_err(|e| format!("invalid server url '{}': {}", server_url, e))?;
    url.host_str()
        .map(str::to_string)
        .ok_or_else(|| format!("server url '{}' has no host", server_url).into())
}

fn parse_token(raw: &str) -> CommandResult<OAuthToken> {
    let parts: Vec<&str> = raw.split(':').collect();
    match parts.as_slice() {
        [consumer_key, consumer_secret, token, token_secret] => Ok(OAuthToken::new(
            *consumer_key,
            *consumer_secret,
            *token,
            *token_secret,
        )),
        _ => Err("token must be consumer_key:consumer_secret:token:token_secret".into()),
    }
}

/// Reads a preferences file of `key=value` lines. `#` starts a comment.
pub fn load_preferences(path: &Path) -> CommandResult<MemoryPreferences> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read preferences {:?}: {}", path, e))?;
    let prefs = MemoryPreferences::new();
    for (number, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| format!("{:?}:{}: expected key=value", path, number + 1))?;
        prefs.set(key.trim(), value.trim());
    }
    Ok(prefs)
}


#[cfg(test)]
mod tests {
    use super::*;
    use osmsync_transfer::{MaxChangesetSizeExceededPolicy, PreferenceStore, UploadStrategy};
    use std::io::Write;

    #[test]
    fn preferences_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# local dev server").unwrap();
        writeln!(file, "osm-server.url = http://localhost:3000/api").unwrap();
        writeln!(file, "osm-server.upload-strategy=chunked").unwrap();
        writeln!(file, "osm-server.upload-strategy.chunk-size=50").unwrap();
        writeln!(file, "osm-server.upload-strategy.policy=auto").unwrap();

        let prefs = load_preferences(file.path()).unwrap();
        assert_eq!(
            prefs.get("osm-server.url").as_deref(),
            Some("http://localhost:3000/api")
        );

        let options = ConnectOptions {
            prefs: Some(file.path().to_path_buf()),
            auth: Some(AuthMethod::OAuth),
            ..ConnectOptions::default()
        };
        let config = options.config().unwrap();
        assert_eq!(config.server_url, "http://localhost:3000/api");
        assert_eq!(config.auth_method, AuthMethod::OAuth);
        assert_eq!(config.upload.strategy, UploadStrategy::chunked(50));
        assert_eq!(
            config.upload.policy,
            MaxChangesetSizeExceededPolicy::AutomaticallyOpenNewChangesets
        );
    }

    #[test]
    fn malformed_preferences_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "no separator here").unwrap();
        assert!(load_preferences(file.path()).is_err());
    }

    #[test]
    fn credentials_keyed_by_host() {
        use osmsync_transfer::CredentialsProvider;

        let options = ConnectOptions {
            server: Some("https://user@api.example.org:8443/api".into()),
            user: Some("alice".into()),
            password: Some("pw".into()),
            token: Some("ck:cs:tk:ts".into()),
            ..ConnectOptions::default()
        };
        let config = options.config().unwrap();
        let credentials = options.credentials(&config).unwrap();
        assert_eq!(
            credentials.lookup("api.example.org").unwrap().username,
            "alice"
        );
        assert_eq!(
            credentials.lookup_token("api.example.org").unwrap().token,
            "tk"
        );

        let bad = ConnectOptions {
            token: Some("only:three:parts".into()),
            ..ConnectOptions::default()
        };
        assert!(bad.credentials(&config).is_err());
        assert!(url_host("not a url").is_err());
    }
}
