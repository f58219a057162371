//! Signed-token authorization header.
//!
//! An OAuth 1.0a style scheme using HMAC-SHA256. The client signs the request
//! method, the normalized URL and the protocol parameters with the consumer
//! secret and the token secret; the server recomputes the signature from the
//! same inputs.
//!
//! ## Header Format
//!
//! ```text
//! OAuth oauth_consumer_key="..", oauth_nonce="..", oauth_signature="..",
//!       oauth_signature_method="HMAC-SHA256", oauth_timestamp="..",
//!       oauth_token="..", oauth_version="1.0"
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

/// Signature method announced in the header.
pub const SIGNATURE_METHOD: &str = "HMAC-SHA256";

/// Protocol parameters carried by a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedParams {
    /// Public consumer key.
    pub consumer_key: String,
    /// Public access token.
    pub token: String,
    /// Single-use random string.
    pub nonce: String,
    /// Unix time in seconds.
    pub timestamp: u64,
    /// Base64 signature; empty until signed.
    pub signature: String,
}

impl SignedParams {
    /// Creates unsigned parameters.
    pub fn new(
        consumer_key: impl Into<String>,
        token: impl Into<String>,
        nonce: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            token: token.into(),
            nonce: nonce.into(),
            timestamp,
            signature: String::new(),
        }
    }

    fn protocol_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("oauth_consumer_key", self.consumer_key.clone()),
            ("oauth_nonce", self.nonce.clone()),
            ("oauth_signature_method", SIGNATURE_METHOD.to_string()),
            ("oauth_timestamp", self.timestamp.to_string()),
            ("oauth_token", self.token.clone()),
            ("oauth_version", "1.0".to_string()),
        ]
    }
}

fn encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Builds the string that gets signed.
///
/// Query parameters of `url` are folded into the parameter string; the URL
/// itself is signed without its query.
pub fn signature_base_string(method: &str, url: &str, params: &SignedParams) -> String {
    let (base_url, query) = match url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (url, None),
    };

    let mut pairs: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in params.protocol_pairs() {
        pairs.entry(encode(key)).or_default().push(encode(&value));
    }
    for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = urlencoding::decode(key).map(|k| k.into_owned()).unwrap_or_else(|_| key.to_string());
        let value = urlencoding::decode(value)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.to_string());
        pairs.entry(encode(&key)).or_default().push(encode(&value));
    }

    let mut normalized = Vec::new();
    for (key, mut values) in pairs {
        values.sort();
        for value in values {
            normalized.push(format!("{}={}", key, value));
        }
    }

    format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        encode(base_url),
        encode(&normalized.join("&"))
    )
}

fn mac_for(consumer_secret: &str, token_secret: &str) -> ProtocolResult<HmacSha256> {
    let key = format!("{}&{}", encode(consumer_secret), encode(token_secret));
    HmacSha256::new_from_slice(key.as_bytes()).map_err(|e| ProtocolError::Signing(e.to_string()))
}

/// Signs a base string, returning the base64 signature.
pub fn sign(base_string: &str, consumer_secret: &str, token_secret: &str) -> ProtocolResult<String> {
    let mut mac = mac_for(consumer_secret, token_secret)?;
    mac.update(base_string.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Signs `params` for a request and fills in the signature.
pub fn sign_request(
    method: &str,
    url: &str,
    params: &mut SignedParams,
    consumer_secret: &str,
    token_secret: &str,
) -> ProtocolResult<()> {
    let base = signature_base_string(method, url, params);
    params.signature = sign(&base, consumer_secret, token_secret)?;
    Ok(())
}

/// Renders the `Authorization` header value.
pub fn authorization_header(params: &SignedParams) -> String {
    let mut parts: Vec<String> = params
        .protocol_pairs()
        .into_iter()
        .map(|(key, value)| format!("{}=\"{}\"", key, encode(&value)))
        .collect();
    parts.push(format!("oauth_signature=\"{}\"", encode(&params.signature)));
    parts.sort();
    format!("OAuth {}", parts.join(", "))
}

/// Parses an `Authorization` header produced by [`authorization_header`].
pub fn parse_authorization_header(value: &str) -> ProtocolResult<SignedParams> {
    let rest = value
        .trim()
        .strip_prefix("OAuth ")
        .ok_or_else(|| ProtocolError::Signing("not an OAuth header".into()))?;

    let mut fields = BTreeMap::new();
    for part in rest.split(',') {
        let (key, raw) = part
            .trim()
            .split_once('=')
            .ok_or_else(|| ProtocolError::Signing(format!("malformed header field '{}'", part)))?;
        let raw = raw.trim_matches('"');
        let decoded = urlencoding::decode(raw)
            .map_err(|e| ProtocolError::Signing(e.to_string()))?
            .into_owned();
        fields.insert(key.to_string(), decoded);
    }

    let mut take = |key: &str| {
        fields
            .remove(key)
            .ok_or_else(|| ProtocolError::Signing(format!("missing header field '{}'", key)))
    };
    let method = take("oauth_signature_method")?;
    if method != SIGNATURE_METHOD {
        return Err(ProtocolError::Signing(format!(
            "unsupported signature method '{}'",
            method
        )));
    }
    let timestamp_raw = take("oauth_timestamp")?;
    let timestamp = timestamp_raw
        .parse()
        .map_err(|_| ProtocolError::Signing(format!("invalid timestamp '{}'", timestamp_raw)))?;
    Ok(SignedParams {
        consumer_key: take("oauth_consumer_key")?,
        token: take("oauth_token")?,
        nonce: take("oauth_nonce")?,
        timestamp,
        signature: take("oauth_signature")?,
    })
}

/// Verifies a signed request in constant time.
pub fn verify(
    method: &str,
    url: &str,
    params: &SignedParams,
    consumer_secret: &str,
    token_secret: &str,
) -> ProtocolResult<bool> {
    let signature = match STANDARD.decode(params.signature.as_bytes()) {
        Ok(bytes) => bytes,
        Err(_) => return Ok(false),
    };
    let mut mac = mac_for(consumer_secret, token_secret)?;
    mac.update(signature_base_string(method, url, params).as_bytes());
    Ok(mac.verify_slice(&signature).is_ok())
}
