//! Incoming request authentication and authorization.
//!
//! Callers sign requests with the Hawk MAC scheme over the URL as seen
//! by the outside world, so the URL is reconstructed with the scheme from
//! `X-Forwarded-Proto`. The whitelist check trusts the second-from-last
//! entry of `X-Forwarded-For` (the client IP as recorded by the trusted
//! proxy in front of us): a single entry is always rejected and the
//! leftmost, caller-supplied entry is never trusted on its own. Replay is
//! prevented with a nonce key in the KV store.

use anyhow::Context;
use chrono::Utc;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::kv::{nonce_key, KvStore};
use crate::signing;

pub const NONCE_EXPIRE: u64 = 120;
const MAX_SKEW_SECONDS: i64 = 60;

pub const NOT_PROVIDED: &str = "Authentication credentials were not provided.";
pub const INCORRECT: &str = "Incorrect authentication credentials.";
pub const MISSING_CONTENT_TYPE: &str = "Content-Type header was not set. \
     It must be set for authentication, even if as the empty string.";
pub const MISSING_X_FORWARDED_PROTO: &str = "The X-Forwarded-Proto header was not set.";
pub const NOT_AUTHORIZED: &str = "You are not authorized to perform this action.";
pub const UNKNOWN_ERROR: &str = "An unknown error occurred.";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("{0}")]
    Forbidden(&'static str),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// An incoming key pair with the HTTP methods it is allowed to use.
#[derive(Debug, Clone)]
pub struct Credential {
    pub key_id: String,
    pub secret_key: String,
    pub permissions: Vec<String>,
}

impl Credential {
    pub fn from_config(config: &common::KeyPairConfig) -> Self {
        Self {
            key_id: config.key_id.clone(),
            secret_key: config.secret_key.clone(),
            permissions: config.permissions.clone(),
        }
    }
}

/// The authenticated caller attached to a request after all checks pass.
#[derive(Debug, Clone)]
pub struct Caller {
    pub key_id: String,
    pub permissions: Vec<String>,
}

/// The request headers authentication needs, captured by the server's
/// request guard. `None` means the header was absent; `Content-Type` may
/// legitimately be present and empty.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub x_forwarded_proto: Option<String>,
    pub x_forwarded_for: Option<String>,
    pub host: Option<String>,
}

#[derive(Debug)]
struct HawkAttributes {
    id: String,
    ts: String,
    nonce: String,
    hash: String,
    mac: String,
}

/// Authenticate one request. Checks run in a fixed order so the caller
/// always gets the most specific message for the first thing wrong.
pub async fn authenticate(
    kv: &KvStore,
    credentials: &[Credential],
    ip_whitelist: &[String],
    headers: &RequestHeaders,
    method: &str,
    path_and_query: &str,
    body: &[u8],
) -> Result<Caller, AuthError> {
    let proto = headers.x_forwarded_proto.as_deref().ok_or_else(|| {
        warn!("failed authentication: no X-Forwarded-Proto header passed");
        AuthError::Unauthorized(MISSING_X_FORWARDED_PROTO)
    })?;
    let authorization = headers
        .authorization
        .as_deref()
        .ok_or(AuthError::Unauthorized(NOT_PROVIDED))?;
    let content_type = headers
        .content_type
        .as_deref()
        .ok_or(AuthError::Unauthorized(MISSING_CONTENT_TYPE))?;

    check_whitelist(ip_whitelist, headers.x_forwarded_for.as_deref())?;

    let host = headers
        .host
        .as_deref()
        .ok_or(AuthError::Unauthorized(INCORRECT))?;
    let url = Url::parse(&format!("{}://{}{}", proto, host, path_and_query))
        .map_err(|_| AuthError::Unauthorized(INCORRECT))?;

    let attributes = parse_hawk_header(authorization).ok_or_else(|| {
        warn!("failed authentication: malformed Hawk header");
        AuthError::Unauthorized(INCORRECT)
    })?;
    let credential = lookup_credential(credentials, &attributes.id).ok_or_else(|| {
        warn!(key_id = attributes.id.as_str(), "failed authentication: unknown key id");
        AuthError::Unauthorized(INCORRECT)
    })?;

    if !timestamp_within_skew(&attributes.ts, Utc::now().timestamp()) {
        return Err(AuthError::Unauthorized(INCORRECT));
    }

    let expected_hash = signing::hawk_payload_hash(content_type, body);
    if !constant_time_eq(expected_hash.as_bytes(), attributes.hash.as_bytes()) {
        return Err(AuthError::Unauthorized(INCORRECT));
    }

    if !signing::hawk_verify_mac(
        &credential.secret_key,
        &attributes.ts,
        &attributes.nonce,
        method,
        &url,
        &attributes.hash,
        &attributes.mac,
    ) {
        return Err(AuthError::Unauthorized(INCORRECT));
    }

    let fresh = kv
        .set_nx_ex(
            &nonce_key(&credential.key_id, &attributes.nonce),
            NONCE_EXPIRE,
        )
        .await
        .context("nonce check failed")?;
    if !fresh {
        warn!(key_id = credential.key_id.as_str(), "failed authentication: nonce replayed");
        return Err(AuthError::Unauthorized(INCORRECT));
    }

    Ok(Caller {
        key_id: credential.key_id.clone(),
        permissions: credential.permissions.clone(),
    })
}

/// The caller's permission set must contain the request method.
pub fn authorize(caller: &Caller, method: &str) -> Result<(), AuthError> {
    if caller.permissions.iter().any(|allowed| allowed == method) {
        Ok(())
    } else {
        Err(AuthError::Forbidden(NOT_AUTHORIZED))
    }
}

fn check_whitelist(whitelist: &[String], x_forwarded_for: Option<&str>) -> Result<(), AuthError> {
    let header = x_forwarded_for.ok_or_else(|| {
        warn!("failed authentication: no X-Forwarded-For header passed");
        AuthError::Unauthorized(INCORRECT)
    })?;
    let entries: Vec<&str> = header.split(',').map(str::trim).collect();
    if entries.len() < 2 {
        warn!("failed authentication: X-Forwarded-For too short");
        return Err(AuthError::Unauthorized(INCORRECT));
    }
    let client_ip = entries[entries.len() - 2];
    if whitelist.iter().any(|allowed| allowed == client_ip) {
        Ok(())
    } else {
        warn!(client_ip, "failed authentication: IP not whitelisted");
        Err(AuthError::Unauthorized(INCORRECT))
    }
}

fn timestamp_within_skew(ts: &str, now: i64) -> bool {
    match ts.parse::<i64>() {
        Ok(ts) => (now - ts).abs() <= MAX_SKEW_SECONDS,
        Err(_) => false,
    }
}

fn parse_hawk_header(header: &str) -> Option<HawkAttributes> {
    let rest = header.strip_prefix("Hawk ")?;
    let mut id = None;
    let mut ts = None;
    let mut nonce = None;
    let mut hash = None;
    let mut mac = None;
    for part in rest.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        let value = value.trim().strip_prefix('"')?.strip_suffix('"')?;
        match key.trim() {
            "id" => id = Some(value.to_string()),
            "ts" => ts = Some(value.to_string()),
            "nonce" => nonce = Some(value.to_string()),
            "hash" => hash = Some(value.to_string()),
            "mac" => mac = Some(value.to_string()),
            _ => {}
        }
    }
    Some(HawkAttributes {
        id: id?,
        ts: ts?,
        nonce: nonce?,
        hash: hash?,
        mac: mac?,
    })
}

/// Key-id lookup without early exit, so lookup time does not depend on
/// which credential matched.
fn lookup_credential<'a>(credentials: &'a [Credential], key_id: &str) -> Option<&'a Credential> {
    let mut found = None;
    for credential in credentials {
        let matches = constant_time_eq(credential.key_id.as_bytes(), key_id.as_bytes());
        if matches && found.is_none() {
            found = Some(credential);
        }
    }
    found
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::{hawk_auth_header, HawkCredentials};

    #[test]
    fn hawk_headers_parse_in_any_attribute_order() {
        let header = r#"Hawk id="incoming-some-id-1", ts="1326542401", nonce="c29tZX", hash="aGFzaA==", mac="bWFj""#;
        let attributes = parse_hawk_header(header).unwrap();
        assert_eq!(attributes.id, "incoming-some-id-1");
        assert_eq!(attributes.ts, "1326542401");
        assert_eq!(attributes.nonce, "c29tZX");
        assert_eq!(attributes.hash, "aGFzaA==");
        assert_eq!(attributes.mac, "bWFj");

        let generated = hawk_auth_header(
            HawkCredentials {
                id: "incoming-some-id-1",
                key: "incoming-some-secret-1",
            },
            "POST",
            "http://127.0.0.1:8080/v1/",
            b"",
            "",
            1326542401,
            "c29tZX",
        )
        .unwrap();
        assert!(parse_hawk_header(&generated).is_some());
    }

    #[test]
    fn hawk_header_without_all_fields_is_rejected() {
        assert!(parse_hawk_header("Hawk id=\"a\", ts=\"1\"").is_none());
        assert!(parse_hawk_header("Bearer abc").is_none());
    }

    #[test]
    fn skew_of_sixty_seconds_is_accepted_and_sixty_one_rejected() {
        let now = 1326542401;
        assert!(timestamp_within_skew(&(now - 60).to_string(), now));
        assert!(timestamp_within_skew(&(now + 60).to_string(), now));
        assert!(!timestamp_within_skew(&(now - 61).to_string(), now));
        assert!(!timestamp_within_skew(&(now + 61).to_string(), now));
        assert!(!timestamp_within_skew("not-a-number", now));
    }

    fn whitelist() -> Vec<String> {
        vec!["1.2.3.4".to_string()]
    }

    #[test]
    fn a_single_forwarded_entry_is_never_trusted() {
        assert!(check_whitelist(&whitelist(), Some("1.2.3.4")).is_err());
        assert!(check_whitelist(&whitelist(), None).is_err());
    }

    #[test]
    fn the_second_from_last_entry_must_be_whitelisted() {
        assert!(check_whitelist(&whitelist(), Some("1.2.3.4, 127.0.0.1")).is_ok());
        assert!(check_whitelist(&whitelist(), Some("3.4.5.6, 127.0.0.1")).is_err());
        // Three entries: same rule, the original client entry is ignored.
        assert!(check_whitelist(&whitelist(), Some("9.9.9.9, 1.2.3.4, 127.0.0.1")).is_ok());
        assert!(check_whitelist(&whitelist(), Some("1.2.3.4, 3.4.5.6, 127.0.0.1")).is_err());
        // Whitelisted entry at the end is not the proxy-recorded client.
        assert!(check_whitelist(&whitelist(), Some("3.4.5.6, 1.2.3.4")).is_err());
    }

    fn credentials() -> Vec<Credential> {
        vec![
            Credential {
                key_id: "incoming-some-id-1".to_string(),
                secret_key: "incoming-some-secret-1".to_string(),
                permissions: vec!["POST".to_string()],
            },
            Credential {
                key_id: "incoming-some-id-2".to_string(),
                secret_key: "incoming-some-secret-2".to_string(),
                permissions: vec!["GET".to_string()],
            },
        ]
    }

    #[test]
    fn credential_lookup_matches_exactly() {
        let credentials = credentials();
        assert_eq!(
            lookup_credential(&credentials, "incoming-some-id-2").map(|c| c.key_id.as_str()),
            Some("incoming-some-id-2")
        );
        assert!(lookup_credential(&credentials, "incoming-some-id-3").is_none());
        assert!(lookup_credential(&credentials, "incoming-some-id-").is_none());
    }

    #[test]
    fn authorization_requires_the_method_in_the_permission_set() {
        let caller = Caller {
            key_id: "incoming-some-id-1".to_string(),
            permissions: vec!["POST".to_string()],
        };
        assert!(authorize(&caller, "POST").is_ok());
        assert!(matches!(
            authorize(&caller, "GET"),
            Err(AuthError::Forbidden(message)) if message == NOT_AUTHORIZED
        ));
    }
}
