//! Request signing: AWS SigV4 for the Elasticsearch endpoint and the
//! Hawk-style MAC scheme used both for outgoing feed requests and for
//! verifying incoming API callers.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use url::Url;

type HmacSha256 = Hmac<Sha256>;

const AWS_ALGORITHM: &str = "AWS4-HMAC-SHA256";
const AWS_SERVICE: &str = "es";
const AWS_SIGNED_HEADERS: &str = "content-type;host;x-amz-date";

/// Credentials for signing requests to the search backend.
#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_key: String,
    pub region: String,
}

/// Credentials for the Hawk MAC scheme, on either side of the wire.
#[derive(Debug, Clone, Copy)]
pub struct HawkCredentials<'a> {
    pub id: &'a str,
    pub key: &'a str,
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// The four-step SigV4 key derivation chain:
/// `AWS4`+secret -> date -> region -> service -> `aws4_request`.
pub(crate) fn derive_signing_key(
    secret_key: &str,
    datestamp: &str,
    region: &str,
    service: &str,
) -> Vec<u8> {
    let date_key = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), datestamp.as_bytes());
    let region_key = hmac_sha256(&date_key, region.as_bytes());
    let service_key = hmac_sha256(&region_key, service.as_bytes());
    hmac_sha256(&service_key, b"aws4_request")
}

/// The canonical query string: pairs URI-encoded and sorted. The server
/// canonicalises the query it receives the same way, so the pairs may be
/// sent in their original order.
pub fn canonical_query_string(params: &[(String, String)]) -> String {
    let mut pairs: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect();
    pairs.sort();
    pairs.join("&")
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
pub fn uri_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// Compute the `x-amz-date` and `Authorization` headers for one request.
///
/// The signed headers are exactly `content-type;host;x-amz-date`, so the
/// content type passed here must be the value actually sent.
pub fn aws_sigv4_headers(
    credentials: &AwsCredentials,
    method: &str,
    host: &str,
    path: &str,
    canonical_querystring: &str,
    content_type: &str,
    payload: &[u8],
    now: DateTime<Utc>,
) -> Vec<(String, String)> {
    let amzdate = now.format("%Y%m%dT%H%M%SZ").to_string();
    let datestamp = now.format("%Y%m%d").to_string();
    let credential_scope = format!(
        "{}/{}/{}/aws4_request",
        datestamp, credentials.region, AWS_SERVICE
    );

    let payload_hash = hex::encode(Sha256::digest(payload));
    let canonical_headers = format!(
        "content-type:{}\nhost:{}\nx-amz-date:{}\n",
        content_type, host, amzdate
    );
    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, path, canonical_querystring, canonical_headers, AWS_SIGNED_HEADERS, payload_hash
    );

    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        AWS_ALGORITHM,
        amzdate,
        credential_scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let signing_key = derive_signing_key(
        &credentials.secret_key,
        &datestamp,
        &credentials.region,
        AWS_SERVICE,
    );
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    vec![
        ("x-amz-date".to_string(), amzdate),
        (
            "Authorization".to_string(),
            format!(
                "{} Credential={}/{}, SignedHeaders={}, Signature={}",
                AWS_ALGORITHM,
                credentials.access_key_id,
                credential_scope,
                AWS_SIGNED_HEADERS,
                signature
            ),
        ),
    ]
}

/// The Hawk payload hash: base64 of SHA-256 over the `hawk.1.payload`
/// envelope. The content type participates as the bare media type,
/// lowercased, parameters stripped; an absent body hashes as empty.
pub fn hawk_payload_hash(content_type: &str, body: &[u8]) -> String {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(b"hawk.1.payload\n");
    hasher.update(media_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    hasher.update(b"\n");
    base64::encode(hasher.finalize())
}

fn hawk_normalized_string(
    ts: &str,
    nonce: &str,
    method: &str,
    url: &Url,
    payload_hash: &str,
) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    let port = url.port_or_known_default()?;
    let resource = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };
    // Trailing empty line is the (empty) ext field.
    Some(format!(
        "hawk.1.header\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n\n",
        ts, nonce, method, resource, host, port, payload_hash
    ))
}

/// Compute the MAC for a request, base64-encoded.
pub fn hawk_mac(
    key: &str,
    ts: &str,
    nonce: &str,
    method: &str,
    url: &Url,
    payload_hash: &str,
) -> Option<String> {
    let normalized = hawk_normalized_string(ts, nonce, method, url, payload_hash)?;
    Some(base64::encode(hmac_sha256(
        key.as_bytes(),
        normalized.as_bytes(),
    )))
}

/// Verify a presented MAC in constant time.
pub fn hawk_verify_mac(
    key: &str,
    ts: &str,
    nonce: &str,
    method: &str,
    url: &Url,
    payload_hash: &str,
    presented_mac_b64: &str,
) -> bool {
    let normalized = match hawk_normalized_string(ts, nonce, method, url, payload_hash) {
        Some(normalized) => normalized,
        None => return false,
    };
    let presented = match base64::decode(presented_mac_b64) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(normalized.as_bytes());
    mac.verify_slice(&presented).is_ok()
}

/// Build a complete outbound Hawk `Authorization` header value.
pub fn hawk_auth_header(
    credentials: HawkCredentials<'_>,
    method: &str,
    url_str: &str,
    body: &[u8],
    content_type: &str,
    ts: i64,
    nonce: &str,
) -> anyhow::Result<String> {
    let url = Url::parse(url_str)?;
    let ts = ts.to_string();
    let hash = hawk_payload_hash(content_type, body);
    let mac = hawk_mac(credentials.key, &ts, nonce, method, &url, &hash)
        .ok_or_else(|| anyhow::anyhow!("URL {} has no host to sign against", url_str))?;
    Ok(format!(
        r#"Hawk mac="{}", hash="{}", id="{}", ts="{}", nonce="{}""#,
        mac, hash, credentials.id, ts, nonce
    ))
}

/// As `hawk_auth_header`, stamped with the current time and a fresh nonce.
pub fn hawk_auth_header_now(
    credentials: HawkCredentials<'_>,
    method: &str,
    url_str: &str,
    body: &[u8],
    content_type: &str,
) -> anyhow::Result<String> {
    hawk_auth_header(
        credentials,
        method,
        url_str,
        body,
        content_type,
        Utc::now().timestamp(),
        &random_url_safe(6),
    )
}

const URL_SAFE_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// A random string drawn from the URL-safe alphabet, for nonces and
/// public scroll ids.
pub fn random_url_safe(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| URL_SAFE_ALPHABET[rng.gen_range(0..URL_SAFE_ALPHABET.len())] as char)
        .collect()
}
