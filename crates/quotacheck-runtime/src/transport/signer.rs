//! Request signing (AWS Signature Version 4).

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

use super::Credentials;
use crate::request::PreparedRequest;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Errors from request signing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("Credentials are empty")]
    MissingCredentials,

    #[error("Invalid signing key: {0}")]
    InvalidKey(String),
}

/// Signs a prepared request in place.
pub trait RequestSigner: Send + Sync {
    /// Add authentication headers for a request sent at `now`.
    fn sign(&self, request: &mut PreparedRequest, now: DateTime<Utc>) -> Result<(), SigningError>;

    /// Signer name for logs.
    fn name(&self) -> &str;
}

/// SigV4 signer backed by an access key pair.
#[derive(Debug, Clone)]
pub struct SigV4Signer {
    credentials: Arc<Credentials>,
}

impl SigV4Signer {
    pub fn new(credentials: Arc<Credentials>) -> Self {
        Self { credentials }
    }

    fn signing_key(&self, date: &str, region: &str, service: &str) -> Result<Vec<u8>, SigningError> {
        let secret = format!("AWS4{}", self.credentials.expose_secret());
        let k_date = hmac(secret.as_bytes(), date.as_bytes())?;
        let k_region = hmac(&k_date, region.as_bytes())?;
        let k_service = hmac(&k_region, service.as_bytes())?;
        hmac(&k_service, b"aws4_request")
    }
}

impl RequestSigner for SigV4Signer {
    fn sign(&self, request: &mut PreparedRequest, now: DateTime<Utc>) -> Result<(), SigningError> {
        if self.credentials.is_empty() {
            return Err(SigningError::MissingCredentials);
        }

        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        request.headers.retain(|k, _| !k.eq_ignore_ascii_case("authorization"));
        request.set_header("X-Amz-Date", amz_date.clone());
        if let Some(token) = self.credentials.expose_session_token() {
            request.set_header("X-Amz-Security-Token", token);
        }

        let (canonical, signed_headers) = canonical_request(request);
        let scope = format!("{}/{}/{}/aws4_request", date, request.region, request.service);
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical.as_bytes()))
        );

        let key = self.signing_key(&date, &request.region, &request.service)?;
        let signature = hex::encode(hmac(&key, string_to_sign.as_bytes())?);

        request.set_header(
            "Authorization",
            format!(
                "{} Credential={}/{}, SignedHeaders={}, Signature={}",
                ALGORITHM,
                self.credentials.access_key_id(),
                scope,
                signed_headers,
                signature
            ),
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "sigv4"
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SigningError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| SigningError::InvalidKey(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Returns the canonical request and the signed-headers list.
fn canonical_request(request: &PreparedRequest) -> (String, String) {
    let path = match request.url.path() {
        "" => "/",
        p => p,
    };

    let mut query: Vec<(String, String)> = request
        .url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k), uri_encode(&v)))
        .collect();
    query.sort();
    let query = query
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let mut headers: Vec<(String, String)> = request
        .headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), collapse_whitespace(v)))
        .collect();
    headers.sort();

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        request.method,
        path,
        query,
        canonical_headers,
        signed_headers,
        hex::encode(Sha256::digest(request.body.as_bytes()))
    );
    (canonical, signed_headers)
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// RFC 3986 encoding of everything but unreserved characters.
fn uri_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
