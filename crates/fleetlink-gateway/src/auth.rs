//! Bearer token verification
//!
//! Requests carry the target host's credentials inside an HS256 JWT, either
//! as `Authorization: Bearer <token>` or as the `authorize` query parameter.

use crate::problem::Problem;
use axum::extract::{FromRef, FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use fleetlink::ssh::Credentials;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Token rejection reasons
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Neither header nor query parameter carried a token
    #[error("Missing bearer token")]
    Missing,

    /// Token is not three base64url segments of JSON
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// Header names an algorithm other than HS256
    #[error("Unsupported token algorithm {0}")]
    Algorithm(String),

    /// Signature does not match the configured key
    #[error("Token signature does not match")]
    Signature,

    /// `exp` lies in the past
    #[error("Token expired")]
    Expired,

    /// `aud` does not name this gateway
    #[error("Token audience does not match")]
    Audience,
}

#[derive(Debug, Deserialize)]
struct TokenHeader {
    alg: String,
}

/// `aud` may be a single string or a list
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    fn contains(&self, expected: &str) -> bool {
        match self {
            Audience::One(aud) => aud == expected,
            Audience::Many(auds) => auds.iter().any(|aud| aud == expected),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Claims {
    #[serde(flatten)]
    credentials: Credentials,
    #[serde(default)]
    exp: Option<u64>,
    #[serde(default)]
    aud: Option<Audience>,
}

/// Verifies tokens against a shared secret
#[derive(Clone)]
pub struct TokenVerifier {
    key: Arc<[u8]>,
    audience: Option<String>,
}

impl TokenVerifier {
    /// Create a verifier; with `audience` set, tokens must name it in `aud`
    pub fn new(key: impl Into<Vec<u8>>, audience: Option<String>) -> Self {
        let key: Vec<u8> = key.into();
        Self {
            key: key.into(),
            audience,
        }
    }

    /// Verify `token` and return the credentials it carries
    pub fn verify(&self, token: &str) -> Result<Credentials, AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        self.verify_at(token, now)
    }

    fn verify_at(&self, token: &str, now: u64) -> Result<Credentials, AuthError> {
        let mut segments = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(AuthError::Malformed("expected three segments".to_string()));
        };

        let token_header: TokenHeader = decode_segment(header)?;
        if token_header.alg != "HS256" {
            return Err(AuthError::Algorithm(token_header.alg));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        mac.update(&token.as_bytes()[..header.len() + 1 + payload.len()]);
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::Signature)?;

        let claims: Claims = decode_segment(payload)?;
        if let Some(exp) = claims.exp {
            if now >= exp {
                return Err(AuthError::Expired);
            }
        }
        if let Some(expected) = &self.audience {
            if !claims.aud.as_ref().is_some_and(|aud| aud.contains(expected)) {
                return Err(AuthError::Audience);
            }
        }

        Ok(claims.credentials)
    }
}

fn decode_segment<T: DeserializeOwned>(segment: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| AuthError::Malformed(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| AuthError::Malformed(e.to_string()))
}

/// `?authorize=` in place of the `Authorization` header
#[derive(Debug, Deserialize)]
struct TokenQuery {
    authorize: Option<String>,
}

fn request_token(parts: &Parts) -> Option<String> {
    let header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim().to_string());

    header.or_else(|| {
        Query::<TokenQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(query)| query.authorize)
    })
}

/// Credentials of an authenticated request
#[derive(Debug, Clone)]
pub struct Authenticated(pub Credentials);

impl<S> FromRequestParts<S> for Authenticated
where
    TokenVerifier: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Problem;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let verifier = TokenVerifier::from_ref(state);
        let token = request_token(parts).ok_or(AuthError::Missing)?;
        match verifier.verify(&token) {
            Ok(credentials) => Ok(Authenticated(credentials)),
            Err(e) => {
                debug!("Rejected token for {}: {}", parts.uri.path(), e);
                Err(e.into())
            }
        }
    }
}

/// Sign `claims` with `key`
#[cfg(test)]
pub(crate) fn sign(key: &[u8], claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    let mut mac = HmacSha256::new_from_slice(key).unwrap();
    mac.update(format!("{header}.{payload}").as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{header}.{payload}.{signature}")
}
