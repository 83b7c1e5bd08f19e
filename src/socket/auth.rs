//! Bearer token verification
//!
//! Tokens are issued by the external login service, signed HS256 with a
//! shared secret. The caller identity is the `owner_id` claim, falling back
//! to `sub`.

use std::collections::HashSet;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

use crate::config::AuthConfig;
use crate::object::Identity;

/// Token rejection reasons
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("No bearer token supplied")]
    Missing,

    #[error("Token expired")]
    Expired,

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Malformed token")]
    Malformed,

    #[error("Token carries no identity claim")]
    NoIdentity,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    owner_id: Option<String>,
    #[serde(default)]
    sub: Option<String>,
}

/// Validates bearer tokens and extracts the caller identity
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str, audience: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // The login service issues tokens without an expiry; check it only when present.
        validation.required_spec_claims = HashSet::new();
        match audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Build from config; `None` when no secret is configured
    pub fn from_config(config: &AuthConfig) -> Option<Self> {
        config
            .secret
            .as_deref()
            .map(|secret| Self::new(secret, config.audience.as_deref()))
    }

    /// Verify a token and return the identity it names
    pub fn verify(&self, token: &str) -> Result<Identity, TokenError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature => TokenError::InvalidSignature,
                _ => TokenError::Malformed,
            }
        })?;

        let claims = data.claims;
        claims
            .owner_id
            .or(claims.sub)
            .filter(|id| !id.is_empty())
            .map(Identity::new)
            .ok_or(TokenError::NoIdentity)
    }
}

/// Pull a bearer token from an `Authorization` header value
pub fn bearer(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Pull a `token` parameter from a request query string
pub fn query_token(query: &str) -> Option<&str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value)
        .filter(|token| !token.is_empty())
}
