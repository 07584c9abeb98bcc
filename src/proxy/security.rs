//! Bearer token verification.
//!
//! Only HMAC-signed tokens are accepted. The algorithm named in the token
//! header is checked before any key material is used.

use std::collections::BTreeMap;
use std::sync::Arc;

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::{Map, Value};
use thiserror::Error;

/// Environment variable holding the shared secret unless configured otherwise.
pub const DEFAULT_SECRET_ENV: &str = "JWT_SECRET";

const HMAC_ALGORITHMS: [Algorithm; 3] = [Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];

/// Where the HMAC secret comes from.
#[derive(Debug, Clone)]
pub enum SecretSource {
    /// Read from this environment variable on every verification, so the
    /// secret can be rotated without a restart.
    Env(String),
    Static(Arc<[u8]>),
}

impl SecretSource {
    pub fn from_bytes(secret: impl AsRef<[u8]>) -> Self {
        Self::Static(Arc::from(secret.as_ref()))
    }

    /// Current secret. Missing and empty secrets are both `None`.
    pub fn current(&self) -> Option<Vec<u8>> {
        let secret = match self {
            SecretSource::Env(var) => std::env::var_os(var)?.into_encoded_bytes(),
            SecretSource::Static(bytes) => bytes.to_vec(),
        };
        (!secret.is_empty()).then_some(secret)
    }
}

impl Default for SecretSource {
    fn default() -> Self {
        Self::Env(DEFAULT_SECRET_ENV.to_string())
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(jsonwebtoken::errors::Error),
    #[error("unexpected signing method: {0:?}")]
    DisallowedAlgorithm(Algorithm),
    #[error("no signing secret configured")]
    MissingSecret,
    #[error("invalid token: {0}")]
    Invalid(jsonwebtoken::errors::Error),
}

/// Claims of a verified token, values rendered as strings.
pub type VerifiedClaims = BTreeMap<String, String>;

/// Strings are kept verbatim, everything else is rendered as JSON text.
pub fn render_claim(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct TokenVerifier {
    secret: SecretSource,
}

impl TokenVerifier {
    pub fn new(secret: SecretSource) -> Self {
        Self { secret }
    }

    /// Checks signature, `exp` and `nbf` (when present) and returns the claim set.
    pub fn verify(&self, token: &str) -> Result<VerifiedClaims, TokenError> {
        let header = decode_header(token).map_err(TokenError::Malformed)?;
        if !HMAC_ALGORITHMS.contains(&header.alg) {
            return Err(TokenError::DisallowedAlgorithm(header.alg));
        }

        let secret = self.secret.current().ok_or(TokenError::MissingSecret)?;

        let mut validation = Validation::new(header.alg);
        validation.required_spec_claims.clear();
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.leeway = 0;

        let data = decode::<Map<String, Value>>(
            token,
            &DecodingKey::from_secret(&secret),
            &validation,
        )
        .map_err(TokenError::Invalid)?;

        Ok(data
            .claims
            .into_iter()
            .map(|(name, value)| (name, render_claim(&value)))
            .collect())
    }
}
