//! Per-request authorization against the access policy of the matched route.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tracing::{debug, warn};

use crate::proxy::config::{AccessDefinition, Claim};
use crate::proxy::middleware::cors::apply_cors_headers;
use crate::proxy::security::{TokenError, TokenVerifier, VerifiedClaims};

/// On open routes, shorter bearer strings are treated as no token at all.
pub const MIN_TOKEN_LEN: usize = 16;

const BEARER_SEPARATOR: &str = "Bearer ";

#[derive(Debug)]
pub enum Decision {
    /// Forward the request. `claims` is `None` when no token was checked.
    Allow { claims: Option<VerifiedClaims> },
    Deny(DenyReason),
}

/// Why a request was answered with 401. Only ever logged.
#[derive(Debug, Error)]
pub enum DenyReason {
    #[error("no authorization bearer")]
    MissingToken,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("token claims do not satisfy the route policy")]
    ClaimsNotSatisfied,
}

/// The token from an `Authorization` header that splits into exactly two
/// parts around `"Bearer "`.
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let mut parts = value.split(BEARER_SEPARATOR);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(token), None) => Some(token),
        _ => None,
    }
}

/// True when any configured claim matches any token claim with any accepted value.
/// No configured claims means any verified token is enough.
pub fn claims_satisfied(required: &[Claim], claims: &VerifiedClaims) -> bool {
    if required.is_empty() {
        return true;
    }
    required.iter().any(|claim| {
        claims
            .get(&claim.key)
            .is_some_and(|actual| claim.value.iter().any(|accepted| accepted == actual))
    })
}

/// Headers every response of an authorized route carries, whatever the outcome.
pub fn response_headers(access: &AccessDefinition, request: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    apply_cors_headers(request, &mut headers);

    if let Some(cache_control) = access.cache_control() {
        match HeaderValue::from_str(cache_control) {
            Ok(value) => {
                headers.insert(header::CACHE_CONTROL, value);
            }
            Err(_) => warn!("cache-control value {:?} is not a valid header value", cache_control),
        }
    }
    headers
}

#[derive(Debug, Clone)]
pub struct Authorizer {
    verifier: TokenVerifier,
    header_prefix: String,
}

impl Authorizer {
    pub fn new(verifier: TokenVerifier, header_prefix: impl Into<String>) -> Self {
        Self {
            verifier,
            header_prefix: header_prefix.into(),
        }
    }

    /// Decides whether a request may be forwarded.
    ///
    /// Once a token verifies, every claim is written to the request headers
    /// (`<prefix><claim>`) before the claims policy is checked.
    pub fn authorize(&self, headers: &mut HeaderMap, access: &AccessDefinition) -> Decision {
        let token = extract_bearer(headers).map(str::to_owned);

        if access.open {
            match token.as_deref() {
                None => {
                    debug!("open route, no token");
                    return Decision::Allow { claims: None };
                }
                Some(t) if t.len() < MIN_TOKEN_LEN => {
                    debug!("open route, token too short to verify");
                    return Decision::Allow { claims: None };
                }
                Some(_) => {}
            }
        }

        let Some(token) = token else {
            return Decision::Deny(DenyReason::MissingToken);
        };

        let claims = match self.verifier.verify(&token) {
            Ok(claims) => claims,
            Err(e) => return Decision::Deny(e.into()),
        };

        self.inject_claims(headers, &claims);

        if !access.methods.is_empty() && !claims_satisfied(&access.claims, &claims) {
            return Decision::Deny(DenyReason::ClaimsNotSatisfied);
        }

        Decision::Allow {
            claims: Some(claims),
        }
    }

    fn inject_claims(&self, headers: &mut HeaderMap, claims: &VerifiedClaims) {
        for (name, value) in claims {
            let header_name = format!("{}{}", self.header_prefix, name);
            let (Ok(header_name), Ok(value)) = (
                HeaderName::from_bytes(header_name.as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) else {
                warn!("claim {:?} cannot be forwarded as a header, skipped", name);
                continue;
            };
            headers.insert(header_name, value);
        }
    }
}
