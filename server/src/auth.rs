//! Session tokens signed with Ed25519.
//!
//! After a successful login the server hands the client a bearer token that
//! embeds the user identity and an expiry. The WebSocket endpoint accepts the
//! token back (cookie or query parameter) and resolves it to an identity
//! before a connection is ever constructed.
//!
//! # Format
//!
//! Tokens use the compact JWS layout with the `EdDSA` algorithm:
//!
//! ```text
//! base64url(header) . base64url(claims) . base64url(signature)
//! ```
//!
//! where the header is `{"alg":"EdDSA","typ":"JWT"}`, the claims are
//! `{"sub":<identity>,"iat":<unix secs>,"exp":<unix secs>}` and the signature
//! covers the first two segments joined by `.`.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use huddle_server::auth::{AuthError, TokenService};
//!
//! let tokens = TokenService::new([9u8; 32], Duration::from_secs(3600));
//! let token = tokens.issue("alice").unwrap();
//! assert_eq!(tokens.validate(&token).unwrap(), "alice");
//!
//! assert_eq!(tokens.validate("garbage"), Err(AuthError::Malformed("expected three segments".into())));
//! ```

use std::time::Duration;

use base64::prelude::*;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey, SECRET_KEY_LENGTH, SIGNATURE_LENGTH};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;

/// The only signing algorithm accepted.
const ALGORITHM: &str = "EdDSA";

/// Errors that can occur during token issuance or validation.
///
/// All variants map to `401 Unauthorized` at the HTTP boundary; the detail
/// is only logged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The token is not three base64url segments of valid JSON.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// The header names a signing method other than EdDSA.
    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The signature does not match the header and claims.
    #[error("invalid signature")]
    InvalidSignature,

    /// The token's expiry is in the past.
    #[error("token expired")]
    Expired,

    /// The claims carry no usable identity.
    #[error("token has no subject")]
    MissingSubject,
}

impl AuthError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

impl Header {
    fn eddsa() -> Self {
        Self {
            alg: ALGORITHM.to_string(),
            typ: Some("JWT".to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: String,
    iat: i64,
    exp: i64,
}

/// Issues and validates session tokens.
pub struct TokenService {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    ttl: Duration,
}

impl TokenService {
    /// Creates a service from a fixed 32-byte seed.
    pub fn new(seed: [u8; SECRET_KEY_LENGTH], ttl: Duration) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
            ttl,
        }
    }

    /// Creates a service with a freshly generated key.
    pub fn random(ttl: Duration) -> Self {
        let mut seed = [0u8; SECRET_KEY_LENGTH];
        rand::rng().fill(&mut seed);
        Self::new(seed, ttl)
    }

    /// Builds the service from server configuration.
    ///
    /// Without `HUDDLE_TOKEN_KEY` a random key is used, so issued tokens do
    /// not survive a restart.
    pub fn from_config(config: &Config) -> Self {
        match config.token_key {
            Some(seed) => Self::new(seed, config.token_ttl),
            None => {
                warn!("HUDDLE_TOKEN_KEY not set - using a random signing key, sessions end on restart");
                Self::random(config.token_ttl)
            }
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issues a token for `identity` that expires after the configured TTL.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingSubject`] for a blank identity.
    pub fn issue(&self, identity: &str) -> Result<String, AuthError> {
        self.issue_at(identity, Utc::now())
    }

    /// Issues a token as if the current time were `now`.
    pub fn issue_at(&self, identity: &str, now: DateTime<Utc>) -> Result<String, AuthError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(AuthError::MissingSubject);
        }

        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            sub: identity.to_string(),
            iat: now.timestamp(),
            exp: now.timestamp().saturating_add(ttl),
        };
        self.sign(&Header::eddsa(), &claims)
    }

    /// Validates a token and returns the identity it was issued to.
    pub fn validate(&self, token: &str) -> Result<String, AuthError> {
        self.validate_at(token, Utc::now())
    }

    /// Validates a token as if the current time were `now`.
    pub fn validate_at(&self, token: &str, now: DateTime<Utc>) -> Result<String, AuthError> {
        let segments: Vec<&str> = token.trim().split('.').collect();
        let [header_b64, claims_b64, signature_b64] = segments.as_slice() else {
            return Err(AuthError::malformed("expected three segments"));
        };

        let header: Header = decode_json(header_b64, "header")?;
        if header.alg != ALGORITHM {
            debug!(alg = %header.alg, "Rejected token with unsupported algorithm");
            return Err(AuthError::UnsupportedAlgorithm(header.alg));
        }

        let signature_bytes = BASE64_URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AuthError::malformed("signature is not base64url"))?;
        let signature_array: [u8; SIGNATURE_LENGTH] = signature_bytes
            .try_into()
            .map_err(|_| AuthError::InvalidSignature)?;
        let signature = Signature::from_bytes(&signature_array);

        let signing_input = format!("{header_b64}.{claims_b64}");
        self.verifying_key
            .verify_strict(signing_input.as_bytes(), &signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        let claims: Claims = decode_json(claims_b64, "claims")?;
        let subject = claims.sub.trim();
        if subject.is_empty() {
            return Err(AuthError::MissingSubject);
        }
        if claims.exp <= now.timestamp() {
            return Err(AuthError::Expired);
        }

        Ok(subject.to_string())
    }

    fn sign(&self, header: &Header, claims: &Claims) -> Result<String, AuthError> {
        let header = serde_json::to_vec(header).map_err(|e| AuthError::malformed(e.to_string()))?;
        let claims = serde_json::to_vec(claims).map_err(|e| AuthError::malformed(e.to_string()))?;

        let signing_input = format!(
            "{}.{}",
            BASE64_URL_SAFE_NO_PAD.encode(header),
            BASE64_URL_SAFE_NO_PAD.encode(claims)
        );
        let signature = self.signing_key.sign(signing_input.as_bytes());
        Ok(format!(
            "{signing_input}.{}",
            BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn decode_json<T: for<'de> Deserialize<'de>>(segment: &str, part: &str) -> Result<T, AuthError> {
    let bytes = BASE64_URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| AuthError::malformed(format!("{part} is not base64url")))?;
    serde_json::from_slice(&bytes).map_err(|_| AuthError::malformed(format!("{part} is not valid JSON")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn service() -> TokenService {
        TokenService::new([1u8; 32], Duration::from_secs(3600))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn issued_token_validates_to_identity() {
        let tokens = service();
        let token = tokens.issue("alice").unwrap();
        assert_eq!(token.split('.').count(), 3);
        assert_eq!(tokens.validate(&token).unwrap(), "alice");
    }

    #[test]
    fn token_expires_after_ttl() {
        let tokens = service();
        let token = tokens.issue_at("alice", at(1_000_000)).unwrap();

        assert_eq!(tokens.validate_at(&token, at(1_000_000 + 3599)).unwrap(), "alice");
        assert_eq!(
            tokens.validate_at(&token, at(1_000_000 + 3600)),
            Err(AuthError::Expired)
        );
    }

    #[test]
    fn token_from_other_key_is_rejected() {
        let other = TokenService::new([2u8; 32], Duration::from_secs(3600));
        let token = other.issue("alice").unwrap();

        assert_eq!(service().validate(&token), Err(AuthError::InvalidSignature));
    }

    #[test]
    fn tampered_claims_are_rejected() {
        let tokens = service();
        let token = tokens.issue("alice").unwrap();
        let parts: Vec<&str> = token.split('.').collect();

        let forged_claims = BASE64_URL_SAFE_NO_PAD
            .encode(br#"{"sub":"mallory","iat":0,"exp":99999999999}"#);
        let forged = format!("{}.{}.{}", parts[0], forged_claims, parts[2]);

        assert_eq!(tokens.validate(&forged), Err(AuthError::InvalidSignature));
    }

    #[test]
    fn wrong_algorithm_is_rejected() {
        let tokens = service();
        let header = Header {
            alg: "HS256".to_string(),
            typ: Some("JWT".to_string()),
        };
        let claims = Claims {
            sub: "alice".to_string(),
            iat: 0,
            exp: i64::MAX,
        };
        let token = tokens.sign(&header, &claims).unwrap();

        let err = tokens.validate(&token).unwrap_err();
        assert_eq!(err, AuthError::UnsupportedAlgorithm("HS256".to_string()));
    }

    #[test]
    fn missing_subject_is_rejected() {
        let tokens = service();
        let claims = Claims {
            sub: "  ".to_string(),
            iat: 0,
            exp: i64::MAX,
        };
        let token = tokens.sign(&Header::eddsa(), &claims).unwrap();

        assert_eq!(tokens.validate(&token), Err(AuthError::MissingSubject));
    }

    #[test]
    fn blank_identity_cannot_be_issued() {
        assert_eq!(service().issue("   "), Err(AuthError::MissingSubject));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let tokens = service();
        for token in ["", "a.b", "a.b.c.d", "!!!.???.###"] {
            assert!(
                matches!(tokens.validate(token), Err(AuthError::Malformed(_))),
                "token {token:?} should be malformed"
            );
        }
    }

    #[test]
    fn short_signature_is_invalid() {
        let tokens = service();
        let token = tokens.issue("alice").unwrap();
        let (head, _) = token.rsplit_once('.').unwrap();
        let truncated = format!("{head}.{}", BASE64_URL_SAFE_NO_PAD.encode([0u8; 32]));

        assert_eq!(tokens.validate(&truncated), Err(AuthError::InvalidSignature));
    }

    #[test]
    fn random_services_do_not_share_keys() {
        let a = TokenService::random(Duration::from_secs(60));
        let b = TokenService::random(Duration::from_secs(60));
        let token = a.issue("alice").unwrap();

        assert!(a.validate(&token).is_ok());
        assert!(b.validate(&token).is_err());
    }

    #[test]
    fn auth_error_display_all_variants() {
        assert_eq!(AuthError::malformed("x").to_string(), "malformed token: x");
        assert_eq!(
            AuthError::UnsupportedAlgorithm("none".into()).to_string(),
            "unsupported signing algorithm: none"
        );
        assert_eq!(AuthError::InvalidSignature.to_string(), "invalid signature");
        assert_eq!(AuthError::Expired.to_string(), "token expired");
        assert_eq!(AuthError::MissingSubject.to_string(), "token has no subject");
    }
}
