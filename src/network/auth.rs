//! Connection Identity
//!
//! Resolves the optional authenticated identity of a WebSocket connection
//! from a JWT passed as the `token` query parameter of the handshake URL.
//! Tokens are issued elsewhere; this module only validates them. A missing
//! or invalid token leaves the connection anonymous.

use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::persistence::IdentityRef;

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// RS256 public key in PEM format.
    pub public_key_pem: Option<String>,
    /// HS256 secret.
    pub secret: Option<String>,
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
            public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("AUTH_SECRET").ok(),
        }
    }

    /// Check if authentication is configured.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }
}

/// Claims we read from the token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject, the user id of the surrounding application.
    pub sub: String,
    /// Expiry timestamp (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<serde_json::Value>,
}

impl TokenClaims {
    /// Identity handed to persistence for this user.
    pub fn identity(&self) -> IdentityRef {
        IdentityRef(self.sub.clone())
    }
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No authentication configured on server.
    #[error("authentication not configured")]
    NotConfigured,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match expected value.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Audience claim doesn't match expected value.
    #[error("invalid audience")]
    InvalidAudience,
    /// Subject claim is empty.
    #[error("missing subject claim")]
    MissingSubject,
    /// Key or decoding failure.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Validate a JWT token and extract claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let (key, algorithm) = match (&config.public_key_pem, &config.secret) {
        (Some(pem), _) => (
            DecodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| AuthError::DecodeError(format!("invalid public key: {e}")))?,
            Algorithm::RS256,
        ),
        (None, Some(secret)) => (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256),
        (None, None) => return Err(AuthError::NotConfigured),
    };

    let mut validation = Validation::new(algorithm);
    // exp is checked when present; the surrounding app may issue non-expiring tokens
    validation.required_spec_claims.clear();

    if let Some(ref issuer) = config.issuer {
        validation.set_issuer(&[issuer]);
    }
    match config.audience {
        Some(ref audience) => validation.set_audience(&[audience]),
        None => validation.validate_aud = false,
    }

    let token_data: TokenData<TokenClaims> =
        decode(token, &key, &validation).map_err(map_jwt_error)?;

    if token_data.claims.sub.is_empty() {
        return Err(AuthError::MissingSubject);
    }

    Ok(token_data.claims)
}

/// Extract the `token` parameter from a URL query string.
pub fn token_from_query(query: &str) -> Option<&str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

/// Identity of a connection given its handshake query string.
pub fn resolve_identity(query: Option<&str>, config: &AuthConfig) -> Option<IdentityRef> {
    if !config.is_configured() {
        return None;
    }
    let token = query.and_then(token_from_query)?;
    match validate_token(token, config) {
        Ok(claims) => Some(claims.identity()),
        Err(e) => {
            debug!("Rejected connection token, continuing anonymously: {}", e);
            None
        }
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "test-secret-key-256-bits-long!!";

    fn create_test_token(claims: &TokenClaims, secret: &str) -> String {
        let header = Header::new(Algorithm::HS256);
        let key = EncodingKey::from_secret(secret.as_bytes());
        encode(&header, claims, &key).unwrap()
    }

    fn test_claims() -> TokenClaims {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        TokenClaims {
            sub: "42".into(),
            exp: Some(now + 3600),
            iss: Some("pong".into()),
            aud: None,
        }
    }

    fn config() -> AuthConfig {
        AuthConfig {
            secret: Some(SECRET.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_token_yields_identity() {
        let token = create_test_token(&test_claims(), SECRET);
        let claims = validate_token(&token, &config()).unwrap();
        assert_eq!(claims.identity(), IdentityRef("42".into()));
    }

    #[test]
    fn test_token_without_expiry_accepted() {
        let mut claims = test_claims();
        claims.exp = None;
        let token = create_test_token(&claims, SECRET);
        assert!(validate_token(&token, &config()).is_ok());
    }

    #[test]
    fn test_expired_token_rejected() {
        let mut claims = test_claims();
        claims.exp = Some(1);
        let token = create_test_token(&claims, SECRET);
        assert!(matches!(validate_token(&token, &config()), Err(AuthError::Expired)));
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let token = create_test_token(&test_claims(), "another-secret-key-entirely!!");
        assert!(matches!(
            validate_token(&token, &config()),
            Err(AuthError::InvalidSignature)
        ));
    }

    #[test]
    fn test_issuer_validation() {
        let token = create_test_token(&test_claims(), SECRET);
        let config = AuthConfig {
            issuer: Some("someone-else".into()),
            ..config()
        };
        assert!(matches!(validate_token(&token, &config), Err(AuthError::InvalidIssuer)));
    }

    #[test]
    fn test_missing_subject_rejected() {
        let mut claims = test_claims();
        claims.sub = String::new();
        let token = create_test_token(&claims, SECRET);
        assert!(matches!(
            validate_token(&token, &config()),
            Err(AuthError::MissingSubject)
        ));
    }

    #[test]
    fn test_not_configured() {
        assert!(matches!(
            validate_token("a.b.c", &AuthConfig::default()),
            Err(AuthError::NotConfigured)
        ));
    }

    #[test]
    fn test_token_from_query() {
        assert_eq!(token_from_query("token=abc"), Some("abc"));
        assert_eq!(token_from_query("room=1&token=xyz&x=2"), Some("xyz"));
        assert_eq!(token_from_query("token="), None);
        assert_eq!(token_from_query("other=1"), None);
    }

    #[test]
    fn test_resolve_identity_falls_back_to_anonymous() {
        let token = create_test_token(&test_claims(), SECRET);
        let query = format!("token={token}");

        assert_eq!(
            resolve_identity(Some(&query), &config()),
            Some(IdentityRef("42".into()))
        );
        assert_eq!(resolve_identity(Some("token=garbage"), &config()), None);
        assert_eq!(resolve_identity(None, &config()), None);
        assert_eq!(resolve_identity(Some(&query), &AuthConfig::default()), None);
    }
}
