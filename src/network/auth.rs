//! JWT Authentication
//!
//! Validates JWTs issued by the account service. The server never issues
//! tokens; it only maps a valid token to an [`Identity`].

use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::game::state::{Bettor, UserId};

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// RS256 public key in PEM format.
    pub public_key_pem: Option<String>,
    /// HS256 secret.
    pub secret: Option<String>,
    /// Skip expiry validation (local development only).
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("JWT_SECRET")
                .or_else(|_| std::env::var("AUTH_SECRET"))
                .ok(),
            skip_expiry: std::env::var("AUTH_SKIP_EXPIRY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// Check if authentication is configured.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }
}

/// Claims read from account-service tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject.
    #[serde(default)]
    pub sub: Option<String>,
    /// Numeric account id.
    #[serde(default, rename = "userId")]
    pub user_id: Option<u64>,
    /// Display name.
    #[serde(default)]
    pub username: Option<String>,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,
}

/// Authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Account id.
    pub user_id: UserId,
    /// Display name shown to other players.
    pub username: String,
}

impl Identity {
    /// The identity as a bettor.
    pub fn bettor(&self) -> Bettor {
        Bettor {
            id: self.user_id,
            name: self.username.clone(),
        }
    }
}

impl TokenClaims {
    /// Resolve the account id: `userId`, else a numeric `sub`, else a hash of `sub`.
    pub fn resolve_user_id(&self) -> Option<UserId> {
        if let Some(id) = self.user_id {
            return Some(UserId(id));
        }
        let sub = self.sub.as_deref().filter(|s| !s.is_empty())?;
        if let Ok(id) = sub.parse::<u64>() {
            return Some(UserId(id));
        }

        let mut hasher = Sha256::new();
        hasher.update(b"crash-round-user:");
        hasher.update(sub.as_bytes());
        let hash = hasher.finalize();
        let mut id = [0u8; 8];
        id.copy_from_slice(&hash[..8]);
        Some(UserId(u64::from_be_bytes(id)))
    }

    /// Build the identity, falling back to `sub` for the display name.
    pub fn identity(&self) -> Result<Identity, AuthError> {
        let user_id = self
            .resolve_user_id()
            .ok_or_else(|| AuthError::MissingClaim("userId".into()))?;
        let username = self
            .username
            .clone()
            .filter(|u| !u.is_empty())
            .or_else(|| self.sub.clone())
            .unwrap_or_else(|| format!("user-{}", user_id));
        Ok(Identity { user_id, username })
    }
}

/// Authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
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
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Maps a credential to an identity.
pub trait AuthValidator: Send + Sync {
    /// Validate `token`.
    fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// JWT-backed validator.
#[derive(Clone, Debug)]
pub struct JwtValidator {
    config: AuthConfig,
}

impl JwtValidator {
    /// Create a validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }
}

impl AuthValidator for JwtValidator {
    fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        validate_token(token, &self.config)?.identity()
    }
}

/// Validate a JWT token and extract claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    if !config.is_configured() {
        return Err(AuthError::NotConfigured);
    }

    let algorithm = if config.public_key_pem.is_some() {
        Algorithm::RS256
    } else {
        Algorithm::HS256
    };

    let mut validation = Validation::new(algorithm);
    validation.required_spec_claims = std::collections::HashSet::new();
    validation.validate_aud = false;
    if let Some(ref issuer) = config.issuer {
        validation.set_issuer(&[issuer]);
    }
    if config.skip_expiry {
        validation.validate_exp = false;
    }

    let token_data: TokenData<TokenClaims> = if let Some(ref pem) = config.public_key_pem {
        let key = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AuthError::DecodeError(format!("invalid public key: {}", e)))?;
        decode(token, &key, &validation).map_err(map_jwt_error)?
    } else if let Some(ref secret) = config.secret {
        let key = DecodingKey::from_secret(secret.as_bytes());
        decode(token, &key, &validation).map_err(map_jwt_error)?
    } else {
        return Err(AuthError::NotConfigured);
    };

    let claims = token_data.claims;

    // Tokens without exp pass the library check
    if !config.skip_expiry && claims.exp > 0 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        if now > claims.exp {
            return Err(AuthError::Expired);
        }
    }

    Ok(claims)
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================
