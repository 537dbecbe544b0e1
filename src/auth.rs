//! Authentication and authorization module
//!
//! Panel accounts sign in with a username (or email) and password; passwords
//! are stored as bcrypt hashes. Successful logins receive an HS256 JWT that
//! the middleware in `middleware_auth` checks on every protected route.

use anyhow::{Context, Result};
use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{
    config::AuthConfig,
    models::User,
    registry::Registry,
};

const ISSUER: &str = "frp-panel";

/// JWT token claims containing user identity and role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // User ID
    pub username: String,
    pub is_admin: bool,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
}

/// Authenticated caller, placed in request extensions by the middleware
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: Uuid,
    pub username: String,
    pub is_admin: bool,
}

impl From<&User> for AuthUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            is_admin: user.is_admin,
        }
    }
}

/// Issues and checks tokens, hashes and verifies passwords
#[derive(Clone)]
pub struct AuthService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    token_expiry: Duration,
    bcrypt_cost: u32,
}

impl AuthService {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        if config.jwt_secret.is_empty() {
            anyhow::bail!("JWT secret cannot be empty");
        }

        Ok(Self {
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            issuer: ISSUER.to_string(),
            token_expiry: Duration::hours(config.jwt_expiry_hours),
            bcrypt_cost: config.bcrypt_cost,
        })
    }

    /// Generates a token for `user`, returning it with its expiry
    pub fn generate_token(&self, user: &User) -> Result<(String, DateTime<Utc>)> {
        let now = Utc::now();
        let expires_at = now + self.token_expiry;

        let claims = Claims {
            sub: user.id.to_string(),
            username: user.username.clone(),
            is_admin: user.is_admin,
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            iss: self.issuer.clone(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .context("Failed to generate JWT token")?;
        Ok((token, expires_at))
    }

    /// Validates and decodes a JWT token, returning claims if valid
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.issuer]);

        let token_data = decode::<Claims>(token, &self.decoding_key, &validation)
            .context("Failed to validate JWT token")?;

        Ok(token_data.claims)
    }

    pub fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        bcrypt::hash(password, self.bcrypt_cost).map_err(|_| AuthError::HashingError)
    }

    pub fn verify_password(&self, password: &str, hash: &str) -> Result<bool, AuthError> {
        bcrypt::verify(password, hash).map_err(|_| AuthError::HashingError)
    }

    /// Checks a login attempt against the stored account
    pub fn check_credentials(&self, user: &User, password: &str) -> Result<(), AuthError> {
        if !self.verify_password(password, &user.password_hash)? {
            return Err(AuthError::InvalidCredentials);
        }
        if !user.is_active {
            return Err(AuthError::UserInactive);
        }
        Ok(())
    }

    /// Resolves a bearer token to an active user
    pub async fn authenticate_jwt(
        &self,
        token: &str,
        registry: &dyn Registry,
    ) -> Result<AuthUser, AuthError> {
        let claims = self.validate_token(token).map_err(|e| {
            debug!(error = %e, "token rejected");
            AuthError::InvalidToken
        })?;

        let user_id: Uuid = claims.sub.parse().map_err(|_| AuthError::InvalidToken)?;

        let user = registry
            .get_user(user_id)
            .await
            .map_err(|_| AuthError::DatabaseError)?
            .ok_or(AuthError::UserNotFound)?;

        if !user.is_active {
            return Err(AuthError::UserInactive);
        }

        Ok(AuthUser::from(&user))
    }
}

/// Extracts the bearer token from the Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication credentials")]
    MissingCredentials,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("User not found")]
    UserNotFound,

    #[error("User account is inactive")]
    UserInactive,

    #[error("Insufficient permissions")]
    InsufficientPermissions,

    #[error("Password hashing failed")]
    HashingError,

    #[error("Database error")]
    DatabaseError,
}

pub fn require_admin(user: &AuthUser) -> Result<(), AuthError> {
    if user.is_admin {
        Ok(())
    } else {
        Err(AuthError::InsufficientPermissions)
    }
}

/// At least 8 characters with a letter and a digit
pub fn validate_password_strength(password: &str) -> Result<(), String> {
    if password.chars().count() < 8 {
        return Err("Password must be at least 8 characters long".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_alphabetic()) || !password.chars().any(|c| c.is_ascii_digit()) {
        return Err("Password must contain both letters and digits".to_string());
    }
    Ok(())
}

pub fn validate_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
}

/// 3-32 characters of letters, digits, `_` or `-`
pub fn validate_username(username: &str) -> bool {
    (3..=32).contains(&username.len())
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
