use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::services::rbac::AuthzSnapshot;

const ACCESS_TOKEN_TYPE: &str = "access";
const REFRESH_TOKEN_TYPE: &str = "refresh";

/// Why a token failed to decode. Never shown to callers.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,

    #[error("wrong token type: {0}")]
    WrongType(String),

    #[error("malformed or badly signed token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
}

/// Claims for access tokens (short-lived)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Subject (principal ID)
    pub sub: Uuid,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    /// JWT ID (for blacklisting)
    pub jti: String,
    /// Session the token was minted for
    pub sid: Uuid,
    pub typ: String,
    /// Authorization state at mint time
    pub authz: AuthzSnapshot,
}

impl AccessTokenClaims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Claims for refresh tokens (long-lived)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshTokenClaims {
    pub sub: Uuid,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    /// Token ID (matches the refresh token record)
    pub jti: String,
    pub sid: Uuid,
    pub typ: String,
    /// Lifetime class, carried across rotations
    #[serde(rename = "rme")]
    pub remember_me: bool,
}

impl RefreshTokenClaims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// The record id, if the jti is one.
    pub fn token_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.jti).ok()
    }
}

/// HS256 token minting and verification, one key per token class.
///
/// Expiry is checked against the caller-supplied instant rather than the
/// system clock.
#[derive(Clone)]
pub struct JwtService {
    access_encoding_key: EncodingKey,
    access_decoding_key: DecodingKey,
    refresh_encoding_key: EncodingKey,
    refresh_decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    access_token_ttl: Duration,
    refresh_token_ttl: Duration,
    remember_me_ttl: Duration,
}

impl JwtService {
    pub fn new(config: &JwtConfig) -> Result<Self, anyhow::Error> {
        let access_secret = config.access_secret.expose_secret().as_bytes();
        let refresh_secret = config.refresh_secret.expose_secret().as_bytes();

        if access_secret.is_empty() || refresh_secret.is_empty() {
            return Err(anyhow::anyhow!("JWT secrets must not be empty"));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_required_spec_claims(&["sub", "iss", "exp"]);

        tracing::info!(issuer = %config.issuer, "JWT service initialized with HS256 keys");

        Ok(Self {
            access_encoding_key: EncodingKey::from_secret(access_secret),
            access_decoding_key: DecodingKey::from_secret(access_secret),
            refresh_encoding_key: EncodingKey::from_secret(refresh_secret),
            refresh_decoding_key: DecodingKey::from_secret(refresh_secret),
            validation,
            issuer: config.issuer.clone(),
            access_token_ttl: Duration::minutes(config.access_token_expiry_minutes),
            refresh_token_ttl: Duration::days(config.refresh_token_expiry_days),
            remember_me_ttl: Duration::days(config.remember_me_expiry_days),
        })
    }

    /// Generate an access token carrying an authorization snapshot.
    pub fn generate_access_token(
        &self,
        principal_id: Uuid,
        session_id: Uuid,
        authz: AuthzSnapshot,
        now: DateTime<Utc>,
    ) -> Result<(String, AccessTokenClaims), anyhow::Error> {
        let claims = AccessTokenClaims {
            sub: principal_id,
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + self.access_token_ttl).timestamp(),
            jti: Uuid::new_v4().to_string(),
            sid: session_id,
            typ: ACCESS_TOKEN_TYPE.to_string(),
            authz,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.access_encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode access token: {}", e))?;

        Ok((token, claims))
    }

    /// Generate a refresh token for an existing record id.
    pub fn generate_refresh_token(
        &self,
        principal_id: Uuid,
        session_id: Uuid,
        token_id: Uuid,
        remember_me: bool,
        now: DateTime<Utc>,
    ) -> Result<(String, RefreshTokenClaims), anyhow::Error> {
        let claims = RefreshTokenClaims {
            sub: principal_id,
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: self.refresh_expiry(remember_me, now).timestamp(),
            jti: token_id.to_string(),
            sid: session_id,
            typ: REFRESH_TOKEN_TYPE.to_string(),
            remember_me,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.refresh_encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode refresh token: {}", e))?;

        Ok((token, claims))
    }

    /// Sliding window: always measured from `now`.
    pub fn refresh_expiry(&self, remember_me: bool, now: DateTime<Utc>) -> DateTime<Utc> {
        if remember_me {
            now + self.remember_me_ttl
        } else {
            now + self.refresh_token_ttl
        }
    }

    pub fn validate_access_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessTokenClaims, TokenError> {
        let claims = self.decode_access_token_ignoring_expiry(token)?;
        if claims.exp <= now.timestamp() {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    pub fn validate_refresh_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<RefreshTokenClaims, TokenError> {
        let claims = self.decode_refresh_token_ignoring_expiry(token)?;
        if claims.exp <= now.timestamp() {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    /// Signature, issuer and type only. Used for revocation, where an expired
    /// token must still be accepted.
    pub fn decode_access_token_ignoring_expiry(
        &self,
        token: &str,
    ) -> Result<AccessTokenClaims, TokenError> {
        let claims =
            decode::<AccessTokenClaims>(token, &self.access_decoding_key, &self.validation)?.claims;
        if claims.typ != ACCESS_TOKEN_TYPE {
            return Err(TokenError::WrongType(claims.typ));
        }
        Ok(claims)
    }

    pub fn decode_refresh_token_ignoring_expiry(
        &self,
        token: &str,
    ) -> Result<RefreshTokenClaims, TokenError> {
        let claims =
            decode::<RefreshTokenClaims>(token, &self.refresh_decoding_key, &self.validation)?
                .claims;
        if claims.typ != REFRESH_TOKEN_TYPE {
            return Err(TokenError::WrongType(claims.typ));
        }
        Ok(claims)
    }

    /// Get access token expiry in seconds (for client info)
    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_ttl.num_seconds()
    }
}
