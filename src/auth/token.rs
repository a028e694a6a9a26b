use std::collections::HashSet;

use jsonwebtoken::{
    decode, encode, errors::ErrorKind as JwtErrorKind, Algorithm, DecodingKey, EncodingKey,
    Header, Validation,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use crate::config::TokenConfig;
use crate::error::{Classify, ErrorKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,
    #[error("token is malformed")]
    Malformed,
    #[error("token signature is invalid")]
    BadSignature,
    #[error("invalid key material: {0}")]
    Key(String),
    #[error("failed to sign token: {0}")]
    Signing(String),
}

impl Classify for TokenError {
    fn kind(&self) -> ErrorKind {
        match self {
            TokenError::Expired | TokenError::Malformed | TokenError::BadSignature => {
                ErrorKind::Auth
            }
            TokenError::Key(_) | TokenError::Signing(_) => ErrorKind::Internal,
        }
    }
}

/// JWT payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user ID
    pub jti: Uuid,   // unique token ID
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// Result of [`TokenCodec::issue`].
#[derive(Debug, Clone, Serialize)]
pub struct TokenDetails {
    pub token: String,
    pub token_uuid: Uuid,
    pub user_id: Uuid,
    pub expires_at: i64,
}

/// Signs and verifies one kind of token with one key pair.
#[derive(Clone)]
pub struct TokenCodec {
    algorithm: Algorithm,
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenCodec {
    pub fn from_pem(
        algorithm: Algorithm,
        private_pem: &str,
        public_pem: &str,
        ttl: Duration,
    ) -> Result<Self, TokenError> {
        let (encoding, decoding) = match algorithm {
            Algorithm::RS256 => (
                EncodingKey::from_rsa_pem(private_pem.as_bytes()),
                DecodingKey::from_rsa_pem(public_pem.as_bytes()),
            ),
            Algorithm::EdDSA => (
                EncodingKey::from_ed_pem(private_pem.as_bytes()),
                DecodingKey::from_ed_pem(public_pem.as_bytes()),
            ),
            other => return Err(TokenError::Key(format!("unsupported algorithm {other:?}"))),
        };
        Ok(Self {
            algorithm,
            encoding: encoding.map_err(|e| TokenError::Key(e.to_string()))?,
            decoding: decoding.map_err(|e| TokenError::Key(e.to_string()))?,
            ttl,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, user_id: Uuid, now: OffsetDateTime) -> Result<TokenDetails, TokenError> {
        let iat = now.unix_timestamp();
        let exp = (now + self.ttl).unix_timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            jti: Uuid::new_v4(),
            iat,
            nbf: iat,
            exp,
        };
        let token = encode(&Header::new(self.algorithm), &claims, &self.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))?;
        debug!(user_id = %user_id, jti = %claims.jti, "token issued");
        Ok(TokenDetails {
            token,
            token_uuid: claims.jti,
            user_id,
            expires_at: exp,
        })
    }

    pub fn validate(&self, token: &str, now: OffsetDateTime) -> Result<Uuid, TokenError> {
        Ok(self.decode_claims(token, now)?.0)
    }

    /// Validates the token and returns the subject together with its claims.
    pub fn decode_claims(
        &self,
        token: &str,
        now: OffsetDateTime,
    ) -> Result<(Uuid, Claims), TokenError> {
        let mut validation = Validation::new(self.algorithm);
        // Expiry and not-before are checked against the caller's clock below.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.leeway = 0;
        validation.required_spec_claims = HashSet::from(["exp".to_string(), "sub".to_string()]);

        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                JwtErrorKind::InvalidSignature
                | JwtErrorKind::InvalidAlgorithm
                | JwtErrorKind::InvalidEcdsaKey
                | JwtErrorKind::InvalidRsaKey(_) => TokenError::BadSignature,
                _ => TokenError::Malformed,
            }
        })?;

        let claims = data.claims;
        if now.unix_timestamp() < claims.nbf {
            return Err(TokenError::Malformed);
        }
        if now.unix_timestamp() > claims.exp {
            return Err(TokenError::Expired);
        }
        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| TokenError::Malformed)?;
        Ok((user_id, claims))
    }
}

/// Access and refresh codecs; each kind has its own key pair.
#[derive(Clone)]
pub struct TokenKeys {
    pub access: TokenCodec,
    pub refresh: TokenCodec,
}

impl TokenKeys {
    pub fn from_config(cfg: &TokenConfig) -> Result<Self, TokenError> {
        Ok(Self {
            access: TokenCodec::from_pem(
                cfg.algorithm,
                &cfg.access_private_key,
                &cfg.access_public_key,
                Duration::minutes(cfg.access_ttl_minutes),
            )?,
            refresh: TokenCodec::from_pem(
                cfg.algorithm,
                &cfg.refresh_private_key,
                &cfg.refresh_public_key,
                Duration::minutes(cfg.refresh_ttl_minutes),
            )?,
        })
    }
}
