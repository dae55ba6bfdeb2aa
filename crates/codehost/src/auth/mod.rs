//! Opaque session tokens.
//!
//! Tokens are HS256 JWTs carrying the user id in `sub`. Nothing else in the
//! broker inspects their structure; the proxy passes them through to the
//! backend untouched.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Token verification failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token was presented.
    #[error("token missing")]
    Missing,

    /// The token is malformed or unverifiable.
    #[error("invalid token: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
}

/// Issues and verifies the opaque tokens the proxy routes on.
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenCodec {
    /// Create a codec over a shared secret.
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Tokens carry no expiry claim; the session TTL bounds their
        // usefulness.
        validation.required_spec_claims.clear();
        validation.validate_exp = false;

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Issue a token for a user.
    pub fn issue(&self, user_id: &str) -> Result<String, AuthError> {
        encode(
            &Header::default(),
            &Claims {
                sub: user_id.to_string(),
            },
            &self.encoding,
        )
        .map_err(|err| AuthError::Invalid(err.to_string()))
    }

    /// Resolve a token back to its user id.
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|err| AuthError::Invalid(err.to_string()))?;
        Ok(data.claims.sub)
    }
}
