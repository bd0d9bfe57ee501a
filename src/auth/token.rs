//! Signed bearer tokens (JWT, HS256 only).
//!
//! A token carries a subject (`sub`) and an optional expiry (`exp`, unix
//! seconds). Verification pins the algorithm to HS256, so a token whose
//! header names any other algorithm is rejected before the signature is
//! even considered. Expiry is checked here rather than by `jsonwebtoken`
//! so that the clock can be supplied by the caller and so that a token is
//! already invalid at the exact second of its expiry.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::AuthError;
use crate::error::{Error, Result};

const SHARE_GRANT_HOURS: i64 = 24;

/// Lifetime of a share grant.
pub fn share_grant_ttl() -> Duration {
    Duration::hours(SHARE_GRANT_HOURS)
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
}

/// Issues and validates tokens with one shared HMAC secret.
pub struct TokenAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenAuthority {
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Config("token signing secret is empty".into()));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        validation.validate_aud = false;

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        })
    }

    /// Sign a token for `subject`. `None` means the token never expires.
    pub fn issue(&self, subject: &str, expiry: Option<DateTime<Utc>>) -> Result<String> {
        let claims = Claims {
            sub: subject.to_string(),
            exp: expiry.map(|t| t.timestamp()),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Config(format!("failed to sign token: {}", e)))
    }

    /// Issue a share grant for `name`, valid for [`share_grant_ttl`].
    pub fn issue_share_grant(&self, name: &str) -> Result<(String, DateTime<Utc>)> {
        let expires_at = Utc::now() + share_grant_ttl();
        let token = self.issue(name, Some(expires_at))?;
        Ok((token, expires_at))
    }

    /// Validate against the current time and return the subject.
    pub fn validate(&self, token: &str) -> std::result::Result<String, AuthError> {
        self.validate_at(token, Utc::now())
    }

    pub fn validate_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<String, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }

        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| AuthError::Invalid(format!("{:?}", e.kind())))?;

        if let Some(exp) = data.claims.exp {
            if exp <= now.timestamp() {
                return Err(AuthError::Expired);
            }
        }
        if data.claims.sub.is_empty() {
            return Err(AuthError::Invalid("empty subject".into()));
        }

        Ok(data.claims.sub)
    }
}
