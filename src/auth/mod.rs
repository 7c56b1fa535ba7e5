//! Credentials: argon2id password digests and signed admin tokens.
//!
//! Admin callers carry an HS256 token with user id, admin flag and expiry;
//! instances authenticate with their opaque bearer token against the worker
//! endpoints (see `web::worker`). The two token shapes are mutually
//! unparseable, so each surface rejects the other's credentials.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Lifetime of an admin session token.
pub const AUTH_TOKEN_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let digest = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| Error::Internal(format!("password hash failed: {e}")))?;
    Ok(digest.to_string())
}

pub fn verify_password(password: &str, digest: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(digest) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Claims carried by an admin token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminClaims {
    /// User id.
    pub id: i64,
    /// Admin flag; read-only accounts carry `false`.
    pub adm: bool,
    /// Expiry, unix seconds.
    pub exp: i64,
}

#[derive(Clone)]
pub struct Jwt {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl Jwt {
    pub fn new(key: &str) -> Result<Self> {
        if key.is_empty() {
            return Err(Error::Internal("signature key is empty".into()));
        }

        Ok(Self {
            encoding: EncodingKey::from_secret(key.as_bytes()),
            decoding: DecodingKey::from_secret(key.as_bytes()),
        })
    }

    pub fn sign(&self, claims: &AdminClaims) -> Result<String> {
        encode(&Header::default(), claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("token signing failed: {e}")))
    }

    /// Parse and validate a token; expiry is enforced.
    pub fn parse(&self, token: &str) -> Result<AdminClaims> {
        if token.is_empty() {
            return Err(Error::Unauthorized("token is empty".into()));
        }

        decode::<AdminClaims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| Error::Unauthorized(format!("invalid token: {e}")))
    }
}

/// Extract the credential from an `Authorization: Bearer <token>` header.
pub fn bearer_token(header: &str) -> Result<&str> {
    let mut parts = header.split(' ');
    let (Some(scheme), Some(token), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(Error::Unauthorized("invalid auth header".into()));
    };

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(Error::Unauthorized(format!("unknown auth method: {scheme}")));
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_password_hash_and_verify() {
        let digest = hash_password("hunter2").unwrap();
        assert_ne!(digest, "hunter2");
        assert!(verify_password("hunter2", &digest));
        assert!(!verify_password("hunter3", &digest));
        assert!(!verify_password("hunter2", "not-a-digest"));
    }

    #[test]
    fn test_token_roundtrip() {
        let jwt = Jwt::new("signing-key").unwrap();
        let claims = AdminClaims {
            id: 1,
            adm: true,
            exp: Utc::now().timestamp() + 3600,
        };

        let token = jwt.sign(&claims).unwrap();
        let parsed = jwt.parse(&token).unwrap();
        assert_eq!(parsed.id, 1);
        assert!(parsed.adm);
    }

    #[test]
    fn test_expired_token_rejected() {
        let jwt = Jwt::new("signing-key").unwrap();
        let claims = AdminClaims {
            id: 1,
            adm: true,
            exp: Utc::now().timestamp() - 3600,
        };

        let token = jwt.sign(&claims).unwrap();
        assert!(matches!(jwt.parse(&token), Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let jwt = Jwt::new("signing-key").unwrap();
        let other = Jwt::new("other-key").unwrap();
        let token = jwt
            .sign(&AdminClaims {
                id: 1,
                adm: false,
                exp: Utc::now().timestamp() + 3600,
            })
            .unwrap();
        assert!(other.parse(&token).is_err());
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc").unwrap(), "abc");
        assert_eq!(bearer_token("bearer abc").unwrap(), "abc");
        assert!(bearer_token("abc").is_err());
        assert!(bearer_token("Basic abc").is_err());
        assert!(bearer_token("Bearer a b").is_err());
    }
}
