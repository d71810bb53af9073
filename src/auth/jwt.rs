use anyhow::Result;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::User;

/// Signs and checks the short-lived access tokens. Refresh tokens are opaque
/// and live in the database instead.
#[derive(Clone)]
pub struct JwtService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: String,
    audience: String,
    lifetime: Duration,
}

impl JwtService {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self::new(
            &config.jwt_secret,
            &config.jwt_issuer,
            &config.jwt_audience,
            Duration::minutes(config.jwt_expiry_minutes),
        ))
    }

    fn new(secret: &str, issuer: &str, audience: &str, lifetime: Duration) -> Self {
        let mut validation = Validation::default();
        validation.set_audience(&[audience]);
        validation.set_issuer(&[issuer]);
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            issuer: issuer.to_string(),
            audience: audience.to_string(),
            lifetime,
        }
    }

    pub fn expires_in_seconds(&self) -> i64 {
        self.lifetime.num_seconds()
    }

    pub fn issue(&self, user: &User) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user.id,
            username: user.username.clone(),
            role: user.role.clone(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp(),
            exp: (now + self.lifetime).timestamp(),
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    /// Errors keep their `jsonwebtoken` kind so expiry can be reported apart
    /// from a malformed or forged token.
    pub fn verify_token(&self, token: &str) -> jsonwebtoken::errors::Result<Claims> {
        decode::<Claims>(token, &self.decoding, &self.validation).map(|data| data.claims)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub role: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::errors::ErrorKind;

    fn service(secret: &str, lifetime_minutes: i64) -> JwtService {
        JwtService::new(
            secret,
            "docarchive",
            "docarchive-clients",
            Duration::minutes(lifetime_minutes),
        )
    }

    fn clerk() -> User {
        let now = Utc::now().naive_utc();
        User {
            id: Uuid::new_v4(),
            username: "clerk".into(),
            email: "clerk@archive.test".into(),
            password_hash: String::new(),
            full_name: "Registry Clerk".into(),
            role: "data_entry".into(),
            is_active: true,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn issued_tokens_verify() {
        let jwt = service("secret", 5);
        let user = clerk();
        let claims = jwt.verify_token(&jwt.issue(&user).unwrap()).unwrap();
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.role, "data_entry");
        assert_eq!(jwt.expires_in_seconds(), 300);
    }

    #[test]
    fn expired_tokens_are_reported_as_expired() {
        let jwt = service("secret", -10);
        let token = jwt.issue(&clerk()).unwrap();
        let err = jwt.verify_token(&token).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ExpiredSignature));
    }

    #[test]
    fn tokens_for_another_audience_are_rejected() {
        let token = service("one", 5).issue(&clerk()).unwrap();
        assert!(service("two", 5).verify_token(&token).is_err());

        let other = JwtService::new("one", "docarchive", "someone-else", Duration::minutes(5));
        assert!(other.verify_token(&token).is_err());
    }
}
