use std::sync::Arc;

use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use khata_core::OwnerId;
use serde::Deserialize;

use crate::config::AppConfig;
use crate::error::AppError;

/// Caller identity established from a verified bearer token
#[derive(Debug, Clone)]
pub struct AuthenticatedFarmer {
    pub owner: OwnerId,
}

/// HS256 verifier for access tokens minted by the account service
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)] // required by the verifier, checked not read
    exp: i64,
}

impl JwtVerifier {
    pub fn new(config: &AppConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        validation.leeway = config.auth_clock_skew.as_secs();
        if let Some(issuer) = &config.jwt_issuer {
            validation.set_issuer(&[issuer.as_str()]);
        }
        Self {
            decoding_key: Arc::new(DecodingKey::from_secret(config.jwt_secret.as_bytes())),
            validation,
        }
    }

    pub fn verify_access_token(&self, token: &str) -> Result<AuthenticatedFarmer, AppError> {
        let decoded = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|error| {
                AppError::unauthorized(format!("Token validation failed: {}", sanitize(&error)))
            })?;

        let subject = decoded.claims.sub.trim();
        if subject.is_empty() {
            return Err(AppError::unauthorized("Token subject is missing"));
        }

        Ok(AuthenticatedFarmer {
            owner: OwnerId::new(subject),
        })
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }

    Ok(token)
}

fn sanitize(error: &impl std::fmt::Display) -> String {
    error.to_string().replace('\n', " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef-test";

    fn config() -> AppConfig {
        AppConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            db_path: PathBuf::from(":memory:"),
            jwt_secret: SECRET.to_string(),
            jwt_issuer: None,
            auth_clock_skew: Duration::from_secs(60),
            max_batch_len: 200,
            max_page_size: 500,
        }
    }

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        exp: i64,
    }

    fn token(sub: &str, exp_offset: i64, secret: &str) -> String {
        let claims = TestClaims {
            sub: sub.to_string(),
            exp: chrono::Utc::now().timestamp() + exp_offset,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn verifier_accepts_valid_token() {
        let verifier = JwtVerifier::new(&config());
        let farmer = verifier
            .verify_access_token(&token("farmer-1", 300, SECRET))
            .unwrap();
        assert_eq!(farmer.owner.as_str(), "farmer-1");
    }

    #[test]
    fn verifier_rejects_wrong_secret() {
        let verifier = JwtVerifier::new(&config());
        assert!(verifier
            .verify_access_token(&token("farmer-1", 300, "another-secret-another-secret!!"))
            .is_err());
    }

    #[test]
    fn verifier_rejects_expired_token() {
        let verifier = JwtVerifier::new(&config());
        assert!(verifier
            .verify_access_token(&token("farmer-1", -3600, SECRET))
            .is_err());
    }

    #[test]
    fn verifier_rejects_blank_subject() {
        let verifier = JwtVerifier::new(&config());
        assert!(verifier
            .verify_access_token(&token("   ", 300, SECRET))
            .is_err());
    }

    #[test]
    fn bearer_token_extractor_accepts_standard_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer abc.def.ghi"),
        );
        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc.def.ghi");
    }

    #[test]
    fn bearer_token_extractor_rejects_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert!(extract_bearer_token(&headers).is_err());
    }
}
