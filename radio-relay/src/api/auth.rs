//! Optional listener identity from a JWT.
//!
//! Status is public, so a missing or bad token never rejects a listener;
//! it only means the connection is anonymous.

use axum::http::{HeaderMap, header};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::fanout::ListenerIdentity;

/// Name of the cookie carrying a listener token.
pub const TOKEN_COOKIE: &str = "token";

/// Token verification settings.
#[derive(Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("secret", &"***")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    pub exp: u64,
    #[serde(default)]
    pub iat: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token generation failed: {0}")]
    TokenGeneration(String),
    #[error("Token validation failed: {0}")]
    TokenValidation(String),
    #[error("Token expired")]
    TokenExpired,
    #[error("Invalid token")]
    InvalidToken,
}

/// Verifies listener tokens.
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: Option<String>,
    audience: Option<String>,
}

impl JwtService {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
        }
    }

    /// Issue a token. Used by tooling and tests; the relay never logs users in.
    pub fn generate_token(
        &self,
        user_id: &str,
        username: Option<&str>,
        expiration_secs: u64,
    ) -> Result<String, JwtError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| JwtError::TokenGeneration(e.to_string()))?
            .as_secs();

        let claims = Claims {
            sub: user_id.to_string(),
            username: username.map(str::to_string),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            exp: now + expiration_secs,
            iat: now,
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| JwtError::TokenGeneration(e.to_string()))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, JwtError> {
        let mut validation = Validation::default();
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::TokenExpired,
                jsonwebtoken::errors::ErrorKind::InvalidToken
                | jsonwebtoken::errors::ErrorKind::InvalidSignature => JwtError::InvalidToken,
                _ => JwtError::TokenValidation(e.to_string()),
            })
    }

    /// Resolve a listener identity, or `None` for an anonymous listener.
    pub fn resolve_listener(&self, token: Option<&str>) -> Option<ListenerIdentity> {
        let token = token?;
        match self.validate_token(token) {
            Ok(claims) => Some(ListenerIdentity {
                user_id: claims.sub,
                username: claims.username,
            }),
            Err(e) => {
                debug!(error = %e, "Listener token rejected, admitting anonymously");
                None
            }
        }
    }
}

impl std::fmt::Debug for JwtService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtService")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .finish()
    }
}

/// Find a token in the `Authorization` header, the `token` cookie or the
/// `token` query parameter, in that order.
pub fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    let cookie = || {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .find_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (name == TOKEN_COOKIE).then_some(value.trim())
            })
    };

    bearer
        .or_else(cookie)
        .or(query_token)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use rstest::rstest;

    fn service() -> JwtService {
        JwtService::new(&JwtConfig {
            secret: "test-secret-key-32-chars-long!!".to_string(),
            issuer: Some("radio".to_string()),
            audience: None,
        })
    }

    #[test]
    fn test_resolves_valid_token() {
        let service = service();
        let token = service.generate_token("user-9", Some("dj"), 600).unwrap();

        let identity = service.resolve_listener(Some(&token)).unwrap();
        assert_eq!(identity.user_id, "user-9");
        assert_eq!(identity.username.as_deref(), Some("dj"));
    }

    #[test]
    fn test_bad_tokens_are_anonymous() {
        let service = service();
        assert!(service.resolve_listener(None).is_none());
        assert!(service.resolve_listener(Some("not-a-jwt")).is_none());

        let other = JwtService::new(&JwtConfig {
            secret: "another-secret-another-secret!!".to_string(),
            issuer: Some("radio".to_string()),
            audience: None,
        });
        let foreign = other.generate_token("user-9", None, 600).unwrap();
        assert!(matches!(
            service.validate_token(&foreign),
            Err(JwtError::InvalidToken)
        ));
        assert!(service.resolve_listener(Some(&foreign)).is_none());
    }

    #[rstest]
    #[case::bearer(&[("authorization", "Bearer abc")], None, Some("abc"))]
    #[case::cookie(&[("cookie", "theme=dark; token=xyz")], None, Some("xyz"))]
    #[case::query(&[], Some("q"), Some("q"))]
    #[case::header_wins(&[("authorization", "Bearer h"), ("cookie", "token=c")], Some("q"), Some("h"))]
    #[case::none(&[("cookie", "session=1")], None, None)]
    #[case::empty(&[("authorization", "Bearer ")], None, None)]
    fn test_extract_token(
        #[case] headers: &[(&'static str, &'static str)],
        #[case] query: Option<&str>,
        #[case] expected: Option<&str>,
    ) {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(*name, HeaderValue::from_static(value));
        }
        assert_eq!(extract_token(&map, query).as_deref(), expected);
    }
}
