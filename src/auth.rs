//! Bearer-token authentication.
//!
//! Callers present an HS256 JWT either as `Authorization: Bearer <token>` or
//! as a `token` query parameter. The caller identity is the `userId` claim,
//! falling back to `sub`.

use crate::errors::AppError;
use axum::{
    extract::{FromRef, FromRequestParts, Query},
    http::{header::AUTHORIZATION, request::Parts},
};
use jsonwebtoken::{DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Checked when present; tokens without an expiry are accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl Claims {
    fn identity(self) -> Option<String> {
        self.user_id
            .or(self.sub)
            .filter(|id| !id.trim().is_empty())
    }
}

/// Verifies tokens against the shared secret.
#[derive(Clone)]
pub struct JwtVerifier {
    key: Arc<DecodingKey>,
    validation: Arc<Validation>,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::default();
        validation.required_spec_claims.clear();
        Self {
            key: Arc::new(DecodingKey::from_secret(secret.as_bytes())),
            validation: Arc::new(validation),
        }
    }

    pub fn verify(&self, token: &str) -> Result<String, AppError> {
        let claims = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|err| {
                debug!(error = %err, "rejected bearer token");
                AppError::unauthorized("invalid token")
            })?
            .claims;
        claims
            .identity()
            .ok_or_else(|| AppError::unauthorized("token carries no user id"))
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Authenticated caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId(pub String);

impl<S> FromRequestParts<S> for CallerId
where
    JwtVerifier: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .map(str::to_string);

        let token = match header {
            Some(token) => Some(token),
            None => Query::<TokenQuery>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|Query(q)| q.token),
        };
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::unauthorized("missing bearer token"))?;

        let verifier = JwtVerifier::from_ref(state);
        verifier.verify(&token).map(CallerId)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Claims;
    use chrono::{Duration, Utc};
    use jsonwebtoken::{EncodingKey, Header};

    pub fn token_for(secret: &str, user: &str) -> String {
        let claims = Claims {
            sub: None,
            user_id: Some(user.to_string()),
            exp: Some((Utc::now() + Duration::hours(1)).timestamp()),
        };
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};
    use chrono::{Duration, Utc};
    use jsonwebtoken::{EncodingKey, Header};

    const SECRET: &str = "test-secret";

    async fn extract(request: Request<()>) -> Result<CallerId, AppError> {
        let verifier = JwtVerifier::new(SECRET);
        let (mut parts, _) = request.into_parts();
        CallerId::from_request_parts(&mut parts, &verifier).await
    }

    #[tokio::test]
    async fn accepts_bearer_header_and_query_token() {
        let token = testing::token_for(SECRET, "alice");

        let from_header = Request::builder()
            .uri("/api/files/x/status")
            .header("Authorization", format!("Bearer {token}"))
            .body(())
            .unwrap();
        assert_eq!(extract(from_header).await.unwrap(), CallerId("alice".into()));

        let from_query = Request::builder()
            .uri(format!("/api/files/x/download-urls?token={token}"))
            .body(())
            .unwrap();
        assert_eq!(extract(from_query).await.unwrap(), CallerId("alice".into()));
    }

    #[tokio::test]
    async fn falls_back_to_sub_claim() {
        let claims = Claims {
            sub: Some("bob".into()),
            user_id: None,
            exp: Some((Utc::now() + Duration::hours(1)).timestamp()),
        };
        let token = jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert_eq!(JwtVerifier::new(SECRET).verify(&token).unwrap(), "bob");
    }

    fn sign(claims: &Claims) -> String {
        jsonwebtoken::encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn expiry_is_checked_only_when_present() {
        let verifier = JwtVerifier::new(SECRET);
        let no_expiry = sign(&Claims {
            sub: None,
            user_id: Some("carol".into()),
            exp: None,
        });
        assert_eq!(verifier.verify(&no_expiry).unwrap(), "carol");

        let expired = sign(&Claims {
            sub: None,
            user_id: Some("carol".into()),
            exp: Some((Utc::now() - Duration::hours(1)).timestamp()),
        });
        assert_eq!(
            verifier.verify(&expired).unwrap_err().status,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn rejects_missing_and_forged_tokens() {
        let missing = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(
            extract(missing).await.unwrap_err().status,
            StatusCode::UNAUTHORIZED
        );

        let forged = Request::builder()
            .uri("/")
            .header(
                "Authorization",
                format!("Bearer {}", testing::token_for("other", "alice")),
            )
            .body(())
            .unwrap();
        assert_eq!(
            extract(forged).await.unwrap_err().status,
            StatusCode::UNAUTHORIZED
        );
    }
}
