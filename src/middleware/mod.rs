//! Идентификация пользователя по Bearer JWT (HS256).
//!
//! Сам сервис пользователей не хранит: id, email и роль приходят в токене
//! от внешнего провайдера идентификации.

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::JwtConfig;
use crate::error::BookingError;

const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub exp: usize,
}

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub email: Option<String>,
    pub is_admin: bool,
}

/// Пользователь с правами администратора.
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

/// Проверка токенов. Дёшево клонируется, ключи общие.
#[derive(Clone)]
pub struct IdentityVerifier {
    keys: Arc<Keys>,
}

struct Keys {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    validation: Validation,
    admin_email: Option<String>,
}

impl IdentityVerifier {
    pub fn new(secret: &str, admin_email: Option<String>) -> Self {
        Self {
            keys: Arc::new(Keys {
                decoding_key: DecodingKey::from_secret(secret.as_bytes()),
                encoding_key: EncodingKey::from_secret(secret.as_bytes()),
                validation: Validation::new(Algorithm::HS256),
                admin_email: admin_email.map(|e| e.to_lowercase()),
            }),
        }
    }

    pub fn from_config(config: &JwtConfig) -> Self {
        Self::new(&config.secret, config.admin_email.clone())
    }

    pub fn verify(&self, token: &str) -> Result<AuthUser, BookingError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.keys.decoding_key, &self.keys.validation).map_err(|e| {
            tracing::debug!("Rejected bearer token: {}", e);
            BookingError::Unauthenticated
        })?;
        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(BookingError::Unauthenticated);
        }

        let is_admin = claims.role.as_deref() == Some(ADMIN_ROLE)
            || matches!(
                (&claims.email, &self.keys.admin_email),
                (Some(email), Some(admin)) if email.to_lowercase() == *admin
            );

        Ok(AuthUser { user_id: claims.sub, email: claims.email, is_admin })
    }

    /// Выпускает токен; нужен для локальной отладки и тестов.
    pub fn issue(&self, claims: &Claims) -> Result<String, BookingError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.keys.encoding_key)
            .map_err(|e| BookingError::Internal(e.to_string()))
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

impl<S> FromRequestParts<S> for AuthUser
where
    IdentityVerifier: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = BookingError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(BookingError::Unauthenticated)?;
        let verifier = IdentityVerifier::from_ref(state);
        verifier.verify(token)
    }
}

impl<S> FromRequestParts<S> for AdminUser
where
    IdentityVerifier: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = BookingError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_admin {
            tracing::warn!("User {} denied admin access", user.user_id);
            return Err(BookingError::Unauthorized);
        }
        Ok(AdminUser(user))
    }
}
