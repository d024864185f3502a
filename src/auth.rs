use actix_web::dev::Payload;
use actix_web::http::header::AUTHORIZATION;
use actix_web::{web, FromRequest, HttpRequest};
use chrono::Duration;
use futures_util::future::LocalBoxFuture;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use tracing::{debug, info};

use crate::config::user_key;
use crate::core::db::{Store, StoreExt};
use crate::core::errors::{ApiError, ApiResult};
use crate::core::helpers::{normalize_email, now, verify_password};
use crate::models::models::{Claims, LoginRequest, LoginResponse, User};
use crate::state::AppState;
use crate::users::find_user_by_email;

/// HS256 signing material plus the lifetime of issued tokens.
#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenKeys {
    pub fn new(secret: &[u8], ttl_hours: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl: Duration::hours(ttl_hours),
        }
    }

    pub fn issue(&self, user: &User) -> anyhow::Result<String> {
        let issued = now();
        let claims = Claims {
            id: user.id.clone(),
            name: user.name.clone(),
            iat: issued.timestamp(),
            exp: (issued + self.ttl).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| anyhow::anyhow!("Failed to sign token: {}", e))
    }

    pub fn verify(&self, token: &str) -> ApiResult<Claims> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| {
                debug!(error = %e, "rejected bearer token");
                ApiError::Unauthorized
            })
    }
}

pub fn login_user(store: &dyn Store, tokens: &TokenKeys, req: LoginRequest) -> ApiResult<LoginResponse> {
    if req.email.trim().is_empty() || req.password.is_empty() {
        return Err(ApiError::validation("Please fill all fields."));
    }

    let invalid = || ApiError::InvalidCredentials("Invalid credentials.".to_string());

    let user = find_user_by_email(store, &normalize_email(&req.email))?.ok_or_else(invalid)?;
    if !verify_password(&req.password, &user.password) {
        return Err(invalid());
    }

    let token = tokens.issue(&user)?;
    info!(user_id = %user.id, "user logged in");

    Ok(LoginResponse {
        token,
        id: user.id,
        name: user.name,
    })
}

/// The caller identified by a bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub name: String,
}

/// Checks the signature and expiry, then that the user still exists.
pub fn validate_token(store: &dyn Store, tokens: &TokenKeys, token: &str) -> ApiResult<AuthUser> {
    let claims = tokens.verify(token)?;
    if store.get_json::<User>(&user_key(&claims.id))?.is_none() {
        return Err(ApiError::Unauthorized);
    }
    Ok(AuthUser {
        id: claims.id,
        name: claims.name,
    })
}

fn bearer_token(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

impl FromRequest for AuthUser {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let state = req.app_data::<web::Data<AppState>>().cloned();
        let token = bearer_token(req);

        Box::pin(async move {
            let state = state.ok_or_else(|| ApiError::Internal("application state missing".to_string()))?;
            let token = token.ok_or(ApiError::Unauthorized)?;
            web::block(move || validate_token(state.store.as_ref(), &state.tokens, &token)).await?
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::SqliteStore;
    use crate::core::helpers::hash_password;

    fn keys() -> TokenKeys {
        TokenKeys::new(b"test-secret", 24)
    }

    fn seed_user(store: &dyn Store, email: &str, password: &str) -> User {
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            name: "Ada".to_string(),
            email: email.to_string(),
            password: hash_password(password).unwrap(),
            avatar: None,
            posts: 0,
            created_at: now(),
            updated_at: now(),
        };
        crate::users::insert_user(store, &user).unwrap();
        user
    }

    fn login(email: &str, password: &str) -> LoginRequest {
        LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn issued_token_carries_id_and_name() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = seed_user(&store, "ada@x.com", "secret1");

        let token = keys().issue(&user).unwrap();
        let claims = keys().verify(&token).unwrap();
        assert_eq!(claims.id, user.id);
        assert_eq!(claims.name, "Ada");
        assert_eq!(claims.exp - claims.iat, 24 * 3600);

        let auth = validate_token(&store, &keys(), &token).unwrap();
        assert_eq!(auth.id, user.id);
    }

    #[test]
    fn expired_or_foreign_tokens_are_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = seed_user(&store, "ada@x.com", "secret1");

        let expired = TokenKeys::new(b"test-secret", -2).issue(&user).unwrap();
        assert!(matches!(keys().verify(&expired), Err(ApiError::Unauthorized)));

        let foreign = TokenKeys::new(b"other-secret", 24).issue(&user).unwrap();
        assert!(matches!(keys().verify(&foreign), Err(ApiError::Unauthorized)));

        assert!(matches!(keys().verify("garbage"), Err(ApiError::Unauthorized)));
    }

    #[test]
    fn token_for_deleted_user_is_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = seed_user(&store, "ada@x.com", "secret1");
        let token = keys().issue(&user).unwrap();

        store.delete(&user_key(&user.id)).unwrap();
        assert!(matches!(validate_token(&store, &keys(), &token), Err(ApiError::Unauthorized)));
    }

    #[test]
    fn login_is_case_insensitive_on_email() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = seed_user(&store, "ada@x.com", "secret1");

        let resp = login_user(&store, &keys(), login("ADA@X.com", "secret1")).unwrap();
        assert_eq!(resp.id, user.id);
        assert_eq!(resp.name, "Ada");
        assert!(keys().verify(&resp.token).is_ok());
    }

    #[test]
    fn unknown_email_and_wrong_password_look_the_same() {
        let store = SqliteStore::open_in_memory().unwrap();
        seed_user(&store, "ada@x.com", "secret1");

        let unknown = login_user(&store, &keys(), login("bob@x.com", "secret1")).unwrap_err();
        let wrong = login_user(&store, &keys(), login("ada@x.com", "nope123")).unwrap_err();

        assert!(matches!(unknown, ApiError::InvalidCredentials(_)));
        assert_eq!(unknown.to_string(), wrong.to_string());
    }

    #[test]
    fn login_requires_both_fields() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = login_user(&store, &keys(), login("", "secret1")).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }
}
