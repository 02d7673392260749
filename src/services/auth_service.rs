use axum::Extension;
use bcrypt::{DEFAULT_COST, hash, verify};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind};
use tracing::{info, warn};

use crate::db::Persistence;
use crate::db::models::{NewUser, User};
use crate::web::error::AppError;
use crate::web::models::{AuthenticatedUser, Claims, LoginRequest, LoginResponse, RegisterRequest, UserResponse};

pub async fn register_user(store: &dyn Persistence, req: RegisterRequest) -> Result<UserResponse, AppError> {
    let email = req.email.trim().to_lowercase();
    if req.name.trim().is_empty() || !email.contains('@') || req.password.len() < 8 {
        return Err(AppError::InvalidInput(
            "Name is required, email must be valid and the password needs at least 8 characters.".to_string(),
        ));
    }

    if store.find_user_by_email(&email).await?.is_some() {
        return Err(AppError::UserAlreadyExists("Email already registered".to_string()));
    }

    let hashed_password =
        hash(&req.password, DEFAULT_COST).map_err(|e| AppError::PasswordHashingError(e.to_string()))?;

    let user = store
        .create_user(NewUser {
            name: req.name.trim().to_string(),
            email,
            hashed_password,
        })
        .await?;
    info!(user_id = user.id, "User registered.");
    Ok(UserResponse {
        id: user.id,
        name: user.name,
        email: user.email,
    })
}

pub async fn login_user(store: &dyn Persistence, req: LoginRequest, jwt_secret: &str) -> Result<LoginResponse, AppError> {
    if req.email.is_empty() || req.password.is_empty() {
        return Err(AppError::InvalidInput("Email and password are required.".to_string()));
    }

    let user = store
        .find_user_by_email(&req.email.trim().to_lowercase())
        .await?
        .ok_or(AppError::InvalidCredentials)?;

    let valid_password = verify(&req.password, &user.hashed_password)
        .map_err(|e| AppError::InternalServerError(format!("Password verification failed: {e}")))?;
    if !valid_password {
        warn!(user_id = user.id, "Login rejected: wrong password.");
        return Err(AppError::InvalidCredentials);
    }

    create_jwt_for_user(&user, jwt_secret)
}

pub fn create_jwt_for_user(user: &User, jwt_secret: &str) -> Result<LoginResponse, AppError> {
    // Token valid for 24 hours
    let expiration = (Utc::now() + Duration::hours(24)).timestamp() as usize;

    let claims = Claims {
        sub: user.name.clone(),
        user_id: user.id,
        email: user.email.clone(),
        exp: expiration,
    };

    let access_token = encode(&Header::default(), &claims, &EncodingKey::from_secret(jwt_secret.as_ref()))
        .map_err(|e| AppError::TokenCreationError(e.to_string()))?;

    Ok(LoginResponse {
        access_token,
        user_id: user.id,
        username: user.name.clone(),
    })
}

/// Validates a token from a header, cookie or `?token=` query.
pub fn authenticate_token(token: &str, jwt_secret: &str) -> Result<AuthenticatedUser, AppError> {
    decode::<Claims>(token, &DecodingKey::from_secret(jwt_secret.as_ref()), &Validation::default())
        .map(|data| AuthenticatedUser::from(data.claims))
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AppError::Unauthorized("Token has expired".to_string()),
            ErrorKind::InvalidSignature => AppError::Unauthorized("Invalid token signature".to_string()),
            _ => AppError::Unauthorized(format!("Token validation failed: {e}")),
        })
}

pub async fn profile(Extension(user): Extension<AuthenticatedUser>) -> Result<axum::Json<UserResponse>, AppError> {
    Ok(axum::Json(UserResponse {
        id: user.id,
        name: user.name,
        email: user.email,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    const SECRET: &str = "test-secret";

    fn register_request(email: &str) -> RegisterRequest {
        RegisterRequest {
            name: "alice".to_string(),
            email: email.to_string(),
            password: "correct horse".to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_and_login() {
        let store = MemoryStore::new();
        let user = register_user(&store, register_request("Alice@Example.com")).await.unwrap();
        assert_eq!(user.email, "alice@example.com");

        let login = login_user(
            &store,
            LoginRequest {
                email: "alice@example.com".to_string(),
                password: "correct horse".to_string(),
            },
            SECRET,
        )
        .await
        .unwrap();
        assert_eq!(login.user_id, user.id);

        let authed = authenticate_token(&login.access_token, SECRET).unwrap();
        assert_eq!(authed.id, user.id);
        assert_eq!(authed.email, "alice@example.com");
        assert!(authenticate_token(&login.access_token, "other-secret").is_err());
    }

    #[tokio::test]
    async fn test_duplicate_email_is_rejected() {
        let store = MemoryStore::new();
        register_user(&store, register_request("bob@example.com")).await.unwrap();
        let err = register_user(&store, register_request("bob@example.com")).await.unwrap_err();
        assert!(matches!(err, AppError::UserAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let store = MemoryStore::new();
        register_user(&store, register_request("carol@example.com")).await.unwrap();
        let err = login_user(
            &store,
            LoginRequest {
                email: "carol@example.com".to_string(),
                password: "not the password".to_string(),
            },
            SECRET,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidCredentials));
    }

    #[test]
    fn test_expired_token() {
        let claims = Claims {
            sub: "dave".to_string(),
            user_id: 4,
            email: "dave@example.com".to_string(),
            exp: (Utc::now() - Duration::hours(1)).timestamp() as usize,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_ref())).unwrap();
        assert!(matches!(
            authenticate_token(&token, SECRET),
            Err(AppError::Unauthorized(msg)) if msg == "Token has expired"
        ));
    }
}
