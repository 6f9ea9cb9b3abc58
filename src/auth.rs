use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::crypto::{generate_token, PasswordHasher};
use crate::error::ApiError;
use crate::models::User;
use crate::store::ChatStore;

const MIN_USERNAME_LEN: usize = 3;
const MAX_USERNAME_LEN: usize = 32;
const MIN_PASSWORD_LEN: usize = 6;

/// Bearer token -> username.
#[derive(Clone, Default)]
pub struct Sessions {
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn issue(&self, username: &str) -> String {
        let token = generate_token();
        let mut tokens = self.tokens.write().await;
        tokens.insert(token.clone(), username.to_string());
        token
    }

    pub async fn resolve(&self, token: &str) -> Option<String> {
        self.tokens.read().await.get(token).cloned()
    }

    pub async fn revoke(&self, token: &str) -> bool {
        self.tokens.write().await.remove(token).is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

fn validate_username(username: &str) -> Result<(), ApiError> {
    let len = username.chars().count();
    if !(MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&len) {
        return Err(ApiError::BadRequest(format!(
            "Username must be {MIN_USERNAME_LEN}-{MAX_USERNAME_LEN} characters"
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(ApiError::BadRequest(
            "Username may only contain letters, digits, '_' and '.'".to_string(),
        ));
    }
    Ok(())
}

pub async fn register(store: &dyn ChatStore, req: RegisterRequest) -> Result<User, ApiError> {
    validate_username(&req.username)?;
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::BadRequest(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    let mut user = User::new(req.username, PasswordHasher::hash(&req.password));
    user.display_name = req.display_name.or_else(|| Some(user.username.clone()));
    user.email = req.email;
    user.phone_number = req.phone_number;

    store.insert_user(user.clone()).await?;
    info!("Registered user {}", user.username);
    Ok(user)
}

/// Checks credentials and opens a session.
pub async fn login(
    store: &dyn ChatStore,
    sessions: &Sessions,
    req: LoginRequest,
) -> Result<(String, User), ApiError> {
    let user = store
        .find_user(&req.username)
        .await
        .ok_or(ApiError::Unauthorized)?;
    if !PasswordHasher::verify(&req.password, &user.password_hash)? {
        return Err(ApiError::Unauthorized);
    }
    let token = sessions.issue(&user.username).await;
    info!("User {} logged in", user.username);
    Ok((token, user))
}

/// Pulls the token out of an `Authorization: Bearer ...` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
