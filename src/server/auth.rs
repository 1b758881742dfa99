//! Bearer-token authentication
//!
//! Every `/api` endpoint requires `Authorization: Bearer <token>`. Tokens map
//! to a user id and a user kind through `auth.users` in the config. When no
//! users are configured the server generates a token for a single local user
//! at startup and logs it once, so the API is never left open.

use super::error::{ChatError, Surface};
use crate::config::{AuthConfig, UserCredential, UserKind};
use axum::http::{HeaderMap, header};
use std::sync::Arc;

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
    pub kind: UserKind,
}

/// Shared auth state.
#[derive(Clone)]
pub struct AuthState {
    users: Arc<Vec<UserCredential>>,
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("users", &self.users.len())
            .finish()
    }
}

impl AuthState {
    pub fn from_config(config: &AuthConfig) -> Self {
        let mut users = config.users.clone();
        if users.is_empty() {
            let token = format!(
                "{}{}",
                uuid::Uuid::new_v4().simple(),
                uuid::Uuid::new_v4().simple()
            );
            tracing::warn!(
                token = %token,
                "No auth users configured; generated a token for user 'local-user'. \
                 Set CHATRELAY_AUTH_TOKEN to use a stable token."
            );
            users.push(UserCredential {
                token,
                user_id: "local-user".to_string(),
                kind: UserKind::Regular,
            });
        } else {
            tracing::info!(users = users.len(), "Auth tokens loaded");
        }
        Self {
            users: Arc::new(users),
        }
    }

    /// Resolve the caller from the request headers.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<AuthUser, ChatError> {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ChatError::unauthorized(Surface::Auth))?;

        // Compare against every credential so timing does not reveal which matched.
        let mut found = None;
        for user in self.users.iter() {
            if constant_time_eq(provided.as_bytes(), user.token.as_bytes()) {
                found = Some(AuthUser {
                    id: user.user_id.clone(),
                    kind: user.kind,
                });
            }
        }
        found.ok_or_else(|| ChatError::unauthorized(Surface::Auth))
    }
}

/// Constant-time byte comparison.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
