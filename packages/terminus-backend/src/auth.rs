//! Bearer-token authentication against the external user service.
//!
//! The user service itself is out of process; the backend only needs a
//! token → user lookup and an ownership rule. The in-memory token table is
//! the reference implementation of that interface and is what the tests and
//! the self-contained server binary use.

use std::collections::HashMap;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use terminus_error::TerminusError;

use crate::repository::SessionRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Moderator,
    Admin,
}

impl Role {
    /// Moderators and admins may attach to sessions they do not own.
    pub fn may_impersonate(self) -> bool {
        matches!(self, Role::Moderator | Role::Admin)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: i64,
    pub username: String,
    pub role: Role,
}

impl AuthenticatedUser {
    pub fn may_access(&self, session: &SessionRecord) -> bool {
        session.user_id == self.user_id || self.role.may_impersonate()
    }
}

#[derive(Debug, Default)]
pub struct AuthService {
    tokens: RwLock<HashMap<String, AuthenticatedUser>>,
}

impl AuthService {
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_token(&self, token: impl Into<String>, user: AuthenticatedUser) {
        self.tokens.write().await.insert(token.into(), user);
    }

    pub async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser, TerminusError> {
        self.tokens
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or_else(|| TerminusError::auth("missing or invalid token"))
    }

    /// Authenticate and enforce the session-ownership rule in one step.
    pub async fn authorize_session(
        &self,
        token: &str,
        session: &SessionRecord,
    ) -> Result<AuthenticatedUser, TerminusError> {
        let user = self.authenticate(token).await?;
        if !user.may_access(session) {
            return Err(TerminusError::auth("not authorized for this session"));
        }
        Ok(user)
    }
}

/// Pull a bearer token out of an `Authorization` header.
pub fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?;
    let value = value.to_str().ok()?.trim();
    let (scheme, rest) = value.split_once(' ')?;
    match scheme.to_ascii_lowercase().as_str() {
        "bearer" | "token" => Some(rest.trim().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Repository;

    fn user(user_id: i64, role: Role) -> AuthenticatedUser {
        AuthenticatedUser {
            user_id,
            username: format!("user{user_id}"),
            role,
        }
    }

    #[tokio::test]
    async fn plain_users_cannot_cross_sessions() {
        let repo = Repository::new();
        let session = repo.create_session(1, "owned", None).await;

        let auth = AuthService::new();
        auth.register_token("owner-token", user(1, Role::User)).await;
        auth.register_token("other-token", user(2, Role::User)).await;
        auth.register_token("admin-token", user(3, Role::Admin)).await;

        assert!(auth.authorize_session("owner-token", &session).await.is_ok());
        assert!(auth.authorize_session("other-token", &session).await.is_err());
        assert!(auth.authorize_session("admin-token", &session).await.is_ok());
        assert!(auth.authorize_session("unknown", &session).await.is_err());
    }

    #[test]
    fn bearer_extraction_accepts_both_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer secret".parse().unwrap(),
        );
        assert_eq!(extract_bearer(&headers).as_deref(), Some("secret"));

        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Token secret2".parse().unwrap(),
        );
        assert_eq!(extract_bearer(&headers).as_deref(), Some("secret2"));

        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Basic abc".parse().unwrap(),
        );
        assert_eq!(extract_bearer(&headers), None);
    }
}
