//! Explicit session context handed to every operation.

use crate::models::{Role, User, UserId};

/// The signed-in user and their bearer token
#[derive(Debug, Clone)]
pub struct Session {
    /// Bearer token, absent for anonymous calls
    pub token: Option<String>,
    /// The signed-in user
    pub user: User,
}

impl Session {
    /// Build a session for `user`.
    #[must_use]
    pub const fn new(user: User, token: Option<String>) -> Self {
        Self { token, user }
    }

    /// Id of the signed-in user
    #[must_use]
    pub const fn user_id(&self) -> UserId {
        self.user.id
    }

    /// Token to send as `Authorization: Bearer`, if any
    #[must_use]
    pub fn bearer(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }

    /// True when the signed-in user offers services
    #[must_use]
    pub fn is_provider(&self) -> bool {
        self.user.role == Some(Role::Provider)
    }
}
