use crate::api::models::{UserId, UserProfile};

/// The signed-in user, handed to every component that needs to know who "me" is.
///
/// Built from a successful sign-in and dropped on sign-out; nothing looks the
/// current user up from global state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    user: UserProfile,
    token: Option<String>,
}

impl Session {
    pub fn new(user: UserProfile, token: Option<String>) -> Self {
        Self { user, token }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user.uid
    }

    pub fn user(&self) -> &UserProfile {
        &self.user
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}
