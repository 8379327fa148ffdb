//! Caller identity passed explicitly into every operation

use escort_model::{ShareToken, UserId, Walk, Watcher};

/// The signed-in user performing an owner operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserContext {
    /// Authenticated user
    pub user_id: UserId,
}

impl UserContext {
    /// Context for a user
    #[inline]
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }
}

/// Someone asking to observe a walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Viewer {
    /// A registered user (owner or registered watcher)
    User(UserId),
    /// Holder of an anonymous share link
    Token(ShareToken),
}

impl Viewer {
    /// Whether this viewer may observe `walk` given its watcher list
    #[must_use]
    pub fn can_observe(&self, walk: &Walk, watchers: &[Watcher]) -> bool {
        match self {
            Self::User(id) => walk.owner == *id || watchers.iter().any(|w| w.is_user(*id)),
            Self::Token(token) => watchers.iter().any(|w| w.holds_token(token)),
        }
    }
}

impl From<&UserContext> for Viewer {
    fn from(ctx: &UserContext) -> Self {
        Self::User(ctx.user_id)
    }
}
