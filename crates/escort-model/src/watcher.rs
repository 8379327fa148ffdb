//! Watchers entitled to observe a walk

use crate::ids::{UserId, WalkId, WatcherId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque link token handed to an anonymous watcher
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShareToken(pub String);

impl ShareToken {
    /// Borrow the token text
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShareToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a watcher is identified; the two forms are mutually exclusive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatcherIdentity {
    /// A registered account
    Registered {
        /// Account id
        user_id: UserId,
    },
    /// Someone holding a share link
    Anonymous {
        /// Link token
        share_token: ShareToken,
    },
}

/// A party entitled to observe a walk. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watcher {
    /// Watcher id
    pub id: WatcherId,
    /// Observed walk
    pub walk_id: WalkId,
    /// Registered user or share token
    pub identity: WatcherIdentity,
    /// Display name
    pub name: Option<String>,
    /// Contact phone (anonymous watchers)
    pub phone: Option<String>,
    /// When the watcher was added
    pub added_at: DateTime<Utc>,
}

impl Watcher {
    /// Whether this watcher is the given registered user
    #[must_use]
    pub fn is_user(&self, user_id: UserId) -> bool {
        matches!(self.identity, WatcherIdentity::Registered { user_id: u } if u == user_id)
    }

    /// Whether this watcher holds the given share token
    #[must_use]
    pub fn holds_token(&self, token: &ShareToken) -> bool {
        matches!(&self.identity, WatcherIdentity::Anonymous { share_token } if share_token == token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_matching() {
        let user = UserId::new();
        let token = ShareToken("abc".into());
        let registered = Watcher {
            id: WatcherId::new(),
            walk_id: WalkId::new(),
            identity: WatcherIdentity::Registered { user_id: user },
            name: Some("Sam".into()),
            phone: None,
            added_at: Utc::now(),
        };
        let anonymous = Watcher {
            identity: WatcherIdentity::Anonymous {
                share_token: token.clone(),
            },
            ..registered.clone()
        };

        assert!(registered.is_user(user));
        assert!(!registered.holds_token(&token));
        assert!(anonymous.holds_token(&token));
        assert!(!anonymous.is_user(user));
    }

    #[test]
    fn identity_is_tagged_on_the_wire() {
        let identity = WatcherIdentity::Anonymous {
            share_token: ShareToken("t0k".into()),
        };
        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json["type"], "anonymous");
        assert_eq!(json["share_token"], "t0k");
    }
}
