//! Topic naming

use crate::error::TransportError;
use escort_model::WalkId;
use std::fmt;
use std::str::FromStr;

const WALK_PREFIX: &str = "walk:";

/// A broadcast topic, always `walk:<walk id>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    /// Topic for a walk
    #[inline]
    #[must_use]
    pub fn for_walk(id: WalkId) -> Self {
        Self(format!("{WALK_PREFIX}{id}"))
    }

    /// Topic name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Walk this topic belongs to
    #[must_use]
    pub fn walk_id(&self) -> Option<WalkId> {
        self.0.strip_prefix(WALK_PREFIX)?.parse().ok()
    }
}

impl FromStr for Topic {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s
            .strip_prefix(WALK_PREFIX)
            .ok_or_else(|| TransportError::TopicRejected(s.to_string()))?;
        let id: WalkId = id
            .parse()
            .map_err(|_| TransportError::TopicRejected(s.to_string()))?;
        Ok(Self::for_walk(id))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
