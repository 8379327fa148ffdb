//! Transport errors

/// Publish/subscribe failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The transport has been shut down
    #[error("transport closed")]
    Closed,

    /// Topic name not accepted
    #[error("topic rejected: {0}")]
    TopicRejected(String),

    /// Delivery to the backend failed
    #[error("delivery failed: {0}")]
    Delivery(String),
}
