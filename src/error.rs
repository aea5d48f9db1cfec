/// Result type for routing-engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Typed failures surfaced by the routing engine and its collaborators.
///
/// Advisor failures never appear here: they degrade routing to "leave
/// unassigned" inside the engine. Broadcast failures are logged and
/// swallowed for the same reason.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The target conversation has been archived; no further sends allowed.
    #[error("conversation {conversation_id} is closed")]
    ConversationClosed { conversation_id: String },

    /// A conversation, message, or team the caller referenced does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Another agent won the claim race for this conversation.
    #[error("conversation {conversation_id} is already assigned")]
    ConversationAlreadyAssigned { conversation_id: String },

    /// The external channel rejected or failed an outbound send. The caller
    /// decides on retry; the engine never re-sends on its own.
    #[error("channel send failed ({status_code}): {detail}")]
    ChannelSendFailed { status_code: u16, detail: String },

    /// No adapter is registered for the requested channel.
    #[error("channel not configured: {channel}")]
    ChannelNotConfigured { channel: &'static str },

    /// The caller lacks rights over the target conversation's company.
    #[error("not authorized for company {company_id}")]
    Unauthorized { company_id: String },

    /// Underlying storage failed. Webhook callers map this to a non-2xx so
    /// the provider redelivers; the idempotency check absorbs the replay.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn storage(detail: impl std::fmt::Display) -> Self {
        Self::Storage(detail.to_string())
    }
}
