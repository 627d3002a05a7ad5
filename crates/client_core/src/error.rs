use shared::domain::{ClientMessageKey, RequestId};
use thiserror::Error;

/// The event channel could not carry a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("event channel is not connected")]
    Disconnected,
    #[error("event channel was closed for this session")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to issue {kind} request: {source}")]
    Transport {
        kind: &'static str,
        #[source]
        source: ChannelError,
    },
    #[error("history response {0} does not match any pending request")]
    StaleHistoryResponse(RequestId),
    #[error("send confirmation for {0} does not match any pending message")]
    StaleSendConfirmation(ClientMessageKey),
    #[error("{count} timeline entries carry correlation key {key}")]
    AmbiguousCorrelationKey { key: ClientMessageKey, count: usize },
}

impl SyncError {
    /// Stale responses are expected after a conversation switch and are not
    /// surfaced to the user.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            SyncError::StaleHistoryResponse(_) | SyncError::StaleSendConfirmation(_)
        )
    }
}
