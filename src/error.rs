// Error taxonomy for the chat layer.
//
// Connection-level errors are logged and retried internally and never reach
// subscribers. Fetch and send errors come back as typed Results so callers
// can distinguish "empty conversation" from "load failed" and can restore a
// failed draft, instead of checking a success flag.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("no stored session; sign in or pass an explicit user id")]
    NoSession,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("reconnect attempt cap reached; call retry() to try again")]
    RetriesExhausted,

    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no session credential available")]
    NoSession,

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server rejected the request")]
    Rejected,

    #[error("unexpected response shape: {0}")]
    InvalidResponse(String),
}

/// A failed history fetch. Kept distinct from an empty message list so the
/// UI can show an error state instead of an empty conversation.
#[derive(Debug, Error)]
#[error("history fetch failed: {0}")]
pub struct HistoryError(#[from] pub ApiError);

#[derive(Debug, Error)]
pub enum SendError {
    #[error("message content is empty")]
    EmptyContent,

    #[error("no active conversation")]
    NoConversation,

    /// The persistence call failed. `draft` carries the original content back
    /// to the caller so it can be restored into the input field.
    #[error("send failed: {reason}")]
    Rejected {
        draft: String,
        #[source]
        reason: ApiError,
    },
}

impl SendError {
    /// Draft text to restore into the outbound input field, if any.
    pub fn draft(&self) -> Option<&str> {
        match self {
            SendError::Rejected { draft, .. } => Some(draft),
            _ => None,
        }
    }
}
