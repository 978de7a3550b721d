use thiserror::Error;

/// Causes a caller must distinguish: user-visible wording differs between a
/// timed-out turn and a connectivity failure, and cancellation is reported
/// separately from transport errors.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat request exceeded its deadline")]
    Timeout,

    #[error("chat request was cancelled")]
    Cancelled,

    #[error("failed to reach the chat endpoint: {0}")]
    Connect(String),

    #[error("chat endpoint returned status {0}")]
    Status(u16),

    #[error("chat stream interrupted: {0}")]
    Stream(String),
}

impl ChatError {
    /// Timeouts and deadline-driven cancellations read the same to the user.
    pub fn is_deadline(&self) -> bool {
        matches!(self, ChatError::Timeout | ChatError::Cancelled)
    }

    pub(crate) fn from_send_error(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ChatError::Timeout;
        }
        ChatError::Connect(err.to_string())
    }
}
