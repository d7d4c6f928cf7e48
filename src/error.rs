use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Timeout, connection failure or non-2xx status. Never retried here.
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("A request is already in flight")]
    Busy,
    #[error("Reply discarded: the chat was reset while the request was in flight")]
    Discarded,
    #[error("Request cancelled")]
    Cancelled,
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}
