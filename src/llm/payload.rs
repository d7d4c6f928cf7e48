use super::RequestConfig;
use crate::models::chat::Conversation;
use crate::models::completion::RequestEnvelope;

/// Builds the request body from the whole conversation. Nothing is
/// truncated; context length is the caller's concern.
pub fn build(conversation: &Conversation, config: &RequestConfig) -> RequestEnvelope {
    RequestEnvelope {
        model: config.model().to_string(),
        temperature: config.temperature(),
        messages: conversation.turns().to_vec(),
    }
}
