use log::error;

use crate::error::ChatError;
use crate::models::chat::Turn;
use crate::models::completion::CompletionResult;

/// Turns a raw completion body into the reply to append.
///
/// The **last** choice wins: later candidates are treated as the final
/// answer. Any missing required field, or an empty choice list, is a
/// `ChatError::Parse` and nothing should be appended.
pub fn apply(raw_body: &str) -> Result<Turn, ChatError> {
    let result: CompletionResult = serde_json::from_str(raw_body).map_err(|e| {
        error!("Failed to parse completion response: {}", e);
        ChatError::Parse(e.to_string())
    })?;

    let choice = result.choices.into_iter().last().ok_or_else(|| {
        error!("Completion response contained no choices");
        ChatError::Parse("Completion response contained no choices".to_string())
    })?;

    Ok(Turn {
        role: choice.message.role,
        content: choice.message.content.trim().to_string(),
    })
}
